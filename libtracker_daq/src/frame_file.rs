use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::constants::WORD_BYTES;
use super::drain::FrameBatch;

/// Sequential writer for the raw word stream of one board and one run.
///
/// Words go to disk little-endian in the exact order they were read from the
/// FIFO; the file carries no header beyond what the firmware itself puts in
/// the stream.
#[derive(Debug)]
pub struct FrameFileWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    words_written: u64,
}

impl FrameFileWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            words_written: 0,
        })
    }

    pub fn write_batch(&mut self, batch: &FrameBatch) -> io::Result<()> {
        for word in &batch.words {
            self.writer.write_u32::<LittleEndian>(*word)?;
        }
        self.words_written += batch.words.len() as u64;
        Ok(())
    }

    pub fn words_written(&self) -> u64 {
        self.words_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.words_written * WORD_BYTES as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_land_on_disk_little_endian_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_0000_rb01.dat");

        let mut writer = FrameFileWriter::create(&path).unwrap();
        writer
            .write_batch(&FrameBatch {
                words: vec![0x0102_0304, 0xdead_beef],
                full_blocks: 0,
                remainder: 2,
            })
            .unwrap();
        writer.close().unwrap();

        assert_eq!(writer.words_written(), 2);
        assert_eq!(writer.bytes_written(), 8);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01, 0xef, 0xbe, 0xad, 0xde]);
    }
}
