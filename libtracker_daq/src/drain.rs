//! Per-board FIFO drain worker.
//!
//! One worker thread exists per readout board per run. It owns the board's
//! frame file and the board's side of the handshake; after the stop signal
//! it performs one final full-blocks-plus-remainder read so nothing is left
//! in the hardware FIFO for the next run.

use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use human_bytes::human_bytes;

use super::constants::BLOCK_WORDS;
use super::error::DrainError;
use super::frame_file::FrameFileWriter;
use super::registers::{self, SharedLink};
use super::synchronizer::{AcquisitionSynchronizer, StartSignal};
use super::worker_status::{RunStatistics, WorkerReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Starting,
    WaitingStart,
    Draining,
    StoppingDrain,
    Done,
    Failed,
}

/// The words of one drain cycle, in FIFO read order, tagged with the
/// block/remainder accounting that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    pub words: Vec<u32>,
    pub full_blocks: u32,
    pub remainder: u32,
}

pub struct DrainWorker {
    run_number: u32,
    board: u8,
    link: SharedLink,
    sync: AcquisitionSynchronizer,
    output_path: PathBuf,
    poll_interval: Duration,
    start_timeout: Duration,
    state: DrainState,
}

impl DrainWorker {
    pub fn new(
        run_number: u32,
        board: u8,
        link: SharedLink,
        sync: AcquisitionSynchronizer,
        output_path: PathBuf,
        poll_interval: Duration,
        start_timeout: Duration,
    ) -> Self {
        Self {
            run_number,
            board,
            link,
            sync,
            output_path,
            poll_interval,
            start_timeout,
            state: DrainState::Starting,
        }
    }

    /// Thread entry point. Always produces exactly one report.
    pub fn run(mut self, tx: Sender<WorkerReport>) {
        let report = self.execute();
        if tx.send(report).is_err() {
            spdlog::error!(
                "board {:02}: controller hung up before the report was delivered",
                self.board
            );
        }
    }

    fn advance(&mut self, state: DrainState) {
        self.state = state;
        spdlog::debug!("board {:02}: {:?}", self.board, self.state);
    }

    fn execute(&mut self) -> WorkerReport {
        // STARTING: known baseline before signalling ready
        if let Err(e) = self.reset_board() {
            self.advance(DrainState::Failed);
            spdlog::error!("board {:02}: reset failed: {e}", self.board);
            return WorkerReport::Failed {
                board: self.board,
                reason: e.to_string(),
                stats: None,
            };
        }

        self.advance(DrainState::WaitingStart);
        if let Err(e) = self.sync.signal_ready(self.board) {
            self.advance(DrainState::Failed);
            return WorkerReport::Failed {
                board: self.board,
                reason: e.to_string(),
                stats: None,
            };
        }
        match self.sync.await_start(self.start_timeout) {
            Ok(StartSignal::Start) => {}
            Ok(StartSignal::Abort) => {
                // released before the window opened; no file is created
                self.advance(DrainState::Done);
                spdlog::info!("board {:02}: released before start, no data taken", self.board);
                return WorkerReport::AbortedBeforeStart { board: self.board };
            }
            Err(e) => {
                self.advance(DrainState::Failed);
                spdlog::error!("board {:02}: {e}", self.board);
                return WorkerReport::Failed {
                    board: self.board,
                    reason: e.to_string(),
                    stats: None,
                };
            }
        }

        let started = Instant::now();
        let mut writer = match FrameFileWriter::create(&self.output_path) {
            Ok(writer) => writer,
            Err(e) => {
                self.advance(DrainState::Failed);
                return WorkerReport::Failed {
                    board: self.board,
                    reason: format!("could not create {}: {e}", self.output_path.display()),
                    stats: None,
                };
            }
        };

        self.advance(DrainState::Draining);
        let outcome = self.drain(&mut writer);

        // safety measure: no generated triggers may survive into the next run
        if let Err(e) = registers::force_trigger_rate_zero(&self.link) {
            spdlog::warn!("board {:02}: could not zero the trigger rate: {e}", self.board);
        }
        let events_lost = match registers::with_retry(|| {
            registers::lock(&self.link)?.read_register(registers::CNT_LOST_EVENTS)
        }) {
            Ok(count) => u64::from(count),
            Err(e) => {
                spdlog::warn!("board {:02}: lost-event counter unreadable: {e}", self.board);
                0
            }
        };
        if let Err(e) = writer.close() {
            spdlog::error!("board {:02}: final flush failed: {e}", self.board);
        }
        let words = writer.words_written();

        match outcome {
            Ok(elapsed) => {
                self.advance(DrainState::Done);
                let stats =
                    RunStatistics::compute(self.run_number, self.board, words, events_lost, elapsed);
                spdlog::info!(
                    "board {:02}: captured {} in {:.1} s ({} events, {}/s)",
                    self.board,
                    human_bytes(stats.bytes() as f64),
                    stats.elapsed_seconds,
                    stats.events,
                    human_bytes(stats.throughput_bits_per_second / 8.0)
                );
                WorkerReport::Finished {
                    board: self.board,
                    stats,
                }
            }
            Err(e) => {
                self.advance(DrainState::Failed);
                spdlog::error!(
                    "board {:02}: drain failed: {e}; {words} words flushed for analysis",
                    self.board
                );
                let stats = RunStatistics::compute(
                    self.run_number,
                    self.board,
                    words,
                    events_lost,
                    started.elapsed(),
                );
                WorkerReport::Failed {
                    board: self.board,
                    reason: e.to_string(),
                    stats: Some(stats),
                }
            }
        }
    }

    /// Reset the FIFO and the trigger-rate/event counters to a known
    /// baseline. Triggers during the run come only from the sensors.
    fn reset_board(&mut self) -> Result<(), DrainError> {
        registers::with_retry(|| registers::reset_fifo(&self.link))?;
        registers::with_retry(|| registers::force_trigger_rate_zero(&self.link))?;
        registers::with_retry(|| registers::reset_event_counters(&self.link))?;
        Ok(())
    }

    /// DRAINING until stop is visible, then STOPPING_DRAIN: one last
    /// occupancy read drained as full blocks plus the trailing remainder.
    /// Returns the time from start to the observed stop.
    fn drain(&mut self, writer: &mut FrameFileWriter) -> Result<Duration, DrainError> {
        let started = Instant::now();
        loop {
            if self.sync.stop_requested()? {
                break;
            }
            let occupancy = self.read_occupancy()?;
            let full_blocks = occupancy / BLOCK_WORDS;
            if full_blocks == 0 {
                // nothing to read yet; the bounded wait paces the poll and
                // doubles as the stop check
                if self.sync.await_stop(self.poll_interval)? {
                    break;
                }
                continue;
            }
            let batch = self.read_batch(full_blocks, 0)?;
            writer.write_batch(&batch)?;
        }
        let elapsed = started.elapsed();

        self.advance(DrainState::StoppingDrain);
        let occupancy = self.read_occupancy()?;
        let batch = self.read_batch(occupancy / BLOCK_WORDS, occupancy % BLOCK_WORDS)?;
        if !batch.words.is_empty() {
            writer.write_batch(&batch)?;
        }
        spdlog::debug!(
            "board {:02}: final drain of {} words ({} blocks + {} remainder)",
            self.board,
            batch.words.len(),
            batch.full_blocks,
            batch.remainder
        );
        Ok(elapsed)
    }

    fn read_occupancy(&self) -> Result<u32, DrainError> {
        Ok(registers::with_retry(|| {
            registers::lock(&self.link)?.read_register(registers::FIFO_OCCUPANCY)
        })?)
    }

    /// Issue `full_blocks` fixed-size block reads plus an optional trailing
    /// partial read, preserving FIFO order.
    fn read_batch(&self, full_blocks: u32, remainder: u32) -> Result<FrameBatch, DrainError> {
        let mut batch = FrameBatch {
            words: Vec::with_capacity((full_blocks * BLOCK_WORDS + remainder) as usize),
            full_blocks,
            remainder,
        };
        for _ in 0..full_blocks {
            let words = registers::with_retry(|| {
                registers::lock(&self.link)?.read_block(BLOCK_WORDS)
            })?;
            batch.words.extend(words);
        }
        if remainder > 0 {
            let words =
                registers::with_retry(|| registers::lock(&self.link)?.read_block(remainder))?;
            batch.words.extend(words);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegisterError;
    use crate::registers::RegisterLink;
    use std::collections::VecDeque;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Models a hardware FIFO: each occupancy read first takes delivery of
    /// the next scheduled arrival, block reads consume buffered words. Can
    /// request the run stop after a given number of occupancy reads, which
    /// makes the drain sequence fully deterministic.
    struct FifoLink {
        arrivals: VecDeque<u32>,
        fifo: VecDeque<u32>,
        next_word: u32,
        occupancy_reads: usize,
        stop_after_reads: usize,
        sync: AcquisitionSynchronizer,
    }

    impl FifoLink {
        fn new(arrivals: Vec<u32>, stop_after_reads: usize, sync: AcquisitionSynchronizer) -> Self {
            Self {
                arrivals: arrivals.into(),
                fifo: VecDeque::new(),
                next_word: 0,
                occupancy_reads: 0,
                stop_after_reads,
                sync,
            }
        }
    }

    impl RegisterLink for FifoLink {
        fn read_register(&mut self, name: &str) -> Result<u32, RegisterError> {
            match name {
                registers::FIFO_OCCUPANCY => {
                    for _ in 0..self.arrivals.pop_front().unwrap_or(0) {
                        self.fifo.push_back(self.next_word);
                        self.next_word += 1;
                    }
                    self.occupancy_reads += 1;
                    if self.occupancy_reads == self.stop_after_reads {
                        self.sync.request_stop().unwrap();
                    }
                    Ok(self.fifo.len() as u32)
                }
                registers::CNT_LOST_EVENTS => Ok(0),
                _ => Ok(0),
            }
        }

        fn write_register(&mut self, _name: &str, _value: u32) -> Result<(), RegisterError> {
            Ok(())
        }

        fn read_block(&mut self, count: u32) -> Result<Vec<u32>, RegisterError> {
            if (self.fifo.len() as u32) < count {
                return Err(RegisterError::ShortBlockRead {
                    requested: count,
                    available: self.fifo.len(),
                });
            }
            Ok((0..count).filter_map(|_| self.fifo.pop_front()).collect())
        }
    }

    /// Occupancy sequence [0, 150, 64] with 128-word blocks: one full block
    /// after the second poll (remainder 22 stays buffered), stop, then a
    /// final drain of 22 + 64 = 86 words. Total on disk: 214 words, in
    /// order, nothing duplicated.
    #[test]
    fn drain_accounts_for_every_word_at_the_fifo_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_1000_rb07.dat");

        let sync = AcquisitionSynchronizer::new(&[7]);
        let link: SharedLink = Arc::new(Mutex::new(FifoLink::new(
            vec![0, 150, 64],
            2,
            sync.clone(),
        )));
        let worker = DrainWorker::new(
            1000,
            7,
            link,
            sync.clone(),
            path.clone(),
            Duration::from_millis(1),
            Duration::from_secs(5),
        );

        let (tx, rx) = channel();
        let handle = thread::spawn(move || worker.run(tx));
        sync.await_all_ready(Duration::from_secs(5)).unwrap();
        sync.request_start().unwrap();

        let report = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        handle.join().unwrap();

        match report {
            WorkerReport::Finished { board, stats } => {
                assert_eq!(board, 7);
                assert_eq!(stats.words, 214);
                assert_eq!(stats.events, 214 / u64::from(crate::constants::EVENT_WORDS));
            }
            other => panic!("expected a finished report, got {other:?}"),
        }

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 214 * 4);
        // order and uniqueness: words count up from zero exactly once
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            assert_eq!(u32::from_le_bytes(chunk.try_into().unwrap()), i as u32);
        }
    }

    #[test]
    fn start_timeout_fails_the_worker_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_0001_rb01.dat");

        let sync = AcquisitionSynchronizer::new(&[1]);
        let link: SharedLink = Arc::new(Mutex::new(FifoLink::new(vec![], 0, sync.clone())));
        let worker = DrainWorker::new(
            1,
            1,
            link,
            sync,
            path.clone(),
            Duration::from_millis(1),
            Duration::from_millis(20),
        );

        let (tx, rx) = channel();
        thread::spawn(move || worker.run(tx));
        let report = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        match report {
            WorkerReport::Failed { reason, stats, .. } => {
                assert!(reason.contains("start signal"));
                assert!(stats.is_none());
            }
            other => panic!("expected a failed report, got {other:?}"),
        }
        assert!(!path.exists());
    }
}
