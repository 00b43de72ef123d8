use serde::{Deserialize, Serialize};
use std::path::Path;

use super::constants::PIXELS_PER_CHIP;
use super::error::CalibrationError;

pub use super::constants::GRID_DIM;

/// Calibration result for one pixel. `threshold` is the DAC value applied
/// during acquisition and always equals `baseline + chip offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelThreshold {
    pub baseline: u16,
    pub noise_width: u16,
    pub threshold: u16,
}

/// The 16x16 threshold grid of one chip. Pixels whose scan produced no
/// valid baseline are `None` and excluded from the calibration report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipMap {
    pub chip: u8,
    pub offset: i16,
    /// Row-major, always `GRID_DIM * GRID_DIM` entries.
    pub pixels: Vec<Option<PixelThreshold>>,
}

impl ChipMap {
    pub fn new(chip: u8, offset: i16) -> Self {
        Self {
            chip,
            offset,
            pixels: vec![None; PIXELS_PER_CHIP],
        }
    }

    fn index(row: usize, col: usize) -> usize {
        row * GRID_DIM + col
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&PixelThreshold> {
        self.pixels.get(Self::index(row, col))?.as_ref()
    }

    pub fn set(&mut self, row: usize, col: usize, value: PixelThreshold) {
        self.pixels[Self::index(row, col)] = Some(value);
    }

    pub fn valid_pixels(&self) -> usize {
        self.pixels.iter().filter(|p| p.is_some()).count()
    }

    pub fn failed_pixels(&self) -> Vec<(usize, usize)> {
        self.pixels
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| (i / GRID_DIM, i % GRID_DIM))
            .collect()
    }

    /// Mean baseline and mean noise width over the valid pixels, for the
    /// calibration report. None if the chip has no valid pixel.
    pub fn baseline_summary(&self) -> Option<(f64, f64)> {
        let valid: Vec<&PixelThreshold> = self.pixels.iter().flatten().collect();
        if valid.is_empty() {
            return None;
        }
        let n = valid.len() as f64;
        let mean_base = valid.iter().map(|p| f64::from(p.baseline)).sum::<f64>() / n;
        let mean_noise = valid.iter().map(|p| f64::from(p.noise_width)).sum::<f64>() / n;
        Some((mean_base, mean_noise))
    }

    /// A reused map must carry a full grid for every chip.
    pub fn check_dimensions(&self) -> Result<(), CalibrationError> {
        if self.pixels.len() != PIXELS_PER_CHIP {
            return Err(CalibrationError::DimensionMismatch {
                chip: self.chip,
                expected: PIXELS_PER_CHIP,
                found: self.pixels.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardThresholds {
    pub board: u8,
    pub chips: Vec<ChipMap>,
}

impl BoardThresholds {
    pub fn chip(&self, chip: u8) -> Option<&ChipMap> {
        self.chips.iter().find(|c| c.chip == chip)
    }
}

/// Thresholds for every calibrated chip of every board, persisted to YAML
/// so later runs can reuse them without rescanning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdMap {
    pub boards: Vec<BoardThresholds>,
}

impl ThresholdMap {
    pub fn board(&self, board: u8) -> Option<&BoardThresholds> {
        self.boards.iter().find(|b| b.board == board)
    }

    pub fn chip(&self, board: u8, chip: u8) -> Option<&ChipMap> {
        self.board(board)?.chip(chip)
    }

    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        if !path.exists() {
            return Err(CalibrationError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml_str)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_are_row_major() {
        let mut map = ChipMap::new(2, 16);
        map.set(
            1,
            3,
            PixelThreshold {
                baseline: 400,
                noise_width: 4,
                threshold: 416,
            },
        );
        assert_eq!(map.get(1, 3).unwrap().threshold, 416);
        assert!(map.get(3, 1).is_none());
        assert_eq!(map.valid_pixels(), 1);
        assert_eq!(map.failed_pixels().len(), PIXELS_PER_CHIP - 1);
    }

    #[test]
    fn truncated_grid_fails_the_dimension_check() {
        let mut map = ChipMap::new(0, 0);
        map.pixels.truncate(100);
        assert!(map.check_dimensions().is_err());
    }

    #[test]
    fn map_round_trips_through_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thresholds.yaml");

        let mut chip = ChipMap::new(0, -8);
        chip.set(
            0,
            0,
            PixelThreshold {
                baseline: 402,
                noise_width: 3,
                threshold: 394,
            },
        );
        let map = ThresholdMap {
            boards: vec![BoardThresholds {
                board: 1,
                chips: vec![chip],
            }],
        };
        map.save(&path).unwrap();

        let back = ThresholdMap::load(&path).unwrap();
        let pixel = back.chip(1, 0).unwrap().get(0, 0).unwrap();
        assert_eq!(pixel.baseline, 402);
        assert_eq!(pixel.threshold, 394);
    }
}
