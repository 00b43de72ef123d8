//! Per-pixel threshold calibration from a noise scan.
//!
//! For every pixel the threshold DAC is swept across the configured range
//! while the pixel's trigger counter is read at each point. Low thresholds
//! sit in the noise and count heavily; past the baseline the counter goes
//! quiet. The applied threshold is the extracted baseline plus the chip's
//! operator-supplied offset.

use ndarray::Array2;
use std::thread;

use super::config::{BoardConfig, ChipConfig, ScanConfig};
use super::constants::{DAC_MAX, GRID_DIM, PIXELS_PER_CHIP};
use super::error::CalibrationError;
use super::registers::{self, SharedLink};
use super::threshold_map::{BoardThresholds, ChipMap, PixelThreshold, ThresholdMap};

pub struct ThresholdCalibrator {
    scan: ScanConfig,
}

impl ThresholdCalibrator {
    pub fn new(scan: ScanConfig) -> Self {
        Self { scan }
    }

    /// Calibrate every chip of one board. A chip whose scan fails is
    /// excluded from the run and reported here; it never takes the other
    /// chips or the run down with it.
    pub fn calibrate_board(&self, board: u8, chips: &[ChipConfig], link: &SharedLink) -> BoardThresholds {
        let mut thresholds = BoardThresholds {
            board,
            chips: Vec::new(),
        };
        for chip in chips {
            match self.scan_chip(chip, link) {
                Ok(map) => {
                    if let Some((baseline, noise)) = map.baseline_summary() {
                        spdlog::info!(
                            "board {board:02} chip {:02}: {} of {PIXELS_PER_CHIP} pixels calibrated (mean baseline {baseline:.1}, mean noise width {noise:.1})",
                            chip.id,
                            map.valid_pixels()
                        );
                    }
                    thresholds.chips.push(map);
                }
                Err(e) => {
                    spdlog::error!("board {board:02} chip {:02} excluded from the run: {e}", chip.id);
                }
            }
        }
        thresholds
    }

    /// Sweep one chip. Fails only if the scan cannot produce a single valid
    /// baseline (or the scan range itself is unusable).
    pub fn scan_chip(&self, chip: &ChipConfig, link: &SharedLink) -> Result<ChipMap, CalibrationError> {
        let steps = self.scan.steps();
        if steps.len() < 2 {
            return Err(CalibrationError::BadScanRange {
                start: self.scan.dac_start,
                stop: self.scan.dac_stop,
                step: self.scan.dac_step,
            });
        }
        let dwell = self.scan.dwell();
        let counter_reset = registers::chip_counter_reset(chip.id);

        let mut counts = Array2::<u32>::zeros((PIXELS_PER_CHIP, steps.len()));
        for row in 0..GRID_DIM {
            for col in 0..GRID_DIM {
                let dac_reg = registers::pixel_dac(chip.id, row, col);
                let counter_reg = registers::pixel_counter(chip.id, row, col);
                for (step, dac) in steps.iter().enumerate() {
                    {
                        let mut guard = registers::lock(link)?;
                        guard.write_register(&dac_reg, u32::from(*dac))?;
                        guard.write_register(&counter_reset, 1)?;
                    }
                    if !dwell.is_zero() {
                        thread::sleep(dwell);
                    }
                    counts[[row * GRID_DIM + col, step]] =
                        registers::lock(link)?.read_register(&counter_reg)?;
                }
            }
        }

        let mut map = ChipMap::new(chip.id, chip.threshold_offset);
        let mut failed = 0usize;
        for row in 0..GRID_DIM {
            for col in 0..GRID_DIM {
                let pixel_counts = counts.row(row * GRID_DIM + col).to_vec();
                match derive_baseline(&pixel_counts, &steps) {
                    Some((baseline, noise_width)) => {
                        let target = i32::from(baseline) + i32::from(chip.threshold_offset);
                        if target < 0 || target > i32::from(DAC_MAX) {
                            spdlog::warn!(
                                "chip {:02} pixel ({row}, {col}): threshold {target} is outside the DAC range, pixel marked failed",
                                chip.id
                            );
                            failed += 1;
                        } else {
                            map.set(
                                row,
                                col,
                                PixelThreshold {
                                    baseline,
                                    noise_width,
                                    threshold: target as u16,
                                },
                            );
                        }
                    }
                    None => {
                        spdlog::warn!(
                            "chip {:02} pixel ({row}, {col}): no threshold transition, pixel marked failed",
                            chip.id
                        );
                        failed += 1;
                    }
                }
            }
        }

        if map.valid_pixels() == 0 {
            return Err(CalibrationError::ChipAborted(chip.id));
        }
        if failed > 0 {
            spdlog::warn!("chip {:02}: {failed} pixels without a valid baseline", chip.id);
        }
        Ok(map)
    }
}

/// Extract the baseline and noise width from one pixel's scan counts.
///
/// The baseline is the first DAC point where the count falls below half of
/// the pixel's maximum; the noise width is the DAC span between the 90% and
/// 10% count levels (at least one step). Returns None for a flat response
/// (never noisy, or never going quiet) and for a non-monotonic one (the
/// count recovers above half after the crossing).
fn derive_baseline(counts: &[u32], steps: &[u16]) -> Option<(u16, u16)> {
    let max = *counts.iter().max()?;
    if max == 0 {
        return None;
    }
    let half = f64::from(max) / 2.0;
    if f64::from(counts[0]) < half {
        // transition sits below the scan range
        return None;
    }
    let crossing = counts.iter().position(|&c| f64::from(c) < half)?;
    if counts[crossing..].iter().any(|&c| f64::from(c) >= half) {
        return None;
    }

    let baseline = steps[crossing];
    let hi_level = f64::from(max) * 0.9;
    let lo_level = f64::from(max) * 0.1;
    let hi = counts
        .iter()
        .rposition(|&c| f64::from(c) >= hi_level)
        .unwrap_or(0);
    let lo = counts
        .iter()
        .position(|&c| f64::from(c) <= lo_level)
        .unwrap_or(counts.len() - 1);
    let step_size = steps[1].saturating_sub(steps[0]);
    let noise_width = steps[lo].saturating_sub(steps[hi]).max(step_size);
    Some((baseline, noise_width))
}

/// Write every valid pixel threshold of one board to the hardware. Failed
/// pixels keep whatever DAC value they already hold.
pub fn apply_board(thresholds: &BoardThresholds, link: &SharedLink) -> Result<(), CalibrationError> {
    for chip in &thresholds.chips {
        for row in 0..GRID_DIM {
            for col in 0..GRID_DIM {
                if let Some(pixel) = chip.get(row, col) {
                    registers::lock(link)?.write_register(
                        &registers::pixel_dac(chip.chip, row, col),
                        u32::from(pixel.threshold),
                    )?;
                }
            }
        }
    }
    Ok(())
}

/// Validate a previously saved map against the configured boards: every
/// configured chip must be present with a full grid. Fails fast before any
/// threshold is applied.
pub fn check_reused_map(map: &ThresholdMap, boards: &[BoardConfig]) -> Result<(), CalibrationError> {
    for board in boards {
        for chip in &board.chips {
            match map.chip(board.id, chip.id) {
                Some(chip_map) => chip_map.check_dimensions()?,
                None => {
                    return Err(CalibrationError::MissingChip {
                        board: board.id,
                        chip: chip.id,
                    })
                }
            }
        }
    }
    Ok(())
}
