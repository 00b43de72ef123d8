//! Software stand-in for a readout board.
//!
//! Lets the whole chain — calibration scan, handshake, drain, run log — be
//! exercised on a machine with no hardware attached: commissioning dry
//! runs, CI, and the shipped front end all use it. Register semantics
//! mirror the firmware: the FIFO fills while triggers are enabled, overflow
//! increments the lost-event counter, and each pixel's trigger counter
//! traces a falling S-curve around a per-pixel baseline.

use std::collections::VecDeque;

use fxhash::FxHashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::constants::GRID_DIM;
use super::error::RegisterError;
use super::registers::{self, RegisterLink};
use super::telemetry::{BoardTelemetry, TelemetrySource};

/// Words the emulated FIFO can buffer before it drops events.
const FIFO_CAPACITY: usize = 16_384;
/// Mean words arriving between two occupancy polls while triggered.
const WORDS_PER_POLL: u32 = 96;
/// Half-width (in DAC counts) of the emulated noise transition.
const NOISE_HALF_WIDTH: i32 = 3;
/// Counter value of a pixel sitting fully in the noise.
const NOISE_COUNTS: i32 = 1000;

pub struct EmulatedBoard {
    rng: StdRng,
    registers: FxHashMap<String, u32>,
    /// Per-pixel baselines, keyed by the pixel's DAC register name.
    baselines: FxHashMap<String, i32>,
    fifo: VecDeque<u32>,
    next_word: u32,
    lost_events: u32,
}

impl EmulatedBoard {
    pub fn new(board: u8, chips: &[u8]) -> Self {
        // seeded by the board id: deterministic, distinct per board
        let mut rng = StdRng::seed_from_u64(u64::from(board));
        let mut baselines = FxHashMap::default();
        for chip in chips {
            for row in 0..GRID_DIM {
                for col in 0..GRID_DIM {
                    baselines.insert(
                        registers::pixel_dac(*chip, row, col),
                        rng.random_range(380..=420),
                    );
                }
            }
        }
        Self {
            rng,
            registers: FxHashMap::default(),
            baselines,
            fifo: VecDeque::new(),
            next_word: 0,
            lost_events: 0,
        }
    }

    fn triggers_enabled(&self) -> bool {
        self.registers
            .get(registers::TRIGGER_ENABLE)
            .copied()
            .unwrap_or(0)
            == 1
    }

    /// Event data trickles in while the trigger path is open; an occupancy
    /// poll is the natural point to take delivery.
    fn refill(&mut self) {
        if !self.triggers_enabled() {
            return;
        }
        let arriving = self.rng.random_range(0..=2 * WORDS_PER_POLL);
        for _ in 0..arriving {
            if self.fifo.len() >= FIFO_CAPACITY {
                self.lost_events += 1;
                continue;
            }
            self.fifo.push_back(self.next_word);
            self.next_word = self.next_word.wrapping_add(1);
        }
    }

    fn pixel_counts(&self, counter_name: &str) -> u32 {
        let dac_name = counter_name.replace("/counter", "/dac");
        let Some(baseline) = self.baselines.get(&dac_name) else {
            return 0;
        };
        let dac = self.registers.get(&dac_name).copied().unwrap_or(0) as i32;
        let low = baseline - NOISE_HALF_WIDTH;
        let high = baseline + NOISE_HALF_WIDTH;
        if dac < low {
            NOISE_COUNTS as u32
        } else if dac >= high {
            0
        } else {
            (NOISE_COUNTS * (high - dac) / (high - low)) as u32
        }
    }
}

impl RegisterLink for EmulatedBoard {
    fn read_register(&mut self, name: &str) -> Result<u32, RegisterError> {
        match name {
            registers::FIFO_OCCUPANCY => {
                self.refill();
                Ok(self.fifo.len() as u32)
            }
            registers::CNT_LOST_EVENTS => Ok(self.lost_events),
            _ if name.ends_with("/counter") => Ok(self.pixel_counts(name)),
            _ => Ok(self.registers.get(name).copied().unwrap_or(0)),
        }
    }

    fn write_register(&mut self, name: &str, value: u32) -> Result<(), RegisterError> {
        match name {
            registers::FIFO_RESET => self.fifo.clear(),
            registers::CNT_RESET => self.lost_events = 0,
            _ => {
                self.registers.insert(name.to_owned(), value);
            }
        }
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

/// Plausible slow-control values with a little jitter.
pub struct EmulatedTelemetry {
    rng: StdRng,
}

impl EmulatedTelemetry {
    pub fn new() -> Self {
        Self {
            rng: StdRng::seed_from_u64(0x7e1e),
        }
    }
}

impl Default for EmulatedTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for EmulatedTelemetry {
    fn sample(&mut self, _board: u8) -> Option<BoardTelemetry> {
        Some(BoardTelemetry {
            bias_voltage_v: 150.0 + self.rng.random_range(-0.5..0.5),
            leakage_current_ua: 2.0 + self.rng.random_range(-0.2..0.2),
            chip_temperature_c: 28.0 + self.rng.random_range(-1.0..1.0),
        })
    }
}
