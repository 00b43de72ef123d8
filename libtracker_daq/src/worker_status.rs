use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::constants::{EVENT_WORDS, WORD_BYTES};

/// Per-board summary of one run, computed once when the drain finishes and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub run_number: u32,
    pub board_id: u8,
    pub words: u64,
    pub events: u64,
    pub events_lost: u64,
    pub elapsed_seconds: f64,
    pub throughput_bits_per_second: f64,
}

impl RunStatistics {
    pub fn compute(
        run_number: u32,
        board_id: u8,
        words: u64,
        events_lost: u64,
        elapsed: Duration,
    ) -> Self {
        let elapsed_seconds = elapsed.as_secs_f64();
        let bits = words * WORD_BYTES as u64 * 8;
        let throughput_bits_per_second = if elapsed_seconds > 0.0 {
            bits as f64 / elapsed_seconds
        } else {
            0.0
        };
        Self {
            run_number,
            board_id,
            words,
            events: words / u64::from(EVENT_WORDS),
            events_lost,
            elapsed_seconds,
            throughput_bits_per_second,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.words * WORD_BYTES as u64
    }
}

/// What a drain worker sends back to the controller when it ends.
#[derive(Debug, Clone)]
pub enum WorkerReport {
    Finished {
        board: u8,
        stats: RunStatistics,
    },
    /// The worker failed but flushed what it had; the board's data is
    /// partial, not lost.
    Failed {
        board: u8,
        reason: String,
        stats: Option<RunStatistics>,
    },
    /// Released by an abort before the acquisition opened; no file was
    /// created.
    AbortedBeforeStart { board: u8 },
}

impl WorkerReport {
    pub fn board(&self) -> u8 {
        match self {
            WorkerReport::Finished { board, .. } => *board,
            WorkerReport::Failed { board, .. } => *board,
            WorkerReport::AbortedBeforeStart { board } => *board,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_derive_events_and_throughput() {
        let stats = RunStatistics::compute(1000, 7, 214, 1, Duration::from_secs(2));
        assert_eq!(stats.events, 3); // 214 words / 64 words per event
        assert_eq!(stats.events_lost, 1);
        assert_eq!(stats.bytes(), 856);
        assert!((stats.throughput_bits_per_second - 856.0 * 8.0 / 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_elapsed_does_not_divide_by_zero() {
        let stats = RunStatistics::compute(1, 1, 128, 0, Duration::ZERO);
        assert_eq!(stats.throughput_bits_per_second, 0.0);
    }
}
