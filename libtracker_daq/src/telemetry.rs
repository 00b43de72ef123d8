use serde::{Deserialize, Serialize};

/// Slow-control snapshot of one board, taken once per run while finalizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardTelemetry {
    pub bias_voltage_v: f64,
    pub leakage_current_ua: f64,
    pub chip_temperature_c: f64,
}

/// Provider of slow-control readings. An unavailable or failing source
/// yields None; missing telemetry never degrades or aborts a run.
pub trait TelemetrySource: Send {
    fn sample(&mut self, board: u8) -> Option<BoardTelemetry>;
}

/// Source for setups without a slow-control path wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTelemetry;

impl TelemetrySource for NoTelemetry {
    fn sample(&mut self, _board: u8) -> Option<BoardTelemetry> {
        None
    }
}
