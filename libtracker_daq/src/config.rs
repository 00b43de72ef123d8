use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;

/// One sensor chip on a readout board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipConfig {
    pub id: u8,
    /// Operator-supplied offset added to each pixel's scanned baseline to
    /// form the applied threshold. May be negative as long as the target
    /// stays inside the DAC range.
    pub threshold_offset: i16,
}

/// One readout board and the chips it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    pub id: u8,
    pub chips: Vec<ChipConfig>,
}

/// Parameters of the threshold noise scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub dac_start: u16,
    pub dac_stop: u16,
    pub dac_step: u16,
    /// Counting time per DAC point.
    pub dwell_ms: u64,
}

impl ScanConfig {
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    /// The DAC points of the sweep, inclusive of the endpoints the step
    /// lands on.
    pub fn steps(&self) -> Vec<u16> {
        if self.dac_step == 0 {
            return Vec::new();
        }
        (self.dac_start..=self.dac_stop)
            .step_by(self.dac_step as usize)
            .collect()
    }
}

/// Structure representing the application configuration. Contains run range,
/// timing and calibration information.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory receiving frame files, the run log and the run counter.
    pub output_path: PathBuf,
    /// Seed for the run counter when no counter file exists yet.
    pub first_run_number: u32,
    /// How many runs to take this session.
    pub n_runs: u32,
    pub acquisition_window_ms: u64,
    pub ready_timeout_ms: u64,
    pub start_timeout_ms: u64,
    /// Per-worker limit on draining and closing out after stop.
    pub finalize_timeout_ms: u64,
    /// Pacing of every bounded wait: readiness polls, the idle wait of an
    /// empty FIFO, abort checks during the window.
    pub poll_interval_ms: u64,
    /// Load `threshold_map_path` verbatim instead of scanning.
    pub reuse_thresholds: bool,
    /// Where a scan is saved, or where a reused map is loaded from.
    pub threshold_map_path: Option<PathBuf>,
    pub scan: ScanConfig,
    pub boards: Vec<BoardConfig>,
}

impl Default for Config {
    /// Template configuration with workable reference values.
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("."),
            first_run_number: 0,
            n_runs: 1,
            acquisition_window_ms: 30_000,
            ready_timeout_ms: 10_000,
            start_timeout_ms: 20_000,
            finalize_timeout_ms: 10_000,
            poll_interval_ms: 500,
            reuse_thresholds: false,
            threshold_map_path: Some(PathBuf::from("thresholds.yaml")),
            scan: ScanConfig {
                dac_start: 300,
                dac_stop: 500,
                dac_step: 4,
                dwell_ms: 5,
            },
            boards: vec![BoardConfig {
                id: 1,
                chips: vec![
                    ChipConfig {
                        id: 0,
                        threshold_offset: 16,
                    },
                    ChipConfig {
                        id: 1,
                        threshold_offset: 16,
                    },
                ],
            }],
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_runs == 0 {
            return Err(ConfigError::Invalid(String::from("n_runs must be at least 1")));
        }
        if self.boards.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "at least one readout board must be configured",
            )));
        }
        let mut ids: Vec<u8> = self.boards.iter().map(|b| b.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.boards.len() {
            return Err(ConfigError::Invalid(String::from("board ids must be unique")));
        }
        if self.reuse_thresholds && self.threshold_map_path.is_none() {
            return Err(ConfigError::Invalid(String::from(
                "reuse_thresholds requires threshold_map_path",
            )));
        }
        Ok(())
    }

    /// Construct the run string used in file names.
    fn run_str(run_number: u32) -> String {
        format!("run_{run_number:0>4}")
    }

    /// Frame file of one board for one run.
    pub fn frame_file_path(&self, run_number: u32, board: u8) -> PathBuf {
        self.output_path
            .join(format!("{}_rb{board:02}.dat", Self::run_str(run_number)))
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.output_path.join("run_log.yaml")
    }

    pub fn counter_file_path(&self) -> PathBuf {
        self.output_path.join("next_run")
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.acquisition_window_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_round_trips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.n_runs, config.n_runs);
        assert_eq!(back.boards.len(), config.boards.len());
        assert_eq!(back.scan.dac_start, config.scan.dac_start);
        back.validate().unwrap();
    }

    #[test]
    fn duplicate_board_ids_are_rejected() {
        let mut config = Config::default();
        config.boards = vec![
            BoardConfig { id: 4, chips: Vec::new() },
            BoardConfig { id: 4, chips: Vec::new() },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn scan_steps_cover_the_range() {
        let scan = ScanConfig {
            dac_start: 100,
            dac_stop: 112,
            dac_step: 4,
            dwell_ms: 0,
        };
        assert_eq!(scan.steps(), vec![100, 104, 108, 112]);
    }
}
