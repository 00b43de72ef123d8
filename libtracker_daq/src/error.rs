use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RegisterError {
    #[error("Register {0} could not be read over the control link")]
    ReadFailed(String),
    #[error("Register {0} could not be written over the control link")]
    WriteFailed(String),
    #[error("Block read of {0} words failed over the control link")]
    BlockReadFailed(u32),
    #[error("Block read asked for {requested} words but only {available} were available")]
    ShortBlockRead { requested: u32, available: usize },
    #[error("The control link mutex was poisoned by a panicking worker")]
    LinkPoisoned,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Error)]
pub enum SynchronizerError {
    #[error("Board {0:02} is not registered with the synchronizer")]
    UnknownBoard(u8),
    #[error("Start was requested while boards {0:?} had not signalled ready")]
    NotAllReady(Vec<u8>),
    #[error("Boards {0:?} did not signal ready before the timeout")]
    ReadyTimeout(Vec<u8>),
    #[error("The start signal was not received before the timeout")]
    StartTimeout,
    #[error("Stop was requested before start")]
    StopBeforeStart,
    #[error("The handshake state mutex was poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Chip {0:02} has no pixel with a valid baseline; scan aborted for this chip")]
    ChipAborted(u8),
    #[error("Reused threshold map has no entry for board {board:02} chip {chip:02}")]
    MissingChip { board: u8, chip: u8 },
    #[error("Threshold map for chip {chip:02} holds {found} pixels; expected a full {expected}-pixel grid")]
    DimensionMismatch { chip: u8, expected: usize, found: usize },
    #[error("Threshold scan range {start}..={stop} with step {step} yields fewer than two DAC points")]
    BadScanRange { start: u16, stop: u16, step: u16 },
    #[error("Could not load threshold map as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Calibration failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Calibration failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Calibration failed on the register link: {0}")]
    RegisterError(#[from] RegisterError),
}

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("Drain failed on the register link: {0}")]
    RegisterError(#[from] RegisterError),
    #[error("Drain failed during the handshake: {0}")]
    HandshakeError(#[from] SynchronizerError),
    #[error("Drain failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("Run log failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Run log failed to convert to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Run {0} was aborted by the operator")]
    Aborted(u32),
    #[error("Controller failed due to handshake error: {0}")]
    SynchronizerError(#[from] SynchronizerError),
    #[error("Controller failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Controller failed due to calibration error: {0}")]
    CalibrationError(#[from] CalibrationError),
    #[error("Controller failed due to run log error: {0}")]
    RunLogError(#[from] RunLogError),
    #[error("Controller failed on the register link: {0}")]
    RegisterError(#[from] RegisterError),
    #[error("Controller failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Run counter file {0:?} is corrupt")]
    CorruptCounter(PathBuf),
}
