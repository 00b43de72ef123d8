use std::time::Duration;

// Wire format
pub const WORD_BYTES: usize = 4;
/// Words per fixed-size FIFO block read, set by the readout firmware.
pub const BLOCK_WORDS: u32 = 128;
/// Words per event record in the front-end format.
pub const EVENT_WORDS: u32 = 64;

// Sensor geometry
pub const GRID_DIM: usize = 16;
pub const PIXELS_PER_CHIP: usize = GRID_DIM * GRID_DIM;
/// Highest programmable threshold DAC value (10 bit).
pub const DAC_MAX: u16 = 1023;

// Register link retry policy
pub const MAX_TRANSPORT_RETRIES: usize = 3;
pub const TRANSPORT_RETRY_BACKOFF: Duration = Duration::from_millis(10);
