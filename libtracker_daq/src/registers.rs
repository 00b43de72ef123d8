//! Names of the control registers exposed by a readout board, the
//! register-access capability the rest of the crate is written against, and
//! convenience functions to drive the trigger-related registers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use super::constants::{MAX_TRANSPORT_RETRIES, TRANSPORT_RETRY_BACKOFF};
use super::error::RegisterError;

/// Gate for the sensor self-trigger path. 1 = triggers reach the readout.
pub const TRIGGER_ENABLE: &str = "trigger_enable";
/// Rate of the firmware-generated test triggers. Forced to zero during data
/// taking; physics triggers come only from the sensors themselves.
pub const TRIG_GEN_RATE: &str = "trig_gen_rate";
/// Number of data words currently buffered in the readout FIFO.
pub const FIFO_OCCUPANCY: &str = "fifo_occupancy";
/// Write 1 to flush the readout FIFO.
pub const FIFO_RESET: &str = "fifo_reset";
/// Events dropped by the firmware since the last counter reset.
pub const CNT_LOST_EVENTS: &str = "cnt_lost_events";
/// Write 1 to reset the event and lost-event counters.
pub const CNT_RESET: &str = "cnt_reset";

/// Threshold DAC register of one pixel.
pub fn pixel_dac(chip: u8, row: usize, col: usize) -> String {
    format!("chip{chip:02}/pix{row:02}_{col:02}/dac")
}

/// Trigger counter register of one pixel.
pub fn pixel_counter(chip: u8, row: usize, col: usize) -> String {
    format!("chip{chip:02}/pix{row:02}_{col:02}/counter")
}

/// Per-chip reset of all pixel trigger counters.
pub fn chip_counter_reset(chip: u8) -> String {
    format!("chip{chip:02}/cnt_reset")
}

/// The register-access capability of one readout board.
///
/// Implementations wrap whatever transport the board speaks. All calls are
/// potentially blocking I/O and may fail; retry policy is the caller's
/// business (see [`with_retry`]).
pub trait RegisterLink: Send {
    fn read_register(&mut self, name: &str) -> Result<u32, RegisterError>;
    fn write_register(&mut self, name: &str, value: u32) -> Result<(), RegisterError>;
    /// Read `count` words from the FIFO. Must return exactly `count` words.
    fn read_block(&mut self, count: u32) -> Result<Vec<u32>, RegisterError>;
}

/// A register link shared between the controller and a drain worker.
///
/// Boards that sit behind the same physical transport share the mutex, which
/// serializes access per link.
pub type SharedLink = Arc<Mutex<dyn RegisterLink>>;

pub fn lock(link: &SharedLink) -> Result<MutexGuard<'_, dyn RegisterLink + 'static>, RegisterError> {
    link.lock().map_err(|_| RegisterError::LinkPoisoned)
}

/// Enable the sensor self-trigger path.
pub fn enable_trigger(link: &SharedLink) -> Result<(), RegisterError> {
    spdlog::trace!("enable triggers");
    lock(link)?.write_register(TRIGGER_ENABLE, 1)
}

/// Stop all triggers.
pub fn disable_trigger(link: &SharedLink) -> Result<(), RegisterError> {
    spdlog::trace!("disable triggers");
    lock(link)?.write_register(TRIGGER_ENABLE, 0)
}

/// Force the generated-trigger rate to zero.
pub fn force_trigger_rate_zero(link: &SharedLink) -> Result<(), RegisterError> {
    lock(link)?.write_register(TRIG_GEN_RATE, 0)
}

/// Flush the readout FIFO.
pub fn reset_fifo(link: &SharedLink) -> Result<(), RegisterError> {
    lock(link)?.write_register(FIFO_RESET, 1)
}

/// Reset the event and lost-event counters.
pub fn reset_event_counters(link: &SharedLink) -> Result<(), RegisterError> {
    lock(link)?.write_register(CNT_RESET, 1)
}

/// Run a register operation with the bounded transport retry policy: up to
/// [`MAX_TRANSPORT_RETRIES`] attempts with a fixed backoff, then the last
/// error escalates to the caller.
pub fn with_retry<T>(
    mut op: impl FnMut() -> Result<T, RegisterError>,
) -> Result<T, RegisterError> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < MAX_TRANSPORT_RETRIES => {
                spdlog::warn!(
                    "register link error (attempt {attempt}/{MAX_TRANSPORT_RETRIES}): {e}"
                );
                attempt += 1;
                thread::sleep(TRANSPORT_RETRY_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}
