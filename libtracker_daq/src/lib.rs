//! # tracker_daq
//!
//! tracker_daq is the run control for a self-triggered pixel-tracker data
//! acquisition, written in Rust. The sensors generate their own triggers
//! (no external reference detector); the controller calibrates per-pixel
//! thresholds from a noise scan, opens a timed acquisition window across
//! every configured readout board, and drains each board's hardware FIFO to
//! disk without loss or duplication while the window is open.
//!
//! ## Architecture
//!
//! One run controller drives the run life cycle:
//!
//! ```text
//! PENDING -> READY_WAIT -> ACQUIRING -> STOPPING -> FINALIZING -> LOGGED
//! ```
//!
//! with `ABORTED` reachable from any state on operator abort. Per run, one
//! drain worker thread exists per readout board; the controller and the
//! workers meet only at the [`synchronizer::AcquisitionSynchronizer`]
//! (ready/start/stop/abort) and at an mpsc channel carrying each worker's
//! final report. Board hardware is reached through the
//! [`registers::RegisterLink`] capability; a software board in
//! [`emulator`] lets the whole chain run without hardware.
//!
//! ## Configuration
//!
//! Configurations are YAML, loadable and saveable by the front end. The
//! template produced by `tracker_daq_cli new` looks like:
//!
//! ```yml
//! output_path: .
//! first_run_number: 0
//! n_runs: 1
//! acquisition_window_ms: 30000
//! ready_timeout_ms: 10000
//! start_timeout_ms: 20000
//! finalize_timeout_ms: 10000
//! poll_interval_ms: 500
//! reuse_thresholds: false
//! threshold_map_path: thresholds.yaml
//! scan:
//!   dac_start: 300
//!   dac_stop: 500
//!   dac_step: 4
//!   dwell_ms: 5
//! boards:
//! - id: 1
//!   chips:
//!   - id: 0
//!     threshold_offset: 16
//!   - id: 1
//!     threshold_offset: 16
//! ```
//!
//! With `reuse_thresholds: true` the map at `threshold_map_path` is loaded
//! verbatim and applied instead of scanning; it must cover every configured
//! chip with a full 16x16 grid or the session fails before any run starts.
//!
//! ## Output
//!
//! Per run the controller writes one frame file per board
//! (`run_0001_rb01.dat`, raw little-endian words in FIFO order), appends
//! one record to the append-only run log (`run_log.yaml`, one YAML document
//! per run with statistics and slow-control telemetry), and persists the
//! next run number to `next_run` with an atomic write-then-rename. A run
//! aborted before acquisition leaves none of these behind; a run degraded
//! by a failing board is logged with that board marked partial.
pub mod calibrate;
pub mod config;
pub mod constants;
pub mod controller;
pub mod drain;
pub mod emulator;
pub mod error;
pub mod frame_file;
pub mod registers;
pub mod run_log;
pub mod synchronizer;
pub mod telemetry;
pub mod threshold_map;
pub mod worker_status;
