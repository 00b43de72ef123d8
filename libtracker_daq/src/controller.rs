//! The per-run state machine and the loop over the configured run range.
//!
//! The controller owns the run identifiers, the acquisition window timer,
//! the trigger-enable registers and the run log. Everything board-side
//! happens in the drain workers; the controller only coordinates them
//! through the synchronizer and collects their reports.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use fxhash::FxHashMap;
use human_bytes::human_bytes;
use time::OffsetDateTime;

use super::calibrate::{self, ThresholdCalibrator};
use super::config::{BoardConfig, ChipConfig, Config};
use super::drain::DrainWorker;
use super::error::{ControllerError, SynchronizerError};
use super::registers::{self, SharedLink};
use super::run_log::{BoardRecord, RunLogRecord, RunLogger, RunQuality};
use super::synchronizer::AcquisitionSynchronizer;
use super::telemetry::TelemetrySource;
use super::threshold_map::ThresholdMap;
use super::worker_status::WorkerReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    ReadyWait,
    Acquiring,
    Stopping,
    Finalizing,
    Logged,
    Aborted,
}

/// Cooperative cancellation flag handed to the operator interface. Abort is
/// best-effort: workers still drain and close their files so the hardware
/// FIFO is clean for the next run.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Coarse progress shared with a front end, polled rather than pushed.
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    pub run_number: u32,
    pub fraction: f32,
}

/// One readout board as the controller sees it: its identity, its chips and
/// the register link it is reached over.
pub struct BoardHandle {
    pub id: u8,
    pub chips: Vec<ChipConfig>,
    pub link: SharedLink,
}

impl BoardHandle {
    pub fn new(config: &BoardConfig, link: SharedLink) -> Self {
        Self {
            id: config.id,
            chips: config.chips.clone(),
            link,
        }
    }
}

pub struct RunController {
    config: Config,
    boards: Vec<BoardHandle>,
    telemetry: Box<dyn TelemetrySource>,
    logger: RunLogger,
    abort: AbortHandle,
    progress: Arc<Mutex<RunProgress>>,
    thresholds: Option<ThresholdMap>,
}

impl RunController {
    pub fn new(config: Config, boards: Vec<BoardHandle>, telemetry: Box<dyn TelemetrySource>) -> Self {
        let logger = RunLogger::new(config.run_log_path());
        Self {
            config,
            boards,
            telemetry,
            logger,
            abort: AbortHandle::default(),
            progress: Arc::new(Mutex::new(RunProgress::default())),
            thresholds: None,
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn progress(&self) -> Arc<Mutex<RunProgress>> {
        self.progress.clone()
    }

    /// Thresholds as applied to the hardware, available once `execute` has
    /// passed calibration.
    pub fn thresholds(&self) -> Option<&ThresholdMap> {
        self.thresholds.as_ref()
    }

    /// Calibrate (or reuse) thresholds, then take every run in the
    /// configured range. An operator abort skips all remaining runs.
    pub fn execute(&mut self) -> Result<(), ControllerError> {
        self.config.validate()?;
        std::fs::create_dir_all(&self.config.output_path)?;
        self.configure_thresholds()?;

        let counter_path = self.config.counter_file_path();
        let first = load_run_counter(&counter_path, self.config.first_run_number)?;
        let last = first + self.config.n_runs;
        spdlog::info!(
            "taking runs {first}..={} on {} board(s)",
            last - 1,
            self.boards.len()
        );
        for run_number in first..last {
            self.execute_run(run_number)?;
        }
        Ok(())
    }

    fn configure_thresholds(&mut self) -> Result<(), ControllerError> {
        let map = if self.config.reuse_thresholds {
            // reuse: load verbatim, fail fast on shape mismatch, skip the scan
            let path = self.config.threshold_map_path.clone().ok_or_else(|| {
                ControllerError::ConfigError(super::error::ConfigError::Invalid(String::from(
                    "reuse_thresholds requires threshold_map_path",
                )))
            })?;
            let map = ThresholdMap::load(&path)?;
            calibrate::check_reused_map(&map, &self.config.boards)?;
            spdlog::info!("reusing threshold map from {}", path.display());
            map
        } else {
            let calibrator = ThresholdCalibrator::new(self.config.scan.clone());
            let mut map = ThresholdMap::default();
            for board in &self.boards {
                map.boards
                    .push(calibrator.calibrate_board(board.id, &board.chips, &board.link));
            }
            if let Some(path) = &self.config.threshold_map_path {
                map.save(path)?;
                spdlog::info!("threshold map saved to {}", path.display());
            }
            map
        };

        for board in &self.boards {
            if let Some(thresholds) = map.board(board.id) {
                calibrate::apply_board(thresholds, &board.link)?;
            }
        }
        self.thresholds = Some(map);
        Ok(())
    }

    fn execute_run(&mut self, run_number: u32) -> Result<(), ControllerError> {
        self.advance(run_number, RunState::Pending);
        self.set_progress(run_number, 0.0);
        let board_ids: Vec<u8> = self.boards.iter().map(|b| b.id).collect();
        let sync = AcquisitionSynchronizer::new(&board_ids);
        let (tx, rx) = channel();

        // PENDING -> READY_WAIT: one drain worker per board
        let mut handles: Vec<(u8, JoinHandle<()>)> = Vec::new();
        for board in &self.boards {
            let worker = DrainWorker::new(
                run_number,
                board.id,
                board.link.clone(),
                sync.clone(),
                self.config.frame_file_path(run_number, board.id),
                self.config.poll_interval(),
                self.config.start_timeout(),
            );
            let worker_tx = tx.clone();
            handles.push((board.id, thread::spawn(move || worker.run(worker_tx))));
        }
        drop(tx);
        self.advance(run_number, RunState::ReadyWait);

        // READY_WAIT -> ACQUIRING, polling in slices so an operator abort
        // is observed within one poll interval
        let deadline = Instant::now() + self.config.ready_timeout();
        loop {
            if self.abort.is_aborted() {
                self.advance(run_number, RunState::Aborted);
                spdlog::warn!("run {run_number}: operator abort before acquisition; run not logged");
                self.release_workers(&sync, &rx, handles);
                return Err(ControllerError::Aborted(run_number));
            }
            let now = Instant::now();
            let slice = self.config.poll_interval().min(deadline.saturating_duration_since(now));
            match sync.await_all_ready(slice) {
                Ok(()) => break,
                Err(SynchronizerError::ReadyTimeout(missing)) => {
                    if now >= deadline {
                        self.advance(run_number, RunState::Aborted);
                        spdlog::error!(
                            "run {run_number}: boards {missing:?} never signalled ready; run aborted"
                        );
                        self.release_workers(&sync, &rx, handles);
                        return Err(SynchronizerError::ReadyTimeout(missing).into());
                    }
                }
                Err(e) => {
                    self.release_workers(&sync, &rx, handles);
                    return Err(e.into());
                }
            }
        }

        // ACQUIRING: trigger enable, start mark, start signal
        for board in &self.boards {
            if let Err(e) = registers::enable_trigger(&board.link) {
                spdlog::error!(
                    "run {run_number}: board {:02} trigger enable failed: {e}; run aborted",
                    board.id
                );
                self.disable_all_triggers();
                self.release_workers(&sync, &rx, handles);
                return Err(e.into());
            }
        }
        let started = OffsetDateTime::now_utc();
        let window_start = Instant::now();
        sync.request_start()?;
        self.advance(run_number, RunState::Acquiring);
        spdlog::info!(
            "run {run_number}: acquiring for {} ms",
            self.config.acquisition_window_ms
        );

        // timer-driven window, abort-aware
        let window = self.config.window();
        let mut aborted_mid_run = false;
        loop {
            let elapsed = window_start.elapsed();
            if elapsed >= window {
                break;
            }
            if self.abort.is_aborted() {
                spdlog::warn!("run {run_number}: operator abort during acquisition");
                aborted_mid_run = true;
                break;
            }
            if !window.is_zero() {
                self.set_progress(
                    run_number,
                    (elapsed.as_secs_f32() / window.as_secs_f32()).min(1.0),
                );
            }
            thread::sleep((window - elapsed).min(self.config.poll_interval()));
        }

        // STOPPING: triggers off before the stop signal so the final drain
        // sees a quiescent FIFO
        self.disable_all_triggers();
        sync.request_stop()?;
        self.advance(run_number, RunState::Stopping);

        let (mut reports, timed_out) = self.collect_reports(&rx);
        let mut degraded = aborted_mid_run || timed_out;
        for (board, handle) in handles {
            if reports.contains_key(&board) {
                if handle.join().is_err() {
                    spdlog::error!("run {run_number}: board {board:02} drain worker panicked");
                    degraded = true;
                }
            } else {
                // a hung worker is detached, never joined without bound
                spdlog::error!(
                    "run {run_number}: board {board:02} did not finalize before the timeout; data marked partial"
                );
                degraded = true;
            }
        }
        self.advance(run_number, RunState::Finalizing);

        // FINALIZING -> LOGGED: statistics + telemetry into one record
        let mut board_records = Vec::with_capacity(self.boards.len());
        for board in &self.boards {
            let (partial, statistics) = match reports.remove(&board.id) {
                Some(WorkerReport::Finished { stats, .. }) => (false, Some(stats)),
                Some(WorkerReport::Failed { reason, stats, .. }) => {
                    spdlog::error!("run {run_number}: board {:02} failed: {reason}", board.id);
                    degraded = true;
                    (true, stats)
                }
                Some(WorkerReport::AbortedBeforeStart { .. }) | None => {
                    degraded = true;
                    (true, None)
                }
            };
            board_records.push(BoardRecord {
                board_id: board.id,
                partial,
                statistics,
                telemetry: self.telemetry.sample(board.id),
            });
        }

        let quality = if aborted_mid_run {
            RunQuality::Aborted
        } else if degraded {
            RunQuality::Degraded
        } else {
            RunQuality::Good
        };
        let record = RunLogRecord {
            run_number,
            started,
            finished: OffsetDateTime::now_utc(),
            quality,
            acquisition_window_ms: self.config.acquisition_window_ms,
            boards: board_records,
        };
        self.logger.append(&record)?;
        store_run_counter(&self.config.counter_file_path(), run_number + 1)?;
        self.advance(run_number, RunState::Logged);
        self.set_progress(run_number, 1.0);

        for board_record in &record.boards {
            if let Some(stats) = &board_record.statistics {
                spdlog::info!(
                    "run {run_number}: board {:02} logged with {} / {} events ({}/s)",
                    board_record.board_id,
                    human_bytes(stats.bytes() as f64),
                    stats.events,
                    human_bytes(stats.throughput_bits_per_second / 8.0)
                );
            }
        }
        spdlog::info!("run {run_number}: {quality:?}");

        if aborted_mid_run {
            return Err(ControllerError::Aborted(run_number));
        }
        Ok(())
    }

    fn advance(&self, run_number: u32, state: RunState) {
        spdlog::debug!("run {run_number}: {state:?}");
    }

    fn set_progress(&self, run_number: u32, fraction: f32) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.run_number = run_number;
            progress.fraction = fraction;
        }
    }

    fn disable_all_triggers(&self) {
        for board in &self.boards {
            if let Err(e) = registers::disable_trigger(&board.link) {
                spdlog::error!("board {:02}: trigger disable failed: {e}", board.id);
            }
        }
    }

    /// Wait for every worker's report, each with the finalize timeout. A
    /// single expired timeout stops waiting; the boards without a report
    /// are handled by the caller.
    fn collect_reports(&self, rx: &Receiver<WorkerReport>) -> (FxHashMap<u8, WorkerReport>, bool) {
        let mut reports = FxHashMap::default();
        for _ in 0..self.boards.len() {
            match rx.recv_timeout(self.config.finalize_timeout()) {
                Ok(report) => {
                    reports.insert(report.board(), report);
                }
                Err(RecvTimeoutError::Timeout) => return (reports, true),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        (reports, false)
    }

    /// Abort path before acquisition: release the workers without starting
    /// them and reap their reports. No files exist yet and nothing is
    /// logged.
    fn release_workers(
        &self,
        sync: &AcquisitionSynchronizer,
        rx: &Receiver<WorkerReport>,
        handles: Vec<(u8, JoinHandle<()>)>,
    ) {
        if let Err(e) = sync.request_abort() {
            spdlog::error!("could not signal abort to the workers: {e}");
        }
        let (reports, _) = self.collect_reports(rx);
        for (board, handle) in handles {
            if reports.contains_key(&board) {
                let _ = handle.join();
            } else {
                spdlog::error!("board {board:02}: worker did not release before the timeout");
            }
        }
    }
}

fn load_run_counter(path: &Path, fallback: u32) -> Result<u32, ControllerError> {
    if !path.exists() {
        return Ok(fallback);
    }
    let text = std::fs::read_to_string(path)?;
    text.trim()
        .parse::<u32>()
        .map_err(|_| ControllerError::CorruptCounter(path.to_path_buf()))
}

/// Persist the next run number atomically (write-then-rename), so a crash
/// between runs can neither reuse nor skip an identifier.
fn store_run_counter(path: &Path, next: u32) -> Result<(), ControllerError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, format!("{next}\n"))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use crate::emulator::{EmulatedBoard, EmulatedTelemetry};
    use crate::error::RegisterError;
    use crate::registers::RegisterLink;

    fn test_config(dir: &Path, boards: Vec<BoardConfig>) -> Config {
        Config {
            output_path: dir.to_path_buf(),
            first_run_number: 1000,
            n_runs: 3,
            acquisition_window_ms: 30,
            ready_timeout_ms: 2_000,
            start_timeout_ms: 4_000,
            finalize_timeout_ms: 4_000,
            poll_interval_ms: 2,
            reuse_thresholds: false,
            threshold_map_path: None,
            scan: crate::config::ScanConfig {
                dac_start: 380,
                dac_stop: 440,
                dac_step: 4,
                dwell_ms: 0,
            },
            boards,
        }
    }

    fn emulated_handle(config: &BoardConfig) -> BoardHandle {
        let chip_ids: Vec<u8> = config.chips.iter().map(|c| c.id).collect();
        let link: SharedLink = Arc::new(Mutex::new(EmulatedBoard::new(config.id, &chip_ids)));
        BoardHandle::new(config, link)
    }

    #[test]
    fn run_range_is_logged_in_order_and_the_counter_advances() {
        let dir = tempfile::tempdir().unwrap();
        let boards = vec![BoardConfig {
            id: 1,
            chips: Vec::new(),
        }];
        let config = test_config(dir.path(), boards.clone());
        let handles = boards.iter().map(emulated_handle).collect();

        let mut controller =
            RunController::new(config.clone(), handles, Box::new(EmulatedTelemetry::new()));
        controller.execute().unwrap();

        let records = RunLogger::new(config.run_log_path()).read_all().unwrap();
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.run_number, 1000 + i as u32);
            assert_eq!(record.quality, RunQuality::Good);
            assert!(!record.boards[0].partial);
            assert!(record.boards[0].telemetry.is_some());
            assert!(config.frame_file_path(record.run_number, 1).exists());
        }
        let counter = std::fs::read_to_string(config.counter_file_path()).unwrap();
        assert_eq!(counter.trim(), "1003");
    }

    #[test]
    fn abort_before_acquisition_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let boards = vec![BoardConfig {
            id: 1,
            chips: Vec::new(),
        }];
        let config = test_config(dir.path(), boards.clone());
        let handles = boards.iter().map(emulated_handle).collect();

        let mut controller =
            RunController::new(config.clone(), handles, Box::new(EmulatedTelemetry::new()));
        controller.abort_handle().abort();
        match controller.execute() {
            Err(ControllerError::Aborted(1000)) => {}
            other => panic!("expected an aborted run, got {other:?}"),
        }

        assert!(!config.frame_file_path(1000, 1).exists());
        assert!(RunLogger::new(config.run_log_path()).read_all().unwrap().is_empty());
        assert!(!config.counter_file_path().exists());
    }

    #[test]
    fn ready_timeout_reports_the_silent_board() {
        // a link whose FIFO reset never succeeds keeps its worker from
        // signalling ready
        struct DeafLink;
        impl RegisterLink for DeafLink {
            fn read_register(&mut self, name: &str) -> Result<u32, RegisterError> {
                Err(RegisterError::ReadFailed(name.to_owned()))
            }
            fn write_register(&mut self, name: &str, _value: u32) -> Result<(), RegisterError> {
                Err(RegisterError::WriteFailed(name.to_owned()))
            }
            fn read_block(&mut self, count: u32) -> Result<Vec<u32>, RegisterError> {
                Err(RegisterError::BlockReadFailed(count))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let boards = vec![BoardConfig {
            id: 2,
            chips: Vec::new(),
        }];
        let mut config = test_config(dir.path(), boards.clone());
        config.ready_timeout_ms = 50;
        let handles = vec![BoardHandle::new(
            &boards[0],
            Arc::new(Mutex::new(DeafLink)) as SharedLink,
        )];

        let mut controller =
            RunController::new(config.clone(), handles, Box::new(EmulatedTelemetry::new()));
        match controller.execute() {
            Err(ControllerError::SynchronizerError(SynchronizerError::ReadyTimeout(missing))) => {
                assert_eq!(missing, vec![2]);
            }
            other => panic!("expected a ready timeout, got {other:?}"),
        }
        assert!(RunLogger::new(config.run_log_path()).read_all().unwrap().is_empty());
    }

    #[test]
    fn failing_board_degrades_the_run_but_keeps_the_healthy_one() {
        // resets succeed, occupancy reports data, block reads always fail
        struct BrokenReadout;
        impl RegisterLink for BrokenReadout {
            fn read_register(&mut self, name: &str) -> Result<u32, RegisterError> {
                match name {
                    registers::FIFO_OCCUPANCY => Ok(256),
                    _ => Ok(0),
                }
            }
            fn write_register(&mut self, _name: &str, _value: u32) -> Result<(), RegisterError> {
                Ok(())
            }
            fn read_block(&mut self, count: u32) -> Result<Vec<u32>, RegisterError> {
                Err(RegisterError::BlockReadFailed(count))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let boards = vec![
            BoardConfig {
                id: 1,
                chips: Vec::new(),
            },
            BoardConfig {
                id: 2,
                chips: Vec::new(),
            },
        ];
        let mut config = test_config(dir.path(), boards.clone());
        config.n_runs = 1;
        let handles = vec![
            emulated_handle(&boards[0]),
            BoardHandle::new(&boards[1], Arc::new(Mutex::new(BrokenReadout)) as SharedLink),
        ];

        let mut controller =
            RunController::new(config.clone(), handles, Box::new(EmulatedTelemetry::new()));
        controller.execute().unwrap();

        let records = RunLogger::new(config.run_log_path()).read_all().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.quality, RunQuality::Degraded);
        let healthy = record.boards.iter().find(|b| b.board_id == 1).unwrap();
        let broken = record.boards.iter().find(|b| b.board_id == 2).unwrap();
        assert!(!healthy.partial);
        assert!(broken.partial);
        // the failed worker still flushed an (empty) analyzable file
        assert!(config.frame_file_path(1000, 2).exists());
        assert_eq!(broken.statistics.as_ref().unwrap().words, 0);
    }

    #[test]
    fn counter_file_survives_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("next_run");
        assert_eq!(load_run_counter(&path, 42).unwrap(), 42);
        store_run_counter(&path, 43).unwrap();
        assert_eq!(load_run_counter(&path, 0).unwrap(), 43);
        assert!(!path.with_extension("tmp").exists());

        std::fs::write(&path, "not a number").unwrap();
        assert!(matches!(
            load_run_counter(&path, 0),
            Err(ControllerError::CorruptCounter(_))
        ));
    }
}
