//! The readiness/start/stop handshake between the run controller and the
//! per-board drain workers.
//!
//! One synchronizer exists per run. The controller is the only writer of
//! `start_requested`, `stop_requested` and `aborted`; each worker writes
//! only its own ready flag. All waits are condvar-based with explicit
//! deadlines.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use fxhash::FxHashMap;

use super::error::SynchronizerError;

#[derive(Debug, Default)]
struct HandshakeState {
    ready: FxHashMap<u8, bool>,
    start_requested: bool,
    stop_requested: bool,
    aborted: bool,
}

impl HandshakeState {
    fn missing_ready(&self) -> Vec<u8> {
        let mut missing: Vec<u8> = self
            .ready
            .iter()
            .filter(|(_, ready)| !**ready)
            .map(|(board, _)| *board)
            .collect();
        missing.sort_unstable();
        missing
    }
}

/// What a worker blocked in [`AcquisitionSynchronizer::await_start`] was
/// released by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSignal {
    Start,
    Abort,
}

#[derive(Debug, Clone)]
pub struct AcquisitionSynchronizer {
    shared: Arc<(Mutex<HandshakeState>, Condvar)>,
}

impl AcquisitionSynchronizer {
    pub fn new(boards: &[u8]) -> Self {
        let mut ready = FxHashMap::default();
        for board in boards {
            ready.insert(*board, false);
        }
        Self {
            shared: Arc::new((
                Mutex::new(HandshakeState {
                    ready,
                    ..HandshakeState::default()
                }),
                Condvar::new(),
            )),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, HandshakeState>, SynchronizerError> {
        self.shared.0.lock().map_err(|_| SynchronizerError::Poisoned)
    }

    /// Mark one board ready. Idempotent; boards signal independently and
    /// never touch each other's flags.
    pub fn signal_ready(&self, board: u8) -> Result<(), SynchronizerError> {
        let mut state = self.state()?;
        match state.ready.get_mut(&board) {
            Some(flag) => *flag = true,
            None => return Err(SynchronizerError::UnknownBoard(board)),
        }
        self.shared.1.notify_all();
        Ok(())
    }

    /// Block until every registered board is ready. On timeout the error
    /// names the boards that never signalled.
    pub fn await_all_ready(&self, timeout: Duration) -> Result<(), SynchronizerError> {
        let deadline = Instant::now() + timeout;
        let (lock, cond) = &*self.shared;
        let mut state = lock.lock().map_err(|_| SynchronizerError::Poisoned)?;
        loop {
            if state.ready.values().all(|ready| *ready) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SynchronizerError::ReadyTimeout(state.missing_ready()));
            }
            let (guard, _) = cond
                .wait_timeout(state, deadline - now)
                .map_err(|_| SynchronizerError::Poisoned)?;
            state = guard;
        }
    }

    /// Open the acquisition. Rejected while any board has not signalled
    /// ready, so start can never observably precede readiness.
    pub fn request_start(&self) -> Result<(), SynchronizerError> {
        let mut state = self.state()?;
        let missing = state.missing_ready();
        if !missing.is_empty() {
            return Err(SynchronizerError::NotAllReady(missing));
        }
        state.start_requested = true;
        self.shared.1.notify_all();
        Ok(())
    }

    /// Close the acquisition. Only valid after a start.
    pub fn request_stop(&self) -> Result<(), SynchronizerError> {
        let mut state = self.state()?;
        if !state.start_requested {
            return Err(SynchronizerError::StopBeforeStart);
        }
        state.stop_requested = true;
        self.shared.1.notify_all();
        Ok(())
    }

    /// Operator cancellation. Releases workers blocked in `await_start`
    /// without starting them, and reads as a stop to draining workers.
    pub fn request_abort(&self) -> Result<(), SynchronizerError> {
        let mut state = self.state()?;
        state.aborted = true;
        self.shared.1.notify_all();
        Ok(())
    }

    /// Worker-side wait for the start of the acquisition window.
    pub fn await_start(&self, timeout: Duration) -> Result<StartSignal, SynchronizerError> {
        let deadline = Instant::now() + timeout;
        let (lock, cond) = &*self.shared;
        let mut state = lock.lock().map_err(|_| SynchronizerError::Poisoned)?;
        loop {
            if state.aborted {
                return Ok(StartSignal::Abort);
            }
            if state.start_requested {
                return Ok(StartSignal::Start);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SynchronizerError::StartTimeout);
            }
            let (guard, _) = cond
                .wait_timeout(state, deadline - now)
                .map_err(|_| SynchronizerError::Poisoned)?;
            state = guard;
        }
    }

    /// Worker-side bounded wait for stop. Returns true as soon as stop (or
    /// abort) is visible, false once `wait` has elapsed without it. Doubles
    /// as the idle pacing of an empty FIFO, so workers never busy-spin the
    /// register link.
    pub fn await_stop(&self, wait: Duration) -> Result<bool, SynchronizerError> {
        let deadline = Instant::now() + wait;
        let (lock, cond) = &*self.shared;
        let mut state = lock.lock().map_err(|_| SynchronizerError::Poisoned)?;
        loop {
            if state.stop_requested || state.aborted {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = cond
                .wait_timeout(state, deadline - now)
                .map_err(|_| SynchronizerError::Poisoned)?;
            state = guard;
        }
    }

    /// Non-blocking stop check used between drain cycles.
    pub fn stop_requested(&self) -> Result<bool, SynchronizerError> {
        let state = self.state()?;
        Ok(state.stop_requested || state.aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signal_ready_is_idempotent() {
        let sync = AcquisitionSynchronizer::new(&[1]);
        sync.signal_ready(1).unwrap();
        sync.signal_ready(1).unwrap();
        sync.await_all_ready(Duration::ZERO).unwrap();
    }

    #[test]
    fn unknown_board_is_rejected() {
        let sync = AcquisitionSynchronizer::new(&[1]);
        assert!(matches!(
            sync.signal_ready(9),
            Err(SynchronizerError::UnknownBoard(9))
        ));
    }

    #[test]
    fn ready_timeout_names_the_missing_boards() {
        let sync = AcquisitionSynchronizer::new(&[1, 2, 3]);
        sync.signal_ready(2).unwrap();
        match sync.await_all_ready(Duration::from_millis(10)) {
            Err(SynchronizerError::ReadyTimeout(missing)) => assert_eq!(missing, vec![1, 3]),
            other => panic!("expected ready timeout, got {other:?}"),
        }
    }

    #[test]
    fn start_is_rejected_until_every_board_is_ready() {
        let sync = AcquisitionSynchronizer::new(&[1, 2]);
        sync.signal_ready(1).unwrap();
        assert!(matches!(
            sync.request_start(),
            Err(SynchronizerError::NotAllReady(missing)) if missing == vec![2]
        ));
        sync.signal_ready(2).unwrap();
        sync.request_start().unwrap();
    }

    #[test]
    fn stop_is_rejected_before_start() {
        let sync = AcquisitionSynchronizer::new(&[1]);
        assert!(matches!(
            sync.request_stop(),
            Err(SynchronizerError::StopBeforeStart)
        ));
    }

    #[test]
    fn await_all_ready_returns_only_after_the_last_board() {
        let sync = AcquisitionSynchronizer::new(&[0, 1, 2, 3]);
        let mut handles = Vec::new();
        for board in 0u8..4 {
            let sync = sync.clone();
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(5 * u64::from(board)));
                sync.signal_ready(board).unwrap();
            }));
        }
        sync.await_all_ready(Duration::from_secs(5)).unwrap();
        // the slowest board signals after 15 ms; reaching here means all
        // flags were observed
        sync.request_start().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn abort_releases_a_worker_waiting_for_start() {
        let sync = AcquisitionSynchronizer::new(&[1]);
        let waiter = {
            let sync = sync.clone();
            thread::spawn(move || {
                sync.signal_ready(1).unwrap();
                sync.await_start(Duration::from_secs(5)).unwrap()
            })
        };
        sync.await_all_ready(Duration::from_secs(5)).unwrap();
        sync.request_abort().unwrap();
        assert_eq!(waiter.join().unwrap(), StartSignal::Abort);
    }

    #[test]
    fn await_stop_sees_a_requested_stop() {
        let sync = AcquisitionSynchronizer::new(&[1]);
        sync.signal_ready(1).unwrap();
        sync.request_start().unwrap();
        assert!(!sync.await_stop(Duration::from_millis(5)).unwrap());
        sync.request_stop().unwrap();
        assert!(sync.await_stop(Duration::ZERO).unwrap());
        assert!(sync.stop_requested().unwrap());
    }
}
