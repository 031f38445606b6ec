/// Movement scheduler - at most one engine run in flight.
///
/// Moves run on a named worker thread so command handling returns right
/// away with an estimate. The single slot also hosts jog mode.

use crate::axis::{AxisId, Positions};
use crate::engine::{MotionEngine, MotionRequest, MoveReport};
use crate::error::{MotionError, MotionResult};
use crate::profile::MotionProfile;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long a forced submission waits for the in-flight move before
/// preempting it.
pub const FORCE_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Called on the worker thread once a move finishes.
pub type Completion = Box<dyn FnOnce(&MotionResult<MoveReport>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Move,
    Jog,
}

struct InFlight {
    kind: JobKind,
    handle: JoinHandle<()>,
    done_rx: Receiver<MotionResult<MoveReport>>,
    /// Never sent on; disconnects when the worker exits. Waiters clone it so
    /// they can block without holding the slot.
    exited_rx: Receiver<()>,
    /// Preempt flag for moves, stop flag for jog
    flag: Arc<AtomicBool>,
}

impl InFlight {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn join(self) -> Option<MotionResult<MoveReport>> {
        if self.handle.join().is_err() {
            log::error!(target: "scheduler", "Movement worker panicked");
        }
        self.done_rx.try_recv().ok()
    }
}

fn exit_signal() -> (Sender<()>, Receiver<()>) {
    bounded(0)
}

pub struct MovementScheduler {
    engine: Arc<MotionEngine>,
    slot: Mutex<Option<InFlight>>,
    travel_limit: i32,
    force_wait: Duration,
}

impl MovementScheduler {
    pub fn new(engine: Arc<MotionEngine>, travel_limit: i32) -> Self {
        Self {
            engine,
            slot: Mutex::new(None),
            travel_limit,
            force_wait: FORCE_WAIT_TIMEOUT,
        }
    }

    pub fn with_force_wait(mut self, wait: Duration) -> Self {
        self.force_wait = wait;
        self
    }

    pub fn engine(&self) -> &Arc<MotionEngine> {
        &self.engine
    }

    pub fn travel_limit(&self) -> i32 {
        self.travel_limit
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn validate(&self, request: &MotionRequest) -> MotionResult<()> {
        request.profile.validate()?;
        for axis in AxisId::ALL {
            let value = request.target.get(axis);
            if value.unsigned_abs() > self.travel_limit.unsigned_abs() {
                return Err(MotionError::InvalidTarget(format!(
                    "axis {} target {} outside travel limit ±{}",
                    axis, value, self.travel_limit
                )));
            }
        }
        Ok(())
    }

    pub fn submit(&self, request: MotionRequest, force: bool) -> MotionResult<Duration> {
        self.submit_with(request, force, None)
    }

    /// Start `request` on the worker and return the up-front duration
    /// estimate. `on_done` runs on the worker after the engine finishes.
    pub fn submit_with(
        &self,
        request: MotionRequest,
        force: bool,
        on_done: Option<Completion>,
    ) -> MotionResult<Duration> {
        self.validate(&request)?;

        let mut slot = if force {
            self.lock_slot()
        } else {
            match self.slot.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => return Err(MotionError::RejectedBusy),
            }
        };

        if let Some(previous) = slot.take() {
            if previous.is_running() && !force {
                *slot = Some(previous);
                log::info!(target: "scheduler", "Rejected move to {}: busy", request.target);
                return Err(MotionError::RejectedBusy);
            }
            self.displace(previous);
        }

        let max_steps = self.engine.plan(request.target).max_steps();
        let estimate = request.profile.estimate(max_steps);

        let engine = Arc::clone(&self.engine);
        let preempt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&preempt);
        let (done_tx, done_rx) = bounded(1);
        let (exited_tx, exited_rx) = exit_signal();
        let handle = thread::Builder::new()
            .name("bubblebot-move".to_string())
            .spawn(move || {
                let _exited = exited_tx;
                let result = engine.execute_with(request.target, &request.profile, Some(&flag));
                match &result {
                    Ok(_) => engine.state().set_last_error(None),
                    Err(e) => {
                        log::error!(target: "scheduler", "Move to {} failed: {}", request.target, e);
                        engine.state().set_last_error(Some(e.to_string()));
                    }
                }
                if let Some(callback) = on_done {
                    callback(&result);
                }
                let _ = done_tx.send(result);
            })
            .map_err(|e| MotionError::HardwareFault(format!("could not start movement worker: {}", e)))?;

        *slot = Some(InFlight { kind: JobKind::Move, handle, done_rx, exited_rx, flag: preempt });
        log::info!(target: "scheduler", "Move to {} started ({} steps, ~{:.2}s{})",
                   request.target, max_steps, estimate.as_secs_f64(), if force { ", forced" } else { "" });
        Ok(estimate)
    }

    /// Clear the slot for a forced submission: jog stops at once, a move gets
    /// the force wait and is then preempted.
    fn displace(&self, previous: InFlight) {
        if previous.is_running() {
            match previous.kind {
                JobKind::Jog => previous.flag.store(true, Ordering::SeqCst),
                JobKind::Move => match previous.done_rx.recv_timeout(self.force_wait) {
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        log::warn!(target: "scheduler", "In-flight move still running after {:?}; preempting", self.force_wait);
                        previous.flag.store(true, Ordering::SeqCst);
                    }
                },
            }
        }
        previous.join();
    }

    /// Start continuous stepping of `axes`; rejected while anything runs.
    pub fn start_jog(&self, axes: Vec<AxisId>, forward: bool, profile: MotionProfile) -> MotionResult<()> {
        profile.validate()?;
        let mut slot = match self.slot.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(MotionError::RejectedBusy),
        };
        if slot.as_ref().map_or(false, InFlight::is_running) {
            return Err(MotionError::RejectedBusy);
        }
        if let Some(finished) = slot.take() {
            finished.join();
        }

        let engine = Arc::clone(&self.engine);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let limit = self.travel_limit;
        let (done_tx, done_rx) = bounded(1);
        let (exited_tx, exited_rx) = exit_signal();
        let handle = thread::Builder::new()
            .name("bubblebot-jog".to_string())
            .spawn(move || {
                let _exited = exited_tx;
                let result = engine.jog(&axes, forward, &profile, limit, &flag);
                if let Err(e) = &result {
                    engine.state().set_last_error(Some(e.to_string()));
                }
                let _ = done_tx.send(result);
            })
            .map_err(|e| MotionError::HardwareFault(format!("could not start jog worker: {}", e)))?;

        *slot = Some(InFlight { kind: JobKind::Jog, handle, done_rx, exited_rx, flag: stop });
        log::info!(target: "scheduler", "Jog started ({})", if forward { "+" } else { "-" });
        Ok(())
    }

    /// Stop a running jog and wait for it. Returns None when no jog was active.
    pub fn stop_jog(&self) -> Option<MotionResult<MoveReport>> {
        let mut slot = self.lock_slot();
        if slot.as_ref().map(|f| f.kind) != Some(JobKind::Jog) {
            return None;
        }
        let jog = slot.take()?;
        jog.flag.store(true, Ordering::SeqCst);
        let result = jog.done_rx.recv().ok();
        jog.join();
        result
    }

    /// Run `f` with the slot held and nothing in flight, so no move can start
    /// or commit while it runs. Rejected while anything is moving.
    pub fn run_when_idle<T>(&self, f: impl FnOnce() -> T) -> MotionResult<T> {
        let mut slot = match self.slot.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(MotionError::RejectedBusy),
        };
        if slot.as_ref().map_or(false, InFlight::is_running) {
            return Err(MotionError::RejectedBusy);
        }
        if let Some(finished) = slot.take() {
            finished.join();
        }
        Ok(f())
    }

    pub fn is_busy(&self) -> bool {
        match self.slot.try_lock() {
            Ok(slot) => slot.as_ref().map_or(false, InFlight::is_running),
            Err(TryLockError::Poisoned(e)) => e.into_inner().as_ref().map_or(false, InFlight::is_running),
            Err(TryLockError::WouldBlock) => true,
        }
    }

    pub fn is_jogging(&self) -> bool {
        match self.slot.try_lock() {
            Ok(slot) => slot.as_ref().map_or(false, |f| f.kind == JobKind::Jog && f.is_running()),
            Err(_) => false,
        }
    }

    /// Block until nothing is in flight. Returns false on timeout.
    ///
    /// The slot is only locked to look at the current job, so a forced
    /// submission or a jog stop is never held up by a waiter.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let exited = {
                let mut slot = self.lock_slot();
                let running = match slot.as_ref() {
                    None => return true,
                    Some(current) => current.is_running().then(|| current.exited_rx.clone()),
                };
                match running {
                    Some(exited) => exited,
                    None => {
                        if let Some(finished) = slot.take() {
                            finished.join();
                        }
                        return true;
                    }
                }
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(RecvTimeoutError::Timeout) = exited.recv_timeout(remaining) {
                return false;
            }
        }
    }

    /// Stop jog, give a move the force wait, then preempt it.
    pub fn shutdown(&self) {
        self.stop_jog();
        let mut slot = self.lock_slot();
        if let Some(current) = slot.take() {
            self.displace(current);
        }
        log::info!(target: "scheduler", "Scheduler stopped at {}", self.positions());
    }

    pub fn positions(&self) -> Positions {
        self.engine.state().positions()
    }
}
