/// Actuators - fan and smoke, each owning its own cancellable timer task.

use crate::gpio::OutputLine;
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// DMX levels must be re-sent this often or the machine drops back to idle.
pub const SMOKE_RESEND_INTERVAL: Duration = Duration::from_millis(50);
/// Off frames sent at the end of a pulse.
pub const SMOKE_OFF_REPEATS: usize = 10;

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A background task that stops when its handle is cancelled or dropped.
pub struct ScheduledTask {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `body` on a named thread. The receiver disconnects on cancel.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(cancel_rx))
            .map_err(|e| anyhow!("could not spawn task '{}': {}", name, e))?;
        Ok(Self { cancel: Some(cancel_tx), handle: Some(handle) })
    }

    /// Run `action` once after `delay` unless cancelled first.
    pub fn after<F>(name: &str, delay: Duration, action: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(name, move |cancel| {
            if let Err(RecvTimeoutError::Timeout) = cancel.recv_timeout(delay) {
                action();
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the task and wait for it to exit.
    pub fn cancel(mut self) {
        self.cancel.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        // Disconnects the task's receiver; the thread is left to finish alone.
        self.cancel.take();
    }
}

// ---------------------------------------------------------------------------
// Fan
// ---------------------------------------------------------------------------

pub trait FanDriver: Send {
    /// Duty cycle in percent, 0 = off.
    fn set_duty_cycle(&mut self, percent: f64) -> Result<()>;
}

/// Fan stand-in that logs and records every duty cycle written.
#[derive(Debug, Default, Clone)]
pub struct LoggingFan {
    history: Arc<Mutex<Vec<f64>>>,
}

impl LoggingFan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<f64> {
        relock(&self.history).clone()
    }
}

impl FanDriver for LoggingFan {
    fn set_duty_cycle(&mut self, percent: f64) -> Result<()> {
        log::info!(target: "fan", "Fan duty cycle -> {:.0}%", percent);
        relock(&self.history).push(percent);
        Ok(())
    }
}

/// Software PWM on a GPIO line, driven by its own thread.
pub struct SoftPwmFan {
    /// Duty in hundredths of a percent
    duty: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SoftPwmFan {
    pub fn new(line: OutputLine, pwm_hz: u32) -> Result<Self> {
        if pwm_hz == 0 {
            return Err(anyhow!("fan PWM frequency must be positive"));
        }
        let duty = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let period = Duration::from_secs_f64(1.0 / pwm_hz as f64);
        let offset = line.offset();

        let worker = {
            let duty = Arc::clone(&duty);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("bubblebot-fan-pwm".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let fraction = duty.load(Ordering::Relaxed) as f64 / 10_000.0;
                        let on = period.mul_f64(fraction);
                        if !on.is_zero() {
                            if let Err(e) = line.set(true) {
                                log::error!(target: "fan", "PWM line write failed: {}", e);
                                break;
                            }
                            thread::sleep(on);
                        }
                        if on < period {
                            let _ = line.set(false);
                            thread::sleep(period - on);
                        }
                    }
                    let _ = line.set(false);
                })
                .map_err(|e| anyhow!("could not start fan PWM thread: {}", e))?
        };

        log::info!(target: "fan", "Soft PWM fan on line {} at {} Hz", offset, pwm_hz);
        Ok(Self { duty, stop, worker: Some(worker) })
    }
}

impl FanDriver for SoftPwmFan {
    fn set_duty_cycle(&mut self, percent: f64) -> Result<()> {
        if self.worker.as_ref().map_or(true, JoinHandle::is_finished) {
            return Err(anyhow!("fan PWM thread is not running"));
        }
        let hundredths = (percent.clamp(0.0, 100.0) * 100.0).round() as u32;
        self.duty.store(hundredths, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for SoftPwmFan {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct FanInner {
    driver: Box<dyn FanDriver>,
    running: bool,
    speed: f64,
    generation: u64,
    auto_stop: Option<ScheduledTask>,
}

/// Shared fan state. Clones refer to the same fan.
#[derive(Clone)]
pub struct FanController {
    inner: Arc<Mutex<FanInner>>,
}

impl FanController {
    pub fn new(driver: Box<dyn FanDriver>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FanInner {
                driver,
                running: false,
                speed: 100.0,
                generation: 0,
                auto_stop: None,
            })),
        }
    }

    pub fn is_running(&self) -> bool {
        relock(&self.inner).running
    }

    pub fn speed(&self) -> f64 {
        relock(&self.inner).speed
    }

    /// Turn the fan on at `speed`, optionally stopping it after `auto_stop`.
    pub fn start(&self, speed: f64, auto_stop: Option<Duration>) -> Result<()> {
        let mut inner = relock(&self.inner);
        let speed = speed.clamp(0.0, 100.0);
        inner.driver.set_duty_cycle(speed)?;
        inner.running = true;
        inner.speed = speed;
        inner.generation += 1;
        inner.auto_stop = None;

        if let Some(delay) = auto_stop {
            let generation = inner.generation;
            let weak: Weak<Mutex<FanInner>> = Arc::downgrade(&self.inner);
            inner.auto_stop = Some(ScheduledTask::after("bubblebot-fan-stop", delay, move || {
                if let Some(inner) = weak.upgrade() {
                    let fan = FanController { inner };
                    if let Err(e) = fan.stop_generation(generation) {
                        log::error!(target: "fan", "Auto-stop failed: {}", e);
                    }
                }
            })?);
        }
        log::info!(target: "fan", "Fan on at {:.0}%{}", speed,
                   auto_stop.map(|d| format!(" for {:.1}s", d.as_secs_f64())).unwrap_or_default());
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut inner = relock(&self.inner);
        inner.auto_stop = None;
        if inner.running {
            inner.driver.set_duty_cycle(0.0)?;
            inner.running = false;
            log::info!(target: "fan", "Fan off");
        }
        Ok(())
    }

    // Only stops the run that scheduled it; a newer start keeps going.
    fn stop_generation(&self, generation: u64) -> Result<()> {
        let mut inner = relock(&self.inner);
        if inner.generation != generation || !inner.running {
            return Ok(());
        }
        inner.driver.set_duty_cycle(0.0)?;
        inner.running = false;
        inner.auto_stop = None;
        log::info!(target: "fan", "Fan auto-stopped");
        Ok(())
    }

    /// Flip the fan; returns whether it is now running.
    pub fn toggle(&self, speed: f64, auto_stop: Option<Duration>) -> Result<bool> {
        if self.is_running() {
            self.stop()?;
            Ok(false)
        } else {
            self.start(speed, auto_stop)?;
            Ok(true)
        }
    }

    /// Change the speed, applying it at once when the fan is running.
    pub fn set_speed(&self, speed: f64) -> Result<()> {
        let mut inner = relock(&self.inner);
        inner.speed = speed.clamp(0.0, 100.0);
        if inner.running {
            let speed = inner.speed;
            inner.driver.set_duty_cycle(speed)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Smoke
// ---------------------------------------------------------------------------

pub trait SmokeDriver: Send {
    /// Send one frame with the smoke channel at `level`.
    fn send_level(&mut self, level: u8) -> Result<()>;
}

/// Smoke stand-in that records the levels it was asked to send.
#[derive(Debug, Default, Clone)]
pub struct LoggingSmoke {
    levels: Arc<Mutex<Vec<u8>>>,
}

impl LoggingSmoke {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn levels(&self) -> Vec<u8> {
        relock(&self.levels).clone()
    }
}

impl SmokeDriver for LoggingSmoke {
    fn send_level(&mut self, level: u8) -> Result<()> {
        log::trace!(target: "smoke", "smoke level {}", level);
        relock(&self.levels).push(level);
        Ok(())
    }
}

type SharedSmoke = Arc<Mutex<Box<dyn SmokeDriver>>>;

/// Timed smoke pulses: hold a level by re-sending it, then send off frames.
pub struct SmokeController {
    driver: SharedSmoke,
    task: Mutex<Option<ScheduledTask>>,
}

impl SmokeController {
    pub fn new(driver: Box<dyn SmokeDriver>) -> Self {
        Self { driver: Arc::new(Mutex::new(driver)), task: Mutex::new(None) }
    }

    pub fn is_active(&self) -> bool {
        relock(&self.task).as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Start a pulse, replacing any pulse already running.
    pub fn pulse(&self, level: u8, duration: Duration) -> Result<()> {
        self.stop();
        let driver = Arc::clone(&self.driver);
        let task = ScheduledTask::spawn("bubblebot-smoke", move |cancel| {
            log::info!(target: "smoke", "Smoke pulse level {} for {:.1}s", level, duration.as_secs_f64());
            let started = Instant::now();
            let mut frames = 0u32;
            loop {
                if let Err(e) = relock(&driver).send_level(level) {
                    log::error!(target: "smoke", "Smoke send failed: {}", e);
                    break;
                }
                frames += 1;
                if started.elapsed() >= duration {
                    break;
                }
                match cancel.recv_timeout(SMOKE_RESEND_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => {
                        log::info!(target: "smoke", "Smoke pulse cancelled");
                        break;
                    }
                }
            }
            for _ in 0..SMOKE_OFF_REPEATS {
                if let Err(e) = relock(&driver).send_level(0) {
                    log::error!(target: "smoke", "Smoke off frame failed: {}", e);
                    break;
                }
                thread::sleep(SMOKE_RESEND_INTERVAL);
            }
            log::debug!(target: "smoke", "Smoke pulse done ({} frames)", frames);
        })?;
        *relock(&self.task) = Some(task);
        Ok(())
    }

    /// Cancel any running pulse and wait for its off frames.
    pub fn stop(&self) {
        let task = relock(&self.task).take();
        if let Some(task) = task {
            task.cancel();
        }
    }

    /// Wait for the current pulse to run to completion.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_active() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }
}
