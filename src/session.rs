//! Measurement session state machine.
//!
//! ```text
//! Idle ──start──> Measuring ──stop──> Stopped
//!                  │    ▲                ▲
//!             pause│    │resume          │
//!                  ▼    │                │
//!                  Paused ──────stop─────┘
//! ```
//!
//! Only one [`MeasurementMode`] may hold the instrument at a time. A fetch
//! cycle and a waveform export exclude each other through the same scoped
//! lock, and [`SessionArbiter::stop`] waits for an in-flight cycle before the
//! session reaches [`SessionState::Stopped`].

use crate::power::{ComputeError, EnergyAccumulator, EnergySnapshot, PowerSample};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Measuring,
    Paused,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Measuring => write!(f, "Measuring"),
            SessionState::Paused => write!(f, "Paused"),
            SessionState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Measuring | SessionState::Paused)
    }

    pub fn can_start(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Stopped)
    }

    pub fn can_pause(self) -> bool {
        self == SessionState::Measuring
    }

    pub fn can_resume(self) -> bool {
        self == SessionState::Paused
    }
}

/// The two consumers that drive the instrument's channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementMode {
    PowerAnalysis,
    LongTimeLogging,
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementMode::PowerAnalysis => write!(f, "power analysis"),
            MeasurementMode::LongTimeLogging => write!(f, "long-time logging"),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Cannot start {requested} while {active} is running")]
    ModeConflict {
        requested: MeasurementMode,
        active: MeasurementMode,
    },

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },

    #[error("An export or fetch cycle already holds the instrument")]
    ExportBusy,
}

/// Cycles that produced no sample, by reason.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleFaults {
    pub invalid_sample: u64,
    pub indeterminate: u64,
    pub other: u64,
    /// Cycles lost to link or decode failures.
    pub acquisition: u64,
    pub last: Option<ComputeError>,
}

impl SampleFaults {
    pub fn record(&mut self, error: &ComputeError) {
        match error {
            ComputeError::InvalidSample { .. } => self.invalid_sample += 1,
            ComputeError::Indeterminate { .. } => self.indeterminate += 1,
            ComputeError::LengthMismatch { .. } | ComputeError::TooShort(_) => self.other += 1,
        }
        self.last = Some(error.clone());
    }

    pub fn total(&self) -> u64 {
        self.invalid_sample + self.indeterminate + self.other + self.acquisition
    }
}

#[derive(Debug)]
struct ArbiterInner {
    state: SessionState,
    mode: Option<MeasurementMode>,
    accumulator: EnergyAccumulator,
    faults: SampleFaults,
    active_before: Duration,
    active_since: Option<Instant>,
}

impl ArbiterInner {
    fn active_elapsed(&self, now: Instant) -> Duration {
        self.active_before + self.active_since.map_or(Duration::ZERO, |since| now - since)
    }

    fn transition_error(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            action,
            state: self.state,
        }
    }
}

/// Owns the session state, the energy accumulator and the cycle/export lock.
#[derive(Debug)]
pub struct SessionArbiter {
    inner: Mutex<ArbiterInner>,
    changed: Condvar,
    // Lock order: `cycle` before `inner`.
    cycle: Mutex<()>,
}

impl Default for SessionArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionArbiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ArbiterInner {
                state: SessionState::Idle,
                mode: None,
                accumulator: EnergyAccumulator::new(),
                faults: SampleFaults::default(),
                active_before: Duration::ZERO,
                active_since: None,
            }),
            changed: Condvar::new(),
            cycle: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn active_mode(&self) -> Option<MeasurementMode> {
        self.lock().mode
    }

    /// Measuring time so far, paused intervals excluded.
    pub fn active_elapsed(&self) -> Duration {
        self.lock().active_elapsed(Instant::now())
    }

    /// Running energy totals of the current (or last) session.
    pub fn energy(&self) -> EnergySnapshot {
        let inner = self.lock();
        inner.accumulator.snapshot_at(inner.active_elapsed(Instant::now()))
    }

    pub fn faults(&self) -> SampleFaults {
        self.lock().faults.clone()
    }

    /// Begin a fresh session in `mode`.
    pub fn start(&self, mode: MeasurementMode) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if let Some(active) = inner.mode.filter(|_| inner.state.is_active()) {
            if active != mode {
                log::warn!("Rejected {}: {} is running", mode, active);
                return Err(SessionError::ModeConflict {
                    requested: mode,
                    active,
                });
            }
        }
        if !inner.state.can_start() {
            return Err(inner.transition_error("start"));
        }
        inner.accumulator.reset();
        inner.faults = SampleFaults::default();
        inner.active_before = Duration::ZERO;
        inner.active_since = Some(Instant::now());
        inner.mode = Some(mode);
        inner.state = SessionState::Measuring;
        log::info!("Session started: {}", mode);
        self.changed.notify_all();
        Ok(())
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if !inner.state.can_pause() {
            return Err(inner.transition_error("pause"));
        }
        let now = Instant::now();
        inner.active_before = inner.active_elapsed(now);
        inner.active_since = None;
        inner.state = SessionState::Paused;
        log::info!("Session paused");
        self.changed.notify_all();
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if !inner.state.can_resume() {
            return Err(inner.transition_error("resume"));
        }
        inner.active_since = Some(Instant::now());
        inner.state = SessionState::Measuring;
        log::info!("Session resumed");
        self.changed.notify_all();
        Ok(())
    }

    /// End the session and return its final energy totals.
    ///
    /// Blocks until an in-flight fetch cycle has finished. Must not be called
    /// from inside a cycle.
    pub fn stop(&self) -> Result<EnergySnapshot, SessionError> {
        let _cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        let mut inner = self.lock();
        if !inner.state.is_active() {
            return Err(inner.transition_error("stop"));
        }
        let now = Instant::now();
        let elapsed = inner.active_elapsed(now);
        inner.active_before = elapsed;
        inner.active_since = None;
        let snapshot = inner.accumulator.snapshot_at(elapsed);
        inner.state = SessionState::Stopped;
        let mode = inner.mode.take();
        log::info!(
            "Session stopped ({:?}): {} samples over {:.1}s, E_P={:.6}Wh E_S={:.6}VAh E_Q={:.6}varh, {} dropped",
            mode,
            snapshot.samples,
            elapsed.as_secs_f64(),
            snapshot.e_p_wh,
            snapshot.e_s_vah,
            snapshot.e_q_varh,
            inner.faults.total()
        );
        self.changed.notify_all();
        Ok(snapshot)
    }

    /// Return a stopped session to `Idle`.
    pub fn reset(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Stopped {
            return Err(inner.transition_error("reset"));
        }
        inner.state = SessionState::Idle;
        self.changed.notify_all();
        Ok(())
    }

    /// Fold a computed sample into the session energy.
    ///
    /// Samples from a cycle that was already in flight when the session was
    /// paused are still accepted.
    pub fn record_sample(&self, sample: &PowerSample) -> Result<EnergySnapshot, SessionError> {
        let mut inner = self.lock();
        if !inner.state.is_active() {
            return Err(inner.transition_error("record a sample"));
        }
        let elapsed = inner.active_elapsed(Instant::now());
        inner.accumulator.record(sample, elapsed);
        Ok(inner.accumulator.snapshot_at(elapsed))
    }

    /// Count a dropped sample; the accumulator is left untouched.
    pub fn record_fault(&self, error: &ComputeError) {
        log::warn!("Sample dropped: {}", error);
        self.lock().faults.record(error);
    }

    /// Count a cycle whose acquisition failed.
    pub fn record_acquisition_failure(&self, error: &dyn std::error::Error) {
        log::warn!("Cycle lost: {}", error);
        self.lock().faults.acquisition += 1;
    }

    /// Hold the instrument for one fetch cycle. Only granted while measuring.
    pub fn begin_cycle(&self) -> Result<CycleGuard<'_>, SessionError> {
        let guard = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = self.lock();
        if inner.state != SessionState::Measuring {
            return Err(inner.transition_error("begin a cycle"));
        }
        Ok(CycleGuard { _guard: guard })
    }

    /// Wait for any in-flight cycle, then hold off new ones until the guard drops.
    pub fn begin_export(&self) -> ExportGuard<'_> {
        ExportGuard {
            _guard: self.cycle.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn try_begin_export(&self) -> Result<ExportGuard<'_>, SessionError> {
        match self.cycle.try_lock() {
            Ok(guard) => Ok(ExportGuard { _guard: guard }),
            Err(TryLockError::WouldBlock) => Err(SessionError::ExportBusy),
            Err(TryLockError::Poisoned(p)) => Ok(ExportGuard {
                _guard: p.into_inner(),
            }),
        }
    }

    /// Block while paused. Returns `false` once the session is no longer active.
    fn wait_while_paused(&self) -> bool {
        let inner = self
            .changed
            .wait_while(self.lock(), |inner| inner.state == SessionState::Paused)
            .unwrap_or_else(PoisonError::into_inner);
        inner.state == SessionState::Measuring
    }

    /// Sleep until `deadline` unless the session leaves the active states first.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut inner = self.lock();
        loop {
            if !inner.state.is_active() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            inner = self
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Scoped hold of the cycle lock for a fetch cycle.
#[derive(Debug)]
pub struct CycleGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Scoped hold of the cycle lock for an export.
#[derive(Debug)]
pub struct ExportGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Fixed-grid cycle deadlines. An overrun skips the slots it missed.
#[derive(Debug, Clone)]
pub struct CycleScheduler {
    period: Duration,
    next: Instant,
    skipped: u64,
}

impl CycleScheduler {
    pub const MIN_PERIOD: Duration = Duration::from_millis(1);

    /// First cycle is due at `start`.
    pub fn new(period: Duration, start: Instant) -> Self {
        Self {
            period: period.max(Self::MIN_PERIOD),
            next: start,
            skipped: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Deadline of the next cycle after one that finished at `now`.
    pub fn next_deadline(&mut self, now: Instant) -> Instant {
        self.next += self.period;
        let mut missed = 0u64;
        while self.next < now {
            self.next += self.period;
            missed += 1;
        }
        if missed > 0 {
            self.skipped += missed;
            log::warn!("Cycle overran, skipped {} slot(s)", missed);
        }
        self.next
    }

    /// Re-anchor the grid, e.g. after a pause.
    pub fn restart(&mut self, start: Instant) {
        self.next = start;
    }
}

/// Counters reported by a finished [`MeasurementLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopReport {
    pub cycles: u64,
    pub skipped: u64,
}

/// Periodic measurement worker bound to a [`SessionArbiter`].
#[derive(Debug)]
pub struct MeasurementLoop {
    arbiter: Arc<SessionArbiter>,
    handle: JoinHandle<LoopReport>,
}

impl MeasurementLoop {
    /// Run `cycle` every `period` while the session is measuring.
    ///
    /// The worker sleeps while paused and exits once the session is stopped.
    pub fn spawn<F>(arbiter: Arc<SessionArbiter>, period: Duration, mut cycle: F) -> std::io::Result<Self>
    where
        F: FnMut(&SessionArbiter) + Send + 'static,
    {
        let worker = Arc::clone(&arbiter);
        let handle = std::thread::Builder::new()
            .name("measurement".into())
            .spawn(move || {
                let mode = worker.active_mode();
                let mut scheduler = CycleScheduler::new(period, Instant::now());
                let mut report = LoopReport::default();
                loop {
                    let was_paused = worker.state() == SessionState::Paused;
                    if !worker.wait_while_paused() {
                        break;
                    }
                    if was_paused {
                        scheduler.restart(Instant::now());
                    }
                    match worker.begin_cycle() {
                        Ok(_guard) => {
                            let span = tracing::info_span!(
                                "measurement_cycle",
                                mode = ?mode,
                                cycle = report.cycles
                            );
                            let _entered = span.enter();
                            cycle(&worker);
                            report.cycles += 1;
                        }
                        Err(e) => {
                            log::debug!("Cycle not started: {}", e);
                            continue;
                        }
                    }
                    let deadline = scheduler.next_deadline(Instant::now());
                    if !worker.sleep_until(deadline) {
                        break;
                    }
                }
                report.skipped = scheduler.skipped();
                log::debug!("Measurement loop finished: {:?}", report);
                report
            })?;
        Ok(Self { arbiter, handle })
    }

    pub fn arbiter(&self) -> &Arc<SessionArbiter> {
        &self.arbiter
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the session, wait for the worker and return the final energy.
    pub fn stop(self) -> (Result<EnergySnapshot, SessionError>, LoopReport) {
        let snapshot = self.arbiter.stop();
        let report = self.join();
        (snapshot, report)
    }

    /// Wait for the worker to exit on its own.
    pub fn join(self) -> LoopReport {
        self.handle.join().unwrap_or_else(|_| {
            log::error!("Measurement worker panicked");
            LoopReport::default()
        })
    }
}
