//! Cooperative poll-loop agents and the runner that drives them.
//!
//! An agent never blocks on an empty queue. Each `step` does a bounded amount
//! of work and reports whether it did anything; idle iterations go through the
//! configured `IdleStrategy`.

use crate::error::Result;
use crate::pipeline::error::{ErrorReporter, StationError};
use crate::pipeline::idle::IdleStrategy;
use crate::streaming::frame::WorkUnit;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A unit of work driven by an `AgentRunner`.
pub trait Agent: Send + 'static {
    /// Name for logging and error reporting.
    fn name(&self) -> &'static str;

    /// Performs at most one bounded unit of work.
    fn step(&mut self) -> std::result::Result<WorkUnit, StationError>;

    /// True once the agent has nothing more to do, ever.
    fn is_complete(&self) -> bool {
        false
    }

    /// Called on the agent's thread after the loop exits.
    fn on_close(&mut self) {}
}

/// Lifecycle of an agent's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentStatus {
    /// Still looping (or not yet spawned).
    Active = 0,
    /// The agent reported completion.
    Completed = 1,
    /// A fatal error or panic ended the loop.
    Failed = 2,
    /// The loop exited on a stop request.
    Stopped = 3,
}

impl AgentStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AgentStatus::Completed,
            2 => AgentStatus::Failed,
            3 => AgentStatus::Stopped,
            _ => AgentStatus::Active,
        }
    }
}

/// Stop flag and status shared between a runner, its agent and observers.
///
/// Created before the agent so that the agent can watch the same stop flag
/// and other components can probe the status before the thread exists.
#[derive(Debug, Clone, Default)]
pub struct AgentSignals {
    stop: Arc<AtomicBool>,
    status: Arc<AtomicU8>,
}

impl AgentSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// The stop flag itself, for agents that retry internally.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.status() == AgentStatus::Active
    }

    fn set_status(&self, status: AgentStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }
}

/// Marks the agent failed if its thread unwinds.
struct PanicGuard {
    signals: AgentSignals,
    name: &'static str,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.signals.set_status(AgentStatus::Failed);
            tracing::error!(agent = self.name, "agent thread panicked");
        }
    }
}

/// Runs an agent on a dedicated thread.
pub struct AgentRunner {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    signals: AgentSignals,
    fatal: Arc<Mutex<Option<StationError>>>,
}

impl AgentRunner {
    /// Spawns the agent's poll loop.
    ///
    /// # Arguments
    /// * `agent` - The agent to drive
    /// * `signals` - Stop flag and status shared with observers
    /// * `idle` - Wait strategy for unproductive steps
    /// * `error_reporter` - Reporter for step errors
    pub fn spawn<A: Agent>(
        mut agent: A,
        signals: AgentSignals,
        idle: IdleStrategy,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let name = agent.name();
        let fatal = Arc::new(Mutex::new(None));
        let thread_signals = signals.clone();
        let thread_fatal = Arc::clone(&fatal);

        let handle = thread::Builder::new()
            .name(format!("dfstream-{name}"))
            .spawn(move || {
                Self::run_agent(
                    &mut agent,
                    &thread_signals,
                    idle,
                    error_reporter.as_ref(),
                    &thread_fatal,
                );
            })?;

        tracing::debug!(agent = name, "agent started");
        Ok(Self {
            name,
            handle: Some(handle),
            signals,
            fatal,
        })
    }

    fn run_agent<A: Agent>(
        agent: &mut A,
        signals: &AgentSignals,
        idle: IdleStrategy,
        error_reporter: &dyn ErrorReporter,
        fatal: &Mutex<Option<StationError>>,
    ) {
        let name = agent.name();
        let _guard = PanicGuard {
            signals: signals.clone(),
            name,
        };
        let mut idler = idle.idler();

        let final_status = loop {
            if signals.is_stop_requested() {
                break AgentStatus::Stopped;
            }
            match agent.step() {
                Ok(WorkUnit::Produced) => idler.reset(),
                Ok(WorkUnit::None) => {
                    if agent.is_complete() {
                        break AgentStatus::Completed;
                    }
                    idler.idle();
                }
                Err(error @ StationError::Recoverable(_)) => {
                    error_reporter.report(name, &error);
                    idler.idle();
                }
                Err(error @ StationError::Fatal(_)) => {
                    error_reporter.report(name, &error);
                    if let Ok(mut slot) = fatal.lock() {
                        slot.get_or_insert(error);
                    }
                    break AgentStatus::Failed;
                }
            }
        };

        agent.on_close();
        signals.set_status(final_status);
        tracing::debug!(agent = name, status = ?final_status, "agent exited");
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn status(&self) -> AgentStatus {
        self.signals.status()
    }

    pub fn signals(&self) -> &AgentSignals {
        &self.signals
    }

    /// Asks the loop to exit at its next iteration.
    pub fn request_stop(&self) {
        self.signals.request_stop();
    }

    /// Waits up to `timeout` for the thread to exit.
    ///
    /// Returns true if the thread was joined (or already had been).
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        match self.handle.take() {
            Some(handle) => match join_with_deadline(handle, self.name, timeout) {
                Ok(()) => true,
                Err(handle) => {
                    self.handle = Some(handle);
                    false
                }
            },
            None => true,
        }
    }

    /// Requests a stop and waits up to `timeout`. A thread that misses the
    /// deadline is detached.
    pub fn close(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        let joined = self.join_timeout(timeout);
        if !joined {
            tracing::warn!(
                agent = self.name,
                timeout_ms = timeout.as_millis() as u64,
                "agent did not stop within timeout, detaching"
            );
            self.handle = None;
        }
        joined
    }

    /// Takes the latched fatal error, if the loop ended on one.
    pub fn take_fatal_error(&self) -> Option<StationError> {
        self.fatal.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        // Dropping the JoinHandle detaches the thread; make sure it exits.
        self.request_stop();
    }
}

/// Joins `handle` if it finishes before `timeout`, otherwise hands it back.
///
/// A panicked thread counts as joined; the panic is logged.
pub(crate) fn join_with_deadline(
    handle: JoinHandle<()>,
    name: &str,
    timeout: Duration,
) -> std::result::Result<(), JoinHandle<()>> {
    let deadline = Instant::now() + timeout;
    loop {
        if handle.is_finished() {
            if let Err(panic_info) = handle.join() {
                let msg = panic_info
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                    .unwrap_or("unknown panic");
                tracing::error!(thread = name, "thread panicked: {msg}");
            }
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(handle);
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockReporter {
        errors: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl ErrorReporter for MockReporter {
        fn report(&self, stage: &str, error: &StationError) {
            let mut errors = self.errors.lock().unwrap();
            errors.push((stage.to_string(), error.to_string()));
        }
    }

    /// Produces `limit` units of work, then completes.
    struct CountingAgent {
        count: Arc<AtomicUsize>,
        limit: usize,
        closed: Arc<AtomicBool>,
    }

    impl Agent for CountingAgent {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn step(&mut self) -> std::result::Result<WorkUnit, StationError> {
            if self.count.load(Ordering::SeqCst) >= self.limit {
                return Ok(WorkUnit::None);
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(WorkUnit::Produced)
        }

        fn is_complete(&self) -> bool {
            self.count.load(Ordering::SeqCst) >= self.limit
        }

        fn on_close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Never completes; only a stop request ends it.
    struct ForeverAgent;

    impl Agent for ForeverAgent {
        fn name(&self) -> &'static str {
            "forever"
        }

        fn step(&mut self) -> std::result::Result<WorkUnit, StationError> {
            Ok(WorkUnit::None)
        }
    }

    /// Fails recoverably once, then fatally.
    struct FailingAgent {
        calls: usize,
    }

    impl Agent for FailingAgent {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn step(&mut self) -> std::result::Result<WorkUnit, StationError> {
            self.calls += 1;
            if self.calls == 1 {
                Err(StationError::Recoverable("hiccup".to_string()))
            } else {
                Err(StationError::Fatal("broken".to_string()))
            }
        }
    }

    struct PanickingAgent;

    impl Agent for PanickingAgent {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn step(&mut self) -> std::result::Result<WorkUnit, StationError> {
            panic!("agent exploded");
        }
    }

    fn fast_idle() -> IdleStrategy {
        IdleStrategy::Sleep { micros: 100 }
    }

    #[test]
    fn test_runner_completes_agent() {
        let count = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let agent = CountingAgent {
            count: count.clone(),
            limit: 5,
            closed: closed.clone(),
        };
        let mut runner = AgentRunner::spawn(
            agent,
            AgentSignals::new(),
            fast_idle(),
            Arc::new(MockReporter::default()),
        )
        .unwrap();

        assert!(runner.join_timeout(Duration::from_secs(5)));
        assert_eq!(runner.status(), AgentStatus::Completed);
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_runner_stops_on_request() {
        let signals = AgentSignals::new();
        let mut runner = AgentRunner::spawn(
            ForeverAgent,
            signals.clone(),
            fast_idle(),
            Arc::new(MockReporter::default()),
        )
        .unwrap();

        assert!(signals.is_active());
        assert!(runner.close(Duration::from_secs(5)));
        assert_eq!(signals.status(), AgentStatus::Stopped);
    }

    #[test]
    fn test_runner_latches_fatal_error() {
        let reporter = Arc::new(MockReporter::default());
        let errors = reporter.errors.clone();
        let mut runner = AgentRunner::spawn(
            FailingAgent { calls: 0 },
            AgentSignals::new(),
            fast_idle(),
            reporter,
        )
        .unwrap();

        assert!(runner.join_timeout(Duration::from_secs(5)));
        assert_eq!(runner.status(), AgentStatus::Failed);
        assert_eq!(
            runner.take_fatal_error(),
            Some(StationError::Fatal("broken".to_string()))
        );
        // Latch is cleared after the first take.
        assert_eq!(runner.take_fatal_error(), None);

        let reported = errors.lock().unwrap();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].0, "failing");
        assert!(reported[0].1.contains("hiccup"));
        assert!(reported[1].1.contains("broken"));
    }

    #[test]
    fn test_runner_marks_panicked_agent_failed() {
        let signals = AgentSignals::new();
        let mut runner = AgentRunner::spawn(
            PanickingAgent,
            signals.clone(),
            fast_idle(),
            Arc::new(MockReporter::default()),
        )
        .unwrap();

        assert!(runner.join_timeout(Duration::from_secs(5)));
        assert_eq!(signals.status(), AgentStatus::Failed);
    }

    #[test]
    fn test_join_timeout_expires_for_running_agent() {
        let mut runner = AgentRunner::spawn(
            ForeverAgent,
            AgentSignals::new(),
            fast_idle(),
            Arc::new(MockReporter::default()),
        )
        .unwrap();

        assert!(!runner.join_timeout(Duration::from_millis(20)));
        assert_eq!(runner.status(), AgentStatus::Active);
        assert!(runner.close(Duration::from_secs(5)));
    }
}
