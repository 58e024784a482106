//! Dispatch Stage: Output Queue → registered listener groups.
//!
//! One `Dispatcher` can serve several pipelines. Each pipeline registers an
//! `OutputGroup` under its processor id; the dispatch agent pops at most one
//! frame per group per step and hands it to the group's listeners, either on
//! the dispatch thread or through the group's single ordered delivery worker.

use crate::defaults;
use crate::error::{DfStreamError, Result};
use crate::pipeline::agent::{Agent, AgentRunner, AgentSignals, join_with_deadline};
use crate::pipeline::error::{ErrorReporter, LogReporter, StationError};
use crate::pipeline::idle::IdleStrategy;
use crate::pipeline::listener::SharedListener;
use crate::pipeline::stats::PipelineCounters;
use crate::streaming::frame::{ProcessedFrame, WorkUnit};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Where listener callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPolicy {
    /// On the dispatch thread. A slow listener slows every group.
    Inline,
    /// On one worker thread per group, preserving frame order.
    #[default]
    Offloaded,
}

/// Reports how much data is still upstream of a group's Output Queue.
pub type UpstreamProbe = Box<dyn Fn() -> usize + Send + Sync>;

/// State shared between a group and its delivery worker.
struct GroupShared {
    processor_id: String,
    listeners: Vec<SharedListener>,
    in_flight: AtomicUsize,
    counters: Arc<PipelineCounters>,
}

impl GroupShared {
    fn deliver(&self, frame: &ProcessedFrame) {
        for listener in &self.listeners {
            let mut listener = listener.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = listener.on_denoised_frame(&frame.bytes) {
                PipelineCounters::add(&self.counters.listener_errors, 1);
                tracing::warn!(
                    processor = %self.processor_id,
                    listener = listener.name(),
                    sequence = frame.sequence,
                    error = %e,
                    "listener failed to handle frame"
                );
            }
        }
        PipelineCounters::add(&self.counters.frames_delivered, 1);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn deliver_original(&self, bytes: &[u8]) {
        for listener in &self.listeners {
            let mut listener = listener.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = listener.on_original_frame(bytes) {
                PipelineCounters::add(&self.counters.listener_errors, 1);
                tracing::warn!(
                    processor = %self.processor_id,
                    listener = listener.name(),
                    error = %e,
                    "listener failed to handle original frame"
                );
            }
        }
    }

    fn finish(&self) {
        for listener in &self.listeners {
            let mut listener = listener.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = listener.finish() {
                PipelineCounters::add(&self.counters.listener_errors, 1);
                tracing::warn!(
                    processor = %self.processor_id,
                    listener = listener.name(),
                    error = %e,
                    "listener failed to finish"
                );
            }
        }
    }
}

/// Ordered delivery thread for one group.
///
/// Dropping the sender finishes the group once queued frames are delivered.
struct DeliveryWorker {
    sender: Option<Sender<ProcessedFrame>>,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryWorker {
    fn spawn(shared: Arc<GroupShared>, capacity: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded::<ProcessedFrame>(capacity);
        let handle = thread::Builder::new()
            .name(format!("dfstream-deliver-{}", shared.processor_id))
            .spawn(move || {
                for frame in receiver.iter() {
                    shared.deliver(&frame);
                }
                shared.finish();
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    fn is_full(&self) -> bool {
        self.sender.as_ref().is_some_and(|sender| sender.is_full())
    }
}

struct GroupState {
    worker: Option<DeliveryWorker>,
    finished: bool,
}

/// One pipeline's registration with a dispatcher.
///
/// Carries the listeners, the pipeline's Output Queue receiver, its
/// end-of-input flag and a probe for data still upstream of the queue.
pub struct OutputGroup {
    shared: Arc<GroupShared>,
    receiver: Receiver<ProcessedFrame>,
    end_of_input: Arc<AtomicBool>,
    upstream: UpstreamProbe,
    state: Mutex<GroupState>,
    finished: AtomicBool,
}

impl OutputGroup {
    /// Creates a group, spawning its delivery worker for `Offloaded`.
    ///
    /// The worker's queue holds as many frames as the Output Queue, so a slow
    /// listener backs up into the Output Queue instead of growing memory.
    ///
    /// # Arguments
    /// * `processor_id` - Registry key, unique per dispatcher
    /// * `listeners` - Receive every frame, in order
    /// * `receiver` - Consuming end of the pipeline's Output Queue
    /// * `end_of_input` - The pipeline's end-of-input flag
    /// * `upstream` - Bytes or frames still upstream; zero once nothing can arrive
    /// * `delivery` - Inline or offloaded callbacks
    /// * `counters` - The pipeline's counters
    pub fn new(
        processor_id: impl Into<String>,
        listeners: Vec<SharedListener>,
        receiver: Receiver<ProcessedFrame>,
        end_of_input: Arc<AtomicBool>,
        upstream: UpstreamProbe,
        delivery: DeliveryPolicy,
        counters: Arc<PipelineCounters>,
    ) -> Result<Self> {
        let shared = Arc::new(GroupShared {
            processor_id: processor_id.into(),
            listeners,
            in_flight: AtomicUsize::new(0),
            counters,
        });
        let worker = match delivery {
            DeliveryPolicy::Inline => None,
            DeliveryPolicy::Offloaded => {
                let capacity = receiver
                    .capacity()
                    .unwrap_or(defaults::OUTPUT_QUEUE_CAPACITY)
                    .max(1);
                Some(DeliveryWorker::spawn(Arc::clone(&shared), capacity)?)
            }
        };
        Ok(Self {
            shared,
            receiver,
            end_of_input,
            upstream,
            state: Mutex::new(GroupState {
                worker,
                finished: false,
            }),
            finished: AtomicBool::new(false),
        })
    }

    pub fn processor_id(&self) -> &str {
        &self.shared.processor_id
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Frames waiting in the Output Queue.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Frames popped from the queue but not yet handed to every listener.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// True once the group drained and its listeners were finished.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Mirrors raw input to every listener's `on_original_frame`.
    pub fn deliver_original(&self, bytes: &[u8]) {
        self.shared.deliver_original(bytes);
    }

    fn lock_state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pops and delivers at most one frame.
    pub fn poll(&self) -> WorkUnit {
        let mut state = self.lock_state();
        if state.finished {
            return WorkUnit::None;
        }
        // Leave the frame in the Output Queue until the worker has room.
        if state.worker.as_ref().is_some_and(DeliveryWorker::is_full) {
            return WorkUnit::None;
        }

        // Counted before the pop so a frame is never invisible to observers.
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.receiver.try_recv() {
            Ok(frame) => {
                match state.worker.as_ref().and_then(|w| w.sender.as_ref()) {
                    Some(sender) => {
                        // Only this group sends, and it checked for room above.
                        if let Err(e) = sender.try_send(frame) {
                            tracing::warn!(
                                processor = %self.shared.processor_id,
                                "delivery worker unavailable, delivering inline"
                            );
                            self.shared.deliver(&e.into_inner());
                        }
                    }
                    None => self.shared.deliver(&frame),
                }
                WorkUnit::Produced
            }
            Err(_) => {
                self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                if self.end_of_input.load(Ordering::SeqCst)
                    && self.receiver.is_empty()
                    && (self.upstream)() == 0
                {
                    self.finish_locked(&mut state);
                }
                WorkUnit::None
            }
        }
    }

    fn finish_locked(&self, state: &mut GroupState) {
        if state.finished {
            return;
        }
        state.finished = true;
        self.finished.store(true, Ordering::SeqCst);

        // The worker finishes the listeners after its last frame.
        let worker_finishes = state.worker.as_mut().is_some_and(|worker| {
            worker.sender.take().is_some()
                && worker.handle.as_ref().is_some_and(|h| !h.is_finished())
        });
        if !worker_finishes {
            self.shared.finish();
        }
        tracing::debug!(processor = %self.shared.processor_id, "output group drained");
    }

    /// Finishes the group and waits up to `timeout` for pending deliveries.
    ///
    /// Frames still in the queue are discarded. Returns false on timeout.
    pub fn close(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = loop {
            match self.state.try_lock() {
                Ok(state) => break state,
                Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(
                            processor = %self.shared.processor_id,
                            "listener delivery still busy, group not closed cleanly"
                        );
                        return false;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        };

        let discarded = self.receiver.len();
        if discarded > 0 {
            tracing::warn!(
                processor = %self.shared.processor_id,
                frames = discarded,
                "closing output group with undelivered frames"
            );
        }
        self.finish_locked(&mut state);

        let Some(mut worker) = state.worker.take() else {
            return true;
        };
        drop(state);
        match worker.handle.take() {
            Some(handle) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match join_with_deadline(handle, &self.shared.processor_id, remaining) {
                    Ok(()) => true,
                    Err(_detached) => {
                        tracing::warn!(
                            processor = %self.shared.processor_id,
                            "delivery worker did not finish within timeout, detaching"
                        );
                        false
                    }
                }
            }
            None => true,
        }
    }
}

/// Output groups keyed by processor id.
#[derive(Default)]
pub struct ListenerRegistry {
    groups: Mutex<BTreeMap<String, Arc<OutputGroup>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<OutputGroup>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a group. Fails if the processor id is already registered.
    pub fn register(&self, group: Arc<OutputGroup>) -> Result<()> {
        let mut groups = self.lock();
        let id = group.processor_id().to_string();
        if groups.contains_key(&id) {
            tracing::warn!(processor = %id, "processor already registered");
            return Err(DfStreamError::InvalidState {
                message: format!("processor '{id}' is already registered"),
            });
        }
        tracing::info!(
            processor = %id,
            listeners = group.listener_count(),
            "output group registered"
        );
        groups.insert(id, group);
        Ok(())
    }

    /// Removes and returns a group.
    pub fn unregister(&self, processor_id: &str) -> Option<Arc<OutputGroup>> {
        let removed = self.lock().remove(processor_id);
        match &removed {
            Some(_) => tracing::info!(processor = %processor_id, "output group unregistered"),
            None => tracing::debug!(processor = %processor_id, "no output group to unregister"),
        }
        removed
    }

    /// Removes `group` only if it is the one registered under its id.
    pub fn unregister_group(&self, group: &Arc<OutputGroup>) -> bool {
        let mut groups = self.lock();
        let id = group.processor_id();
        if groups.get(id).is_some_and(|current| Arc::ptr_eq(current, group)) {
            groups.remove(id);
            tracing::info!(processor = %id, "output group unregistered");
            true
        } else {
            false
        }
    }

    pub fn get(&self, processor_id: &str) -> Option<Arc<OutputGroup>> {
        self.lock().get(processor_id).cloned()
    }

    pub fn contains(&self, processor_id: &str) -> bool {
        self.lock().contains_key(processor_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Replaces `out` with the current groups.
    pub fn snapshot_into(&self, out: &mut Vec<Arc<OutputGroup>>) {
        out.clear();
        out.extend(self.lock().values().cloned());
    }

    fn drain(&self) -> Vec<Arc<OutputGroup>> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }
}

/// Agent that polls every registered group once per step.
pub struct DispatchStage {
    registry: Arc<ListenerRegistry>,
    groups: Vec<Arc<OutputGroup>>,
}

impl DispatchStage {
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self {
            registry,
            groups: Vec::new(),
        }
    }
}

impl Agent for DispatchStage {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    fn step(&mut self) -> std::result::Result<WorkUnit, StationError> {
        self.registry.snapshot_into(&mut self.groups);
        let mut produced = false;
        for group in &self.groups {
            produced |= group.poll().is_produced();
        }
        // Drop the clones so unregistered groups are freed promptly.
        self.groups.clear();
        Ok(if produced {
            WorkUnit::Produced
        } else {
            WorkUnit::None
        })
    }
}

/// A registry plus the runner that drives its `DispatchStage`.
///
/// Pipelines either own a private dispatcher or share one through `Arc`.
pub struct Dispatcher {
    registry: Arc<ListenerRegistry>,
    idle: IdleStrategy,
    shutdown_timeout: Duration,
    error_reporter: Arc<dyn ErrorReporter>,
    runner: Mutex<Option<AgentRunner>>,
}

impl Dispatcher {
    pub fn new(idle: IdleStrategy) -> Self {
        Self {
            registry: Arc::new(ListenerRegistry::new()),
            idle,
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
            error_reporter: Arc::new(LogReporter),
            runner: Mutex::new(None),
        }
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    fn lock_runner(&self) -> MutexGuard<'_, Option<AgentRunner>> {
        self.runner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the dispatch thread unless it is already looping.
    pub fn ensure_running(&self) -> Result<()> {
        let mut runner = self.lock_runner();
        if runner.as_ref().is_some_and(|r| r.signals().is_active()) {
            return Ok(());
        }
        let stage = DispatchStage::new(Arc::clone(&self.registry));
        *runner = Some(AgentRunner::spawn(
            stage,
            AgentSignals::new(),
            self.idle,
            Arc::clone(&self.error_reporter),
        )?);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_runner()
            .as_ref()
            .is_some_and(|r| r.signals().is_active())
    }

    /// Registers a group and makes sure it will be polled.
    pub fn register(&self, group: Arc<OutputGroup>) -> Result<()> {
        self.registry.register(group)?;
        self.ensure_running()
    }

    /// Unregisters and closes a group. Returns false if it was not registered
    /// or did not close within `timeout`.
    pub fn unregister(&self, processor_id: &str, timeout: Duration) -> bool {
        match self.registry.unregister(processor_id) {
            Some(group) => group.close(timeout),
            None => false,
        }
    }

    /// Stops the dispatch thread and closes every remaining group.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let runner = self.lock_runner().take();
        let mut clean = match runner {
            Some(mut runner) => runner.close(timeout),
            None => true,
        };
        for group in self.registry.drain() {
            clean &= group.close(timeout);
        }
        clean
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown(self.shutdown_timeout);
    }
}
