//! Streaming frame pipeline.
//!
//! Two cooperative agents, each on its own thread: the Processing Stage
//! (channel → accumulator → transform → Output Queue) and the Dispatch Stage
//! (Output Queue → listeners). `StreamPipeline` owns the lifecycle.

pub mod agent;
pub mod dispatch;
pub mod error;
pub mod idle;
pub mod listener;
pub mod orchestrator;
pub mod processing;
pub mod stats;

pub use agent::{Agent, AgentRunner, AgentSignals, AgentStatus};
pub use dispatch::{DeliveryPolicy, DispatchStage, Dispatcher, ListenerRegistry, OutputGroup};
pub use error::{ErrorReporter, LogReporter, StationError};
pub use idle::IdleStrategy;
pub use listener::{CollectorListener, FnListener, FrameListener, SharedListener};
pub use orchestrator::{PipelineConfig, PipelineState, StreamPipeline};
pub use processing::ProcessingStage;
pub use stats::{PipelineCounters, PipelineStats};
