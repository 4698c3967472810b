// Library exports for embedders and tests

pub mod config;
pub mod document;
pub mod error;
pub mod js;
pub mod lifecycle;
pub mod worker;

// Re-export commonly used types
pub use config::{ConfigError, WorkerConfig, WorkerOptions};
pub use document::{Document, DocumentEvent, Element, ReadyState};
pub use error::{
    ChannelUnavailableError, EvaluationPhase, SandboxEvaluationError, SerializationError,
    UnavailableReason, WorkerError,
};
pub use js::{BoundaryValue, ConsoleLevel, ConsoleSink, ListenerId, Message, ScriptLoadTiming};
pub use lifecycle::{Generation, LifecycleState};
pub use worker::{Port, Worker};
