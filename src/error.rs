use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// Why a channel refused to carry a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The document went into the back/forward cache.
    Hidden,
    /// The document was unloaded or the worker destroyed.
    Gone,
}

impl UnavailableReason {
    pub fn detail(&self) -> &'static str {
        match self {
            Self::Hidden => {
                "The page is currently hidden and can no longer be used until it is visible again."
            }
            Self::Gone => {
                "Couldn't find the worker to receive this message. The script may not be \
                 initialized yet, or may already have been unloaded."
            }
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hidden => f.write_str("page is hidden"),
            Self::Gone => f.write_str("page is gone"),
        }
    }
}

/// A send was attempted while the sandbox is frozen or destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {}", reason.detail())]
pub struct ChannelUnavailableError {
    pub reason: UnavailableReason,
}

impl ChannelUnavailableError {
    pub fn hidden() -> Self {
        Self {
            reason: UnavailableReason::Hidden,
        }
    }

    pub fn gone() -> Self {
        Self {
            reason: UnavailableReason::Gone,
        }
    }
}

/// A value could not be made JSON-safe.
///
/// Cyclic graphs fail the send instead of being truncated; the sandbox
/// side reports the same condition from `JSON.stringify`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    #[error("cyclic value at `{path}` cannot be serialized")]
    Cycle { path: String },
    #[error("value nested deeper than {limit} levels at `{path}`")]
    TooDeep { path: String, limit: usize },
    #[error("sandbox produced invalid JSON: {0}")]
    InvalidJson(String),
}

/// Where a script fault happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationPhase {
    Script,
    Listener,
    Timer,
}

impl EvaluationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Listener => "listener",
            Self::Timer => "timer",
        }
    }

    pub(crate) fn parse(raw: &str) -> Self {
        match raw {
            "listener" => Self::Listener,
            "timer" => Self::Timer,
            _ => Self::Script,
        }
    }
}

/// The sandboxed script threw, either while being evaluated or inside one
/// of its callbacks. Reported through the controller's fault path only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} error in sandbox: {message}", phase.as_str())]
pub struct SandboxEvaluationError {
    pub message: String,
    pub stack: Option<String>,
    pub phase: EvaluationPhase,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    ChannelUnavailable(#[from] ChannelUnavailableError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("target document has already been unloaded")]
    DocumentUnloaded,
    #[error("worker cannot be re-attached from inside its own sandbox or while it is being torn down")]
    Reentrant,
    #[error("script engine failure: {0:#}")]
    Engine(#[from] anyhow::Error),
}
