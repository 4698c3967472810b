use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::Document;
use crate::error::SandboxEvaluationError;
use crate::js::channel::Message;
use crate::js::console::{ConsoleSink, TracingConsole};
use crate::js::script::ScriptLoadTiming;

const DEFAULT_SCRIPT_URL: &str = "content-script.js";
const DEFAULT_MAX_DISPATCH_PER_PUMP: usize = 10_000;
const DEFAULT_MIN_INTERVAL_MS: u64 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("The option \"{0}\" is invalid.")]
    InvalidOption(&'static str),
    #[error("failed to read worker config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse document URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Serialisable worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    pub script_load_timing: ScriptLoadTiming,
    pub script_url: String,
    pub max_dispatch_per_pump: usize,
    pub min_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            script_load_timing: ScriptLoadTiming::default(),
            script_url: DEFAULT_SCRIPT_URL.to_string(),
            max_dispatch_per_pump: DEFAULT_MAX_DISPATCH_PER_PUMP,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
        }
    }
}

impl WorkerConfig {
    /// Load settings from a YAML file, falling back to defaults when no
    /// path is given or the file does not exist.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str(&contents)?
            }
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.script_url.trim().is_empty() {
            return Err(ConfigError::InvalidOption("scriptUrl"));
        }
        if self.max_dispatch_per_pump == 0 {
            return Err(ConfigError::InvalidOption("maxDispatchPerPump"));
        }
        if self.min_interval_ms == 0 {
            return Err(ConfigError::InvalidOption("minIntervalMs"));
        }
        Ok(())
    }
}

pub type MessageCallback = Rc<dyn Fn(&Message)>;
pub type ErrorCallback = Rc<dyn Fn(&SandboxEvaluationError)>;

/// Everything needed to construct a [`crate::Worker`].
#[derive(Clone)]
pub struct WorkerOptions {
    pub(crate) target: Document,
    pub(crate) script: String,
    pub(crate) config: WorkerConfig,
    pub(crate) on_message: Option<MessageCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) console: Rc<dyn ConsoleSink>,
}

impl WorkerOptions {
    pub fn new(target: Document, script: impl Into<String>) -> Self {
        Self {
            target,
            script: script.into(),
            config: WorkerConfig::default(),
            on_message: None,
            on_error: None,
            console: Rc::new(TracingConsole),
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn script_load_timing(mut self, timing: ScriptLoadTiming) -> Self {
        self.config.script_load_timing = timing;
        self
    }

    /// Parse the load timing from its string form (`start`, `ready`, `end`).
    pub fn script_load_timing_str(self, timing: &str) -> Result<Self, ConfigError> {
        let timing = timing
            .parse::<ScriptLoadTiming>()
            .map_err(|_| ConfigError::InvalidOption("scriptLoadTiming"))?;
        Ok(self.script_load_timing(timing))
    }

    pub fn on_message(mut self, callback: impl Fn(&Message) + 'static) -> Self {
        self.on_message = Some(Rc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&SandboxEvaluationError) + 'static) -> Self {
        self.on_error = Some(Rc::new(callback));
        self
    }

    pub fn console(mut self, console: Rc<dyn ConsoleSink>) -> Self {
        self.console = console;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.script.trim().is_empty() {
            return Err(ConfigError::InvalidOption("script"));
        }
        self.config.validate()
    }
}

impl fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("target", &self.target.url().as_str())
            .field("script_len", &self.script.len())
            .field("config", &self.config)
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
