use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Exception,
}

impl ConsoleLevel {
    pub const ALL: [ConsoleLevel; 6] = [
        Self::Log,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Debug,
        Self::Exception,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
            Self::Exception => "exception",
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsoleLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or(())
    }
}

/// Where the sandbox's `console.*` calls end up.
pub trait ConsoleSink {
    fn write(&self, level: ConsoleLevel, message: &str);
}

/// Forwards sandbox console output to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsole;

impl ConsoleSink for TracingConsole {
    fn write(&self, level: ConsoleLevel, message: &str) {
        match level {
            ConsoleLevel::Log | ConsoleLevel::Info => {
                tracing::info!(target: "sandbox", message = %message)
            }
            ConsoleLevel::Warn => tracing::warn!(target: "sandbox", message = %message),
            ConsoleLevel::Error | ConsoleLevel::Exception => {
                tracing::error!(target: "sandbox", level = %level, message = %message)
            }
            ConsoleLevel::Debug => tracing::debug!(target: "sandbox", message = %message),
        }
    }
}
