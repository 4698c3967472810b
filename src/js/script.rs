use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document::ReadyState;

/// When the injected script runs relative to the target document's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLoadTiming {
    /// As soon as the sandbox is attached, before the document is parsed.
    Start,
    /// Once the DOM is interactive (DOMContentLoaded).
    Ready,
    /// Once the document has fully loaded.
    End,
}

impl Default for ScriptLoadTiming {
    fn default() -> Self {
        Self::End
    }
}

impl ScriptLoadTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Ready => "ready",
            Self::End => "end",
        }
    }

    /// Whether a document in `state` is far enough along to run the script.
    pub fn is_satisfied_by(&self, state: ReadyState) -> bool {
        match self {
            Self::Start => true,
            Self::Ready => state >= ReadyState::Interactive,
            Self::End => state >= ReadyState::Complete,
        }
    }
}

impl fmt::Display for ScriptLoadTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLoadTiming(pub String);

impl FromStr for ScriptLoadTiming {
    type Err = UnknownLoadTiming;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "start" => Ok(Self::Start),
            "ready" => Ok(Self::Ready),
            "end" => Ok(Self::End),
            other => Err(UnknownLoadTiming(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_thresholds() {
        assert!(ScriptLoadTiming::Start.is_satisfied_by(ReadyState::Loading));
        assert!(!ScriptLoadTiming::Ready.is_satisfied_by(ReadyState::Loading));
        assert!(ScriptLoadTiming::Ready.is_satisfied_by(ReadyState::Interactive));
        assert!(!ScriptLoadTiming::End.is_satisfied_by(ReadyState::Interactive));
        assert!(ScriptLoadTiming::End.is_satisfied_by(ReadyState::Complete));
    }

    #[test]
    fn parses_known_names_only() {
        assert_eq!("ready".parse::<ScriptLoadTiming>(), Ok(ScriptLoadTiming::Ready));
        assert!("later".parse::<ScriptLoadTiming>().is_err());
    }
}
