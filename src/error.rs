//! Error taxonomy for the judge-execution plane.
//!
//! Internal code propagates failures with `anyhow::Result` via the
//! `prelude`, same as it always has here. At the public edges (worker pool,
//! submit intake, sandbox engine) an `anyhow::Error` is classified into a
//! [`JudgeError`] so callers can decide whether to retry, dead-letter, or
//! persist a terminal status.

use log::error;
use thiserror::Error;

pub mod prelude {
    pub use super::{JudgeError, JudgeErrorKind};
    pub use anyhow::{anyhow, bail, Context};
    use std::result::Result as StdResult;
    pub type Result<T = (), E = anyhow::Error> = StdResult<T, E>;
}

/// The five error categories from the design doc. Each maps to a distinct
/// handling policy at the queue / submit boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeErrorKind {
    /// Malformed input, unknown language, missing required field. Never retried.
    Validation,
    /// Unauthorized, suspended, rate-limited. Returned synchronously.
    AuthRate,
    /// Object storage / queue / cache / db hiccup. Retried with bounded attempts.
    TransientExternal,
    /// Compile error, wrong answer, TLE/MLE/OLE/RE. Persisted as final verdict.
    TerminalJudgment,
    /// Misconfigured sandbox, unparseable seccomp profile, missing helper binary.
    Fatal,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct JudgeError {
    pub kind: JudgeErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl JudgeError {
    pub fn new(kind: JudgeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(JudgeErrorKind::Validation, message)
    }

    pub fn auth_rate(message: impl Into<String>) -> Self {
        Self::new(JudgeErrorKind::AuthRate, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(JudgeErrorKind::TransientExternal, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(JudgeErrorKind::Fatal, message)
    }

    pub fn terminal_judgment(message: impl Into<String>) -> Self {
        Self::new(JudgeErrorKind::TerminalJudgment, message)
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether the queue layer should re-deliver the message for this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind, JudgeErrorKind::TransientExternal)
    }
}

impl From<anyhow::Error> for JudgeError {
    fn from(e: anyhow::Error) -> Self {
        error!("Unclassified internal error, treating as transient: {:?}", e);
        JudgeError::transient(e.to_string()).with_source(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retriable_others_are_not() {
        assert!(JudgeError::transient("db timeout").is_retriable());
        assert!(!JudgeError::validation("bad input").is_retriable());
        assert!(!JudgeError::terminal_judgment("wrong answer").is_retriable());
        assert!(!JudgeError::fatal("cgroup root missing").is_retriable());
    }
}
