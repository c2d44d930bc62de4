//! Transient versus permanent failure classification.
//!
//! Explicit rate limiting is always transient, even when the provider words
//! it as a quota or limit. Beyond that, permanent evidence wins over transient
//! evidence, and output that matches neither is permanent: an unknown failure
//! is never retried blindly.

use labs_core::{CommandOutput, LabsError};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

static RATE_LIMIT_PATTERN: OnceLock<Regex> = OnceLock::new();
static PERMANENT_PATTERN: OnceLock<Regex> = OnceLock::new();
static TRANSIENT_PATTERN: OnceLock<Regex> = OnceLock::new();

fn rate_limit_pattern() -> &'static Regex {
    RATE_LIMIT_PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(\b429\b|too many requests|rate.?limit|throttl|calls per (second|minute|hour))",
        )
        .expect("rate limit pattern is valid")
    })
}

fn permanent_pattern() -> &'static Regex {
    PERMANENT_PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(quota|insufficient|exceed(s|ed) (the )?(maximum|limit)|invalid|unsupported|missing required|not allowed|forbidden|unauthori[sz]ed|\b40[0134]\b|already exists|no valid credential|validation)",
        )
        .expect("permanent failure pattern is valid")
    })
}

fn transient_pattern() -> &'static Regex {
    TRANSIENT_PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(timed? ?out|timeout|deadline exceeded|rate.?limit|too many requests|\b429\b|throttl|connection (reset|refused|closed)|broken pipe|no such host|network is unreachable|tls handshake|unexpected eof|temporar(y|ily)|try again|service unavailable|bad gateway|\b50[0234]\b|internal server error|error acquiring the state lock)",
        )
        .expect("transient failure pattern is valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => f.write_str("transient"),
            FailureClass::Permanent => f.write_str("permanent"),
        }
    }
}

/// Classify tool output.
pub fn classify(output: &str) -> FailureClass {
    if rate_limit_pattern().is_match(output) {
        FailureClass::Transient
    } else if permanent_pattern().is_match(output) {
        FailureClass::Permanent
    } else if transient_pattern().is_match(output) {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

#[derive(Debug, Clone, Error)]
#[error("{class} failure: {message}")]
pub struct InfraError {
    pub class: FailureClass,
    pub message: String,
    /// Longer tail of the tool's output, for deployment logs.
    pub output: String,
}

/// Lines of tool output kept with a failure for the deployment log.
pub const LOG_TAIL_LINES: usize = 200;

impl InfraError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
            output: String::new(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
            output: String::new(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }

    /// Failure of a command that ran to completion with a non-zero status.
    ///
    /// A missing exit code means the process died to a signal, which is
    /// treated like an interrupted run.
    pub fn from_output(step: &str, output: &CommandOutput) -> Self {
        let combined = output.combined();
        let class = match output.exit_code {
            None => FailureClass::Transient,
            Some(_) => classify(&combined),
        };
        Self {
            class,
            message: format!("{} failed: {}", step, output.tail(20)),
            output: output.tail(LOG_TAIL_LINES),
        }
    }
}

impl From<LabsError> for InfraError {
    fn from(err: LabsError) -> Self {
        if err.is_timeout() {
            Self::transient(err.to_string())
        } else {
            Self::permanent(err.to_string())
        }
    }
}

impl From<std::io::Error> for InfraError {
    fn from(err: std::io::Error) -> Self {
        Self::permanent(format!("workspace I/O: {}", err))
    }
}
