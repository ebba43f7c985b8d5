use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum XrefError {
    #[error("connection to {url} failed after {attempts} attempts: {cause}")]
    ConnectionFailure {
        url: String,
        attempts: u32,
        cause: String,
    },

    #[error("host unreachable for {url}: {cause}")]
    HostUnreachable {
        url: String,
        attempts: u32,
        cause: String,
    },

    #[error("transfer from {url} failed: {cause}")]
    IoFailure {
        url: String,
        attempts: u32,
        cause: String,
    },

    #[error("invalid request for {url}: {cause}")]
    InvalidRequest {
        url: String,
        attempts: u32,
        cause: String,
    },

    #[error("{service} returned status {status} for {url}: {message}")]
    ServiceStatus {
        service: String,
        url: String,
        status: u16,
        message: String,
    },

    /// `last_body` holds the whole final response; the message shows its start.
    #[error(
        "{service} query failed after {attempts} attempts at {url}; last body: {}",
        body_preview(.last_body)
    )]
    QueryFailed {
        service: String,
        url: String,
        attempts: u32,
        last_body: String,
    },

    #[error("{service} kept rate limiting {url}; gave up after waiting {}s", .waited.as_secs())]
    RateLimitExhausted {
        service: String,
        url: String,
        waited: Duration,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("missing config file xref-fetch.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid species id: {0}")]
    InvalidSpecies(String),

    #[error("invalid reference database id: {0}")]
    InvalidReferenceDb(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("run cancelled")]
    Cancelled,
}

/// Serialisable classification of a failed task, carried by `FetchResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectionFailure,
    HostUnreachable,
    Io,
    TerminalStatus,
    QueryFailed,
    RateLimitExhausted,
    Configuration,
    Filesystem,
    Panicked,
    Phase,
    Cancelled,
}

impl XrefError {
    /// Requests sent before a transfer-level error ended the exchange.
    pub fn transfer_attempts(&self) -> Option<u32> {
        match self {
            XrefError::ConnectionFailure { attempts, .. }
            | XrefError::HostUnreachable { attempts, .. }
            | XrefError::IoFailure { attempts, .. }
            | XrefError::InvalidRequest { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            XrefError::ConnectionFailure { .. } => FailureKind::ConnectionFailure,
            XrefError::HostUnreachable { .. } => FailureKind::HostUnreachable,
            XrefError::IoFailure { .. } => FailureKind::Io,
            XrefError::ServiceStatus { .. } => FailureKind::TerminalStatus,
            XrefError::QueryFailed { .. } => FailureKind::QueryFailed,
            XrefError::RateLimitExhausted { .. } => FailureKind::RateLimitExhausted,
            XrefError::InvalidRequest { .. }
            | XrefError::Configuration(_)
            | XrefError::MissingConfig
            | XrefError::ConfigRead(_)
            | XrefError::ConfigParse(_)
            | XrefError::InvalidSpecies(_)
            | XrefError::InvalidReferenceDb(_) => FailureKind::Configuration,
            XrefError::Filesystem(_) | XrefError::WorkerPool(_) => FailureKind::Filesystem,
            XrefError::TaskPanicked(_) => FailureKind::Panicked,
            XrefError::PhaseFailed { .. } => FailureKind::Phase,
            XrefError::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::ConnectionFailure => "connection_failure",
            FailureKind::HostUnreachable => "host_unreachable",
            FailureKind::Io => "io",
            FailureKind::TerminalStatus => "terminal_status",
            FailureKind::QueryFailed => "query_failed",
            FailureKind::RateLimitExhausted => "rate_limit_exhausted",
            FailureKind::Configuration => "configuration",
            FailureKind::Filesystem => "filesystem",
            FailureKind::Panicked => "panicked",
            FailureKind::Phase => "phase",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

const BODY_PREVIEW_CHARS: usize = 512;

fn body_preview(body: &str) -> String {
    if body.chars().count() <= BODY_PREVIEW_CHARS {
        return body.to_string();
    }
    let mut preview = body.chars().take(BODY_PREVIEW_CHARS).collect::<String>();
    preview.push_str("...");
    preview
}
