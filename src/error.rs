use thiserror::Error;

use crate::message::ParseError;

/// Errors surfaced by pipeline stages.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no valid response from either primary or secondary")]
    FallbackExhausted,

    #[error("all {attempted} upstreams failed, last error: {last}")]
    AllUpstreamsFailed { attempted: usize, last: String },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("IO error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message codec error: {0}")]
    Codec(#[from] ParseError),
}

impl From<std::io::Error> for ResolveError {
    fn from(err: std::io::Error) -> Self {
        ResolveError::Io(err.to_string())
    }
}

/// Errors produced while validating stage configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid cache size: {0}")]
    InvalidCacheSize(String),

    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),

    #[error("invalid concurrency cap: {0}")]
    InvalidConcurrency(String),

    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid mark: {0}")]
    InvalidMark(String),
}

pub type Result<T> = std::result::Result<T, ResolveError>;
