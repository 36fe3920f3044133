//! Error types for vcf-relay.

use crate::channels::ChannelKind;
use crate::store::JobId;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Channel transport errors.
///
/// `DispatchFailed` is surfaced to the submitter. Everything raised while
/// probing stays inside the watcher.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Dispatch on channel {name} failed: {reason}")]
    DispatchFailed { name: String, reason: String },

    #[error("Probe on channel {name} failed: {reason}")]
    ProbeFailed { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Invalid response on channel {name}: {reason}")]
    InvalidResponse { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} already exists")]
    AlreadyExists { id: JobId },

    #[error("Channel {channel} is not configured")]
    ChannelNotConfigured { channel: ChannelKind },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
