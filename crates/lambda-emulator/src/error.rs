//! Error types for the Lambda invoke emulator.

use thiserror::Error;

/// Errors that can occur while starting or running the emulator.
#[derive(Error, Debug)]
pub enum EmulatorError {
    /// Error starting the HTTP server.
    #[error("Failed to start server: {0}")]
    ServerStart(String),

    /// Error binding to the specified address.
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    /// Configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while resolving [`EmulatorConfig`](crate::EmulatorConfig).
///
/// These are fatal: the emulator refuses to start rather than guess a default.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The function timeout is not a whole number of seconds.
    #[error("invalid AWS_LAMBDA_FUNCTION_TIMEOUT value {value:?}")]
    InvalidTimeout {
        /// The raw value that failed to parse.
        value: String,
        /// Parse failure.
        #[source]
        source: std::num::ParseIntError,
    },

    /// The function timeout parsed but is too large to schedule.
    #[error("AWS_LAMBDA_FUNCTION_TIMEOUT value {value} exceeds the maximum of {max} seconds")]
    TimeoutOutOfRange {
        /// The parsed value in seconds.
        value: u64,
        /// Largest accepted value in seconds.
        max: u64,
    },

    /// Layered configuration failed to extract.
    #[error("configuration error")]
    Figment(#[source] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Figment(Box::new(err))
    }
}

/// Failures while turning an inbound HTTP request into an invocation payload.
///
/// Every variant is answered with a bare 500.
#[derive(Error, Debug)]
pub enum TranslateError {
    /// The inbound body could not be read to completion.
    #[error("failed to read invoke body")]
    BodyRead(#[source] axum::Error),

    /// The event envelope could not be serialised.
    #[error("failed to serialise event envelope")]
    Serialize(#[from] serde_json::Error),
}

/// Initialisation failure reported by a sandbox.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sandbox initialisation failed: {message}")]
pub struct InitError {
    /// Human-readable reason.
    pub message: String,
}

impl InitError {
    /// Creates an init error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors starting the local Runtime API.
#[derive(Error, Debug)]
pub enum RuntimeApiError {
    /// The Runtime API listener could not bind.
    #[error("Failed to bind runtime API to {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: std::net::SocketAddr,
        /// Bind failure.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for emulator operations.
pub type EmulatorResult<T> = Result<T, EmulatorError>;
