//! Error types and result handling for catalog-sync.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use catalog_sync::{Error, Result};
//!
//! fn acquire_channel() -> Result<()> {
//!     Err(Error::BrokerUnavailable {
//!         attempts: 5,
//!         message: "connection refused".to_string(),
//!     })
//! }
//!
//! match acquire_channel() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::BrokerUnavailable { attempts, .. }) => {
//!         eprintln!("Broker unavailable after {} attempts", attempts)
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for catalog-sync operations.
///
/// None of these ever reach an interactive caller: the publisher logs and
/// absorbs them, the consumer loop logs them and keeps going.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from a bad file, environment or value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// AMQP client or protocol error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// JSON serialization error when encoding events or snapshots.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from replica snapshot file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No usable broker channel after the retry budget was spent.
    #[error("Broker unavailable after {attempts} attempts: {message}")]
    BrokerUnavailable {
        /// Number of connection attempts made
        attempts: usize,
        /// Last underlying failure
        message: String,
    },

    /// The exchange exists on the broker with different properties.
    ///
    /// Redeclaring never fixes this, so the reconnect loop gives up.
    #[error("Exchange '{exchange}' exists with mismatched properties: {message}")]
    ExchangeMismatch {
        /// Exchange name
        exchange: String,
        /// Broker response
        message: String,
    },

    /// Transport-level failure on an established channel.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Message body could not be decoded into an event.
    #[error("Malformed event: {message}")]
    MalformedEvent {
        /// Description of what was invalid
        message: String,
    },

    /// The replica could not be mutated.
    #[error("Failed to apply event: {message}")]
    ApplyFailure {
        /// Description of the storage fault
        message: String,
    },

    /// Inventory input rejected before commit.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No inventory item with this id.
    #[error("Book {0} not found")]
    NotFound(i64),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// A background task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly unwind a retry loop.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Errors that reconnecting cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ExchangeMismatch { .. })
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedEvent {
            message: message.into(),
        }
    }

    pub(crate) fn apply_failure(message: impl Into<String>) -> Self {
        Error::ApplyFailure {
            message: message.into(),
        }
    }
}

/// A convenient Result type alias for catalog-sync operations.
///
/// This is equivalent to `std::result::Result<T, catalog_sync::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
