//! # Error Types
//!
//! Structured error handling for the ingestion pipeline using thiserror.
//! Every error knows whether retrying the failed operation could succeed, which is
//! what the retry executor consults before scheduling another attempt.

use crate::resilience::RetryError;
use crate::validation::ValidationError;
use thiserror::Error;

/// SQLSTATE codes that indicate a transient condition worth re-running a
/// transaction for: serialization failure, deadlock, lock not available,
/// too many connections and the operator-intervention class.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "53300", "57P01", "57P02", "57P03"];

/// Pipeline error types
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("Database error: {operation}: {message}")]
    Database {
        operation: String,
        message: String,
        transient: bool,
    },

    #[error("Order not found: {order_uid}")]
    OrderNotFound { order_uid: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Message decode error: {message}")]
    Decode { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Broker error: {operation}: {message}")]
    Broker { operation: String, message: String },

    #[error("Dead-letter publish failed for topic {topic}: {message}")]
    DeadLetter { topic: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl IngestError {
    /// Create a database connection error
    pub fn database_connection(message: impl Into<String>) -> Self {
        Self::DatabaseConnection {
            message: message.into(),
        }
    }

    /// Create a non-transient database error for an operation
    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Classify a sqlx error raised while running `operation`
    pub fn from_sqlx(operation: impl Into<String>, err: sqlx::Error) -> Self {
        let operation = operation.into();
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::DatabaseConnection {
                message: format!("{operation}: {err}"),
            },
            sqlx::Error::Database(ref db_err) => {
                let transient = db_err
                    .code()
                    .map(|code| is_transient_sqlstate(&code))
                    .unwrap_or(false);
                Self::Database {
                    operation,
                    message: db_err.to_string(),
                    transient,
                }
            }
            other => Self::Database {
                operation,
                message: other.to_string(),
                transient: false,
            },
        }
    }

    /// Create an order-not-found error
    pub fn order_not_found(order_uid: impl Into<String>) -> Self {
        Self::OrderNotFound {
            order_uid: order_uid.into(),
        }
    }

    /// Create a message decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a broker error
    pub fn broker(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a dead-letter publish error
    pub fn dead_letter(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeadLetter {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a timeout error for an operation that exceeded its budget
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: after.as_millis() as u64,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether re-running the failed operation could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DatabaseConnection { .. } | Self::Broker { .. } | Self::Timeout { .. } => true,
            Self::Database { transient, .. } => *transient,
            Self::OrderNotFound { .. }
            | Self::Validation(_)
            | Self::Decode { .. }
            | Self::Serialization { .. }
            | Self::DeadLetter { .. }
            | Self::Configuration { .. }
            | Self::Cancelled { .. }
            | Self::Internal { .. } => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::OrderNotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    // Class 08 covers every connection exception
    code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&code)
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::from_sqlx("query", err)
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() || err.is_data() {
            IngestError::decode(err.to_string())
        } else {
            IngestError::serialization(err.to_string())
        }
    }
}

impl From<config::ConfigError> for IngestError {
    fn from(err: config::ConfigError) -> Self {
        IngestError::configuration(err.to_string())
    }
}

/// Collapse a retry outcome back into the operation's own error
impl From<RetryError<IngestError>> for IngestError {
    fn from(err: RetryError<IngestError>) -> Self {
        match err {
            RetryError::Cancelled { operation } => IngestError::cancelled(operation),
            RetryError::Aborted(inner) => inner,
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let db_err = IngestError::database_connection("Connection refused");
        assert!(matches!(db_err, IngestError::DatabaseConnection { .. }));

        let broker_err = IngestError::broker("fetch", "Broker unavailable");
        assert!(matches!(broker_err, IngestError::Broker { .. }));

        let not_found = IngestError::order_not_found("abc");
        assert!(not_found.is_not_found());
        assert!(IngestError::cancelled("fetch").is_cancelled());
    }

    #[test]
    fn test_retryability_classification() {
        assert!(IngestError::database_connection("reset").is_retryable());
        assert!(IngestError::broker("ack", "timeout").is_retryable());
        assert!(!IngestError::order_not_found("x").is_retryable());
        assert!(!IngestError::decode("bad json").is_retryable());
        assert!(!IngestError::database("save_item", "value too long").is_retryable());
        assert!(!IngestError::cancelled("save_order").is_retryable());
        assert!(IngestError::timeout("get_order", std::time::Duration::from_secs(5)).is_retryable());
    }

    #[test]
    fn test_sqlx_conversions() {
        let err = IngestError::from_sqlx("get_order", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, IngestError::DatabaseConnection { .. }));
        assert!(err.is_retryable());

        let err = IngestError::from_sqlx("get_order", sqlx::Error::RowNotFound);
        assert!(matches!(err, IngestError::Database { transient: false, .. }));
    }

    #[test]
    fn test_transient_sqlstates() {
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("08006"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("22001"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{\"not\":\"valid\"").unwrap_err();
        let err: IngestError = json_err.into();
        assert!(matches!(err, IngestError::Decode { .. }));
    }

    #[test]
    fn test_retry_error_conversion() {
        let exhausted: RetryError<IngestError> = RetryError::Exhausted {
            attempts: 5,
            last_error: IngestError::database_connection("reset by peer"),
        };
        let err: IngestError = exhausted.into();
        assert!(matches!(err, IngestError::DatabaseConnection { .. }));

        let cancelled: RetryError<IngestError> = RetryError::Cancelled {
            operation: "save_order".to_string(),
        };
        let err: IngestError = cancelled.into();
        assert!(matches!(err, IngestError::Cancelled { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = IngestError::database("save_order", "constraint violated");
        let display = format!("{err}");
        assert!(display.contains("save_order"));
        assert!(display.contains("constraint violated"));
    }
}
