//! WolfBalance Error Types

use thiserror::Error;

/// Result type alias for WolfBalance operations
pub type Result<T> = std::result::Result<T, Error>;

/// MySQL/MariaDB error numbers that mean the connection itself is unusable
const CONNECTION_ERROR_NUMBERS: &[u16] = &[
    1040, // ER_CON_COUNT_ERROR
    1045, // ER_ACCESS_DENIED_ERROR
    1053, // ER_SERVER_SHUTDOWN
    1927, // ER_CONNECTION_KILLED
    2002, // CR_CONNECTION_ERROR
    2003, // CR_CONN_HOST_ERROR
    2006, // CR_SERVER_GONE_ERROR
    2013, // CR_SERVER_LOST
];

/// SQLSTATE for serialization failures (deadlocks, replay conflicts)
const SERIALIZATION_FAILURE_STATE: &str = "40001";

/// WolfBalance error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Query conflicts with replication: {0}")]
    SerializationConflict(String),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Failed to determine the write location of the primary database")]
    NoWriteLocation,

    #[error("A write query is performed inside a read-only transaction")]
    WriteInsideReadOnlyTransaction,

    // Sticking store errors
    #[error("Sticking store error: {0}")]
    StoreBackend(#[from] rusqlite::Error),

    // Discovery errors
    #[error("DNS error: {0}")]
    Dns(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means the connection to a host is broken.
    ///
    /// Against the primary these are retried with backoff, against a replica
    /// they take the host offline.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) => true,
            Error::Database(e) => sqlx_connection_error(e),
            _ => false,
        }
    }

    /// Check if this error is a serialization failure, e.g. a replica
    /// cancelling a query that conflicts with replication replay
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            Error::SerializationConflict(_) => true,
            Error::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some(SERIALIZATION_FAILURE_STATE)
            }
            _ => false,
        }
    }
}

fn sqlx_connection_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
            .map(|e| CONNECTION_ERROR_NUMBERS.contains(&e.number()))
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors() {
        let failed = Error::ConnectionFailed {
            address: "db-1:3306".to_string(),
            reason: "refused".to_string(),
        };
        assert!(failed.is_connection_error());
        assert!(!failed.is_serialization_failure());

        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_connection_error());
        assert!(Error::Database(sqlx::Error::PoolClosed).is_connection_error());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(Error::Database(sqlx::Error::Io(io)).is_connection_error());
    }

    #[test]
    fn test_serialization_failures() {
        let conflict = Error::SerializationConflict("canceled by replay".to_string());
        assert!(conflict.is_serialization_failure());
        assert!(!conflict.is_connection_error());
    }

    #[test]
    fn test_application_errors_are_neither() {
        let errors = [
            Error::QueryExecution("syntax error".to_string()),
            Error::Database(sqlx::Error::RowNotFound),
            Error::NoWriteLocation,
            Error::WriteInsideReadOnlyTransaction,
        ];

        for error in errors {
            assert!(!error.is_connection_error(), "{}", error);
            assert!(!error.is_serialization_failure(), "{}", error);
        }
    }
}
