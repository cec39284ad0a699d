//! Error types for the database core.
//!
//! Every fallible operation in the crate returns [`DbResult`]. Variants map onto the
//! categories callers need to branch on: configuration problems surface when a connection
//! is added, transaction-state problems when a context is misused, and backend failures
//! carry a suggestion the operator can act on.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid connection configuration: {message}")]
    ConfigValidation { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Record not found in '{entity}'")]
    NotFound { entity: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    TransactionState {
        message: String,
        transaction_id: String,
    },

    #[error("Operation '{operation}' is not supported by the {provider} adapter")]
    UnsupportedOperation { operation: String, provider: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration validation error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create a configuration error for a missing provider setting.
    pub fn missing_setting(provider: impl std::fmt::Display, field: &str) -> Self {
        Self::config(format!(
            "{} connections require the '{}' setting",
            provider, field
        ))
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a not found error for an entity.
    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a transaction state error.
    pub fn transaction_state(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::TransactionState {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an unsupported operation error.
    pub fn unsupported(operation: impl Into<String>, provider: impl std::fmt::Display) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            provider: provider.to_string(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a connection not found error.
    pub fn connection_not_found(connection_id: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            connection_id: connection_id.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if the backend reported a missing table or collection.
    pub fn is_undefined_entity(&self) -> bool {
        match self {
            Self::Database {
                sql_state, message, ..
            } => {
                matches!(sql_state.as_deref(), Some("42P01") | Some("42S02") | Some("1146"))
                    || message.contains("no such table")
            }
            _ => false,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the entity name, column names and value types",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Re-add the connection")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::validation(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Convert MongoDB driver errors to DbError.
impl From<mongodb::error::Error> for DbError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        match err.kind.as_ref() {
            ErrorKind::ServerSelection { message, .. } => DbError::connection(
                format!("Server selection failed: {}", message),
                "Check that the MongoDB deployment is running and reachable",
            ),
            ErrorKind::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            ErrorKind::Authentication { message, .. } => DbError::connection(
                format!("Authentication failed: {}", message),
                "Verify the credentials in the connection URI",
            ),
            ErrorKind::InvalidArgument { message, .. } => DbError::validation(message.clone()),
            _ => DbError::database(
                err.to_string(),
                None,
                "Check the collection name and document shape",
            ),
        }
    }
}

impl From<mongodb::bson::ser::Error> for DbError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        DbError::validation(format!("Record cannot be stored as a document: {}", err))
    }
}

impl From<mongodb::bson::de::Error> for DbError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        DbError::internal(format!("Document decode error: {}", err))
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Turns an absent lookup result into a [`DbError::NotFound`].
///
/// Adapters return `None` for "no match"; callers that treat absence as a failure use this.
pub trait OptionExt<T> {
    fn or_not_found(self, entity: &str) -> DbResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn or_not_found(self, entity: &str) -> DbResult<T> {
        self.ok_or_else(|| DbError::not_found(entity))
    }
}
