//! Error types for the migration engine.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, dependency cycle, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store could not be reached or rejected the connection.
    #[error("Connectivity error ({store}): {message}")]
    Connectivity { store: String, message: String },

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Redis driver error (coordination channel)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A record did not have the expected shape.
    #[error("Schema error in {collection}{}: {message}", record_suffix(.key))]
    Schema {
        collection: String,
        key: Option<i64>,
        message: String,
    },

    /// A bulk batch kept failing after all retry attempts.
    #[error("Batch {batch} of {collection} failed after {attempts} attempts: {message}")]
    Batch {
        collection: String,
        batch: usize,
        attempts: u32,
        message: String,
    },

    /// Validation found discrepancies between source and target.
    #[error("Validation failed: {0} discrepancies found")]
    ValidationFailed(usize),

    /// Replication lag is above the alert threshold.
    #[error("Replication lag for {collection} is {lag_ms}ms (threshold {threshold_ms}ms)")]
    SyncLagExceeded {
        collection: String,
        lag_ms: i64,
        threshold_ms: u64,
    },

    /// Final sync did not converge inside the read-only window.
    #[error("Final sync did not converge within {timeout_ms}ms (residual lag: {residual_lag})")]
    CutoverTimeout { timeout_ms: u64, residual_lag: u64 },

    /// Illegal phase transition requested.
    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, operator rollback, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Connectivity error
    pub fn connectivity(store: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Connectivity {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Create a Schema error
    pub fn schema(collection: impl Into<String>, key: Option<i64>, message: impl Into<String>) -> Self {
        MigrateError::Schema {
            collection: collection.into(),
            key,
            message: message.into(),
        }
    }

    /// Whether a retry might succeed. Shape and configuration problems never heal.
    pub fn is_retryable(&self) -> bool {
        match self {
            // server-reported errors only when the connection or transaction broke
            MigrateError::Postgres(e) => e
                .as_db_error()
                .map_or(true, |db| retryable_sqlstate(db.code().code())),
            MigrateError::Connectivity { .. }
            | MigrateError::Redis(_)
            | MigrateError::Pool { .. }
            | MigrateError::Io(_) => true,
            _ => false,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Connection exceptions (08) and serialization failures or deadlocks (40).
fn retryable_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("40")
}

fn record_suffix(key: &Option<i64>) -> String {
    key.map(|k| format!(" (record {})", k)).unwrap_or_default()
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
