//! Error types for the copy engine.

use thiserror::Error;

/// Main error type for copy operations.
#[derive(Error, Debug)]
pub enum PipeError {
    /// Configuration error (invalid YAML, missing fields, unsupported URL, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tokio_postgres::Error),

    /// Destination MySQL connection or query error
    #[error("Destination database error: {0}")]
    MySql(#[from] mysql_async::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Catalog access denied; carries the exact grants that would fix it
    #[error("Insufficient privilege: {message}\nPlease run as a superuser:\n{}", grants.join("\n"))]
    Privilege {
        message: String,
        grants: Vec<String>,
    },

    /// Table descriptor could not be built
    #[error("Table descriptor error for {table}: {message}")]
    Descriptor { table: String, message: String },

    /// A destination column cannot hold a bound value
    #[error("Capacity error: {message}\n  Hint: {hint}")]
    Capacity { message: String, hint: String },

    /// Reading or converting a single column value failed
    #[error("Bind error for column {column}: {message}")]
    Bind { column: String, message: String },

    /// A worker task failed or panicked
    #[error("Worker {worker} failed: {message}")]
    Worker { worker: usize, message: String },

    /// Row-identifier store failure (durable backend)
    #[error("Row-identifier store error: {0}")]
    RowIdStore(String),

    /// IO error (scratch files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PipeError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        PipeError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a worker error
    pub fn worker(worker: usize, message: impl Into<String>) -> Self {
        PipeError::Worker {
            worker,
            message: message.into(),
        }
    }

    /// Process exit code for this error class
    pub fn exit_code(&self) -> u8 {
        match self {
            PipeError::Config(_) | PipeError::Yaml(_) => 2,
            PipeError::Privilege { .. } => 3,
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

/// Result type alias for copy operations.
pub type Result<T> = std::result::Result<T, PipeError>;
