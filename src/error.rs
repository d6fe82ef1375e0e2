use thiserror::Error;

/// Main error type for kgrag
#[derive(Error, Debug)]
pub enum KgragError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// LLM invocation errors (transport, HTTP status, empty response)
    #[error("LLM error: {0}")]
    Llm(String),

    /// LLM invocation exceeded its deadline
    #[error("LLM call timed out after {0} seconds")]
    Timeout(u64),

    /// Parse errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Another build is already running for the same knowledge base and document
    #[error("Build already in flight for kb {kb_id}, document {document_id}")]
    TaskInFlight { kb_id: String, document_id: String },

    /// Build task status change that would break the pending -> running -> terminal order
    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },
}

/// Convenient Result type using KgragError
pub type Result<T> = std::result::Result<T, KgragError>;
