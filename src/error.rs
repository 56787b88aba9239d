//! Error types for the qcommerce-router crate.

use thiserror::Error;

use crate::llm::LlmError;

/// Errors returned by router components.
///
/// Per-database agent failures are folded into result entries by the router;
/// everything else propagates to the caller.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Missing or malformed configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A database or external service could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The database catalog could not be enumerated.
    #[error("Introspection error: {0}")]
    Introspection(String),

    /// The embedding service failed or returned an unusable vector.
    #[error("Embedding service error: {0}")]
    Embedding(String),

    /// Querying the vector index failed.
    #[error("Index query error: {0}")]
    IndexQuery(String),

    /// A statement was rejected by the read-only guard or failed to run.
    #[error("SQL error: {0}")]
    Sql(String),

    /// Upserting into the vector index failed.
    #[error("Index write error: {0}")]
    IndexWrite(String),

    /// The database id is not in the connection table.
    #[error("Unknown database: {0}")]
    UnknownDatabase(String),

    /// The SQL agent loop failed or gave up.
    #[error("Agent execution error: {0}")]
    AgentExecution(String),

    /// A call or the whole routing pass ran past its deadline.
    #[error("timeout")]
    Timeout,

    /// Error from the chat-completion client.
    #[error(transparent)]
    Llm(#[from] LlmError),
}

pub type Result<T> = std::result::Result<T, RouterError>;
