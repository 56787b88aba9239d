//! qcommerce-router: natural language questions over several quick-commerce
//! Postgres databases.
//!
//! Table schemas are embedded into a vector index; at query time the most
//! relevant tables are resolved, one table-scoped SQL agent per database
//! answers concurrently, and the answers are optionally summarized. Shared
//! library for the MCP server and the `qcr` CLI.

pub mod agent;
pub mod cache;
pub mod config;
pub mod context;
pub mod database;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod llm;
pub mod pipeline;
pub mod resolver;
pub mod retry;
pub mod router;
pub mod schema;
pub mod server;
pub mod summarizer;
pub mod vector_index;

pub use context::AppContext;
pub use error::{Result, RouterError};
