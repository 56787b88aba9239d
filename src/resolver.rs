//! Query-time relevance: embed the question and look up the nearest table
//! schemas in the vector index.

use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::error::Result;
use crate::vector_index::{ScoredRecord, VectorIndex};

/// A table judged relevant to a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelevanceMatch {
    pub database: String,
    pub table: String,
    pub score: f32,
}

impl RelevanceMatch {
    pub fn new(database: &str, table: &str, score: f32) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
            score,
        }
    }

    fn from_record(record: ScoredRecord) -> Option<Self> {
        let metadata = record.metadata.as_ref()?;
        let database = metadata.get("db")?.as_str()?;
        let table = metadata.get("table")?.as_str()?;
        Some(Self::new(database, table, record.score))
    }
}

/// Top-`top_k` tables for `query`, best first, exactly as ranked by the
/// index. `top_k == 0` short-circuits without calling either service.
pub async fn resolve(
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    query: &str,
    top_k: usize,
    database: Option<&str>,
) -> Result<Vec<RelevanceMatch>> {
    if top_k == 0 {
        return Ok(Vec::new());
    }

    let vector = embedder.embed(query).await?;
    let records = index.query(&vector, top_k, database).await?;

    let mut matches = Vec::with_capacity(records.len());
    for record in records {
        let id = record.id.clone();
        match RelevanceMatch::from_record(record) {
            Some(m) => matches.push(m),
            None => warn!(id = %id, "Dropping index match without db/table metadata"),
        }
    }

    debug!(top_k, found = matches.len(), "Resolved relevant tables");
    Ok(matches)
}

// ============================================================================
// Tests
// ============================================================================
