//! Vector index abstraction: Pinecone data plane or an in-process index.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::error::{Result, RouterError};
use crate::retry::{RetryPolicy, send_with_retry};

/// Metadata attached to every schema vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub db: String,
    pub table: String,
}

/// One embedded schema record, keyed by `"<db>:<table>"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: IndexMetadata,
}

impl IndexRecord {
    pub fn new(db: &str, table: &str, values: Vec<f32>) -> Self {
        Self {
            id: record_id(db, table),
            values,
            metadata: IndexMetadata {
                db: db.to_string(),
                table: table.to_string(),
            },
        }
    }
}

/// Stable record id for a table.
pub fn record_id(db: &str, table: &str) -> String {
    format!("{db}:{table}")
}

/// A query hit as returned by the index. Metadata is left raw because the
/// index may hold records written by other tools.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredRecord {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by id.
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()>;

    /// Nearest neighbours of `vector`, best first. `database` restricts hits
    /// to records whose `db` metadata equals it.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        database: Option<&str>,
    ) -> Result<Vec<ScoredRecord>>;
}

// ============================================================================
// Pinecone
// ============================================================================

/// Pinecone serverless index client (data-plane REST API).
pub struct PineconeIndex {
    api_key: String,
    host: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PineconeQueryResponse {
    #[serde(default)]
    matches: Vec<ScoredRecord>,
}

impl PineconeIndex {
    /// `host` is the index host shown in the Pinecone console, with or
    /// without scheme.
    pub fn new(api_key: String, host: &str) -> Self {
        let host = host.trim_end_matches('/');
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        Self {
            api_key,
            host,
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
        }
    }

    fn query_body(vector: &[f32], top_k: usize, database: Option<&str>) -> Value {
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
        });
        if let Some(db) = database {
            body["filter"] = json!({ "db": { "$eq": db } });
        }
        body
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let url = format!("{}/vectors/upsert", self.host);
        let body = json!({ "vectors": records });

        send_with_retry(&self.retry, "pinecone upsert", || {
            self.client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .json(&body)
        })
        .await
        .map_err(|e| RouterError::IndexWrite(e.to_string()))?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        database: Option<&str>,
    ) -> Result<Vec<ScoredRecord>> {
        let url = format!("{}/query", self.host);
        let body = Self::query_body(vector, top_k, database);

        let response = send_with_retry(&self.retry, "pinecone query", || {
            self.client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .json(&body)
        })
        .await
        .map_err(|e| RouterError::IndexQuery(e.to_string()))?;

        let parsed: PineconeQueryResponse = response
            .json()
            .await
            .map_err(|e| RouterError::IndexQuery(format!("Failed to parse query response: {e}")))?;
        Ok(parsed.matches)
    }
}

// ============================================================================
// In-process index
// ============================================================================

/// Cosine-similarity index held in memory. Records live as long as the
/// process; ties are broken by id so results are stable.
#[derive(Default)]
pub struct MemoryIndex {
    records: RwLock<BTreeMap<String, (Vec<f32>, IndexMetadata)>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored records in id order.
    pub async fn snapshot(&self) -> Vec<IndexRecord> {
        self.records
            .read()
            .await
            .iter()
            .map(|(id, (values, metadata))| IndexRecord {
                id: id.clone(),
                values: values.clone(),
                metadata: metadata.clone(),
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        let mut guard = self.records.write().await;
        for record in records {
            guard.insert(
                record.id.clone(),
                (record.values.clone(), record.metadata.clone()),
            );
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        database: Option<&str>,
    ) -> Result<Vec<ScoredRecord>> {
        let guard = self.records.read().await;
        let mut hits: Vec<ScoredRecord> = Vec::new();
        for (id, (values, metadata)) in guard.iter() {
            if database.is_some_and(|db| db != metadata.db) {
                continue;
            }
            if values.len() != vector.len() {
                return Err(RouterError::IndexQuery(format!(
                    "dimension mismatch for '{id}': index has {}, query has {}",
                    values.len(),
                    vector.len()
                )));
            }
            hits.push(ScoredRecord {
                id: id.clone(),
                score: cosine(vector, values),
                metadata: Some(json!({ "db": metadata.db, "table": metadata.table })),
            });
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}
