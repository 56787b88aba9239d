//! Schema ingestion: embed every table's schema text and upsert it into the
//! vector index keyed by `"<db>:<table>"`.
//!
//! Ingestion is idempotent. Failures are collected per table in an
//! [`IndexReport`] and never abort the rest of the batch.

use serde::Serialize;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::database::SqlExecutor;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::schema::{self, TableSchema};
use crate::vector_index::{IndexRecord, VectorIndex};

/// Records per upsert request.
pub const UPSERT_BATCH: usize = 100;

/// Table name used in [`IndexReport::failures`] when the whole database
/// could not be extracted.
pub const WHOLE_DATABASE: &str = "*";

/// Outcome of ingesting one database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexReport {
    pub database: String,
    pub indexed: usize,
    /// `(table, message)` for every table that was not indexed.
    pub failures: Vec<(String, String)>,
}

impl IndexReport {
    fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            indexed: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Embed each schema and upsert the vectors in batches of [`UPSERT_BATCH`].
pub async fn embed_and_index(
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    database: &str,
    schemas: &[TableSchema],
) -> IndexReport {
    let mut report = IndexReport::new(database);
    let mut records = Vec::with_capacity(schemas.len());

    for schema in schemas {
        match embedder.embed(&schema.embedding_text()).await {
            Ok(values) => records.push(IndexRecord::new(database, &schema.table_name, values)),
            Err(e) => {
                warn!(db = database, table = %schema.table_name, "Embedding failed: {e}");
                report.failures.push((schema.table_name.clone(), e.to_string()));
            }
        }
    }

    for batch in records.chunks(UPSERT_BATCH) {
        match index.upsert(batch).await {
            Ok(()) => report.indexed += batch.len(),
            Err(e) => {
                warn!(db = database, records = batch.len(), "Upsert failed: {e}");
                let message = e.to_string();
                report.failures.extend(
                    batch
                        .iter()
                        .map(|r| (r.metadata.table.clone(), message.clone())),
                );
            }
        }
    }

    info!(
        db = database,
        indexed = report.indexed,
        failed = report.failures.len(),
        "Indexed schemas"
    );
    report
}

/// Extract and index one database. An extraction failure becomes a single
/// [`WHOLE_DATABASE`] failure entry.
pub async fn index_database(
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    database: &str,
    executor: &dyn SqlExecutor,
) -> IndexReport {
    match schema::extract(executor).await {
        Ok(schemas) => embed_and_index(embedder, index, database, &schemas).await,
        Err(e) => {
            warn!(db = database, "Schema extraction failed: {e}");
            let mut report = IndexReport::new(database);
            report.failures.push((WHOLE_DATABASE.to_string(), e.to_string()));
            report
        }
    }
}

/// Index every configured database, or only `database` when given.
///
/// Fails only when `database` names an unconfigured id.
pub async fn index_all(ctx: &AppContext, database: Option<&str>) -> Result<Vec<IndexReport>> {
    let ids = match database {
        Some(id) => {
            ctx.databases.get(id)?;
            vec![id.to_string()]
        }
        None => ctx.databases.ids(),
    };

    let mut reports = Vec::with_capacity(ids.len());
    for id in ids {
        let executor = ctx.databases.get(&id)?;
        info!(db = %id, "Indexing database");
        reports.push(
            index_database(ctx.embedder.as_ref(), ctx.index.as_ref(), &id, executor.as_ref()).await,
        );
    }
    Ok(reports)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::test_context;
    use crate::database::FakeExecutor;
    use crate::embedding::MockEmbedder;
    use crate::error::RouterError;
    use crate::llm::MockLlmClient;
    use crate::schema::ColumnDef;
    use crate::vector_index::{MemoryIndex, ScoredRecord};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table(name: &str, cols: &[(&str, &str)]) -> TableSchema {
        TableSchema {
            table_name: name.into(),
            columns: cols.iter().map(|(n, t)| ColumnDef::new(*n, *t)).collect(),
        }
    }

    fn grocery_tables() -> Vec<TableSchema> {
        vec![
            table("price", &[("product_id", "integer"), ("mrp", "numeric")]),
            table("product", &[("id", "integer"), ("name", "text")]),
        ]
    }

    /// Fails for any text mentioning `needle`.
    struct PickyEmbedder {
        inner: MockEmbedder,
        needle: &'static str,
    }

    #[async_trait]
    impl Embedder for PickyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains(self.needle) {
                return Err(RouterError::Embedding("quota exceeded".into()));
            }
            self.inner.embed(text).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    /// Index that counts upsert calls and can reject them.
    #[derive(Default)]
    struct CountingIndex {
        upserts: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl VectorIndex for CountingIndex {
        async fn upsert(&self, _records: &[IndexRecord]) -> Result<()> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(RouterError::IndexWrite("403 forbidden".into()));
            }
            Ok(())
        }

        async fn query(&self, _: &[f32], _: usize, _: Option<&str>) -> Result<Vec<ScoredRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_embed_and_index_keys_and_metadata() {
        let index = MemoryIndex::new();
        let report = embed_and_index(&MockEmbedder::new(16), &index, "blinkit_db", &grocery_tables()).await;

        assert_eq!(report.indexed, 2);
        assert!(report.is_complete());

        let records = index.snapshot().await;
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["blinkit_db:price", "blinkit_db:product"]);
        assert_eq!(records[0].metadata.db, "blinkit_db");
        assert_eq!(records[0].metadata.table, "price");
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent() {
        let index = MemoryIndex::new();
        let embedder = MockEmbedder::new(16);

        embed_and_index(&embedder, &index, "zepto_db", &grocery_tables()).await;
        let first = index.snapshot().await;
        embed_and_index(&embedder, &index, "zepto_db", &grocery_tables()).await;
        let second = index.snapshot().await;

        assert_eq!(first.len(), 2);
        assert_eq!(
            first.iter().map(|r| (&r.id, &r.values)).collect::<Vec<_>>(),
            second.iter().map(|r| (&r.id, &r.values)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_embedding_failure_is_per_table() {
        let index = MemoryIndex::new();
        let embedder = PickyEmbedder {
            inner: MockEmbedder::new(16),
            needle: "Table: price",
        };

        let report = embed_and_index(&embedder, &index, "blinkit_db", &grocery_tables()).await;

        assert_eq!(report.indexed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "price");
        assert!(report.failures[0].1.contains("quota exceeded"));
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_upsert_failure_reported_for_batch() {
        let index = CountingIndex {
            reject: true,
            ..Default::default()
        };
        let report = embed_and_index(&MockEmbedder::new(16), &index, "blinkit_db", &grocery_tables()).await;

        assert_eq!(report.indexed, 0);
        let tables: Vec<&str> = report.failures.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(tables, vec!["price", "product"]);
        assert!(report.failures[0].1.contains("Index write error"));
    }

    #[tokio::test]
    async fn test_upserts_are_batched() {
        let index = CountingIndex::default();
        let schemas: Vec<TableSchema> = (0..UPSERT_BATCH + 1)
            .map(|i| table(&format!("t{i:03}"), &[("id", "integer")]))
            .collect();

        let report = embed_and_index(&MockEmbedder::new(8), &index, "bigbasket_db", &schemas).await;

        assert_eq!(report.indexed, UPSERT_BATCH + 1);
        assert_eq!(index.upserts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_index_all_continues_past_unreachable_database() {
        let blinkit: Arc<dyn SqlExecutor> = Arc::new(
            FakeExecutor::new().with_table("price", &[("product_id", "integer"), ("mrp", "numeric")]),
        );
        let zepto: Arc<dyn SqlExecutor> = Arc::new(FakeExecutor::unreachable());
        let (ctx, index) = test_context(
            vec![("blinkit_db", blinkit), ("zepto_db", zepto)],
            Arc::new(MockLlmClient::new(vec![])),
        );

        let reports = index_all(&ctx, None).await.unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].database, "blinkit_db");
        assert_eq!(reports[0].indexed, 1);
        assert_eq!(reports[1].database, "zepto_db");
        assert_eq!(reports[1].failures[0].0, WHOLE_DATABASE);
        assert!(reports[1].failures[0].1.starts_with("Connection error"));
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_index_all_single_database() {
        let blinkit: Arc<dyn SqlExecutor> =
            Arc::new(FakeExecutor::new().with_table("product", &[("id", "integer")]));
        let (ctx, _index) = test_context(
            vec![("blinkit_db", blinkit)],
            Arc::new(MockLlmClient::new(vec![])),
        );

        let reports = index_all(&ctx, Some("blinkit_db")).await.unwrap();
        assert_eq!(reports.len(), 1);

        let err = index_all(&ctx, Some("dunzo_db")).await.unwrap_err();
        assert!(matches!(err, RouterError::UnknownDatabase(_)));
    }
}
