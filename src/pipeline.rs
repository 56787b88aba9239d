//! End-to-end request flow shared by the CLI and the MCP server:
//! resolve relevant tables, route to per-database agents, optionally summarize.

use serde::Serialize;
use tracing::info;

use crate::context::AppContext;
use crate::error::Result;
use crate::resolver::{self, RelevanceMatch};
use crate::router::{DatabaseResult, Router};
use crate::schema::{self, TableSchema};
use crate::summarizer;

#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Overrides the configured `top_k`.
    pub top_k: Option<usize>,
    pub summarize: bool,
    /// Restrict resolution to one database.
    pub database: Option<String>,
}

/// Everything a surface needs to render one answered query.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub query: String,
    pub matches: Vec<RelevanceMatch>,
    pub results: Vec<DatabaseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Answer {
    /// Human-readable rendering shared by the CLI and the tool server.
    pub fn render(&self) -> String {
        if self.matches.is_empty() {
            return "No relevant tables found.".to_string();
        }

        let mut out = String::from("Relevant tables:\n");
        for m in &self.matches {
            out.push_str(&format!("  - {}.{} (score: {:.3})\n", m.database, m.table, m.score));
        }
        out.push_str("\nResults:\n");
        for r in &self.results {
            out.push_str(&format!("  {}: {}\n", r.database, r.output));
        }
        if let Some(summary) = &self.summary {
            out.push_str(&format!("\nSummary:\n{summary}\n"));
        }
        out
    }
}

/// Resolve the tables relevant to `query`. An unknown `database` filter is
/// rejected before any service is called.
pub async fn resolve_tables(
    ctx: &AppContext,
    query: &str,
    top_k: Option<usize>,
    database: Option<&str>,
) -> Result<Vec<RelevanceMatch>> {
    if let Some(db) = database {
        ctx.databases.get(db)?;
    }
    let top_k = top_k.unwrap_or(ctx.config.router.top_k);
    resolver::resolve(ctx.embedder.as_ref(), ctx.index.as_ref(), query, top_k, database).await
}

/// Answer `query` across every database with relevant tables.
///
/// Resolver failures fail the request; per-database failures are reported in
/// [`Answer::results`]; summarizer failures degrade to the raw results.
pub async fn ask(ctx: &AppContext, query: &str, options: &AskOptions) -> Result<Answer> {
    let matches = resolve_tables(ctx, query, options.top_k, options.database.as_deref()).await?;
    info!(matches = matches.len(), "Resolved query");

    let router = Router::new(ctx.agents.clone(), &ctx.config.router);
    let results = router.route(query, &matches).await;

    let summary = if options.summarize {
        Some(summarizer::summarize(ctx.llm.as_ref(), query, &results).await)
    } else {
        None
    };

    Ok(Answer {
        query: query.to_string(),
        matches,
        results,
        summary,
    })
}

/// Extract the live schema of one configured database.
pub async fn describe_schema(ctx: &AppContext, database: &str) -> Result<Vec<TableSchema>> {
    let executor = ctx.databases.get(database)?;
    schema::extract(executor.as_ref()).await
}

// ============================================================================
// Tests
// ============================================================================
