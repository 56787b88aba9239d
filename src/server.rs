use std::sync::Arc;

use rmcp::handler::server::{router::tool::ToolRouter, wrapper::Parameters};
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::{ErrorData, ServerHandler, tool, tool_handler, tool_router};
use serde::Deserialize;
use tracing::warn;

use crate::context::AppContext;
use crate::error::RouterError;
use crate::indexer::index_all;
use crate::pipeline::{self, AskOptions};

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, rmcp::schemars::JsonSchema)]
pub struct AskParams {
    #[schemars(description = "Natural language question, e.g. 'cheapest milk across platforms'")]
    pub query: String,
    #[schemars(description = "Number of relevant tables to retrieve (default: 5)")]
    pub top_k: Option<usize>,
    #[schemars(description = "Restrict the search to one database id, e.g. 'blinkit_db'")]
    pub database: Option<String>,
    #[schemars(description = "Add a short cross-platform summary (default: true)")]
    pub summarize: Option<bool>,
}

#[derive(Debug, Deserialize, rmcp::schemars::JsonSchema)]
pub struct ResolveParams {
    #[schemars(description = "Natural language question to find relevant tables for")]
    pub query: String,
    #[schemars(description = "Maximum number of tables (default: 5)")]
    pub top_k: Option<usize>,
    #[schemars(description = "Restrict the search to one database id")]
    pub database: Option<String>,
}

#[derive(Debug, Deserialize, rmcp::schemars::JsonSchema)]
pub struct IndexParams {
    #[schemars(description = "Database id to index. If omitted, every configured database is indexed.")]
    pub database: Option<String>,
}

#[derive(Debug, Deserialize, rmcp::schemars::JsonSchema)]
pub struct DescribeParams {
    #[schemars(description = "Database id whose tables and columns to list, e.g. 'zepto_db'")]
    pub database: String,
}

/// Caller mistakes become invalid-params; everything else is internal.
fn tool_err(err: RouterError) -> ErrorData {
    match err {
        RouterError::UnknownDatabase(_) | RouterError::Config(_) => {
            ErrorData::invalid_params(err.to_string(), None)
        }
        other => ErrorData::internal_error(other.to_string(), None),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ErrorData> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ErrorData::internal_error(format!("JSON serialization error: {e}"), None))
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RouterServer {
    ctx: Arc<AppContext>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl RouterServer {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Answer a natural language question across the quick-commerce databases. Relevant tables are found by semantic search, each database with matches is queried by a SQL agent, and the answers are optionally summarized."
    )]
    async fn ask(&self, Parameters(p): Parameters<AskParams>) -> Result<CallToolResult, ErrorData> {
        if p.query.trim().is_empty() {
            return Err(ErrorData::invalid_params("'query' must not be empty.", None));
        }

        let options = AskOptions {
            top_k: p.top_k,
            summarize: p.summarize.unwrap_or(true),
            database: p.database,
        };
        let answer = pipeline::ask(&self.ctx, &p.query, &options)
            .await
            .map_err(tool_err)?;

        Ok(CallToolResult::success(vec![Content::text(answer.render())]))
    }

    #[tool(description = "List the tables most relevant to a question, with database id and similarity score.")]
    async fn resolve_tables(
        &self,
        Parameters(p): Parameters<ResolveParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let matches =
            pipeline::resolve_tables(&self.ctx, &p.query, p.top_k, p.database.as_deref())
                .await
                .map_err(tool_err)?;

        if matches.is_empty() {
            return Ok(CallToolResult::success(vec![Content::text(
                "No relevant tables found. Run 'index_schemas' first if the index is empty.",
            )]));
        }

        Ok(CallToolResult::success(vec![Content::text(to_json(&matches)?)]))
    }

    #[tool(
        description = "Extract table schemas from the configured databases and (re)index them for semantic search. Safe to run repeatedly."
    )]
    async fn index_schemas(
        &self,
        Parameters(p): Parameters<IndexParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let reports = index_all(&self.ctx, p.database.as_deref())
            .await
            .map_err(tool_err)?;

        for report in reports.iter().filter(|r| !r.is_complete()) {
            warn!(
                db = %report.database,
                failures = report.failures.len(),
                "Indexing finished with failures"
            );
        }

        Ok(CallToolResult::success(vec![Content::text(to_json(&reports)?)]))
    }

    #[tool(description = "Show the live tables and columns of one database.")]
    async fn describe_schema(
        &self,
        Parameters(p): Parameters<DescribeParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let schemas = pipeline::describe_schema(&self.ctx, &p.database)
            .await
            .map_err(tool_err)?;

        if schemas.is_empty() {
            return Ok(CallToolResult::success(vec![Content::text(format!(
                "No tables found in '{}'.",
                p.database
            ))]));
        }

        let text = schemas
            .iter()
            .map(|s| s.ddl())
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[tool_handler]
impl ServerHandler for RouterServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Natural language access to several quick-commerce Postgres databases. \
                 Use 'ask' to answer a question across platforms, 'resolve_tables' to see which \
                 tables are relevant, 'index_schemas' to (re)build the schema index, and \
                 'describe_schema' to inspect one database."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
