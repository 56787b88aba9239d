//! Table-scoped SQL agents and the factory that builds and caches them.
//!
//! A [`SqlAgent`] is a bounded tool-calling loop over the chat model. Each
//! turn the model replies with one JSON action:
//!
//! - `list_tables`: names of the tables in scope
//! - `describe_tables`: DDL plus sample rows for some of those tables
//! - `run_query`: execute one read-only statement
//! - `final_answer`: stop and return the answer text
//!
//! All database access goes through a [`ScopedDatabase`], so the model never
//! sees schema for tables outside its scope.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::LruCache;
use crate::database::{DatabaseRegistry, ScopedDatabase};
use crate::error::{Result, RouterError};
use crate::llm::{LlmClient, strip_markdown_fences};

/// Longest observation fed back to the model, in characters.
const MAX_OBSERVATION_CHARS: usize = 4000;

// ============================================================================
// Traits
// ============================================================================

/// Something that can answer a question about one database.
#[async_trait]
pub trait QueryAgent: Send + Sync {
    async fn run(&self, question: &str) -> Result<String>;
}

/// Source of per-database agents for the router.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn agent_for(&self, database: &str, tables: &[String]) -> Result<Arc<dyn QueryAgent>>;
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum AgentAction {
    ListTables,
    DescribeTables(Vec<String>),
    RunQuery(String),
    FinalAnswer(String),
}

#[derive(Debug, Deserialize)]
struct RawAction {
    action: String,
    #[serde(default)]
    input: Value,
}

/// Parse a model reply into an action. Tolerates code fences and prose
/// around the JSON object.
fn parse_action(text: &str) -> std::result::Result<AgentAction, String> {
    let cleaned = strip_markdown_fences(text);
    let json = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => return Err("no JSON object found".to_string()),
    };
    let raw: RawAction = serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;

    match raw.action.trim().to_lowercase().as_str() {
        "list_tables" => Ok(AgentAction::ListTables),
        "describe_tables" => Ok(AgentAction::DescribeTables(table_list(&raw.input))),
        "run_query" => match raw.input {
            Value::String(sql) if !sql.trim().is_empty() => Ok(AgentAction::RunQuery(sql)),
            _ => Err("run_query needs a SQL string as input".to_string()),
        },
        "final_answer" => Ok(AgentAction::FinalAnswer(match raw.input {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })),
        other => Err(format!("unknown action '{other}'")),
    }
}

/// Accept `["a", "b"]` or `"a, b"`.
fn table_list(input: &Value) -> Vec<String> {
    match input {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn truncate_observation(mut text: String) -> String {
    if text.chars().count() > MAX_OBSERVATION_CHARS {
        text = text.chars().take(MAX_OBSERVATION_CHARS).collect();
        text.push_str("\n... (truncated)");
    }
    text
}

// ============================================================================
// SqlAgent
// ============================================================================

const AGENT_PROMPT_HEADER: &str = r#"You are an agent designed to answer questions about a PostgreSQL database by running SQL queries.
Only query the tables listed below. Never modify data: only SELECT statements are permitted.
Unless the user asks for more, limit queries to at most 10 rows and select only the relevant columns.
If a query fails, read the error, fix the query and try again.
If the question cannot be answered from these tables, say so in the final answer.

Reply with ONLY one JSON object per turn (no markdown, no explanation):
{"action": "<action>", "input": <input>}

Actions:
- "list_tables": input null. Returns the tables you may use.
- "describe_tables": input is a list of table names. Returns their schema and sample rows.
- "run_query": input is one SQL SELECT statement as a string. Returns the rows.
- "final_answer": input is your answer to the question as a string."#;

/// An agent bound to one database and a fixed table set.
pub struct SqlAgent {
    scope: ScopedDatabase,
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    max_steps: usize,
}

impl SqlAgent {
    /// Assemble the agent. Loads the column lists of every scoped table, so
    /// this fails with `Connection` when the database is unreachable.
    pub async fn build(
        scope: ScopedDatabase,
        llm: Arc<dyn LlmClient>,
        max_steps: usize,
    ) -> Result<Self> {
        let schemas = scope.schemas(&[]).await?;
        let mut tables = String::new();
        for schema in &schemas {
            let cols: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
            tables.push_str(&format!("- {} ({})\n", schema.table_name, cols.join(", ")));
        }

        let system_prompt = format!(
            "{AGENT_PROMPT_HEADER}\n\nDatabase: {}\nTables:\n{tables}",
            scope.database()
        );

        Ok(Self {
            scope,
            llm,
            system_prompt,
            max_steps: max_steps.max(1),
        })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    async fn observe(&self, action: &AgentAction) -> Result<String> {
        let observation = match action {
            AgentAction::ListTables => self.scope.allowed_tables().join(", "),
            AgentAction::DescribeTables(tables) => match self.scope.table_info(tables).await {
                Ok(info) => info,
                Err(e @ RouterError::Connection(_)) => return Err(e),
                Err(e) => format!("Error: {e}"),
            },
            AgentAction::RunQuery(sql) => match self.scope.run_query(sql).await {
                Ok(rows) => rows,
                Err(e @ RouterError::Connection(_)) => return Err(e),
                Err(e) => format!("Error: {e}"),
            },
            AgentAction::FinalAnswer(answer) => answer.clone(),
        };
        Ok(truncate_observation(observation))
    }
}

#[async_trait]
impl QueryAgent for SqlAgent {
    async fn run(&self, question: &str) -> Result<String> {
        let mut transcript = format!("Question: {question}\n");

        for step in 0..self.max_steps {
            let completion = self.llm.complete(&self.system_prompt, &transcript).await?;
            let reply = completion.text.trim();

            let action = match parse_action(reply) {
                Ok(action) => action,
                Err(msg) => {
                    debug!(db = self.scope.database(), step, "unparsable agent reply: {msg}");
                    transcript.push_str(&format!(
                        "\nAssistant: {reply}\nObservation: Could not parse your reply ({msg}). \
                         Reply with exactly one JSON object as described.\n"
                    ));
                    continue;
                }
            };

            if let AgentAction::FinalAnswer(answer) = action {
                return Ok(answer);
            }

            debug!(db = self.scope.database(), step, ?action, "agent action");
            let observation = self.observe(&action).await?;
            transcript.push_str(&format!("\nAssistant: {reply}\nObservation: {observation}\n"));
        }

        Err(RouterError::AgentExecution(format!(
            "agent stopped after {} steps without a final answer",
            self.max_steps
        )))
    }
}

// ============================================================================
// AgentFactory
// ============================================================================

type AgentKey = (String, Vec<String>);

/// Cache key: database id plus the sorted, deduplicated table names.
fn agent_key(database: &str, tables: &[String]) -> AgentKey {
    let mut names = tables.to_vec();
    names.sort();
    names.dedup();
    (database.to_string(), names)
}

/// Builds scoped agents and keeps recently used ones.
pub struct AgentFactory {
    databases: DatabaseRegistry,
    llm: Arc<dyn LlmClient>,
    max_steps: usize,
    cache: Mutex<LruCache<AgentKey, Arc<SqlAgent>>>,
}

impl AgentFactory {
    pub fn new(
        databases: DatabaseRegistry,
        llm: Arc<dyn LlmClient>,
        max_steps: usize,
        cache_capacity: usize,
    ) -> Self {
        Self {
            databases,
            llm,
            max_steps,
            cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    /// Cached agent for `(database, tables)`, building one on a miss.
    ///
    /// Two concurrent misses for the same key may both build; the later
    /// insert wins and both callers get a working agent.
    pub async fn get_agent(&self, database: &str, tables: &[String]) -> Result<Arc<SqlAgent>> {
        let executor = self.databases.get(database)?;
        let key = agent_key(database, tables);

        if let Some(agent) = self.cache.lock().await.get(&key) {
            debug!(db = database, tables = ?key.1, "agent cache hit");
            return Ok(agent);
        }

        let scope = ScopedDatabase::new(database, executor, &key.1);
        let agent = Arc::new(SqlAgent::build(scope, self.llm.clone(), self.max_steps).await?);
        self.cache.lock().await.insert(key, agent.clone());
        Ok(agent)
    }

    pub async fn cached_agents(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[async_trait]
impl AgentProvider for AgentFactory {
    async fn agent_for(&self, database: &str, tables: &[String]) -> Result<Arc<dyn QueryAgent>> {
        let agent: Arc<dyn QueryAgent> = self.get_agent(database, tables).await?;
        Ok(agent)
    }
}

// ============================================================================
// Tests
// ============================================================================
