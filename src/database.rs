//! Database access: per-vendor Postgres pools and the table-scoped view the
//! SQL agent works through.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use sqlx::Row as _;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::{Result, RouterError};
use crate::schema::{ColumnDef, TableSchema};

/// One result row, columns in select-list order.
pub type Row = IndexMap<String, Value>;

/// Rows shown per table when describing it to the agent.
pub const SAMPLE_ROWS: usize = 3;

/// Cap on rows returned to the agent from a single query.
pub const MAX_RESULT_ROWS: usize = 50;

/// Opaque SQL endpoint. Implementations must be safe to share across tasks.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Names of the base tables in the default schema.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Columns of `table` in ordinal order; empty if the table is unknown.
    async fn columns(&self, table: &str) -> Result<Vec<ColumnDef>>;

    /// Run one read-only statement and return at most `limit` rows.
    async fn fetch(&self, sql: &str, limit: usize) -> Result<Vec<Row>>;
}

// ============================================================================
// Postgres
// ============================================================================

/// Pool sizing and timeouts for each database.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// [`SqlExecutor`] over a lazily connected `sqlx` Postgres pool.
pub struct PgExecutor {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgExecutor {
    /// Build the pool without connecting; the first query opens a connection.
    pub fn connect_lazy(url: &str, settings: &PoolSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(settings.idle_timeout)
            .connect_lazy(url)
            .map_err(|e| RouterError::Config(format!("invalid connection string: {e}")))?;
        Ok(Self {
            pool,
            query_timeout: settings.query_timeout,
        })
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result.map_err(classify_sqlx),
            Err(_) => Err(RouterError::Timeout),
        }
    }
}

/// Connectivity problems become `Connection`; the rest are statement errors.
fn classify_sqlx(err: sqlx::Error) -> RouterError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Protocol(_) => RouterError::Connection(err.to_string()),
        other => RouterError::Sql(other.to_string()),
    }
}

fn as_introspection(err: RouterError) -> RouterError {
    match err {
        RouterError::Sql(msg) => RouterError::Introspection(msg),
        other => other,
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let query = r#"
            SELECT table_name::text AS table_name
            FROM information_schema.tables
            WHERE table_schema = 'public'
                AND table_type = 'BASE TABLE'
            ORDER BY table_name
        "#;
        let rows = self
            .timed(sqlx::query(query).fetch_all(&self.pool))
            .await
            .map_err(as_introspection)?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("table_name")
                    .map_err(|e| RouterError::Introspection(format!("table_name: {e}")))
            })
            .collect()
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnDef>> {
        let query = r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
            FROM information_schema.columns
            WHERE table_schema = 'public' AND table_name = $1
            ORDER BY ordinal_position
        "#;
        let rows = self
            .timed(sqlx::query(query).bind(table).fetch_all(&self.pool))
            .await
            .map_err(as_introspection)?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row
                .try_get("column_name")
                .map_err(|e| RouterError::Introspection(format!("column_name: {e}")))?;
            let data_type: String = row
                .try_get("data_type")
                .map_err(|e| RouterError::Introspection(format!("data_type: {e}")))?;
            columns.push(ColumnDef { name, data_type });
        }
        Ok(columns)
    }

    async fn fetch(&self, sql: &str, limit: usize) -> Result<Vec<Row>> {
        let wrapped = wrap_for_fetch(sql, limit);
        let rows = self
            .timed(sqlx::query(&wrapped).fetch_all(&self.pool))
            .await?;

        rows.iter()
            .map(|row| {
                let text: String = row
                    .try_get("row")
                    .map_err(|e| RouterError::Sql(format!("row decode: {e}")))?;
                serde_json::from_str::<Row>(&text)
                    .map_err(|e| RouterError::Sql(format!("row decode: {e}")))
            })
            .collect()
    }
}

/// row_to_json renders every Postgres type, so no per-type decoding. The
/// newline keeps a trailing `--` comment from swallowing the closing paren.
fn wrap_for_fetch(sql: &str, limit: usize) -> String {
    format!("SELECT row_to_json(q)::text AS row FROM ({sql}\n) AS q LIMIT {limit}")
}

// ============================================================================
// Registry
// ============================================================================

/// Connection table: database id to executor. Built once at startup.
#[derive(Clone, Default)]
pub struct DatabaseRegistry {
    executors: BTreeMap<String, Arc<dyn SqlExecutor>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one lazy pool per configured connection string.
    pub fn connect_lazy(urls: &BTreeMap<String, String>, settings: &PoolSettings) -> Result<Self> {
        let mut registry = Self::new();
        for (id, url) in urls {
            let executor = PgExecutor::connect_lazy(url, settings).map_err(|e| match e {
                RouterError::Config(msg) => RouterError::Config(format!("{id}: {msg}")),
                other => other,
            })?;
            registry.insert(id, Arc::new(executor));
            info!("Registered database '{id}'");
        }
        Ok(registry)
    }

    pub fn insert(&mut self, id: &str, executor: Arc<dyn SqlExecutor>) {
        self.executors.insert(id.to_string(), executor);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn SqlExecutor>> {
        self.executors
            .get(id)
            .cloned()
            .ok_or_else(|| RouterError::UnknownDatabase(id.to_string()))
    }

    /// Configured ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }
}

// ============================================================================
// Scoped view
// ============================================================================

/// A database restricted to a fixed set of tables.
///
/// Every introspection path the agent can reach goes through this value, so
/// schema text for tables outside `allowed_tables` never enters a prompt, and
/// queries naming other tables of the database or the system catalogs are
/// refused before they reach the executor.
#[derive(Clone)]
pub struct ScopedDatabase {
    database: String,
    executor: Arc<dyn SqlExecutor>,
    allowed_tables: Vec<String>,
    /// Every table of the database, loaded on the first query.
    known_tables: Arc<OnceCell<Vec<String>>>,
}

impl ScopedDatabase {
    /// `tables` is sorted and deduplicated.
    pub fn new(database: &str, executor: Arc<dyn SqlExecutor>, tables: &[String]) -> Self {
        let mut allowed_tables = tables.to_vec();
        allowed_tables.sort();
        allowed_tables.dedup();
        Self {
            database: database.to_string(),
            executor,
            allowed_tables,
            known_tables: Arc::new(OnceCell::new()),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn allowed_tables(&self) -> &[String] {
        &self.allowed_tables
    }

    pub fn is_allowed(&self, table: &str) -> bool {
        self.allowed_tables.binary_search_by(|t| t.as_str().cmp(table)).is_ok()
    }

    /// Schemas for `requested` intersected with the allowed set; an empty
    /// request means every allowed table.
    pub async fn schemas(&self, requested: &[String]) -> Result<Vec<TableSchema>> {
        let mut out = Vec::new();
        for table in &self.allowed_tables {
            if !requested.is_empty() && !requested.iter().any(|r| r == table) {
                continue;
            }
            let columns = self.executor.columns(table).await?;
            out.push(TableSchema {
                table_name: table.clone(),
                columns,
            });
        }
        Ok(out)
    }

    /// Prompt text for the requested tables: DDL plus a few sample rows.
    pub async fn table_info(&self, requested: &[String]) -> Result<String> {
        let mut sections = Vec::new();

        let rejected: Vec<&str> = requested
            .iter()
            .map(String::as_str)
            .filter(|t| !self.is_allowed(t))
            .collect();
        if !rejected.is_empty() {
            sections.push(format!(
                "Tables not available: {}. Available tables: {}",
                rejected.join(", "),
                self.allowed_tables.join(", ")
            ));
        }

        for schema in self.schemas(requested).await? {
            if schema.columns.is_empty() {
                sections.push(format!("Table {} does not exist.", schema.table_name));
                continue;
            }
            let sample_sql = format!("SELECT * FROM {} LIMIT {SAMPLE_ROWS}", quote_ident(&schema.table_name));
            let sample = match self.executor.fetch(&sample_sql, SAMPLE_ROWS).await {
                Ok(rows) => render_rows(&rows),
                Err(e) => format!("(sample unavailable: {e})"),
            };
            sections.push(format!(
                "{}\n\n/*\n{SAMPLE_ROWS} rows from {} table:\n{sample}\n*/",
                schema.ddl(),
                schema.table_name
            ));
        }
        Ok(sections.join("\n\n"))
    }

    /// Run one read-only statement over the allowed tables and render the
    /// rows as text.
    pub async fn run_query(&self, sql: &str) -> Result<String> {
        let statement = ensure_read_only(sql)?;
        let known = self
            .known_tables
            .get_or_try_init(|| self.executor.list_tables())
            .await?;
        ensure_in_scope(&statement, &self.allowed_tables, known)?;
        let rows = self.executor.fetch(&statement, MAX_RESULT_ROWS).await?;
        Ok(render_rows(&rows))
    }
}

// ============================================================================
// Helpers
// ============================================================================

static FORBIDDEN_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(insert|update|delete|merge|truncate|drop|alter|create|grant|revoke)\b")
        .expect("static regex")
});

static SYSTEM_SCHEMAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(information_schema|pg_catalog|pg_toast)\b").expect("static regex")
});

/// A name after `FROM`, `JOIN` or a comma, optionally qualified.
static RELATION_REFS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:\bfrom\b|\bjoin\b|,)\s*((?:"[^"]*"|[a-z_][a-z0-9_$]*)(?:\s*\.\s*(?:"[^"]*"|[a-z_][a-z0-9_$]*))?)"#,
    )
    .expect("static regex")
});

/// `sql` with comments removed and string literals emptied. With
/// `blank_identifiers`, double-quoted identifiers are emptied as well.
fn mask_sql(sql: &str, blank_identifiers: bool) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                out.push_str("''");
                let _ = chars.find(|&c| c == '\'');
            }
            '"' if blank_identifiers => {
                out.push_str("\"\"");
                let _ = chars.find(|&c| c == '"');
            }
            '"' => {
                out.push('"');
                for c in chars.by_ref() {
                    out.push(c);
                    if c == '"' {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                let _ = chars.find(|&c| c == '\n');
                out.push('\n');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            other => out.push(other),
        }
    }
    out
}

/// Accept a single `SELECT`/`WITH` statement and return it without trailing
/// semicolons. Literals, quoted identifiers and comments are ignored when
/// looking for data-modifying keywords.
pub fn ensure_read_only(sql: &str) -> Result<String> {
    let statement = sql.trim().trim_end_matches(';').trim();
    if statement.is_empty() {
        return Err(RouterError::Sql("empty statement".into()));
    }

    let head = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    if head != "SELECT" && head != "WITH" {
        return Err(RouterError::Sql("only SELECT queries are allowed".into()));
    }

    let masked = mask_sql(statement, true);
    if masked.contains(';') {
        return Err(RouterError::Sql("only a single statement is allowed".into()));
    }
    if let Some(m) = FORBIDDEN_KEYWORDS.find(&masked) {
        return Err(RouterError::Sql(format!(
            "query contains forbidden keyword: {}",
            m.as_str().to_uppercase()
        )));
    }
    Ok(statement.to_string())
}

fn unquote(part: &str) -> String {
    let part = part.trim();
    match part.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => part.to_lowercase(),
    }
}

/// Reject statements that read the system catalogs or any table of the
/// database outside `allowed`. Names that are not tables (CTEs, columns in
/// `EXTRACT(.. FROM col)`) pass through.
pub fn ensure_in_scope(statement: &str, allowed: &[String], known_tables: &[String]) -> Result<()> {
    let masked = mask_sql(statement, false);
    let unavailable = |name: &str| {
        RouterError::Sql(format!(
            "table '{name}' is not available to this query. Available tables: {}",
            allowed.join(", ")
        ))
    };

    if let Some(m) = SYSTEM_SCHEMAS.find(&masked) {
        return Err(unavailable(m.as_str()));
    }

    for caps in RELATION_REFS.captures_iter(&masked) {
        // Only the last part matters: `public.customer` and `o.created_at`
        // name `customer` and `created_at`.
        let name = unquote(caps[1].rsplit('.').next().unwrap_or_default());
        if name.starts_with("pg_") {
            return Err(unavailable(&name));
        }
        let is_table = known_tables.iter().any(|t| *t == name);
        let is_allowed = allowed.iter().any(|t| *t == name);
        if is_table && !is_allowed {
            return Err(unavailable(&name));
        }
    }
    Ok(())
}

/// Double-quote an identifier for Postgres.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Pipe-separated table rendering: header line, then one line per row.
pub fn render_rows(rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return "(no rows)".to_string();
    };

    let header: Vec<&str> = first.keys().map(String::as_str).collect();
    let mut lines = vec![header.join(" | ")];
    for row in rows {
        let cells: Vec<String> = row
            .values()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                Value::Null => "NULL".to_string(),
                other => other.to_string(),
            })
            .collect();
        lines.push(cells.join(" | "));
    }
    lines.join("\n")
}

// ============================================================================
// Fake Implementation (Test Only)
// ============================================================================

/// In-memory executor: declared tables answer sample queries, other SQL must
/// be registered with [`FakeExecutor::with_query`].
#[cfg(test)]
pub struct FakeExecutor {
    tables: BTreeMap<String, (Vec<ColumnDef>, Vec<Row>)>,
    queries: std::collections::HashMap<String, Vec<Row>>,
    unreachable: bool,
    pub executed: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            queries: std::collections::HashMap::new(),
            unreachable: false,
            executed: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new()
        }
    }

    pub fn with_table(mut self, name: &str, columns: &[(&str, &str)]) -> Self {
        let cols = columns.iter().map(|(n, t)| ColumnDef::new(*n, *t)).collect();
        self.tables.insert(name.to_string(), (cols, Vec::new()));
        self
    }

    pub fn with_rows(mut self, table: &str, rows: Vec<serde_json::Value>) -> Self {
        if let Some((_, stored)) = self.tables.get_mut(table) {
            stored.extend(rows.into_iter().map(json_to_row));
        }
        self
    }

    pub fn with_query(mut self, sql: &str, rows: Vec<serde_json::Value>) -> Self {
        self.queries
            .insert(sql.to_string(), rows.into_iter().map(json_to_row).collect());
        self
    }

    fn check(&self) -> Result<()> {
        if self.unreachable {
            Err(RouterError::Connection("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
fn json_to_row(value: serde_json::Value) -> Row {
    serde_json::from_value(value).expect("row must be a JSON object")
}

#[cfg(test)]
#[async_trait]
impl SqlExecutor for FakeExecutor {
    async fn list_tables(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.tables.keys().cloned().collect())
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnDef>> {
        self.check()?;
        Ok(self
            .tables
            .get(table)
            .map(|(cols, _)| cols.clone())
            .unwrap_or_default())
    }

    async fn fetch(&self, sql: &str, limit: usize) -> Result<Vec<Row>> {
        self.check()?;
        self.executed.lock().unwrap().push(sql.to_string());

        if let Some(rows) = self.queries.get(sql) {
            return Ok(rows.iter().take(limit).cloned().collect());
        }
        for (name, (_, rows)) in &self.tables {
            if sql.starts_with(&format!("SELECT * FROM {} LIMIT", quote_ident(name))) {
                return Ok(rows.iter().take(limit).cloned().collect());
            }
        }
        Err(RouterError::Sql(format!("relation in '{sql}' does not exist")))
    }
}

// ============================================================================
// Tests
// ============================================================================
