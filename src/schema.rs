//! Table schema descriptors and their text renderings.
//!
//! A [`TableSchema`] is produced by introspecting one database and is used
//! two ways:
//!
//! - **Embedding**: [`TableSchema::embedding_text`] is the deterministic text
//!   stored in the vector index.
//! - **Agent context**: [`TableSchema::ddl`] is what the SQL agent sees when it
//!   describes a table.

use serde::{Deserialize, Serialize};

use crate::database::SqlExecutor;
use crate::error::Result;

// ============================================================================
// Data Model
// ============================================================================

/// A column as reported by the catalog. `data_type` is the textual SQL type
/// name, never a driver type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Columns of one table in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Text embedded for this table:
    ///
    /// ```text
    /// Table: price
    /// Columns: id integer, product_id integer, mrp numeric
    /// ```
    pub fn embedding_text(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect();
        format!("Table: {}\nColumns: {}", self.table_name, cols.join(", "))
    }

    /// `CREATE TABLE`-style rendering for prompts.
    pub fn ddl(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("\t{} {}", c.name, c.data_type))
            .collect();
        format!("CREATE TABLE {} (\n{}\n)", self.table_name, cols.join(",\n"))
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Introspect every base table visible through `executor`.
///
/// Tables come back sorted by name; columns keep ordinal order. Read-only.
pub async fn extract(executor: &dyn SqlExecutor) -> Result<Vec<TableSchema>> {
    let mut tables = executor.list_tables().await?;
    tables.sort();

    let mut schemas = Vec::with_capacity(tables.len());
    for table_name in tables {
        let columns = executor.columns(&table_name).await?;
        schemas.push(TableSchema {
            table_name,
            columns,
        });
    }
    Ok(schemas)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::FakeExecutor;
    use crate::error::RouterError;

    fn price_table() -> TableSchema {
        TableSchema {
            table_name: "price".into(),
            columns: vec![
                ColumnDef::new("id", "integer"),
                ColumnDef::new("product_id", "integer"),
                ColumnDef::new("mrp", "numeric"),
            ],
        }
    }

    #[test]
    fn test_embedding_text_format() {
        assert_eq!(
            price_table().embedding_text(),
            "Table: price\nColumns: id integer, product_id integer, mrp numeric"
        );
    }

    #[test]
    fn test_embedding_text_no_columns() {
        let t = TableSchema {
            table_name: "empty".into(),
            columns: vec![],
        };
        assert_eq!(t.embedding_text(), "Table: empty\nColumns: ");
    }

    #[test]
    fn test_ddl_lists_columns() {
        let ddl = price_table().ddl();
        assert!(ddl.starts_with("CREATE TABLE price ("));
        assert!(ddl.contains("\tmrp numeric"));
    }

    #[tokio::test]
    async fn test_extract_sorted_tables_ordinal_columns() {
        let exec = FakeExecutor::new()
            .with_table("product", &[("id", "integer"), ("name", "character varying")])
            .with_table("brand", &[("id", "integer"), ("name", "character varying")]);

        let schemas = extract(&exec).await.unwrap();
        let names: Vec<&str> = schemas.iter().map(|s| s.table_name.as_str()).collect();
        assert_eq!(names, vec!["brand", "product"]);
        assert_eq!(schemas[1].columns[1], ColumnDef::new("name", "character varying"));
    }

    #[tokio::test]
    async fn test_extract_unreachable() {
        let exec = FakeExecutor::unreachable();
        let err = extract(&exec).await.unwrap_err();
        assert!(matches!(err, RouterError::Connection(_)));
    }
}
