use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub definition: &'static str,
}

impl ColumnSpec {
    pub const fn new(name: &'static str, definition: &'static str) -> Self {
        Self { name, definition }
    }
}

/// Storage backend that migrations inspect and extend.
///
/// Every mutating method is additive; there is deliberately no way to drop or
/// rename anything through this trait.
pub trait SchemaStore {
    fn table_exists(&self, table: &str) -> Result<bool>;
    fn column_exists(&self, table: &str, column: &str) -> Result<bool>;
    fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<()>;
    fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<()>;
    fn setting_exists(&self, key: &str) -> Result<bool>;
    fn insert_setting(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug)]
pub struct SqliteSchemaStore {
    conn: Connection,
}

impl SqliteSchemaStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database: {}", path.display()))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Table and column names, sorted, for comparing schema shape.
    pub fn schema_outline(&self) -> Result<Vec<String>> {
        let mut tables_stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = tables_stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut outline = Vec::new();
        for table in tables {
            let mut columns_stmt = self
                .conn
                .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
            let columns = columns_stmt
                .query_map([&table], |row| {
                    Ok(format!(
                        "{}.{} {}",
                        table,
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            outline.extend(columns);
        }
        Ok(outline)
    }
}

impl SchemaStore for SqliteSchemaStore {
    fn table_exists(&self, table: &str) -> Result<bool> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to inspect table '{table}'"))?;
        Ok(exists)
    }

    fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
                params![table, column],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to inspect column '{table}.{column}'"))?;
        Ok(exists)
    }

    fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<()> {
        validate_identifier(table)?;
        if columns.is_empty() {
            return Err(anyhow!("table '{table}' must declare at least one column"));
        }
        let mut definitions = Vec::with_capacity(columns.len());
        for column in columns {
            validate_identifier(column.name)?;
            definitions.push(format!("{} {}", column.name, column.definition));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} ({})",
            definitions.join(", ")
        );
        self.conn
            .execute_batch(&sql)
            .with_context(|| format!("failed to create table '{table}'"))?;
        Ok(())
    }

    fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<()> {
        validate_identifier(table)?;
        validate_identifier(column.name)?;
        let sql = format!(
            "ALTER TABLE {table} ADD COLUMN {} {}",
            column.name, column.definition
        );
        self.conn
            .execute_batch(&sql)
            .with_context(|| format!("failed to add column '{table}.{}'", column.name))?;
        Ok(())
    }

    fn setting_exists(&self, key: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM settings WHERE key = ?1",
                [key],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to read setting '{key}'"))?;
        Ok(found.is_some())
    }

    fn insert_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .with_context(|| format!("failed to seed setting '{key}'"))?;
        Ok(())
    }
}

fn validate_identifier(name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    let valid = !bytes.is_empty()
        && bytes.len() <= 64
        && (bytes[0].is_ascii_alphabetic() || bytes[0] == b'_')
        && bytes
            .iter()
            .all(|byte| byte.is_ascii_alphanumeric() || *byte == b'_');
    if !valid {
        return Err(anyhow!("invalid schema identifier '{name}'"));
    }
    Ok(())
}
