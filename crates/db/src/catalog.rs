// crates/db/src/catalog.rs
//! Read-only catalog introspection over `sqlite_master` and the table-valued
//! pragma functions.
//!
//! Everything takes a `&mut SqliteConnection` so callers can run the same
//! checks inside a step's transaction (`&mut *tx`) or on a pooled connection.

use serde::Serialize;
use sqlx::{Row, SqliteConnection};

use crate::quote_ident;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub unique: bool,
    /// `true` for indexes SQLite created itself (PRIMARY KEY / UNIQUE
    /// constraints). Those cannot be dropped or renamed directly.
    pub implicit: bool,
    pub sql: Option<String>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyInfo {
    pub table: String,
    pub column: String,
    pub parent_table: String,
    /// `None` when the constraint references the parent's primary key implicitly.
    pub parent_column: Option<String>,
}

/// Storage class SQLite derives from a declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

/// Apply SQLite's affinity rules (section 3.1 of the datatype docs) to a
/// declared type such as `VARCHAR(10)` or `BIGINT`.
pub fn affinity(declared: &str) -> Affinity {
    let t = declared.to_ascii_uppercase();
    if t.contains("INT") {
        Affinity::Integer
    } else if t.contains("CHAR") || t.contains("CLOB") || t.contains("TEXT") {
        Affinity::Text
    } else if t.contains("BLOB") || t.trim().is_empty() {
        Affinity::Blob
    } else if t.contains("REAL") || t.contains("FLOA") || t.contains("DOUB") {
        Affinity::Real
    } else {
        Affinity::Numeric
    }
}

/// Two declared types are interchangeable when they resolve to the same affinity.
pub fn types_compatible(a: &str, b: &str) -> bool {
    affinity(a) == affinity(b)
}

pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

/// User tables, excluding SQLite's own.
pub async fn tables(conn: &mut SqliteConnection) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(n,)| n).collect())
}

pub async fn columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<ColumnInfo>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(ColumnInfo {
                name: row.try_get("name")?,
                data_type: row.try_get("type")?,
                not_null: row.try_get::<i64, _>("notnull")? != 0,
                primary_key: row.try_get::<i64, _>("pk")? != 0,
                default: row.try_get("dflt_value")?,
            })
        })
        .collect()
}

pub async fn column(
    conn: &mut SqliteConnection,
    table: &str,
    name: &str,
) -> Result<Option<ColumnInfo>, sqlx::Error> {
    Ok(columns(conn, table)
        .await?
        .into_iter()
        .find(|c| c.name.eq_ignore_ascii_case(name)))
}

pub async fn indexes(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<IndexInfo>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT il.name AS name, il."unique" AS is_unique, il.origin AS origin, m.sql AS sql
           FROM pragma_index_list(?1) il
           LEFT JOIN sqlite_master m ON m.type = 'index' AND m.name = il.name
           ORDER BY il.name"#,
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name")?;
        let origin: String = row.try_get("origin")?;
        let cols: Vec<(Option<String>,)> =
            sqlx::query_as("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
                .bind(&name)
                .fetch_all(&mut *conn)
                .await?;
        out.push(IndexInfo {
            table: table.to_string(),
            unique: row.try_get::<i64, _>("is_unique")? != 0,
            implicit: origin != "c",
            sql: row.try_get("sql")?,
            // Expression index members have no name
            columns: cols.into_iter().filter_map(|(c,)| c).collect(),
            name,
        });
    }
    Ok(out)
}

/// Foreign keys declared on `table` (the child side).
pub async fn foreign_keys(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<ForeignKeyInfo>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT "table" AS parent_table, "from" AS child_column, "to" AS parent_column
           FROM pragma_foreign_key_list(?1) ORDER BY id, seq"#,
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(ForeignKeyInfo {
                table: table.to_string(),
                column: row.try_get("child_column")?,
                parent_table: row.try_get("parent_table")?,
                parent_column: row.try_get("parent_column")?,
            })
        })
        .collect()
}

/// Every foreign key in the database whose parent is `parent_table`.
pub async fn referencing_foreign_keys(
    conn: &mut SqliteConnection,
    parent_table: &str,
) -> Result<Vec<ForeignKeyInfo>, sqlx::Error> {
    let mut out = Vec::new();
    for table in tables(conn).await? {
        for fk in foreign_keys(conn, &table).await? {
            if fk.parent_table.eq_ignore_ascii_case(parent_table) {
                out.push(fk);
            }
        }
    }
    Ok(out)
}

pub async fn count_rows(conn: &mut SqliteConnection, table: &str) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

pub async fn count_non_null(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT({}) FROM {}",
        quote_ident(column),
        quote_ident(table)
    ))
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Row and column counts of a table, `None` when it does not exist.
pub async fn table_shape(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<(i64, usize)>, sqlx::Error> {
    if !table_exists(conn, table).await? {
        return Ok(None);
    }
    let rows = count_rows(conn, table).await?;
    let cols = columns(conn, table).await?.len();
    Ok(Some((rows, cols)))
}
