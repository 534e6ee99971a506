//! Query Execution Traits and Core Types
//!
//! This module defines the seam between resource management and the server.
//! Resource code builds [`Statement`]s and hands them to a [`Queryable`]; it never
//! touches a driver directly.
//!
//! # Handles
//! - [`Executor`]: server-wide handle, can open transactions and per-database scoped handles
//! - [`Transaction`]: statements run on one dedicated connection until commit or rollback
//!
//! Handles are passed explicitly (`Arc<dyn Executor>`) into every manager constructor.
//! There is no process-wide connection singleton.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{AdminError, Result};

pub mod postgres;

/// A bound statement parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Text(String),
    Int(i64),
    Bool(bool),
    /// Typed as `text` on the server
    Null,
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for Param {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Param {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// SQL text plus positional parameters (`$1`, `$2`, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    /// Create a statement without parameters
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), params: Vec::new() }
    }

    /// Append the next positional parameter
    #[must_use]
    pub fn bind(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// One result row (column name to JSON value)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(HashMap<String, Value>);

impl Row {
    /// Create an empty row
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Raw column value (`None` when the column is absent)
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Required text column
    pub fn text(&self, column: &str) -> Result<String> {
        self.opt_text(column)
            .ok_or_else(|| AdminError::internal(format!("column '{column}' is missing or not text")))
    }

    /// Nullable text column
    #[must_use]
    pub fn opt_text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(Value::as_str).map(str::to_string)
    }

    /// Required integer column
    pub fn int(&self, column: &str) -> Result<i64> {
        self.opt_int(column).ok_or_else(|| {
            AdminError::internal(format!("column '{column}' is missing or not an integer"))
        })
    }

    /// Nullable integer column
    #[must_use]
    pub fn opt_int(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    /// Nullable float column
    #[must_use]
    pub fn opt_float(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(Value::as_f64)
    }

    /// Boolean column; NULL reads as false
    #[must_use]
    pub fn flag(&self, column: &str) -> bool {
        self.get(column).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Text array column; NULL reads as empty
    #[must_use]
    pub fn text_array(&self, column: &str) -> Vec<String> {
        match self.get(column) {
            Some(Value::Array(items)) => {
                items.iter().filter_map(Value::as_str).map(str::to_string).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Anything statements can run against
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Run a statement that returns no rows, yielding the affected row count
    async fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<u64>;

    /// Run a statement and collect its rows
    async fn query(&self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>>;

    /// Run a statement expected to return exactly one row
    async fn query_one(&self, ctx: &Context, stmt: &Statement) -> Result<Row> {
        self.query(ctx, stmt)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AdminError::not_found("query returned no rows"))
    }
}

/// Server-wide handle
#[async_trait]
pub trait Executor: Queryable {
    /// Open a transaction on a dedicated connection
    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>>;

    /// A handle bound to one database (partition) of the same server
    async fn scoped(&self, ctx: &Context, database: &str) -> Result<Arc<dyn Executor>>;
}

/// An open transaction; dropping it without commit rolls it back
#[async_trait]
pub trait Transaction: Queryable {
    async fn commit(&self, ctx: &Context) -> Result<()>;
    async fn rollback(&self, ctx: &Context) -> Result<()>;
}

/// Commit on success, roll back on failure.
///
/// A failed rollback is logged; the body's error is what the caller sees.
pub async fn finish<T>(ctx: &Context, tx: Box<dyn Transaction>, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit(ctx).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback(ctx).await {
                tracing::warn!(error = %rollback, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statement_bind_order() {
        let stmt = Statement::new("SELECT $1, $2, $3")
            .bind("a")
            .bind(Some(5_i64))
            .bind(None::<String>);
        assert_eq!(stmt.params, vec![Param::Text("a".into()), Param::Int(5), Param::Null]);
        assert_eq!(stmt.to_string(), "SELECT $1, $2, $3");
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new()
            .with("name", "app")
            .with("limit", -1)
            .with("allow", true)
            .with("acl", json!(["=Tc/postgres", null, "app=CTc/postgres"]))
            .with("comment", Value::Null);

        assert_eq!(row.text("name").unwrap(), "app");
        assert_eq!(row.int("limit").unwrap(), -1);
        assert!(row.flag("allow"));
        assert!(!row.flag("missing"));
        assert_eq!(row.text_array("acl"), vec!["=Tc/postgres", "app=CTc/postgres"]);
        assert!(row.text_array("comment").is_empty());
        assert!(row.opt_text("comment").is_none());
        assert!(row.text("comment").is_err());
    }

    #[test]
    fn test_u64_param_saturates() {
        assert_eq!(Param::from(u64::MAX), Param::Int(i64::MAX));
        assert_eq!(Param::from(10_u64), Param::Int(10));
    }
}
