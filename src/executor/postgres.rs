//! `PostgreSQL` Executor Implementation
//!
//! This module implements the [`Executor`] traits on top of `tokio-postgres`.
//!
//! # Connections
//! - One shared client for plain statements (the driver pipelines concurrent calls)
//! - One dedicated connection per transaction; dropping a transaction closes its
//!   connection, which aborts the open transaction server-side
//! - One new connection per scoped database handle
//!
//! # Implementation Notes
//! - Every call is raced against the caller's [`Context`]
//! - Rows are converted to a column → JSON map
//! - Arrays of text-like types become JSON arrays
//! - BYTEA data is Base64-encoded for JSON safety
//! - `aclitem[]` is not decodable by the driver; queries cast it to `text[]`

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::context::Context;
use crate::error::{AdminError, Result};
use crate::executor::{Executor, Param, Queryable, Row, Statement, Transaction};

/// Default database used when the connection config names none
pub const DEFAULT_DATABASE: &str = "postgres";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Basic facts about the connected server
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerInfo {
    /// Full `version()` string
    pub version: String,
    /// `server_version_num` (e.g. 160002)
    pub version_num: i64,
    /// Name of the connected database
    pub database: String,
    /// Connected user name
    pub user: String,
}

/// `PostgreSQL` executor
pub struct PgExecutor {
    config: ConnectionConfig,
    client: Client,
}

impl PgExecutor {
    /// Connect using `config`
    pub async fn connect(ctx: &Context, config: &ConnectionConfig) -> Result<Self> {
        let client = ctx.run("connect", open(config)).await?;
        Ok(Self { config: config.clone(), client })
    }

    /// Query version, database and user of the live connection
    pub async fn server_info(&self, ctx: &Context) -> Result<ServerInfo> {
        let row = self
            .query_one(
                ctx,
                &Statement::new(
                    "SELECT version() AS version,
                            current_setting('server_version_num')::int8 AS version_num,
                            current_database()::text AS database,
                            current_user::text AS \"user\"",
                ),
            )
            .await?;

        Ok(ServerInfo {
            version: row.text("version")?,
            version_num: row.int("version_num")?,
            database: row.text("database")?,
            user: row.text("user")?,
        })
    }
}

#[async_trait]
impl Queryable for PgExecutor {
    async fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<u64> {
        ctx.run("execute", run_execute(&self.client, stmt)).await
    }

    async fn query(&self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>> {
        ctx.run("query", run_query(&self.client, stmt)).await
    }
}

#[async_trait]
impl Executor for PgExecutor {
    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>> {
        let client = ctx.run("begin", open(&self.config)).await?;
        ctx.run("begin", async {
            client
                .batch_execute("BEGIN")
                .await
                .map_err(|e| AdminError::internal(describe(&e)))
        })
        .await?;
        Ok(Box::new(PgTransaction { client }))
    }

    async fn scoped(&self, ctx: &Context, database: &str) -> Result<Arc<dyn Executor>> {
        let mut config = self.config.clone();
        config.database = Some(database.to_string());
        let scoped = PgExecutor::connect(ctx, &config).await?;
        Ok(Arc::new(scoped))
    }
}

/// Transaction on a dedicated connection
struct PgTransaction {
    client: Client,
}

#[async_trait]
impl Queryable for PgTransaction {
    async fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<u64> {
        ctx.run("execute", run_execute(&self.client, stmt)).await
    }

    async fn query(&self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>> {
        ctx.run("query", run_query(&self.client, stmt)).await
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(&self, ctx: &Context) -> Result<()> {
        ctx.run("commit", async {
            self.client.batch_execute("COMMIT").await.map_err(|e| AdminError::internal(describe(&e)))
        })
        .await
    }

    async fn rollback(&self, ctx: &Context) -> Result<()> {
        ctx.run("rollback", async {
            self.client
                .batch_execute("ROLLBACK")
                .await
                .map_err(|e| AdminError::internal(describe(&e)))
        })
        .await
    }
}

/// Build `tokio-postgres` config from `ConnectionConfig`
fn build_pg_config(config: &ConnectionConfig) -> Result<Config> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| AdminError::bad_parameter("connection requires 'host' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| AdminError::bad_parameter("connection requires 'user' parameter"))?;

    let mut pg_config = Config::new();
    pg_config
        .host(host)
        .port(config.port.unwrap_or(5432))
        .user(user)
        .dbname(config.database.as_deref().unwrap_or(DEFAULT_DATABASE))
        .application_name("pgctl")
        .connect_timeout(CONNECT_TIMEOUT);

    if let Some(password) = &config.password {
        pg_config.password(password);
    }

    Ok(pg_config)
}

async fn open(config: &ConnectionConfig) -> Result<Client> {
    let pg_config = build_pg_config(config)?;

    let (client, connection) = pg_config
        .connect(NoTls)
        .await
        .map_err(|e| AdminError::connection_failed(format!("could not connect: {e}")))?;

    // Connection errors carry no credentials, but stay at debug level
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "connection closed with error");
        }
    });

    Ok(client)
}

/// Render a driver error, keeping the server's SQLSTATE and message
fn describe(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => format!("{} (SQLSTATE {})", db.message(), db.code().code()),
        None => err.to_string(),
    }
}

fn to_sql_params(params: &[Param]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|p| -> Box<dyn ToSql + Sync + Send> {
            match p {
                Param::Text(v) => Box::new(v.clone()),
                Param::Int(v) => Box::new(*v),
                Param::Bool(v) => Box::new(*v),
                Param::Null => Box::new(None::<String>),
            }
        })
        .collect()
}

async fn run_execute(client: &Client, stmt: &Statement) -> Result<u64> {
    debug!(sql = %stmt.sql, params = stmt.params.len(), "execute");
    let boxed = to_sql_params(&stmt.params);
    let params: Vec<&(dyn ToSql + Sync)> =
        boxed.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

    client.execute(stmt.sql.as_str(), &params).await.map_err(|e| AdminError::internal(describe(&e)))
}

async fn run_query(client: &Client, stmt: &Statement) -> Result<Vec<Row>> {
    debug!(sql = %stmt.sql, params = stmt.params.len(), "query");
    let boxed = to_sql_params(&stmt.params);
    let params: Vec<&(dyn ToSql + Sync)> =
        boxed.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

    let rows = client
        .query(stmt.sql.as_str(), &params)
        .await
        .map_err(|e| AdminError::internal(describe(&e)))?;

    rows.iter().map(row_to_json).collect()
}

/// Convert a `PostgreSQL` row to a column → JSON map
fn row_to_json(row: &tokio_postgres::Row) -> Result<Row> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| Ok((column.name().to_string(), postgres_value_to_json(row, idx)?)))
        .collect()
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        AdminError::internal(format!(
            "Failed to decode column '{}': {e}",
            row.columns()[idx].name()
        ))
    })
}

/// Convert `PostgreSQL` value to JSON value (NULL → `Value::Null`)
fn postgres_value_to_json(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    let col_type = row.columns()[idx].type_().clone();

    let value = match col_type {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),

        Type::INT2 => get::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => get::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::from),
        Type::OID => get::<u32>(row, idx)?.map(Value::from),

        // NaN/Infinity become null
        Type::FLOAT4 => get::<f32>(row, idx)?
            .and_then(|v| serde_json::Number::from_f64(f64::from(v)))
            .map(Value::Number),
        Type::FLOAT8 => {
            get::<f64>(row, idx)?.and_then(serde_json::Number::from_f64).map(Value::Number)
        }

        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get::<String>(row, idx)?.map(Value::String)
        }

        Type::JSON | Type::JSONB => get::<Value>(row, idx)?,

        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(|v| {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(v))
        }),

        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S").to_string())),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)?
            .map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => get::<chrono::NaiveDate>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%d").to_string())),

        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),

        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY => {
            get::<Vec<Option<String>>>(row, idx)?.map(|items| {
                Value::Array(items.into_iter().map(|v| v.map_or(Value::Null, Value::String)).collect())
            })
        }

        // Anything else must already be text-compatible (queries cast exotic types)
        _ => get::<String>(row, idx).map_err(|_| {
            AdminError::internal(format!(
                "Unsupported PostgreSQL type '{}' in column '{}'",
                col_type.name(),
                row.columns()[idx].name()
            ))
        })?
        .map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            host: Some("localhost".to_string()),
            port: Some(5432),
            user: Some("postgres".to_string()),
            password: Some("postgres".to_string()),
            database: None,
        }
    }

    #[test]
    fn test_default_database() {
        let pg_config = build_pg_config(&config()).unwrap();
        assert_eq!(pg_config.get_dbname(), Some(DEFAULT_DATABASE));
        assert_eq!(pg_config.get_application_name(), Some("pgctl"));
    }

    #[test]
    fn test_missing_host_error() {
        let mut config = config();
        config.host = None;

        let error = build_pg_config(&config).unwrap_err();
        assert_eq!(error.error_code(), "BAD_PARAMETER");
        assert!(error.message().contains("'host'"));
    }

    #[test]
    fn test_params_keep_order() {
        let boxed = to_sql_params(&[Param::Text("a".into()), Param::Int(1), Param::Null]);
        assert_eq!(boxed.len(), 3);
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_server_info() {
        let ctx = Context::background();
        let executor = PgExecutor::connect(&ctx, &config()).await.unwrap();

        let info = executor.server_info(&ctx).await.unwrap();
        assert!(info.version.contains("PostgreSQL"));
        assert_eq!(info.database, "postgres");
        assert_eq!(info.user, "postgres");
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_transaction_rollback_discards_work() {
        let ctx = Context::background();
        let executor = PgExecutor::connect(&ctx, &config()).await.unwrap();

        let tx = executor.begin(&ctx).await.unwrap();
        tx.execute(&ctx, &Statement::new("CREATE TEMP TABLE pgctl_probe (id int)")).await.unwrap();
        tx.rollback(&ctx).await.unwrap();

        let rows = executor
            .query(&ctx, &Statement::new("SELECT to_regclass('pgctl_probe')::text AS t"))
            .await
            .unwrap();
        assert_eq!(rows[0].get("t"), Some(&Value::Null));
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_acl_array_decodes_as_text() {
        let ctx = Context::background();
        let executor = PgExecutor::connect(&ctx, &config()).await.unwrap();

        let row = executor
            .query_one(
                &ctx,
                &Statement::new(
                    "SELECT datacl::text[] AS acl FROM pg_database WHERE datname = $1",
                )
                .bind("template1"),
            )
            .await
            .unwrap();
        assert!(!row.text_array("acl").is_empty());
    }
}
