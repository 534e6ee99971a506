//! Replication Slots
//!
//! Slots cannot be altered after creation, so there is no update operation.
//! Logical slots are bound to a database and are created through a connection to it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::context::Context;
use crate::error::{AdminError, Result};
use crate::executor::{Executor, Row, Statement};
use crate::lifecycle::{self, Managed};

use super::{
    contains_pattern, list_paged, validate_name, CreateResource, DeleteResource, GetResource, List,
    ListRequest, ListResources, ObjectName, ResourceKind,
};

/// How long a forced delete waits for the slot's walsender to exit
const TERMINATE_TIMEOUT_MS: i64 = 5000;

const SELECT: &str = "SELECT s.slot_name::text AS name,
       s.slot_type AS slot_type,
       s.plugin::text AS plugin,
       s.database::text AS database,
       s.active AS active,
       s.active_pid::int8 AS active_pid,
       s.temporary AS temporary,
       s.restart_lsn::text AS restart_lsn,
       s.confirmed_flush_lsn::text AS confirmed_flush_lsn,
       CASE WHEN pg_catalog.pg_is_in_recovery() THEN NULL
            ELSE pg_catalog.pg_wal_lsn_diff(pg_catalog.pg_current_wal_lsn(), s.restart_lsn)::int8
       END AS retained_bytes
FROM pg_catalog.pg_replication_slots s";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    /// `physical` or `logical`
    pub slot_type: String,
    pub plugin: Option<String>,
    pub database: Option<String>,
    pub active: bool,
    pub active_pid: Option<i64>,
    pub temporary: bool,
    pub restart_lsn: Option<String>,
    pub confirmed_flush_lsn: Option<String>,
    /// WAL kept back by this slot
    pub retained_bytes: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotMeta {
    pub name: String,
    /// Output plugin; makes the slot logical
    pub plugin: Option<String>,
    /// Required for logical slots
    pub database: Option<String>,
    /// Physical slots only: reserve WAL immediately
    pub reserve_wal: bool,
}

pub struct SlotManager {
    exec: Arc<dyn Executor>,
}

impl SlotManager {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }
}

/// Slot names may only hold lower case letters, digits and underscores
fn validate(meta: &SlotMeta) -> Result<()> {
    validate_name(&meta.name)?;
    if !meta.name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(AdminError::bad_parameter(format!(
            "slot name '{}' may only contain lower case letters, digits and underscores",
            meta.name
        )));
    }
    if meta.plugin.is_some() && meta.database.as_deref().unwrap_or_default().is_empty() {
        return Err(AdminError::bad_parameter("a logical slot needs a database"));
    }
    if meta.plugin.is_none() && meta.database.is_some() {
        return Err(AdminError::bad_parameter("a physical slot is not bound to a database"));
    }
    Ok(())
}

fn create_statement(meta: &SlotMeta) -> Statement {
    match &meta.plugin {
        Some(plugin) => {
            Statement::new("SELECT pg_catalog.pg_create_logical_replication_slot($1, $2)")
                .bind(&meta.name)
                .bind(plugin)
        }
        None => Statement::new("SELECT pg_catalog.pg_create_physical_replication_slot($1, $2)")
            .bind(&meta.name)
            .bind(meta.reserve_wal),
    }
}

impl Managed for SlotManager {
    type Resource = Slot;

    fn kind(&self) -> &'static str {
        "slot"
    }

    fn select(&self, name: &str) -> Statement {
        Statement::new(format!("{SELECT} WHERE s.slot_name = $1")).bind(name)
    }

    fn decode(&self, row: &Row) -> Result<Slot> {
        Ok(Slot {
            name: row.text("name")?,
            slot_type: row.text("slot_type")?,
            plugin: row.opt_text("plugin"),
            database: row.opt_text("database"),
            active: row.flag("active"),
            active_pid: row.opt_int("active_pid"),
            temporary: row.flag("temporary"),
            restart_lsn: row.opt_text("restart_lsn"),
            confirmed_flush_lsn: row.opt_text("confirmed_flush_lsn"),
            retained_bytes: row.opt_int("retained_bytes"),
        })
    }

    /// `force` terminates the consumer holding the slot first
    fn drop_statements(&self, name: &str, force: bool) -> Vec<Statement> {
        let mut statements = Vec::new();
        if force {
            statements.push(
                Statement::new(
                    "SELECT pg_catalog.pg_terminate_backend(active_pid, $2)
                     FROM pg_catalog.pg_replication_slots
                     WHERE slot_name = $1 AND active_pid IS NOT NULL",
                )
                .bind(name)
                .bind(TERMINATE_TIMEOUT_MS),
            );
        }
        statements.push(Statement::new("SELECT pg_catalog.pg_drop_replication_slot($1)").bind(name));
        statements
    }
}

impl ResourceKind for SlotManager {
    const KIND: &'static str = "slot";
    type Id = ObjectName;
    type Item = Slot;
}

#[async_trait]
impl ListResources for SlotManager {
    type Request = ListRequest;

    async fn list(&self, ctx: &Context, request: ListRequest) -> Result<List<Slot>> {
        let base = Statement::new(format!(
            "{SELECT} WHERE ($1::text IS NULL OR s.slot_name LIKE $1) ORDER BY s.slot_name"
        ))
        .bind(request.name.as_deref().map(contains_pattern));

        list_paged(ctx, &*self.exec, &base, request.offset, request.limit, |row| self.decode(row))
            .await
    }
}

#[async_trait]
impl GetResource for SlotManager {
    async fn get(&self, ctx: &Context, id: &ObjectName) -> Result<Slot> {
        lifecycle::fetch(ctx, self, &*self.exec, &id.name).await
    }
}

#[async_trait]
impl CreateResource for SlotManager {
    type Meta = SlotMeta;

    async fn create(&self, ctx: &Context, meta: SlotMeta) -> Result<Slot> {
        validate(&meta)?;

        match &meta.database {
            Some(database) => {
                let conn = self.exec.scoped(ctx, database).await?;
                conn.execute(ctx, &create_statement(&meta)).await?;
            }
            None => {
                self.exec.execute(ctx, &create_statement(&meta)).await?;
            }
        }
        info!(kind = "slot", name = %meta.name, logical = meta.plugin.is_some(), "created");

        lifecycle::fetch(ctx, self, &*self.exec, &meta.name).await
    }
}

#[async_trait]
impl DeleteResource for SlotManager {
    async fn delete(&self, ctx: &Context, id: &ObjectName, force: bool) -> Result<Slot> {
        lifecycle::delete(ctx, self, &*self.exec, &id.name, force).await
    }
}
