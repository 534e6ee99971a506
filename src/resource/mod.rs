//! Resource Managers
//!
//! Every resource kind exposes the same CRUD shape through capability traits. A kind
//! implements only the operations it supports; replication slots, for example, have
//! no [`UpdateResource`] implementation, so there is no update route or command for them.
//!
//! # Kinds
//! - [`database::DatabaseManager`], [`tablespace::TablespaceManager`]: server-wide, grants reconciled
//! - [`schema::SchemaManager`]: per database, grants reconciled, federated listing
//! - [`role::RoleManager`]: server-wide, memberships instead of grants
//! - [`extension::ExtensionManager`]: per database, federated listing
//! - [`slot::SlotManager`]: server-wide, no update
//!
//! All managers share one [`Executor`] handle passed in at construction ([`Catalog::new`]).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::acl::reconcile::AclStatements;
use crate::acl::{split_grant_option, AclList, PUBLIC};
use crate::context::Context;
use crate::error::{AdminError, Result};
use crate::executor::{Executor, Param, Queryable, Row, Statement};
use crate::federation::PageWindow;

pub mod database;
pub mod extension;
pub mod role;
pub mod schema;
pub mod slot;
pub mod tablespace;

/// Page size when the caller does not ask for one
pub const DEFAULT_LIMIT: u64 = 100;

/// Longest identifier the server keeps without truncation (`NAMEDATALEN - 1`)
pub const MAX_IDENTIFIER_LEN: usize = 63;

const RESERVED_PREFIX: &str = "pg_";

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

/// List request for server-wide kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
    /// Substring filter on the name
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for ListRequest {
    fn default() -> Self {
        Self { offset: 0, limit: DEFAULT_LIMIT, name: None }
    }
}

/// List request for per-database kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionedListRequest {
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
    /// Only list inside this database
    #[serde(default)]
    pub database: Option<String>,
    /// Substring filter on the name
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for PartitionedListRequest {
    fn default() -> Self {
        Self { offset: 0, limit: DEFAULT_LIMIT, database: None, name: None }
    }
}

/// One page of results plus the total number of matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct List<T> {
    pub count: u64,
    pub body: Vec<T>,
}

/// Identity of a server-wide resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectName {
    pub name: String,
}

impl ObjectName {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Identity of a resource living inside one database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedName {
    pub database: String,
    pub name: String,
}

impl ScopedName {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self { database: database.into(), name: name.into() }
    }
}

/// Common shape of a resource kind
pub trait ResourceKind: Send + Sync + 'static {
    /// Kind name used in output envelopes and logs
    const KIND: &'static str;
    type Id: DeserializeOwned + Send + Sync;
    type Item: Serialize + Send;
}

#[async_trait]
pub trait ListResources: ResourceKind {
    type Request: DeserializeOwned + Send + Sync;

    async fn list(&self, ctx: &Context, request: Self::Request) -> Result<List<Self::Item>>;
}

#[async_trait]
pub trait GetResource: ResourceKind {
    async fn get(&self, ctx: &Context, id: &Self::Id) -> Result<Self::Item>;
}

#[async_trait]
pub trait CreateResource: ResourceKind {
    type Meta: DeserializeOwned + Send + Sync;

    async fn create(&self, ctx: &Context, meta: Self::Meta) -> Result<Self::Item>;
}

#[async_trait]
pub trait UpdateResource: CreateResource {
    /// Apply `meta` to the resource; fields left out of `meta` are unchanged
    async fn update(&self, ctx: &Context, id: &Self::Id, meta: Self::Meta) -> Result<Self::Item>;
}

#[async_trait]
pub trait DeleteResource: ResourceKind {
    async fn delete(&self, ctx: &Context, id: &Self::Id, force: bool) -> Result<Self::Item>;
}

/// Metadata of a resource that lives inside one database
pub trait DatabaseScoped {
    /// Place the resource in `database`; an explicit, different database is an error
    fn scope_to(&mut self, database: &str) -> Result<()>;
}

pub(crate) fn scope_field(field: &mut String, database: &str) -> Result<()> {
    if field.is_empty() {
        database.clone_into(field);
        Ok(())
    } else if field == database {
        Ok(())
    } else {
        Err(AdminError::bad_parameter(format!(
            "database '{field}' in the request body does not match '{database}'"
        )))
    }
}

/// All managers over one server connection
pub struct Catalog {
    pub databases: database::DatabaseManager,
    pub schemas: schema::SchemaManager,
    pub tablespaces: tablespace::TablespaceManager,
    pub roles: role::RoleManager,
    pub extensions: extension::ExtensionManager,
    pub slots: slot::SlotManager,
}

impl Catalog {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self {
            databases: database::DatabaseManager::new(exec.clone()),
            schemas: schema::SchemaManager::new(exec.clone()),
            tablespaces: tablespace::TablespaceManager::new(exec.clone()),
            roles: role::RoleManager::new(exec.clone()),
            extensions: extension::ExtensionManager::new(exec.clone()),
            slots: slot::SlotManager::new(exec),
        }
    }
}

/// Reject identifiers the server would refuse, truncate or reserve
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AdminError::bad_parameter("name must not be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(AdminError::bad_parameter(format!(
            "name '{name}' is longer than {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if name.contains('\0') {
        return Err(AdminError::bad_parameter("name must not contain NUL"));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(AdminError::bad_parameter(format!(
            "name '{name}' uses the reserved prefix '{RESERVED_PREFIX}'"
        )));
    }
    Ok(())
}

/// Quote an identifier
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for statements that take no parameters (DDL)
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A grantee as written in GRANT/REVOKE
#[must_use]
pub fn role_spec(role: &str) -> String {
    if role == PUBLIC {
        PUBLIC.to_string()
    } else {
        quote_ident(role)
    }
}

/// `COMMENT ON <object> IS ...`; an empty comment removes it
pub(crate) fn comment_statement(object: &str, comment: &str) -> Statement {
    if comment.is_empty() {
        Statement::new(format!("COMMENT ON {object} IS NULL"))
    } else {
        Statement::new(format!("COMMENT ON {object} IS {}", quote_literal(comment)))
    }
}

/// True when `desired` differs from the live comment (absent equals empty)
pub(crate) fn comment_changed(current: Option<&str>, desired: &str) -> bool {
    current.unwrap_or_default() != desired
}

/// Live grants from a `aclitem[]::text[]` column; NULL means no explicit grants
pub(crate) fn decode_acl(row: &Row, column: &str) -> Result<AclList> {
    AclList::from_native(&row.text_array(column))
        .map_err(|err| AdminError::internal(format!("unreadable ACL in column '{column}': {err}")))
}

/// Reject writes on a read-only connection
pub fn ensure_writable(readonly: bool) -> Result<()> {
    if readonly {
        Err(AdminError::not_available("connection is read-only"))
    } else {
        Ok(())
    }
}

/// `LIKE` pattern matching `needle` anywhere
pub(crate) fn contains_pattern(needle: &str) -> String {
    let escaped = needle.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{escaped}%")
}

/// `SELECT count(*)` over the rows of `base`
pub(crate) fn count_of(base: &Statement) -> Statement {
    Statement {
        sql: format!("SELECT count(*)::int8 AS count FROM ({}) AS matched", base.sql),
        params: base.params.clone(),
    }
}

/// `base` restricted to `limit` rows starting at `offset`
pub(crate) fn page_of(base: &Statement, offset: u64, limit: u64) -> Statement {
    let next = base.params.len() + 1;
    Statement {
        sql: format!("{} OFFSET ${} LIMIT ${}", base.sql, next, next + 1),
        params: base.params.iter().cloned().chain([Param::from(offset), Param::from(limit)]).collect(),
    }
}

async fn count_rows<Q: Queryable + ?Sized>(ctx: &Context, conn: &Q, base: &Statement) -> Result<u64> {
    let count = conn.query_one(ctx, &count_of(base)).await?.int("count")?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Count and page an ordered `base` query
pub(crate) async fn list_paged<Q, T, F>(
    ctx: &Context,
    conn: &Q,
    base: &Statement,
    offset: u64,
    limit: u64,
    decode: F,
) -> Result<List<T>>
where
    Q: Queryable + ?Sized,
    F: Fn(&Row) -> Result<T> + Send + Sync,
{
    let count = count_rows(ctx, conn, base).await?;
    if offset >= count || limit == 0 {
        return Ok(List { count, body: Vec::new() });
    }

    let rows = conn.query(ctx, &page_of(base, offset, limit)).await?;
    let body = rows.iter().map(decode).collect::<Result<Vec<_>>>()?;
    Ok(List { count, body })
}

/// Offer the matching rows of one partition to `window`, fetching only the page slice
pub(crate) async fn list_into_window<Q, T, F>(
    ctx: &Context,
    conn: &Q,
    base: &Statement,
    window: &mut PageWindow<T>,
    decode: F,
) -> Result<u64>
where
    Q: Queryable + ?Sized,
    T: Send,
    F: Fn(&Row) -> Result<T> + Send + Sync,
{
    let matched = count_rows(ctx, conn, base).await?;

    match window.slice(matched) {
        Some((skip, take)) => {
            let rows = conn.query(ctx, &page_of(base, skip, take)).await?;
            let items = rows.iter().map(decode).collect::<Result<Vec<_>>>()?;
            window.absorb(matched, skip, items);
        }
        None => window.absorb(matched, matched, Vec::new()),
    }

    Ok(matched)
}

/// Databases federated listings visit: connectable, non-template, by name
pub(crate) async fn list_partitions<Q: Queryable + ?Sized>(ctx: &Context, conn: &Q) -> Result<Vec<String>> {
    let rows = conn
        .query(
            ctx,
            &Statement::new(
                "SELECT datname::text AS name FROM pg_catalog.pg_database
                 WHERE datallowconn AND NOT datistemplate
                 ORDER BY datname",
            ),
        )
        .await?;
    rows.iter().map(|row| row.text("name")).collect()
}

/// Object types whose grants are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Database,
    Schema,
    Tablespace,
}

impl ObjectType {
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Database => "DATABASE",
            Self::Schema => "SCHEMA",
            Self::Tablespace => "TABLESPACE",
        }
    }
}

/// GRANT/REVOKE statements for one named object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantTarget {
    object: ObjectType,
    name: String,
}

impl GrantTarget {
    pub fn new(object: ObjectType, name: impl Into<String>) -> Self {
        Self { object, name: name.into() }
    }

    fn on(&self) -> String {
        format!("ON {} {}", self.object.keyword(), quote_ident(&self.name))
    }
}

impl AclStatements for GrantTarget {
    fn grant(&self, role: &str, privileges: &[String]) -> Vec<Statement> {
        let mut plain = Vec::new();
        let mut with_option = Vec::new();
        for privilege in privileges {
            match split_grant_option(privilege) {
                (base, true) => with_option.push(base),
                (base, false) => plain.push(base),
            }
        }

        let mut statements = Vec::new();
        if !plain.is_empty() {
            statements.push(Statement::new(format!(
                "GRANT {} {} TO {}",
                plain.join(", "),
                self.on(),
                role_spec(role)
            )));
        }
        if !with_option.is_empty() {
            statements.push(Statement::new(format!(
                "GRANT {} {} TO {} WITH GRANT OPTION",
                with_option.join(", "),
                self.on(),
                role_spec(role)
            )));
        }
        statements
    }

    fn revoke(&self, role: &str, privileges: &[String]) -> Vec<Statement> {
        let mut bases: Vec<&str> = Vec::new();
        for privilege in privileges {
            let (base, _) = split_grant_option(privilege);
            if !bases.contains(&base) {
                bases.push(base);
            }
        }
        if bases.is_empty() {
            return Vec::new();
        }

        vec![Statement::new(format!("REVOKE {} {} FROM {}", bases.join(", "), self.on(), role_spec(role)))]
    }

    fn grant_all(&self, role: &str) -> Statement {
        Statement::new(format!("GRANT ALL {} TO {}", self.on(), role_spec(role)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn privs(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| (*p).to_string()).collect()
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("app").is_ok());
        assert!(validate_name(&"a".repeat(63)).is_ok());

        for bad in ["", "pg_app", "a\0b"] {
            assert_eq!(validate_name(bad).unwrap_err().error_code(), "BAD_PARAMETER", "{bad:?}");
        }
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("my \"db\""), "\"my \"\"db\"\"\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(role_spec("PUBLIC"), "PUBLIC");
        assert_eq!(role_spec("app"), "\"app\"");
    }

    #[test]
    fn test_contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("a_b%"), "%a\\_b\\%%");
    }

    #[test]
    fn test_page_statement_numbers_parameters() {
        let base = Statement::new("SELECT name FROM t WHERE name LIKE $1 ORDER BY name").bind("%a%");
        let page = page_of(&base, 20, 10);
        assert_eq!(page.sql, "SELECT name FROM t WHERE name LIKE $1 ORDER BY name OFFSET $2 LIMIT $3");
        assert_eq!(page.params, vec![Param::from("%a%"), Param::Int(20), Param::Int(10)]);

        let count = count_of(&base);
        assert!(count.sql.starts_with("SELECT count(*)::int8 AS count FROM (SELECT name"));
        assert_eq!(count.params.len(), 1);
    }

    #[test]
    fn test_list_request_defaults() {
        let request: ListRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request, ListRequest::default());
        assert_eq!(request.limit, DEFAULT_LIMIT);

        let request: PartitionedListRequest =
            serde_json::from_str(r#"{"database":"app","offset":5}"#).unwrap();
        assert_eq!(request.database.as_deref(), Some("app"));
        assert_eq!(request.offset, 5);
        assert_eq!(request.limit, DEFAULT_LIMIT);
    }

    #[test]
    fn test_grant_splits_grant_option() {
        let target = GrantTarget::new(ObjectType::Database, "app");
        let sql: Vec<String> = target
            .grant("ops team", &privs(&["CONNECT", "CREATE WITH GRANT OPTION", "TEMPORARY"]))
            .into_iter()
            .map(|s| s.sql)
            .collect();

        assert_eq!(
            sql,
            vec![
                "GRANT CONNECT, TEMPORARY ON DATABASE \"app\" TO \"ops team\"",
                "GRANT CREATE ON DATABASE \"app\" TO \"ops team\" WITH GRANT OPTION",
            ]
        );
    }

    #[test]
    fn test_revoke_strips_grant_option() {
        let target = GrantTarget::new(ObjectType::Schema, "sales");
        let sql: Vec<String> = target
            .revoke("PUBLIC", &privs(&["USAGE WITH GRANT OPTION", "USAGE", "CREATE"]))
            .into_iter()
            .map(|s| s.sql)
            .collect();
        assert_eq!(sql, vec!["REVOKE USAGE, CREATE ON SCHEMA \"sales\" FROM PUBLIC"]);
    }

    #[test]
    fn test_grant_all() {
        let target = GrantTarget::new(ObjectType::Tablespace, "fast");
        assert_eq!(target.grant_all("app").sql, "GRANT ALL ON TABLESPACE \"fast\" TO \"app\"");
    }

    #[test]
    fn test_scope_to_database() {
        let mut meta = schema::SchemaMeta { name: "sales".to_string(), ..Default::default() };
        meta.scope_to("app").unwrap();
        assert_eq!(meta.database, "app");
        meta.scope_to("app").unwrap();

        let err = meta.scope_to("other").unwrap_err();
        assert_eq!(err.error_code(), "BAD_PARAMETER");
    }

    #[test]
    fn test_readonly_connection() {
        assert!(ensure_writable(false).is_ok());
        assert_eq!(ensure_writable(true).unwrap_err().error_code(), "NOT_AVAILABLE");
    }
}
