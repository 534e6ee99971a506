//! Databases
//!
//! `CREATE DATABASE` cannot run inside a transaction block, so creation goes through
//! the compensating path in [`crate::lifecycle`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::acl::AclList;
use crate::context::Context;
use crate::error::{AdminError, Result};
use crate::executor::{Executor, Row, Statement};
use crate::lifecycle::{self, AclManaged, Managed};

use super::{
    comment_changed, comment_statement, contains_pattern, decode_acl, list_paged, quote_ident,
    quote_literal, CreateResource, DeleteResource, GetResource, GrantTarget, List, ListRequest,
    ListResources, ObjectName, ObjectType, ResourceKind, UpdateResource,
};

const SELECT: &str = "SELECT d.datname::text AS name,
       pg_catalog.pg_get_userbyid(d.datdba)::text AS owner,
       pg_catalog.pg_encoding_to_char(d.encoding)::text AS encoding,
       d.datcollate::text AS collation,
       d.datctype::text AS ctype,
       t.spcname::text AS tablespace,
       d.datconnlimit::int8 AS connection_limit,
       d.datallowconn AS allow_connections,
       d.datistemplate AS is_template,
       CASE WHEN pg_catalog.has_database_privilege(d.oid, 'CONNECT')
            THEN pg_catalog.pg_database_size(d.oid) END AS size_bytes,
       pg_catalog.shobj_description(d.oid, 'pg_database') AS comment,
       d.datacl::text[] AS acl
FROM pg_catalog.pg_database d
JOIN pg_catalog.pg_tablespace t ON t.oid = d.dattablespace";

/// A database as reported by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub owner: String,
    pub encoding: String,
    pub collation: String,
    pub ctype: String,
    pub tablespace: String,
    /// `-1` for no limit
    pub connection_limit: i64,
    pub allow_connections: bool,
    pub is_template: bool,
    /// Absent when the connected user may not connect to the database
    pub size_bytes: Option<i64>,
    pub comment: Option<String>,
    pub acl: AclList,
}

/// Desired database state; absent fields keep their current or server default value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseMeta {
    pub name: String,
    pub owner: Option<String>,
    /// Creation only
    pub template: Option<String>,
    /// Creation only
    pub encoding: Option<String>,
    /// Creation only
    pub collation: Option<String>,
    /// Creation only
    pub ctype: Option<String>,
    /// Creation only
    pub tablespace: Option<String>,
    pub connection_limit: Option<i64>,
    pub allow_connections: Option<bool>,
    pub is_template: Option<bool>,
    pub comment: Option<String>,
    pub acl: Option<AclList>,
}

pub struct DatabaseManager {
    exec: Arc<dyn Executor>,
}

impl DatabaseManager {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }
}

fn object(name: &str) -> String {
    format!("DATABASE {}", quote_ident(name))
}

fn immutable<T: PartialEq>(field: &str, current: &T, desired: Option<&T>) -> Result<()> {
    match desired {
        Some(desired) if desired != current => Err(AdminError::bad_parameter(format!(
            "{field} of an existing database cannot be changed"
        ))),
        _ => Ok(()),
    }
}

impl Managed for DatabaseManager {
    type Resource = Database;

    fn kind(&self) -> &'static str {
        "database"
    }

    fn select(&self, name: &str) -> Statement {
        Statement::new(format!("{SELECT} WHERE d.datname = $1")).bind(name)
    }

    fn decode(&self, row: &Row) -> Result<Database> {
        Ok(Database {
            name: row.text("name")?,
            owner: row.text("owner")?,
            encoding: row.text("encoding")?,
            collation: row.text("collation")?,
            ctype: row.text("ctype")?,
            tablespace: row.text("tablespace")?,
            connection_limit: row.int("connection_limit")?,
            allow_connections: row.flag("allow_connections"),
            is_template: row.flag("is_template"),
            size_bytes: row.opt_int("size_bytes"),
            comment: row.opt_text("comment"),
            acl: decode_acl(row, "acl")?,
        })
    }

    fn drop_statements(&self, name: &str, force: bool) -> Vec<Statement> {
        let mut sql = format!("DROP DATABASE {}", quote_ident(name));
        if force {
            sql.push_str(" WITH (FORCE)");
        }
        vec![Statement::new(sql)]
    }
}

impl AclManaged for DatabaseManager {
    type Meta = DatabaseMeta;
    type Target = GrantTarget;

    fn name_of<'a>(&self, meta: &'a DatabaseMeta) -> &'a str {
        &meta.name
    }

    fn acl_of<'a>(&self, meta: &'a DatabaseMeta) -> Option<&'a AclList> {
        meta.acl.as_ref()
    }

    fn current_acl(&self, resource: &Database) -> AclList {
        resource.acl.clone()
    }

    fn create_statement(&self, meta: &DatabaseMeta) -> Result<Statement> {
        let mut sql = format!("CREATE DATABASE {}", quote_ident(&meta.name));
        if let Some(owner) = &meta.owner {
            sql.push_str(&format!(" OWNER {}", quote_ident(owner)));
        }
        if let Some(template) = &meta.template {
            sql.push_str(&format!(" TEMPLATE {}", quote_ident(template)));
        }
        if let Some(encoding) = &meta.encoding {
            sql.push_str(&format!(" ENCODING {}", quote_literal(encoding)));
        }
        if let Some(collation) = &meta.collation {
            sql.push_str(&format!(" LC_COLLATE {}", quote_literal(collation)));
        }
        if let Some(ctype) = &meta.ctype {
            sql.push_str(&format!(" LC_CTYPE {}", quote_literal(ctype)));
        }
        if let Some(tablespace) = &meta.tablespace {
            sql.push_str(&format!(" TABLESPACE {}", quote_ident(tablespace)));
        }
        if let Some(allow) = meta.allow_connections {
            sql.push_str(&format!(" ALLOW_CONNECTIONS {allow}"));
        }
        if let Some(limit) = meta.connection_limit {
            if limit < -1 {
                return Err(AdminError::bad_parameter("connection_limit must be -1 or greater"));
            }
            sql.push_str(&format!(" CONNECTION LIMIT {limit}"));
        }
        if let Some(is_template) = meta.is_template {
            sql.push_str(&format!(" IS_TEMPLATE {is_template}"));
        }
        Ok(Statement::new(sql))
    }

    fn post_create_statements(&self, meta: &DatabaseMeta) -> Vec<Statement> {
        match &meta.comment {
            Some(comment) if !comment.is_empty() => {
                vec![comment_statement(&object(&meta.name), comment)]
            }
            _ => Vec::new(),
        }
    }

    fn update_statements(&self, current: &Database, meta: &DatabaseMeta) -> Result<Vec<Statement>> {
        immutable("encoding", &current.encoding, meta.encoding.as_ref())?;
        immutable("collation", &current.collation, meta.collation.as_ref())?;
        immutable("ctype", &current.ctype, meta.ctype.as_ref())?;
        immutable("tablespace", &current.tablespace, meta.tablespace.as_ref())?;

        let mut statements = Vec::new();
        if meta.name != current.name {
            statements.push(Statement::new(format!(
                "ALTER DATABASE {} RENAME TO {}",
                quote_ident(&current.name),
                quote_ident(&meta.name)
            )));
        }

        let name = quote_ident(&meta.name);
        if let Some(owner) = meta.owner.as_ref().filter(|o| **o != current.owner) {
            statements.push(Statement::new(format!(
                "ALTER DATABASE {name} OWNER TO {}",
                quote_ident(owner)
            )));
        }
        if let Some(limit) = meta.connection_limit.filter(|l| *l != current.connection_limit) {
            if limit < -1 {
                return Err(AdminError::bad_parameter("connection_limit must be -1 or greater"));
            }
            statements.push(Statement::new(format!(
                "ALTER DATABASE {name} WITH CONNECTION LIMIT {limit}"
            )));
        }
        if let Some(allow) = meta.allow_connections.filter(|a| *a != current.allow_connections) {
            statements.push(Statement::new(format!(
                "ALTER DATABASE {name} WITH ALLOW_CONNECTIONS {allow}"
            )));
        }
        if let Some(is_template) = meta.is_template.filter(|t| *t != current.is_template) {
            statements.push(Statement::new(format!(
                "ALTER DATABASE {name} WITH IS_TEMPLATE {is_template}"
            )));
        }
        if let Some(comment) = &meta.comment {
            if comment_changed(current.comment.as_deref(), comment) {
                statements.push(comment_statement(&object(&meta.name), comment));
            }
        }

        Ok(statements)
    }

    fn acl_target(&self, name: &str) -> GrantTarget {
        GrantTarget::new(ObjectType::Database, name)
    }
}

impl ResourceKind for DatabaseManager {
    const KIND: &'static str = "database";
    type Id = ObjectName;
    type Item = Database;
}

#[async_trait]
impl ListResources for DatabaseManager {
    type Request = ListRequest;

    async fn list(&self, ctx: &Context, request: ListRequest) -> Result<List<Database>> {
        let base = Statement::new(format!(
            "{SELECT} WHERE ($1::text IS NULL OR d.datname LIKE $1) ORDER BY d.datname"
        ))
        .bind(request.name.as_deref().map(contains_pattern));

        list_paged(ctx, &*self.exec, &base, request.offset, request.limit, |row| self.decode(row))
            .await
    }
}

#[async_trait]
impl GetResource for DatabaseManager {
    async fn get(&self, ctx: &Context, id: &ObjectName) -> Result<Database> {
        lifecycle::fetch(ctx, self, &*self.exec, &id.name).await
    }
}

#[async_trait]
impl CreateResource for DatabaseManager {
    type Meta = DatabaseMeta;

    async fn create(&self, ctx: &Context, meta: DatabaseMeta) -> Result<Database> {
        lifecycle::create(ctx, self, &*self.exec, &meta).await
    }
}

#[async_trait]
impl UpdateResource for DatabaseManager {
    async fn update(&self, ctx: &Context, id: &ObjectName, mut meta: DatabaseMeta) -> Result<Database> {
        if meta.name.is_empty() {
            meta.name.clone_from(&id.name);
        }
        lifecycle::update(ctx, self, &*self.exec, &id.name, &meta).await
    }
}

#[async_trait]
impl DeleteResource for DatabaseManager {
    async fn delete(&self, ctx: &Context, id: &ObjectName, force: bool) -> Result<Database> {
        lifecycle::delete(ctx, self, &*self.exec, &id.name, force).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::postgres::PgExecutor;
    use crate::resource::testing::{offline, sql};
    use pretty_assertions::assert_eq;

    fn current() -> Database {
        Database {
            name: "app".to_string(),
            owner: "postgres".to_string(),
            encoding: "UTF8".to_string(),
            collation: "C".to_string(),
            ctype: "C".to_string(),
            tablespace: "pg_default".to_string(),
            connection_limit: -1,
            allow_connections: true,
            is_template: false,
            size_bytes: Some(7_000_000),
            comment: None,
            acl: AclList::new(),
        }
    }

    fn manager() -> DatabaseManager {
        DatabaseManager::new(offline())
    }

    #[test]
    fn test_create_statement_options() {
        let meta = DatabaseMeta {
            name: "app".to_string(),
            owner: Some("app_owner".to_string()),
            template: Some("template0".to_string()),
            encoding: Some("UTF8".to_string()),
            connection_limit: Some(20),
            ..DatabaseMeta::default()
        };
        assert_eq!(
            manager().create_statement(&meta).unwrap().sql,
            "CREATE DATABASE \"app\" OWNER \"app_owner\" TEMPLATE \"template0\" ENCODING 'UTF8' CONNECTION LIMIT 20"
        );
    }

    #[test]
    fn test_rename_comes_first() {
        let meta = DatabaseMeta {
            name: "app2".to_string(),
            owner: Some("ops".to_string()),
            comment: Some("billing".to_string()),
            ..DatabaseMeta::default()
        };
        assert_eq!(
            sql(manager().update_statements(&current(), &meta).unwrap()),
            vec![
                "ALTER DATABASE \"app\" RENAME TO \"app2\"",
                "ALTER DATABASE \"app2\" OWNER TO \"ops\"",
                "COMMENT ON DATABASE \"app2\" IS 'billing'",
            ]
        );
    }

    #[test]
    fn test_unchanged_meta_updates_nothing() {
        let meta = DatabaseMeta {
            name: "app".to_string(),
            owner: Some("postgres".to_string()),
            encoding: Some("UTF8".to_string()),
            connection_limit: Some(-1),
            allow_connections: Some(true),
            comment: Some(String::new()),
            ..DatabaseMeta::default()
        };
        assert!(manager().update_statements(&current(), &meta).unwrap().is_empty());
    }

    #[test]
    fn test_encoding_is_immutable() {
        let meta = DatabaseMeta {
            name: "app".to_string(),
            encoding: Some("LATIN1".to_string()),
            ..DatabaseMeta::default()
        };
        let err = manager().update_statements(&current(), &meta).unwrap_err();
        assert_eq!(err.error_code(), "BAD_PARAMETER");
    }

    #[test]
    fn test_drop_force() {
        assert_eq!(
            sql(manager().drop_statements("app", true)),
            vec!["DROP DATABASE \"app\" WITH (FORCE)"]
        );
    }

    #[test]
    fn test_decode_row() {
        let row = Row::new()
            .with("name", "app")
            .with("owner", "postgres")
            .with("encoding", "UTF8")
            .with("collation", "C")
            .with("ctype", "C")
            .with("tablespace", "pg_default")
            .with("connection_limit", -1)
            .with("allow_connections", true)
            .with("is_template", false)
            .with("size_bytes", 7_000_000)
            .with("comment", serde_json::Value::Null)
            .with("acl", serde_json::json!(["=Tc/postgres", "postgres=CTc/postgres"]));

        let database = manager().decode(&row).unwrap();
        assert_eq!(database.acl.len(), 2);
        assert_eq!(database, Database { acl: database.acl.clone(), ..current() });
    }

    #[tokio::test]
    #[ignore] // Requires PGCTL_TEST_HOST
    async fn test_live_list() {
        let Ok(host) = std::env::var("PGCTL_TEST_HOST") else { return };
        let config = crate::config::ConnectionConfig {
            host: Some(host),
            user: Some("postgres".to_string()),
            ..Default::default()
        };
        let ctx = Context::background();
        let exec = PgExecutor::connect(&ctx, &config).await.unwrap();
        let manager = DatabaseManager::new(Arc::new(exec));
        let list = manager.list(&ctx, ListRequest::default()).await.unwrap();
        assert!(list.count >= 1);
    }
}
