//! Schemas
//!
//! Schemas live inside one database and are managed through a connection scoped to
//! it. Listing visits every database (see [`crate::federation`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::acl::AclList;
use crate::context::Context;
use crate::error::{AdminError, Result};
use crate::executor::{Executor, Row, Statement};
use crate::federation::{list_federated, PageWindow, PartitionLister};
use crate::lifecycle::{self, AclManaged, Managed};

use super::{
    comment_changed, comment_statement, contains_pattern, decode_acl, list_into_window,
    list_partitions, quote_ident, scope_field, validate_name, CreateResource, DatabaseScoped,
    DeleteResource, GetResource, GrantTarget, List, ListResources, ObjectType,
    PartitionedListRequest, ResourceKind, ScopedName, UpdateResource,
};

const SELECT: &str = "SELECT current_database()::text AS database,
       n.nspname::text AS name,
       pg_catalog.pg_get_userbyid(n.nspowner)::text AS owner,
       pg_catalog.obj_description(n.oid, 'pg_namespace') AS comment,
       n.nspacl::text[] AS acl
FROM pg_catalog.pg_namespace n";

/// A schema as reported by its database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub database: String,
    pub name: String,
    pub owner: String,
    pub comment: Option<String>,
    pub acl: AclList,
}

/// Desired schema state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaMeta {
    pub database: String,
    pub name: String,
    pub owner: Option<String>,
    pub comment: Option<String>,
    pub acl: Option<AclList>,
}

pub struct SchemaManager {
    exec: Arc<dyn Executor>,
}

impl SchemaManager {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }

    fn list_statement(name: Option<&str>) -> Statement {
        Statement::new(format!(
            "{SELECT}
             WHERE n.nspname NOT LIKE 'pg\\_%' AND n.nspname <> 'information_schema'
               AND ($1::text IS NULL OR n.nspname LIKE $1)
             ORDER BY n.nspname"
        ))
        .bind(name.map(contains_pattern))
    }
}

fn object(name: &str) -> String {
    format!("SCHEMA {}", quote_ident(name))
}

impl Managed for SchemaManager {
    type Resource = Schema;

    fn kind(&self) -> &'static str {
        "schema"
    }

    fn select(&self, name: &str) -> Statement {
        Statement::new(format!("{SELECT} WHERE n.nspname = $1")).bind(name)
    }

    fn decode(&self, row: &Row) -> Result<Schema> {
        Ok(Schema {
            database: row.text("database")?,
            name: row.text("name")?,
            owner: row.text("owner")?,
            comment: row.opt_text("comment"),
            acl: decode_acl(row, "acl")?,
        })
    }

    fn drop_statements(&self, name: &str, force: bool) -> Vec<Statement> {
        let cascade = if force { " CASCADE" } else { "" };
        vec![Statement::new(format!("DROP SCHEMA {}{cascade}", quote_ident(name)))]
    }
}

impl AclManaged for SchemaManager {
    type Meta = SchemaMeta;
    type Target = GrantTarget;

    fn name_of<'a>(&self, meta: &'a SchemaMeta) -> &'a str {
        &meta.name
    }

    fn acl_of<'a>(&self, meta: &'a SchemaMeta) -> Option<&'a AclList> {
        meta.acl.as_ref()
    }

    fn current_acl(&self, resource: &Schema) -> AclList {
        resource.acl.clone()
    }

    fn validate(&self, meta: &SchemaMeta) -> Result<()> {
        if meta.database.is_empty() {
            return Err(AdminError::bad_parameter("schema database must not be empty"));
        }
        validate_name(&meta.name)
    }

    fn create_statement(&self, meta: &SchemaMeta) -> Result<Statement> {
        let mut sql = format!("CREATE SCHEMA {}", quote_ident(&meta.name));
        if let Some(owner) = &meta.owner {
            sql.push_str(&format!(" AUTHORIZATION {}", quote_ident(owner)));
        }
        Ok(Statement::new(sql))
    }

    fn post_create_statements(&self, meta: &SchemaMeta) -> Vec<Statement> {
        match &meta.comment {
            Some(comment) if !comment.is_empty() => {
                vec![comment_statement(&object(&meta.name), comment)]
            }
            _ => Vec::new(),
        }
    }

    fn update_statements(&self, current: &Schema, meta: &SchemaMeta) -> Result<Vec<Statement>> {
        if meta.database != current.database {
            return Err(AdminError::bad_parameter("a schema cannot move to another database"));
        }

        let mut statements = Vec::new();
        if meta.name != current.name {
            statements.push(Statement::new(format!(
                "ALTER SCHEMA {} RENAME TO {}",
                quote_ident(&current.name),
                quote_ident(&meta.name)
            )));
        }
        if let Some(owner) = meta.owner.as_ref().filter(|o| **o != current.owner) {
            statements.push(Statement::new(format!(
                "ALTER SCHEMA {} OWNER TO {}",
                quote_ident(&meta.name),
                quote_ident(owner)
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
        GrantTarget::new(ObjectType::Schema, name)
    }
}

/// Schemas of every database, filtered by name
struct SchemaPartitions<'a> {
    manager: &'a SchemaManager,
    name: Option<String>,
}

#[async_trait]
impl PartitionLister for SchemaPartitions<'_> {
    type Item = Schema;

    async fn partitions(&self, ctx: &Context) -> Result<Vec<String>> {
        list_partitions(ctx, &*self.manager.exec).await
    }

    async fn list_partition(
        &self,
        ctx: &Context,
        partition: &str,
        window: &mut PageWindow<Schema>,
    ) -> Result<u64> {
        let conn = self.manager.exec.scoped(ctx, partition).await?;
        let base = SchemaManager::list_statement(self.name.as_deref());
        list_into_window(ctx, &*conn, &base, window, |row| self.manager.decode(row)).await
    }
}

impl ResourceKind for SchemaManager {
    const KIND: &'static str = "schema";
    type Id = ScopedName;
    type Item = Schema;
}

#[async_trait]
impl ListResources for SchemaManager {
    type Request = PartitionedListRequest;

    async fn list(&self, ctx: &Context, request: PartitionedListRequest) -> Result<List<Schema>> {
        let lister = SchemaPartitions { manager: self, name: request.name };
        list_federated(ctx, &lister, request.database.as_deref(), request.offset, request.limit).await
    }
}

#[async_trait]
impl GetResource for SchemaManager {
    async fn get(&self, ctx: &Context, id: &ScopedName) -> Result<Schema> {
        let conn = self.exec.scoped(ctx, &id.database).await?;
        lifecycle::fetch(ctx, self, &*conn, &id.name).await
    }
}

#[async_trait]
impl CreateResource for SchemaManager {
    type Meta = SchemaMeta;

    async fn create(&self, ctx: &Context, meta: SchemaMeta) -> Result<Schema> {
        self.validate(&meta)?;
        let conn = self.exec.scoped(ctx, &meta.database).await?;
        lifecycle::create(ctx, self, &*conn, &meta).await
    }
}

#[async_trait]
impl UpdateResource for SchemaManager {
    async fn update(&self, ctx: &Context, id: &ScopedName, mut meta: SchemaMeta) -> Result<Schema> {
        if meta.database.is_empty() {
            meta.database.clone_from(&id.database);
        }
        if meta.name.is_empty() {
            meta.name.clone_from(&id.name);
        }
        let conn = self.exec.scoped(ctx, &id.database).await?;
        lifecycle::update(ctx, self, &*conn, &id.name, &meta).await
    }
}

#[async_trait]
impl DeleteResource for SchemaManager {
    async fn delete(&self, ctx: &Context, id: &ScopedName, force: bool) -> Result<Schema> {
        let conn = self.exec.scoped(ctx, &id.database).await?;
        lifecycle::delete(ctx, self, &*conn, &id.name, force).await
    }
}

impl DatabaseScoped for SchemaMeta {
    fn scope_to(&mut self, database: &str) -> Result<()> {
        scope_field(&mut self.database, database)
    }
}
