//! Extensions
//!
//! Extensions are installed per database. Installing one the server does not ship
//! fails with `NotAvailable` before anything is changed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::context::Context;
use crate::error::{AdminError, Result};
use crate::executor::{finish, Executor, Queryable, Row, Statement};
use crate::federation::{list_federated, PageWindow, PartitionLister};
use crate::lifecycle::{self, Managed};

use super::{
    contains_pattern, list_into_window, list_partitions, quote_ident, quote_literal, scope_field,
    CreateResource, DatabaseScoped, DeleteResource, GetResource, List, ListResources,
    PartitionedListRequest, ResourceKind, ScopedName, UpdateResource, MAX_IDENTIFIER_LEN,
};

const SELECT: &str = "SELECT current_database()::text AS database,
       e.extname::text AS name,
       e.extversion AS version,
       n.nspname::text AS schema,
       e.extrelocatable AS relocatable,
       pg_catalog.obj_description(e.oid, 'pg_extension') AS comment
FROM pg_catalog.pg_extension e
JOIN pg_catalog.pg_namespace n ON n.oid = e.extnamespace";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub database: String,
    pub name: String,
    pub version: String,
    pub schema: String,
    pub relocatable: bool,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionMeta {
    pub database: String,
    pub name: String,
    /// Latest available when absent on create; unchanged when absent on update
    pub version: Option<String>,
    pub schema: Option<String>,
    /// Also install required extensions (create only)
    pub cascade: bool,
}

pub struct ExtensionManager {
    exec: Arc<dyn Executor>,
}

impl ExtensionManager {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }

    fn list_statement(name: Option<&str>) -> Statement {
        Statement::new(format!(
            "{SELECT} WHERE ($1::text IS NULL OR e.extname LIKE $1) ORDER BY e.extname"
        ))
        .bind(name.map(contains_pattern))
    }

    /// Fail with `NotAvailable` unless the server ships `name` (at `version`)
    async fn ensure_available<Q: Queryable + ?Sized>(
        ctx: &Context,
        conn: &Q,
        name: &str,
        version: Option<&str>,
    ) -> Result<()> {
        let stmt = Statement::new(
            "SELECT 1 AS available FROM pg_catalog.pg_available_extension_versions
             WHERE name = $1 AND ($2::text IS NULL OR version = $2)",
        )
        .bind(name)
        .bind(version);

        if conn.query(ctx, &stmt).await?.is_empty() {
            return Err(AdminError::not_available(match version {
                Some(version) => format!("extension '{name}' version '{version}' is not available"),
                None => format!("extension '{name}' is not available on this server"),
            }));
        }
        Ok(())
    }

    fn create_statement(meta: &ExtensionMeta) -> Statement {
        let mut sql = format!("CREATE EXTENSION {}", quote_ident(&meta.name));
        if let Some(schema) = &meta.schema {
            sql.push_str(&format!(" SCHEMA {}", quote_ident(schema)));
        }
        if let Some(version) = &meta.version {
            sql.push_str(&format!(" VERSION {}", quote_literal(version)));
        }
        if meta.cascade {
            sql.push_str(" CASCADE");
        }
        Statement::new(sql)
    }

    fn update_statements(current: &Extension, meta: &ExtensionMeta) -> Result<Vec<Statement>> {
        if meta.name != current.name {
            return Err(AdminError::bad_parameter("extensions cannot be renamed"));
        }
        if meta.database != current.database {
            return Err(AdminError::bad_parameter("an extension cannot move to another database"));
        }

        let name = quote_ident(&current.name);
        let mut statements = Vec::new();
        if let Some(version) = meta.version.as_ref().filter(|v| **v != current.version) {
            statements.push(Statement::new(format!(
                "ALTER EXTENSION {name} UPDATE TO {}",
                quote_literal(version)
            )));
        }
        if let Some(schema) = meta.schema.as_ref().filter(|s| **s != current.schema) {
            if !current.relocatable {
                return Err(AdminError::bad_parameter(format!(
                    "extension '{}' is not relocatable",
                    current.name
                )));
            }
            statements.push(Statement::new(format!(
                "ALTER EXTENSION {name} SET SCHEMA {}",
                quote_ident(schema)
            )));
        }
        Ok(statements)
    }
}

/// Extension names are shipped by the server and may use the `pg_` prefix
fn validate(meta: &ExtensionMeta) -> Result<()> {
    if meta.database.is_empty() {
        return Err(AdminError::bad_parameter("extension database must not be empty"));
    }
    if meta.name.is_empty() || meta.name.len() > MAX_IDENTIFIER_LEN || meta.name.contains('\0') {
        return Err(AdminError::bad_parameter(format!("invalid extension name '{}'", meta.name)));
    }
    Ok(())
}

impl Managed for ExtensionManager {
    type Resource = Extension;

    fn kind(&self) -> &'static str {
        "extension"
    }

    fn select(&self, name: &str) -> Statement {
        Statement::new(format!("{SELECT} WHERE e.extname = $1")).bind(name)
    }

    fn decode(&self, row: &Row) -> Result<Extension> {
        Ok(Extension {
            database: row.text("database")?,
            name: row.text("name")?,
            version: row.text("version")?,
            schema: row.text("schema")?,
            relocatable: row.flag("relocatable"),
            comment: row.opt_text("comment"),
        })
    }

    fn drop_statements(&self, name: &str, force: bool) -> Vec<Statement> {
        let cascade = if force { " CASCADE" } else { "" };
        vec![Statement::new(format!("DROP EXTENSION {}{cascade}", quote_ident(name)))]
    }
}

struct ExtensionPartitions<'a> {
    manager: &'a ExtensionManager,
    name: Option<String>,
}

#[async_trait]
impl PartitionLister for ExtensionPartitions<'_> {
    type Item = Extension;

    async fn partitions(&self, ctx: &Context) -> Result<Vec<String>> {
        list_partitions(ctx, &*self.manager.exec).await
    }

    async fn list_partition(
        &self,
        ctx: &Context,
        partition: &str,
        window: &mut PageWindow<Extension>,
    ) -> Result<u64> {
        let conn = self.manager.exec.scoped(ctx, partition).await?;
        let base = ExtensionManager::list_statement(self.name.as_deref());
        list_into_window(ctx, &*conn, &base, window, |row| self.manager.decode(row)).await
    }
}

impl ResourceKind for ExtensionManager {
    const KIND: &'static str = "extension";
    type Id = ScopedName;
    type Item = Extension;
}

#[async_trait]
impl ListResources for ExtensionManager {
    type Request = PartitionedListRequest;

    async fn list(&self, ctx: &Context, request: PartitionedListRequest) -> Result<List<Extension>> {
        let lister = ExtensionPartitions { manager: self, name: request.name };
        list_federated(ctx, &lister, request.database.as_deref(), request.offset, request.limit).await
    }
}

#[async_trait]
impl GetResource for ExtensionManager {
    async fn get(&self, ctx: &Context, id: &ScopedName) -> Result<Extension> {
        let conn = self.exec.scoped(ctx, &id.database).await?;
        lifecycle::fetch(ctx, self, &*conn, &id.name).await
    }
}

#[async_trait]
impl CreateResource for ExtensionManager {
    type Meta = ExtensionMeta;

    async fn create(&self, ctx: &Context, meta: ExtensionMeta) -> Result<Extension> {
        validate(&meta)?;
        let conn = self.exec.scoped(ctx, &meta.database).await?;
        Self::ensure_available(ctx, &*conn, &meta.name, meta.version.as_deref()).await?;

        let tx = conn.begin(ctx).await?;
        let outcome = tx.execute(ctx, &Self::create_statement(&meta)).await;
        finish(ctx, tx, outcome).await?;
        info!(kind = "extension", database = %meta.database, name = %meta.name, "created");

        lifecycle::fetch(ctx, self, &*conn, &meta.name).await
    }
}

#[async_trait]
impl UpdateResource for ExtensionManager {
    async fn update(&self, ctx: &Context, id: &ScopedName, mut meta: ExtensionMeta) -> Result<Extension> {
        if meta.database.is_empty() {
            meta.database.clone_from(&id.database);
        }
        if meta.name.is_empty() {
            meta.name.clone_from(&id.name);
        }
        validate(&meta)?;

        let conn = self.exec.scoped(ctx, &id.database).await?;
        if let Some(version) = &meta.version {
            Self::ensure_available(ctx, &*conn, &id.name, Some(version)).await?;
        }

        let tx = conn.begin(ctx).await?;
        let outcome = async {
            let current = lifecycle::fetch(ctx, self, &*tx, &id.name).await?;
            let statements = Self::update_statements(&current, &meta)?;
            for stmt in &statements {
                tx.execute(ctx, stmt).await?;
            }
            Ok::<_, AdminError>(statements.len())
        }
        .await;
        let writes = finish(ctx, tx, outcome).await?;
        if writes > 0 {
            info!(kind = "extension", database = %id.database, name = %id.name, writes, "updated");
        }

        lifecycle::fetch(ctx, self, &*conn, &id.name).await
    }
}

#[async_trait]
impl DeleteResource for ExtensionManager {
    async fn delete(&self, ctx: &Context, id: &ScopedName, force: bool) -> Result<Extension> {
        let conn = self.exec.scoped(ctx, &id.database).await?;
        lifecycle::delete(ctx, self, &*conn, &id.name, force).await
    }
}

impl DatabaseScoped for ExtensionMeta {
    fn scope_to(&mut self, database: &str) -> Result<()> {
        scope_field(&mut self.database, database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::sql;
    use pretty_assertions::assert_eq;

    fn current() -> Extension {
        Extension {
            database: "app".to_string(),
            name: "pg_trgm".to_string(),
            version: "1.5".to_string(),
            schema: "public".to_string(),
            relocatable: true,
            comment: None,
        }
    }

    #[test]
    fn test_pg_prefix_allowed() {
        let meta = ExtensionMeta {
            database: "app".to_string(),
            name: "pg_trgm".to_string(),
            ..ExtensionMeta::default()
        };
        assert!(validate(&meta).is_ok());
    }

    #[test]
    fn test_create_statement() {
        let meta = ExtensionMeta {
            database: "app".to_string(),
            name: "postgis_topology".to_string(),
            schema: Some("gis".to_string()),
            cascade: true,
            ..ExtensionMeta::default()
        };
        assert_eq!(
            ExtensionManager::create_statement(&meta).sql,
            "CREATE EXTENSION \"postgis_topology\" SCHEMA \"gis\" CASCADE"
        );
    }

    #[test]
    fn test_update_version_and_schema() {
        let meta = ExtensionMeta {
            database: "app".to_string(),
            name: "pg_trgm".to_string(),
            version: Some("1.6".to_string()),
            schema: Some("ext".to_string()),
            cascade: false,
        };
        assert_eq!(
            sql(ExtensionManager::update_statements(&current(), &meta).unwrap()),
            vec![
                "ALTER EXTENSION \"pg_trgm\" UPDATE TO '1.6'",
                "ALTER EXTENSION \"pg_trgm\" SET SCHEMA \"ext\"",
            ]
        );
    }

    #[test]
    fn test_rename_rejected() {
        let meta = ExtensionMeta {
            database: "app".to_string(),
            name: "trgm".to_string(),
            ..ExtensionMeta::default()
        };
        let err = ExtensionManager::update_statements(&current(), &meta).unwrap_err();
        assert_eq!(err.error_code(), "BAD_PARAMETER");
    }

    #[test]
    fn test_non_relocatable_schema_move_rejected() {
        let meta = ExtensionMeta {
            database: "app".to_string(),
            name: "pg_trgm".to_string(),
            schema: Some("ext".to_string()),
            ..ExtensionMeta::default()
        };
        let fixed = Extension { relocatable: false, ..current() };
        assert!(ExtensionManager::update_statements(&fixed, &meta).is_err());
    }
}
