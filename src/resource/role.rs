//! Roles
//!
//! Unlike databases, a role and all of its memberships can be created in one
//! transaction, so no compensation is involved.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::context::Context;
use crate::error::{AdminError, Result};
use crate::executor::{finish, Executor, Queryable, Row, Statement};
use crate::lifecycle::{self, Managed};

use super::{
    comment_changed, comment_statement, contains_pattern, list_paged, quote_ident, quote_literal,
    validate_name, CreateResource, DeleteResource, GetResource, List, ListRequest, ListResources,
    ObjectName, ResourceKind, UpdateResource,
};

const SELECT: &str = "SELECT r.rolname::text AS name,
       r.rolsuper AS superuser,
       r.rolinherit AS inherit,
       r.rolcreaterole AS create_role,
       r.rolcreatedb AS create_db,
       r.rolcanlogin AS login,
       r.rolreplication AS replication,
       r.rolbypassrls AS bypass_rls,
       r.rolconnlimit::int8 AS connection_limit,
       r.rolvaliduntil::text AS valid_until,
       ARRAY(SELECT g.rolname::text
             FROM pg_catalog.pg_auth_members m
             JOIN pg_catalog.pg_roles g ON g.oid = m.roleid
             WHERE m.member = r.oid
             ORDER BY g.rolname) AS member_of,
       pg_catalog.shobj_description(r.oid, 'pg_authid') AS comment
FROM pg_catalog.pg_roles r";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub superuser: bool,
    pub inherit: bool,
    pub create_role: bool,
    pub create_db: bool,
    pub login: bool,
    pub replication: bool,
    pub bypass_rls: bool,
    pub connection_limit: i64,
    pub valid_until: Option<String>,
    /// Roles this role is a member of
    pub member_of: Vec<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleMeta {
    pub name: String,
    /// Write-only; set on every update that carries it
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub superuser: Option<bool>,
    pub inherit: Option<bool>,
    pub create_role: Option<bool>,
    pub create_db: Option<bool>,
    pub login: Option<bool>,
    pub replication: Option<bool>,
    pub bypass_rls: Option<bool>,
    pub connection_limit: Option<i64>,
    /// Timestamp after which the password stops working; `infinity` for never
    pub valid_until: Option<String>,
    pub member_of: Option<Vec<String>>,
    pub comment: Option<String>,
}

pub struct RoleManager {
    exec: Arc<dyn Executor>,
}

impl RoleManager {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }
}

fn object(name: &str) -> String {
    format!("ROLE {}", quote_ident(name))
}

/// Attribute keywords for every flag `meta` sets to a value other than `current`
fn attribute_options(meta: &RoleMeta, current: Option<&Role>) -> Vec<&'static str> {
    let flags = [
        ("SUPERUSER", "NOSUPERUSER", meta.superuser, current.map(|r| r.superuser)),
        ("INHERIT", "NOINHERIT", meta.inherit, current.map(|r| r.inherit)),
        ("CREATEROLE", "NOCREATEROLE", meta.create_role, current.map(|r| r.create_role)),
        ("CREATEDB", "NOCREATEDB", meta.create_db, current.map(|r| r.create_db)),
        ("LOGIN", "NOLOGIN", meta.login, current.map(|r| r.login)),
        ("REPLICATION", "NOREPLICATION", meta.replication, current.map(|r| r.replication)),
        ("BYPASSRLS", "NOBYPASSRLS", meta.bypass_rls, current.map(|r| r.bypass_rls)),
    ];

    flags
        .into_iter()
        .filter_map(|(on, off, desired, current)| match desired {
            Some(desired) if Some(desired) != current => Some(if desired { on } else { off }),
            _ => None,
        })
        .collect()
}

fn options_clause(meta: &RoleMeta, current: Option<&Role>) -> Result<String> {
    let mut options: Vec<String> =
        attribute_options(meta, current).into_iter().map(str::to_string).collect();

    if let Some(limit) = meta.connection_limit {
        if limit < -1 {
            return Err(AdminError::bad_parameter("connection_limit must be -1 or greater"));
        }
        if current.map(|r| r.connection_limit) != Some(limit) {
            options.push(format!("CONNECTION LIMIT {limit}"));
        }
    }
    if let Some(password) = &meta.password {
        options.push(format!("PASSWORD {}", quote_literal(password)));
    }
    if let Some(valid_until) = &meta.valid_until {
        if current.and_then(|r| r.valid_until.as_ref()) != Some(valid_until) {
            options.push(format!("VALID UNTIL {}", quote_literal(valid_until)));
        }
    }
    Ok(options.join(" "))
}

impl Managed for RoleManager {
    type Resource = Role;

    fn kind(&self) -> &'static str {
        "role"
    }

    fn select(&self, name: &str) -> Statement {
        Statement::new(format!("{SELECT} WHERE r.rolname = $1")).bind(name)
    }

    fn decode(&self, row: &Row) -> Result<Role> {
        Ok(Role {
            name: row.text("name")?,
            superuser: row.flag("superuser"),
            inherit: row.flag("inherit"),
            create_role: row.flag("create_role"),
            create_db: row.flag("create_db"),
            login: row.flag("login"),
            replication: row.flag("replication"),
            bypass_rls: row.flag("bypass_rls"),
            connection_limit: row.int("connection_limit")?,
            valid_until: row.opt_text("valid_until"),
            member_of: row.text_array("member_of"),
            comment: row.opt_text("comment"),
        })
    }

    /// `force` first drops what the role owns in the connected database
    fn drop_statements(&self, name: &str, force: bool) -> Vec<Statement> {
        let mut statements = Vec::new();
        if force {
            statements.push(Statement::new(format!("DROP OWNED BY {}", quote_ident(name))));
        }
        statements.push(Statement::new(format!("DROP ROLE {}", quote_ident(name))));
        statements
    }
}

impl RoleManager {
    fn create_statements(&self, meta: &RoleMeta) -> Result<Vec<Statement>> {
        let options = options_clause(meta, None)?;
        let mut sql = format!("CREATE ROLE {}", quote_ident(&meta.name));
        if !options.is_empty() {
            sql.push_str(" WITH ");
            sql.push_str(&options);
        }

        let mut statements = vec![Statement::new(sql)];
        for group in meta.member_of.iter().flatten() {
            statements.push(Statement::new(format!(
                "GRANT {} TO {}",
                quote_ident(group),
                quote_ident(&meta.name)
            )));
        }
        if let Some(comment) = meta.comment.as_ref().filter(|c| !c.is_empty()) {
            statements.push(comment_statement(&object(&meta.name), comment));
        }
        Ok(statements)
    }

    fn update_statements(&self, current: &Role, meta: &RoleMeta) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        if meta.name != current.name {
            statements.push(Statement::new(format!(
                "ALTER ROLE {} RENAME TO {}",
                quote_ident(&current.name),
                quote_ident(&meta.name)
            )));
        }

        let name = quote_ident(&meta.name);
        let options = options_clause(meta, Some(current))?;
        if !options.is_empty() {
            statements.push(Statement::new(format!("ALTER ROLE {name} WITH {options}")));
        }

        if let Some(desired) = &meta.member_of {
            for group in current.member_of.iter().filter(|g| !desired.contains(g)) {
                statements.push(Statement::new(format!("REVOKE {} FROM {name}", quote_ident(group))));
            }
            for group in desired.iter().filter(|g| !current.member_of.contains(g)) {
                statements.push(Statement::new(format!("GRANT {} TO {name}", quote_ident(group))));
            }
        }

        if let Some(comment) = &meta.comment {
            if comment_changed(current.comment.as_deref(), comment) {
                statements.push(comment_statement(&object(&meta.name), comment));
            }
        }
        Ok(statements)
    }

    async fn run_all<Q: Queryable + ?Sized>(
        ctx: &Context,
        conn: &Q,
        statements: &[Statement],
    ) -> Result<()> {
        for stmt in statements {
            conn.execute(ctx, stmt).await?;
        }
        Ok(())
    }
}

impl ResourceKind for RoleManager {
    const KIND: &'static str = "role";
    type Id = ObjectName;
    type Item = Role;
}

#[async_trait]
impl ListResources for RoleManager {
    type Request = ListRequest;

    async fn list(&self, ctx: &Context, request: ListRequest) -> Result<List<Role>> {
        let base = Statement::new(format!(
            "{SELECT} WHERE r.rolname NOT LIKE 'pg\\_%'
               AND ($1::text IS NULL OR r.rolname LIKE $1)
             ORDER BY r.rolname"
        ))
        .bind(request.name.as_deref().map(contains_pattern));

        list_paged(ctx, &*self.exec, &base, request.offset, request.limit, |row| self.decode(row))
            .await
    }
}

#[async_trait]
impl GetResource for RoleManager {
    async fn get(&self, ctx: &Context, id: &ObjectName) -> Result<Role> {
        lifecycle::fetch(ctx, self, &*self.exec, &id.name).await
    }
}

#[async_trait]
impl CreateResource for RoleManager {
    type Meta = RoleMeta;

    async fn create(&self, ctx: &Context, meta: RoleMeta) -> Result<Role> {
        validate_name(&meta.name)?;
        let statements = self.create_statements(&meta)?;

        let tx = self.exec.begin(ctx).await?;
        let outcome = Self::run_all(ctx, &*tx, &statements).await;
        finish(ctx, tx, outcome).await?;
        info!(kind = "role", name = %meta.name, "created");

        lifecycle::fetch(ctx, self, &*self.exec, &meta.name).await
    }
}

#[async_trait]
impl UpdateResource for RoleManager {
    async fn update(&self, ctx: &Context, id: &ObjectName, mut meta: RoleMeta) -> Result<Role> {
        if meta.name.is_empty() {
            meta.name.clone_from(&id.name);
        }
        validate_name(&meta.name)?;

        let tx = self.exec.begin(ctx).await?;
        let outcome = async {
            let current = lifecycle::fetch(ctx, self, &*tx, &id.name).await?;
            let statements = self.update_statements(&current, &meta)?;
            Self::run_all(ctx, &*tx, &statements).await?;
            Ok::<_, AdminError>(statements.len())
        }
        .await;
        let writes = finish(ctx, tx, outcome).await?;
        if writes > 0 {
            info!(kind = "role", name = %id.name, new_name = %meta.name, writes, "updated");
        }

        lifecycle::fetch(ctx, self, &*self.exec, &meta.name).await
    }
}

#[async_trait]
impl DeleteResource for RoleManager {
    async fn delete(&self, ctx: &Context, id: &ObjectName, force: bool) -> Result<Role> {
        lifecycle::delete(ctx, self, &*self.exec, &id.name, force).await
    }
}
