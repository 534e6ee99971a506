//! Resource Lifecycle
//!
//! Create, update and delete for resources whose grants are reconciled from a
//! desired [`AclList`].
//!
//! # Create
//! The creating statement (e.g. `CREATE DATABASE`) cannot run inside a transaction,
//! so it runs first and on its own. Follow-up configuration (comment, grants) then
//! runs in one transaction. If that transaction fails, the new resource is dropped
//! again and the caller gets [`AdminError::RolledBack`], or
//! [`AdminError::RollbackFailed`] when the drop failed as well.
//!
//! # Update
//! One transaction end to end: read current state, apply attribute changes (rename
//! first), re-read under the new name, reconcile grants. A failure anywhere leaves
//! the resource as it was.
//!
//! # Delete
//! Fetch, then drop; the pre-deletion representation is returned.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::acl::reconcile::{reconcile, AclStatements};
use crate::acl::AclList;
use crate::context::Context;
use crate::error::{AdminError, Result};
use crate::executor::{finish, Executor, Queryable, Row, Statement};
use crate::resource::validate_name;

/// Budget for dropping a resource whose configuration failed
const COMPENSATION_TIMEOUT: Duration = Duration::from_secs(30);

/// A resource kind addressable by name on one connection
pub trait Managed: Send + Sync {
    type Resource: Send;

    /// Human-readable kind, e.g. `database`
    fn kind(&self) -> &'static str;

    /// Statement selecting exactly the resource called `name`
    fn select(&self, name: &str) -> Statement;

    fn decode(&self, row: &Row) -> Result<Self::Resource>;

    /// Statements removing the resource; `force` cascades or disconnects users
    fn drop_statements(&self, name: &str, force: bool) -> Vec<Statement>;
}

/// A resource kind with owner, desired grants and non-transactional creation
pub trait AclManaged: Managed {
    type Meta: Send + Sync;
    type Target: AclStatements;

    fn name_of<'a>(&self, meta: &'a Self::Meta) -> &'a str;

    /// Desired grants; `None` leaves live grants untouched
    fn acl_of<'a>(&self, meta: &'a Self::Meta) -> Option<&'a AclList>;

    /// Grants currently held on `resource`
    fn current_acl(&self, resource: &Self::Resource) -> AclList;

    fn validate(&self, meta: &Self::Meta) -> Result<()> {
        validate_name(self.name_of(meta))
    }

    /// The creating statement, run outside any transaction
    fn create_statement(&self, meta: &Self::Meta) -> Result<Statement>;

    /// Configuration run in the transaction after creation
    fn post_create_statements(&self, meta: &Self::Meta) -> Vec<Statement> {
        let _ = meta;
        Vec::new()
    }

    /// Changes from `current` to `meta`; a rename comes first and later
    /// statements address the new name. Empty when nothing differs.
    fn update_statements(&self, current: &Self::Resource, meta: &Self::Meta)
        -> Result<Vec<Statement>>;

    /// Grant/revoke statements for the resource called `name`
    fn acl_target(&self, name: &str) -> Self::Target;
}

/// Fetch one resource by name
pub async fn fetch<M, Q>(ctx: &Context, manager: &M, conn: &Q, name: &str) -> Result<M::Resource>
where
    M: Managed + ?Sized,
    Q: Queryable + ?Sized,
{
    let rows = conn.query(ctx, &manager.select(name)).await?;
    match rows.first() {
        Some(row) => manager.decode(row),
        None => Err(AdminError::not_found(format!("{} '{name}' does not exist", manager.kind()))),
    }
}

/// Create a resource, dropping it again if its configuration fails
pub async fn create<M>(
    ctx: &Context,
    manager: &M,
    exec: &dyn Executor,
    meta: &M::Meta,
) -> Result<M::Resource>
where
    M: AclManaged + ?Sized,
{
    manager.validate(meta)?;
    let kind = manager.kind();
    let name = manager.name_of(meta);

    exec.execute(ctx, &manager.create_statement(meta)?).await?;
    info!(kind, name, "created");

    if let Err(cause) = configure(ctx, manager, exec, meta).await {
        warn!(kind, name, error = %cause, "configuration failed, dropping new resource");

        // the caller's context may be the reason configuration failed
        let undo = Context::detached(COMPENSATION_TIMEOUT);
        let mut rollback = Ok(());
        for stmt in manager.drop_statements(name, false) {
            if let Err(err) = exec.execute(&undo, &stmt).await {
                warn!(kind, name, error = %err, "compensating drop failed");
                rollback = Err(err);
                break;
            }
        }

        return Err(AdminError::compensated(format!("{kind} '{name}'"), cause, rollback));
    }

    fetch(ctx, manager, exec, name).await
}

async fn configure<M>(ctx: &Context, manager: &M, exec: &dyn Executor, meta: &M::Meta) -> Result<()>
where
    M: AclManaged + ?Sized,
{
    let tx = exec.begin(ctx).await?;

    let outcome = async {
        for stmt in manager.post_create_statements(meta) {
            tx.execute(ctx, &stmt).await?;
        }
        if let Some(desired) = manager.acl_of(meta) {
            let target = manager.acl_target(manager.name_of(meta));
            reconcile(ctx, &*tx, &target, &AclList::new(), desired).await?;
        }
        Ok::<_, AdminError>(())
    }
    .await;

    finish(ctx, tx, outcome).await
}

/// Update a resource and reconcile its grants in one transaction
pub async fn update<M>(
    ctx: &Context,
    manager: &M,
    exec: &dyn Executor,
    name: &str,
    meta: &M::Meta,
) -> Result<M::Resource>
where
    M: AclManaged + ?Sized,
{
    manager.validate(meta)?;

    let tx = exec.begin(ctx).await?;
    let outcome = apply_update(ctx, manager, &*tx, name, meta).await;
    let writes = finish(ctx, tx, outcome).await?;

    let new_name = manager.name_of(meta);
    if writes > 0 {
        info!(kind = manager.kind(), name, new_name, writes, "updated");
    }
    fetch(ctx, manager, exec, new_name).await
}

async fn apply_update<M, Q>(
    ctx: &Context,
    manager: &M,
    tx: &Q,
    name: &str,
    meta: &M::Meta,
) -> Result<usize>
where
    M: AclManaged + ?Sized,
    Q: Queryable + ?Sized,
{
    let current = fetch(ctx, manager, tx, name).await?;

    let statements = manager.update_statements(&current, meta)?;
    for stmt in &statements {
        tx.execute(ctx, stmt).await?;
    }

    let Some(desired) = manager.acl_of(meta) else {
        return Ok(statements.len());
    };

    // grants are looked up by the new name and may have moved with an owner change
    let new_name = manager.name_of(meta);
    let current = if statements.is_empty() {
        current
    } else {
        fetch(ctx, manager, tx, new_name).await?
    };

    let target = manager.acl_target(new_name);
    let grants = reconcile(ctx, tx, &target, &manager.current_acl(&current), desired).await?;
    debug!(kind = manager.kind(), name = new_name, grants, "grants reconciled");

    Ok(statements.len() + grants)
}

/// Delete a resource, returning what it looked like before
pub async fn delete<M, Q>(
    ctx: &Context,
    manager: &M,
    conn: &Q,
    name: &str,
    force: bool,
) -> Result<M::Resource>
where
    M: Managed + ?Sized,
    Q: Queryable + ?Sized,
{
    let resource = match fetch(ctx, manager, conn, name).await {
        Ok(resource) => resource,
        Err(err @ (AdminError::NotFound(_) | AdminError::Cancelled(_))) => return Err(err),
        Err(err) => {
            return Err(AdminError::not_found(format!(
                "{} '{name}' could not be read: {}",
                manager.kind(),
                err.message()
            )))
        }
    };

    for stmt in manager.drop_statements(name, force) {
        conn.execute(ctx, &stmt).await?;
    }
    info!(kind = manager.kind(), name, force, "deleted");

    Ok(resource)
}
