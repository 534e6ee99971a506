//! Grant Reconciliation
//!
//! Converges a resource's live grants to a desired [`AclList`] with the smallest
//! set of GRANT/REVOKE statements.
//!
//! Planning is pure ([`plan`]); applying ([`reconcile`]) runs the plan through a
//! caller-supplied connection, normally an open transaction, and stops at the first
//! error so the caller's rollback undoes everything this call did.
//!
//! # Order
//! Roles are visited in `current` order, then roles only present in `desired`.
//! For a role present in both, revokes are issued before grants.

use tracing::debug;

use crate::acl::{split_grant_option, AclItem, AclList, ALL};
use crate::context::Context;
use crate::error::Result;
use crate::executor::{Queryable, Statement};

/// Resource-scoped grant operations
pub trait AclStatements: Send + Sync {
    /// Grant `privileges` to `role`
    fn grant(&self, role: &str, privileges: &[String]) -> Vec<Statement>;

    /// Revoke `privileges` (including any grant option) from `role`
    fn revoke(&self, role: &str, privileges: &[String]) -> Vec<Statement>;

    /// Grant every privilege of the object type to `role`
    fn grant_all(&self, role: &str) -> Statement;
}

/// One reconciliation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclStep {
    Grant { role: String, privileges: Vec<String> },
    Revoke { role: String, privileges: Vec<String> },
    GrantAll { role: String },
}

/// Compute the steps that turn `current` into `desired`
#[must_use]
pub fn plan(current: &AclList, desired: &AclList) -> Vec<AclStep> {
    let mut steps = Vec::new();

    for have in current {
        match desired.find(have.role()) {
            None => steps.push(AclStep::Revoke {
                role: have.role().to_string(),
                privileges: have.privileges().to_vec(),
            }),
            Some(want) if want.same_privileges(have) => {}
            Some(want) if want.is_all() => {
                steps.push(AclStep::GrantAll { role: have.role().to_string() });
            }
            Some(want) => diff(have, want, &mut steps),
        }
    }

    for want in desired {
        if current.find(want.role()).is_some() {
            continue;
        }
        if want.is_all() {
            steps.push(AclStep::GrantAll { role: want.role().to_string() });
        } else {
            steps.push(AclStep::Grant {
                role: want.role().to_string(),
                privileges: want.privileges().to_vec(),
            });
        }
    }

    steps
}

/// Per-token diff for a role present on both sides.
///
/// Revoking a privilege also drops its grant option (and revoking `ALL` drops
/// everything), so desired tokens sharing a revoked privilege are granted again.
fn diff(have: &AclItem, want: &AclItem, steps: &mut Vec<AclStep>) {
    let role = have.role();

    let to_revoke: Vec<&String> =
        have.privileges().iter().filter(|p| !want.privileges().contains(p)).collect();

    let revoked_base = |privilege: &str| {
        let (base, _) = split_grant_option(privilege);
        to_revoke.iter().any(|r| {
            let (revoked, _) = split_grant_option(r);
            revoked == ALL || revoked == base
        })
    };

    let to_grant: Vec<&String> = want
        .privileges()
        .iter()
        .filter(|p| !have.privileges().contains(p) || revoked_base(p))
        .collect();

    for privilege in &to_revoke {
        steps.push(AclStep::Revoke { role: role.to_string(), privileges: vec![(*privilege).clone()] });
    }
    for privilege in to_grant {
        steps.push(AclStep::Grant { role: role.to_string(), privileges: vec![privilege.clone()] });
    }
}

/// Apply the plan from `current` to `desired` on `conn`.
///
/// Returns the number of statements executed; zero when nothing changed.
pub async fn reconcile<Q, T>(
    ctx: &Context,
    conn: &Q,
    target: &T,
    current: &AclList,
    desired: &AclList,
) -> Result<usize>
where
    Q: Queryable + ?Sized,
    T: AclStatements + ?Sized,
{
    let mut executed = 0;

    for step in plan(current, desired) {
        let statements = match &step {
            AclStep::Grant { role, privileges } => target.grant(role, privileges),
            AclStep::Revoke { role, privileges } => target.revoke(role, privileges),
            AclStep::GrantAll { role } => vec![target.grant_all(role)],
        };
        debug!(?step, "applying ACL step");

        for stmt in &statements {
            conn.execute(ctx, stmt).await?;
            executed += 1;
        }
    }

    Ok(executed)
}
