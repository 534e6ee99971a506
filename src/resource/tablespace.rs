//! Tablespaces

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
    quote_literal, CreateResource, DeleteResource, GetResource, GrantTarget, List,
    ListRequest, ListResources, ObjectName, ObjectType, ResourceKind, UpdateResource,
};

const SELECT: &str = "SELECT t.spcname::text AS name,
       pg_catalog.pg_get_userbyid(t.spcowner)::text AS owner,
       pg_catalog.pg_tablespace_location(t.oid) AS location,
       CASE WHEN pg_catalog.has_tablespace_privilege(t.oid, 'CREATE')
            THEN pg_catalog.pg_tablespace_size(t.oid) END AS size_bytes,
       pg_catalog.shobj_description(t.oid, 'pg_tablespace') AS comment,
       t.spcacl::text[] AS acl
FROM pg_catalog.pg_tablespace t";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tablespace {
    pub name: String,
    pub owner: String,
    /// Empty for the built-in tablespaces
    pub location: String,
    pub size_bytes: Option<i64>,
    pub comment: Option<String>,
    pub acl: AclList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TablespaceMeta {
    pub name: String,
    pub owner: Option<String>,
    /// Absolute directory on the server; required on create, fixed afterwards
    pub location: Option<String>,
    pub comment: Option<String>,
    pub acl: Option<AclList>,
}

pub struct TablespaceManager {
    exec: Arc<dyn Executor>,
}

impl TablespaceManager {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }
}

fn object(name: &str) -> String {
    format!("TABLESPACE {}", quote_ident(name))
}

impl Managed for TablespaceManager {
    type Resource = Tablespace;

    fn kind(&self) -> &'static str {
        "tablespace"
    }

    fn select(&self, name: &str) -> Statement {
        Statement::new(format!("{SELECT} WHERE t.spcname = $1")).bind(name)
    }

    fn decode(&self, row: &Row) -> Result<Tablespace> {
        Ok(Tablespace {
            name: row.text("name")?,
            owner: row.text("owner")?,
            location: row.opt_text("location").unwrap_or_default(),
            size_bytes: row.opt_int("size_bytes"),
            comment: row.opt_text("comment"),
            acl: decode_acl(row, "acl")?,
        })
    }

    /// A tablespace must be empty to be dropped; `force` changes nothing
    fn drop_statements(&self, name: &str, _force: bool) -> Vec<Statement> {
        vec![Statement::new(format!("DROP TABLESPACE {}", quote_ident(name)))]
    }
}

impl AclManaged for TablespaceManager {
    type Meta = TablespaceMeta;
    type Target = GrantTarget;

    fn name_of<'a>(&self, meta: &'a TablespaceMeta) -> &'a str {
        &meta.name
    }

    fn acl_of<'a>(&self, meta: &'a TablespaceMeta) -> Option<&'a AclList> {
        meta.acl.as_ref()
    }

    fn current_acl(&self, resource: &Tablespace) -> AclList {
        resource.acl.clone()
    }

    fn create_statement(&self, meta: &TablespaceMeta) -> Result<Statement> {
        let location = meta
            .location
            .as_deref()
            .filter(|l| l.starts_with('/'))
            .ok_or_else(|| AdminError::bad_parameter("tablespace location must be an absolute path"))?;

        let mut sql = format!("CREATE TABLESPACE {}", quote_ident(&meta.name));
        if let Some(owner) = &meta.owner {
            sql.push_str(&format!(" OWNER {}", quote_ident(owner)));
        }
        sql.push_str(&format!(" LOCATION {}", quote_literal(location)));
        Ok(Statement::new(sql))
    }

    fn post_create_statements(&self, meta: &TablespaceMeta) -> Vec<Statement> {
        match &meta.comment {
            Some(comment) if !comment.is_empty() => {
                vec![comment_statement(&object(&meta.name), comment)]
            }
            _ => Vec::new(),
        }
    }

    fn update_statements(
        &self,
        current: &Tablespace,
        meta: &TablespaceMeta,
    ) -> Result<Vec<Statement>> {
        if meta.location.as_ref().is_some_and(|l| *l != current.location) {
            return Err(AdminError::bad_parameter("tablespace location cannot be changed"));
        }

        let mut statements = Vec::new();
        if meta.name != current.name {
            statements.push(Statement::new(format!(
                "ALTER TABLESPACE {} RENAME TO {}",
                quote_ident(&current.name),
                quote_ident(&meta.name)
            )));
        }
        if let Some(owner) = meta.owner.as_ref().filter(|o| **o != current.owner) {
            statements.push(Statement::new(format!(
                "ALTER TABLESPACE {} OWNER TO {}",
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
        GrantTarget::new(ObjectType::Tablespace, name)
    }
}

impl ResourceKind for TablespaceManager {
    const KIND: &'static str = "tablespace";
    type Id = ObjectName;
    type Item = Tablespace;
}

#[async_trait]
impl ListResources for TablespaceManager {
    type Request = ListRequest;

    async fn list(&self, ctx: &Context, request: ListRequest) -> Result<List<Tablespace>> {
        let base = Statement::new(format!(
            "{SELECT} WHERE ($1::text IS NULL OR t.spcname LIKE $1) ORDER BY t.spcname"
        ))
        .bind(request.name.as_deref().map(contains_pattern));

        list_paged(ctx, &*self.exec, &base, request.offset, request.limit, |row| self.decode(row))
            .await
    }
}

#[async_trait]
impl GetResource for TablespaceManager {
    async fn get(&self, ctx: &Context, id: &ObjectName) -> Result<Tablespace> {
        lifecycle::fetch(ctx, self, &*self.exec, &id.name).await
    }
}

#[async_trait]
impl CreateResource for TablespaceManager {
    type Meta = TablespaceMeta;

    async fn create(&self, ctx: &Context, meta: TablespaceMeta) -> Result<Tablespace> {
        lifecycle::create(ctx, self, &*self.exec, &meta).await
    }
}

#[async_trait]
impl UpdateResource for TablespaceManager {
    async fn update(
        &self,
        ctx: &Context,
        id: &ObjectName,
        mut meta: TablespaceMeta,
    ) -> Result<Tablespace> {
        if meta.name.is_empty() {
            meta.name.clone_from(&id.name);
        }
        lifecycle::update(ctx, self, &*self.exec, &id.name, &meta).await
    }
}

#[async_trait]
impl DeleteResource for TablespaceManager {
    async fn delete(&self, ctx: &Context, id: &ObjectName, force: bool) -> Result<Tablespace> {
        lifecycle::delete(ctx, self, &*self.exec, &id.name, force).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::{offline, sql};
    use pretty_assertions::assert_eq;

    fn manager() -> TablespaceManager {
        TablespaceManager::new(offline())
    }

    #[test]
    fn test_create_requires_absolute_location() {
        let mut meta = TablespaceMeta { name: "fast".to_string(), ..TablespaceMeta::default() };
        assert!(manager().create_statement(&meta).is_err());

        meta.location = Some("relative/dir".to_string());
        assert!(manager().create_statement(&meta).is_err());

        meta.location = Some("/mnt/nvme/pg".to_string());
        meta.owner = Some("ops".to_string());
        assert_eq!(
            manager().create_statement(&meta).unwrap().sql,
            "CREATE TABLESPACE \"fast\" OWNER \"ops\" LOCATION '/mnt/nvme/pg'"
        );
    }

    #[test]
    fn test_update_owner_only() {
        let current = Tablespace {
            name: "fast".to_string(),
            owner: "postgres".to_string(),
            location: "/mnt/nvme/pg".to_string(),
            size_bytes: None,
            comment: None,
            acl: AclList::new(),
        };
        let meta = TablespaceMeta {
            name: "fast".to_string(),
            owner: Some("ops".to_string()),
            location: Some("/mnt/nvme/pg".to_string()),
            ..TablespaceMeta::default()
        };
        assert_eq!(
            sql(manager().update_statements(&current, &meta).unwrap()),
            vec!["ALTER TABLESPACE \"fast\" OWNER TO \"ops\""]
        );
    }
}
