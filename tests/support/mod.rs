//! In-memory server for integration tests
//!
//! `FakeServer` implements the executor traits over a map of "widgets", a
//! resource kind defined only for tests. Transactions work on a snapshot that
//! replaces the live state on commit. Statements can be made to fail by
//! substring, which drives the rollback paths.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use pgctl::acl::reconcile::AclStatements;
use pgctl::acl::{split_grant_option, AclItem, AclList, ALL};
use pgctl::context::{CancelHandle, Context};
use pgctl::error::{AdminError, Result};
use pgctl::executor::{Executor, Param, Queryable, Row, Statement, Transaction};
use pgctl::lifecycle::{AclManaged, Managed};

// ============================================================================
// Server State
// ============================================================================

/// Live widget: owner plus privilege tokens per role
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Widget {
    pub owner: String,
    pub grants: BTreeMap<String, Vec<String>>,
}

type Widgets = BTreeMap<String, Widget>;

#[derive(Debug, Default)]
struct State {
    widgets: Widgets,
    log: Vec<String>,
    failures: Vec<String>,
    cancel_after: Option<(String, CancelHandle)>,
}

/// Shared in-memory server
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a widget directly, bypassing the log
    pub fn seed(&self, name: &str, owner: &str, grants: &[(&str, &[&str])]) {
        let widget = Widget {
            owner: owner.to_string(),
            grants: grants
                .iter()
                .map(|(role, tokens)| {
                    (role.to_string(), tokens.iter().map(|t| (*t).to_string()).collect())
                })
                .collect(),
        };
        self.state.lock().unwrap().widgets.insert(name.to_string(), widget);
    }

    /// Fail every statement whose rendering contains `pattern`
    pub fn fail_on(&self, pattern: &str) {
        self.state.lock().unwrap().failures.push(pattern.to_string());
    }

    /// Cancel `handle` once a statement containing `pattern` has run
    pub fn cancel_after(&self, pattern: &str, handle: CancelHandle) {
        self.state.lock().unwrap().cancel_after = Some((pattern.to_string(), handle));
    }

    pub fn widget(&self, name: &str) -> Option<Widget> {
        self.state.lock().unwrap().widgets.get(name).cloned()
    }

    pub fn widget_names(&self) -> Vec<String> {
        self.state.lock().unwrap().widgets.keys().cloned().collect()
    }

    /// Every statement that was attempted, in order
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    /// Attempted statements that are not reads
    pub fn writes(&self) -> Vec<String> {
        self.log().into_iter().filter(|s| !s.starts_with("SELECT")).collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::new(self.clone())
    }

    fn record(&self, entry: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let failing = state.failures.iter().any(|pattern| entry.contains(pattern.as_str()));
        state.log.push(entry.clone());
        if let Some((pattern, handle)) = &state.cancel_after {
            if entry.contains(pattern.as_str()) {
                handle.cancel();
            }
        }
        if failing {
            Err(AdminError::internal(format!("injected failure: {entry}")))
        } else {
            Ok(())
        }
    }
}

fn render(stmt: &Statement) -> String {
    let params: Vec<String> = stmt
        .params
        .iter()
        .map(|p| match p {
            Param::Text(text) => text.clone(),
            Param::Int(value) => value.to_string(),
            Param::Bool(value) => value.to_string(),
            Param::Null => "NULL".to_string(),
        })
        .collect();
    if params.is_empty() {
        stmt.sql.clone()
    } else {
        format!("{} {}", stmt.sql, params.join(" "))
    }
}

fn text_param(stmt: &Statement, index: usize) -> Result<String> {
    match stmt.params.get(index) {
        Some(Param::Text(text)) => Ok(text.clone()),
        _ => Err(AdminError::internal(format!("missing parameter ${} in '{}'", index + 1, stmt.sql))),
    }
}

fn same_base(a: &str, b: &str) -> bool {
    let (a, _) = split_grant_option(a);
    let (b, _) = split_grant_option(b);
    a == ALL || b == ALL || a == b
}

/// Apply one widget statement to `widgets`
fn apply(widgets: &mut Widgets, stmt: &Statement) -> Result<u64> {
    let name = text_param(stmt, 0)?;
    let missing = || AdminError::internal(format!("widget \"{name}\" does not exist"));

    match stmt.sql.as_str() {
        "CREATE WIDGET" => {
            if widgets.contains_key(&name) {
                return Err(AdminError::internal(format!("widget \"{name}\" already exists")));
            }
            let owner = text_param(stmt, 1)?;
            widgets.insert(name, Widget { owner, grants: BTreeMap::new() });
        }
        "DROP WIDGET" => {
            widgets.remove(&name).ok_or_else(missing)?;
        }
        "RENAME WIDGET" => {
            let new_name = text_param(stmt, 1)?;
            let widget = widgets.remove(&name).ok_or_else(missing)?;
            widgets.insert(new_name, widget);
        }
        "SET OWNER" => {
            widgets.get_mut(&name).ok_or_else(missing)?.owner = text_param(stmt, 1)?;
        }
        "GRANT" => {
            let role = text_param(stmt, 1)?;
            let widget = widgets.get_mut(&name).ok_or_else(missing)?;
            let tokens = widget.grants.entry(role).or_default();
            for token in text_param(stmt, 2)?.split(',') {
                if !tokens.iter().any(|t| t == token) {
                    tokens.push(token.to_string());
                }
            }
        }
        "GRANT ALL" => {
            let role = text_param(stmt, 1)?;
            let widget = widgets.get_mut(&name).ok_or_else(missing)?;
            widget.grants.insert(role, vec![ALL.to_string()]);
        }
        "REVOKE" => {
            let role = text_param(stmt, 1)?;
            let widget = widgets.get_mut(&name).ok_or_else(missing)?;
            let revoked = text_param(stmt, 2)?;
            if let Some(tokens) = widget.grants.get_mut(&role) {
                tokens.retain(|t| !revoked.split(',').any(|r| same_base(t, r)));
                if tokens.is_empty() {
                    widget.grants.remove(&role);
                }
            }
        }
        other => return Err(AdminError::internal(format!("syntax error at '{other}'"))),
    }
    Ok(1)
}

fn select(widgets: &Widgets, stmt: &Statement) -> Result<Vec<Row>> {
    if stmt.sql != "SELECT WIDGET" {
        return Ok(Vec::new());
    }
    let name = text_param(stmt, 0)?;
    Ok(widgets
        .get(&name)
        .map(|widget| {
            let acl: Vec<Value> = widget
                .grants
                .iter()
                .map(|(role, tokens)| Value::String(format!("{role}:{}", tokens.join(","))))
                .collect();
            Row::new().with("name", name.clone()).with("owner", widget.owner.clone()).with("acl", acl)
        })
        .into_iter()
        .collect())
}

#[async_trait]
impl Queryable for FakeServer {
    async fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<u64> {
        ctx.check()?;
        self.record(render(stmt))?;
        apply(&mut self.state.lock().unwrap().widgets, stmt)
    }

    async fn query(&self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>> {
        ctx.check()?;
        self.record(render(stmt))?;
        select(&self.state.lock().unwrap().widgets, stmt)
    }
}

#[async_trait]
impl Executor for FakeServer {
    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>> {
        ctx.check()?;
        self.record("BEGIN".to_string())?;
        let snapshot = self.state.lock().unwrap().widgets.clone();
        Ok(Box::new(FakeTransaction { server: self.clone(), working: Mutex::new(Some(snapshot)) }))
    }

    async fn scoped(&self, ctx: &Context, _database: &str) -> Result<Arc<dyn Executor>> {
        ctx.check()?;
        Ok(self.executor())
    }
}

/// Works on a snapshot until commit
struct FakeTransaction {
    server: FakeServer,
    working: Mutex<Option<Widgets>>,
}

impl FakeTransaction {
    fn with_working<T>(&self, f: impl FnOnce(&mut Widgets) -> Result<T>) -> Result<T> {
        let mut working = self.working.lock().unwrap();
        let widgets = working.as_mut().ok_or_else(|| AdminError::internal("transaction is closed"))?;
        f(widgets)
    }
}

#[async_trait]
impl Queryable for FakeTransaction {
    async fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<u64> {
        ctx.check()?;
        self.server.record(render(stmt))?;
        self.with_working(|widgets| apply(widgets, stmt))
    }

    async fn query(&self, ctx: &Context, stmt: &Statement) -> Result<Vec<Row>> {
        ctx.check()?;
        self.server.record(render(stmt))?;
        self.with_working(|widgets| select(widgets, stmt))
    }
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn commit(&self, _ctx: &Context) -> Result<()> {
        self.server.record("COMMIT".to_string())?;
        let widgets = self
            .working
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AdminError::internal("transaction is closed"))?;
        self.server.state.lock().unwrap().widgets = widgets;
        Ok(())
    }

    async fn rollback(&self, _ctx: &Context) -> Result<()> {
        self.working.lock().unwrap().take();
        self.server.record("ROLLBACK".to_string())
    }
}

// ============================================================================
// Widget Resource Kind
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WidgetView {
    pub name: String,
    pub owner: String,
    pub acl: AclList,
}

#[derive(Debug, Clone, Default)]
pub struct WidgetMeta {
    pub name: String,
    pub owner: Option<String>,
    pub acl: Option<AclList>,
}

impl WidgetMeta {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Self::default() }
    }

    pub fn with_acl(mut self, entries: &[&str]) -> Self {
        self.acl = Some(acl(entries));
        self
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }
}

pub struct WidgetManager;

pub struct WidgetGrants {
    name: String,
}

impl AclStatements for WidgetGrants {
    fn grant(&self, role: &str, privileges: &[String]) -> Vec<Statement> {
        vec![Statement::new("GRANT").bind(&self.name).bind(role).bind(privileges.join(","))]
    }

    fn revoke(&self, role: &str, privileges: &[String]) -> Vec<Statement> {
        vec![Statement::new("REVOKE").bind(&self.name).bind(role).bind(privileges.join(","))]
    }

    fn grant_all(&self, role: &str) -> Statement {
        Statement::new("GRANT ALL").bind(&self.name).bind(role)
    }
}

impl Managed for WidgetManager {
    type Resource = WidgetView;

    fn kind(&self) -> &'static str {
        "widget"
    }

    fn select(&self, name: &str) -> Statement {
        Statement::new("SELECT WIDGET").bind(name)
    }

    fn decode(&self, row: &Row) -> Result<WidgetView> {
        let acl = row
            .text_array("acl")
            .iter()
            .map(|entry| entry.parse::<AclItem>())
            .collect::<std::result::Result<AclList, _>>()?;
        Ok(WidgetView { name: row.text("name")?, owner: row.text("owner")?, acl })
    }

    fn drop_statements(&self, name: &str, _force: bool) -> Vec<Statement> {
        vec![Statement::new("DROP WIDGET").bind(name)]
    }
}

impl AclManaged for WidgetManager {
    type Meta = WidgetMeta;
    type Target = WidgetGrants;

    fn name_of<'a>(&self, meta: &'a WidgetMeta) -> &'a str {
        &meta.name
    }

    fn acl_of<'a>(&self, meta: &'a WidgetMeta) -> Option<&'a AclList> {
        meta.acl.as_ref()
    }

    fn current_acl(&self, resource: &WidgetView) -> AclList {
        resource.acl.clone()
    }

    fn create_statement(&self, meta: &WidgetMeta) -> Result<Statement> {
        let owner = meta.owner.clone().unwrap_or_else(|| "postgres".to_string());
        Ok(Statement::new("CREATE WIDGET").bind(&meta.name).bind(owner))
    }

    fn update_statements(&self, current: &WidgetView, meta: &WidgetMeta) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        if meta.name != current.name {
            statements.push(Statement::new("RENAME WIDGET").bind(&current.name).bind(&meta.name));
        }
        if let Some(owner) = meta.owner.as_ref().filter(|o| **o != current.owner) {
            statements.push(Statement::new("SET OWNER").bind(&meta.name).bind(owner));
        }
        Ok(statements)
    }

    fn acl_target(&self, name: &str) -> WidgetGrants {
        WidgetGrants { name: name.to_string() }
    }
}

/// Parse `role:PRIV,...` / native entries into a list
pub fn acl(entries: &[&str]) -> AclList {
    entries.iter().map(|e| e.parse::<AclItem>().unwrap()).collect()
}
