//! Resource Lifecycle Integration Tests
//!
//! Drives create/update/delete through the in-memory server in `support`,
//! checking both the resulting state and the exact statement sequence.

mod support;

use pgctl::context::Context;
use pgctl::error::AdminError;
use pgctl::lifecycle;
use pretty_assertions::assert_eq;

use support::{acl, FakeServer, WidgetManager, WidgetMeta};

fn grants(server: &FakeServer, name: &str) -> Vec<(String, Vec<String>)> {
    server.widget(name).unwrap().grants.into_iter().collect()
}

fn entry(role: &str, tokens: &[&str]) -> (String, Vec<String>) {
    (role.to_string(), tokens.iter().map(|t| (*t).to_string()).collect())
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_configures_grants_in_a_transaction() {
    let server = FakeServer::new();
    let exec = server.executor();
    let meta = WidgetMeta::named("w1").with_acl(&["app:USAGE,CREATE", "PUBLIC:CONNECT"]);

    let created = lifecycle::create(&Context::background(), &WidgetManager, &*exec, &meta)
        .await
        .unwrap();

    assert_eq!(created.name, "w1");
    assert_eq!(created.acl.len(), 2);
    assert_eq!(
        server.log(),
        vec![
            "CREATE WIDGET w1 postgres",
            "BEGIN",
            "GRANT w1 app USAGE,CREATE",
            "GRANT w1 PUBLIC CONNECT",
            "COMMIT",
            "SELECT WIDGET w1",
        ]
    );
}

#[tokio::test]
async fn test_create_without_acl_leaves_grants_alone() {
    let server = FakeServer::new();
    let exec = server.executor();

    let created = lifecycle::create(
        &Context::background(),
        &WidgetManager,
        &*exec,
        &WidgetMeta::named("plain").with_owner("app"),
    )
    .await
    .unwrap();

    assert_eq!(created.owner, "app");
    assert!(created.acl.is_empty());
    assert!(server.writes().iter().all(|s| !s.starts_with("GRANT")));
}

#[tokio::test]
async fn test_failed_grant_rolls_back_cleanly() {
    let server = FakeServer::new();
    server.fail_on("ghost");
    let exec = server.executor();
    let meta = WidgetMeta::named("w").with_acl(&["app:USAGE", "ghost:USAGE"]);

    let err = lifecycle::create(&Context::background(), &WidgetManager, &*exec, &meta)
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "ROLLED_BACK");
    assert!(!err.is_dirty_rollback());
    assert!(matches!(err.root_cause(), AdminError::Internal(_)));
    assert!(server.widget_names().is_empty());
    assert_eq!(
        server.log(),
        vec![
            "CREATE WIDGET w postgres",
            "BEGIN",
            "GRANT w app USAGE",
            "GRANT w ghost USAGE",
            "ROLLBACK",
            "DROP WIDGET w",
        ]
    );
}

#[tokio::test]
async fn test_failed_compensation_is_reported_as_dirty() {
    let server = FakeServer::new();
    server.fail_on("ghost");
    server.fail_on("DROP WIDGET");
    let exec = server.executor();
    let meta = WidgetMeta::named("w").with_acl(&["ghost:USAGE"]);

    let err = lifecycle::create(&Context::background(), &WidgetManager, &*exec, &meta)
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "ROLLBACK_FAILED");
    assert!(err.is_dirty_rollback());
    assert!(err.message().contains("manual cleanup"));
    // left behind for the operator
    assert_eq!(server.widget_names(), vec!["w"]);
}

#[tokio::test]
async fn test_compensation_survives_cancelled_caller() {
    let server = FakeServer::new();
    let (ctx, cancel) = Context::background().with_cancel();
    server.cancel_after("CREATE WIDGET", cancel);
    let exec = server.executor();
    let meta = WidgetMeta::named("w").with_acl(&["app:USAGE"]);

    let err = lifecycle::create(&ctx, &WidgetManager, &*exec, &meta).await.unwrap_err();

    assert_eq!(err.error_code(), "ROLLED_BACK");
    assert!(matches!(err.root_cause(), AdminError::Cancelled(_)));
    assert_eq!(server.log(), vec!["CREATE WIDGET w postgres", "DROP WIDGET w"]);
    assert!(server.widget_names().is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let server = FakeServer::new();
    let exec = server.executor();
    let (ctx, cancel) = Context::background().with_cancel();
    cancel.cancel();

    let err = lifecycle::create(&ctx, &WidgetManager, &*exec, &WidgetMeta::named("w"))
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "CANCELLED");
    assert!(server.log().is_empty());
}

#[tokio::test]
async fn test_invalid_name_runs_nothing() {
    let server = FakeServer::new();
    let exec = server.executor();

    let err = lifecycle::create(
        &Context::background(),
        &WidgetManager,
        &*exec,
        &WidgetMeta::named("pg_reserved"),
    )
    .await
    .unwrap_err();

    assert_eq!(err.error_code(), "BAD_PARAMETER");
    assert!(server.log().is_empty());
}

#[tokio::test]
async fn test_failed_create_statement_is_not_compensated() {
    let server = FakeServer::new();
    server.seed("dup", "postgres", &[]);
    let exec = server.executor();

    let err = lifecycle::create(
        &Context::background(),
        &WidgetManager,
        &*exec,
        &WidgetMeta::named("dup").with_acl(&["app:USAGE"]),
    )
    .await
    .unwrap_err();

    assert_eq!(err.error_code(), "INTERNAL");
    assert_eq!(server.log(), vec!["CREATE WIDGET dup postgres"]);
    assert!(server.widget("dup").is_some());
}

// ============================================================================
// Update
// ============================================================================

#[tokio::test]
async fn test_rename_happens_before_grants() {
    let server = FakeServer::new();
    server.seed("old", "postgres", &[("app", &["USAGE"])]);
    let exec = server.executor();
    let meta = WidgetMeta::named("new").with_acl(&["app:USAGE,CREATE", "ops:ALL"]);

    let updated = lifecycle::update(&Context::background(), &WidgetManager, &*exec, "old", &meta)
        .await
        .unwrap();

    assert_eq!(updated.name, "new");
    assert!(server.widget("old").is_none());
    assert_eq!(
        grants(&server, "new"),
        vec![entry("app", &["USAGE", "CREATE"]), entry("ops", &["ALL"])]
    );
    assert_eq!(
        server.log(),
        vec![
            "BEGIN",
            "SELECT WIDGET old",
            "RENAME WIDGET old new",
            "SELECT WIDGET new",
            "GRANT new app CREATE",
            "GRANT ALL new ops",
            "COMMIT",
            "SELECT WIDGET new",
        ]
    );
}

#[tokio::test]
async fn test_repeated_update_writes_nothing() {
    let server = FakeServer::new();
    server.seed("w", "app", &[("app", &["USAGE", "CREATE"]), ("PUBLIC", &["USAGE"])]);
    let exec = server.executor();
    let meta = WidgetMeta::named("w").with_owner("app").with_acl(&["PUBLIC:USAGE", "app:CREATE,USAGE"]);

    lifecycle::update(&Context::background(), &WidgetManager, &*exec, "w", &meta).await.unwrap();

    assert_eq!(server.writes(), vec!["BEGIN", "COMMIT"]);
}

#[tokio::test]
async fn test_failed_update_changes_nothing() {
    let server = FakeServer::new();
    server.seed("w", "postgres", &[("app", &["USAGE"])]);
    server.fail_on("ghost");
    let exec = server.executor();
    let meta = WidgetMeta::named("w2").with_acl(&["ghost:USAGE"]);

    let err = lifecycle::update(&Context::background(), &WidgetManager, &*exec, "w", &meta)
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "INTERNAL");
    assert_eq!(server.widget_names(), vec!["w"]);
    assert_eq!(grants(&server, "w"), vec![entry("app", &["USAGE"])]);
    assert_eq!(server.log().last().map(String::as_str), Some("ROLLBACK"));
}

#[tokio::test]
async fn test_update_without_acl_keeps_grants() {
    let server = FakeServer::new();
    server.seed("w", "postgres", &[("app", &["USAGE"])]);
    let exec = server.executor();

    let updated = lifecycle::update(
        &Context::background(),
        &WidgetManager,
        &*exec,
        "w",
        &WidgetMeta::named("w").with_owner("app"),
    )
    .await
    .unwrap();

    assert_eq!(updated.owner, "app");
    assert_eq!(updated.acl, acl(&["app:USAGE"]));
    assert_eq!(server.writes(), vec!["BEGIN", "SET OWNER w app", "COMMIT"]);
}

#[tokio::test]
async fn test_update_missing_resource() {
    let server = FakeServer::new();
    let exec = server.executor();

    let err = lifecycle::update(
        &Context::background(),
        &WidgetManager,
        &*exec,
        "nope",
        &WidgetMeta::named("nope"),
    )
    .await
    .unwrap_err();

    assert_eq!(err.error_code(), "NOT_FOUND");
    assert!(err.message().contains("widget 'nope' does not exist"));
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_returns_previous_state() {
    let server = FakeServer::new();
    server.seed("w", "app", &[("app", &["USAGE"])]);
    let exec = server.executor();

    let deleted = lifecycle::delete(&Context::background(), &WidgetManager, &*exec, "w", false)
        .await
        .unwrap();

    assert_eq!(deleted.owner, "app");
    assert_eq!(deleted.acl, acl(&["app:USAGE"]));
    assert!(server.widget_names().is_empty());
}

#[tokio::test]
async fn test_delete_missing_is_not_found() {
    let server = FakeServer::new();
    let exec = server.executor();

    let err = lifecycle::delete(&Context::background(), &WidgetManager, &*exec, "nope", true)
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "NOT_FOUND");
    assert!(server.writes().is_empty());
}

#[tokio::test]
async fn test_delete_unreadable_is_not_found() {
    let server = FakeServer::new();
    server.seed("w", "app", &[]);
    server.fail_on("SELECT WIDGET");
    let exec = server.executor();

    let err = lifecycle::delete(&Context::background(), &WidgetManager, &*exec, "w", false)
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "NOT_FOUND");
    assert!(err.message().contains("could not be read"));
    assert!(server.widget("w").is_some());
}
