//! REST API
//!
//! One route set per resource kind, built from generic handlers over the capability
//! traits in [`crate::resource`]. A kind without [`UpdateResource`] simply has no `PUT`
//! route.
//!
//! | Route | Methods |
//! |---|---|
//! | `/databases`, `/tablespaces`, `/roles`, `/slots` | `GET` list, `POST` create |
//! | `/<kind>/:name` | `GET`, `PUT` (not slots), `DELETE ?force=true` |
//! | `/databases/:database/schemas`, `/databases/:database/extensions` | `GET` list, `POST` create |
//! | `/databases/:database/<kind>/:name` | `GET`, `PUT`, `DELETE ?force=true` |
//! | `/schemas`, `/extensions` | `GET` list across databases (`database`, `name`, `offset`, `limit`) |
//! | `/metrics` | Prometheus text |
//! | `/healthz` | liveness |
//!
//! Errors are returned as the JSON error envelope, with the status derived from the
//! error code.

use axum::extract::{Extension, Path, Query};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerSettings;
use crate::context::Context;
use crate::error::{AdminError, Result};
use crate::executor::Executor;
use crate::metrics;
use crate::output::ErrorEnvelope;
use crate::resource::database::DatabaseManager;
use crate::resource::extension::ExtensionManager;
use crate::resource::role::RoleManager;
use crate::resource::schema::SchemaManager;
use crate::resource::slot::SlotManager;
use crate::resource::tablespace::TablespaceManager;
use crate::resource::{
    ensure_writable, Catalog, CreateResource, DatabaseScoped, DeleteResource, GetResource, List,
    ListResources, ObjectName, PartitionedListRequest, ResourceKind, ScopedName, UpdateResource,
};

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared state behind every route
pub struct Api {
    catalog: Catalog,
    exec: Arc<dyn Executor>,
    readonly: bool,
    settings: ServerSettings,
}

impl Api {
    pub fn new(exec: Arc<dyn Executor>, readonly: bool, settings: ServerSettings) -> Self {
        Self { catalog: Catalog::new(exec.clone()), exec, readonly, settings }
    }

    fn context(&self) -> Context {
        Context::background().with_timeout(self.settings.request_timeout())
    }
}

/// Picks a kind's manager out of the shared [`Catalog`]
trait Member: ResourceKind {
    fn of(catalog: &Catalog) -> &Self;
}

impl Member for DatabaseManager {
    fn of(catalog: &Catalog) -> &Self {
        &catalog.databases
    }
}

impl Member for SchemaManager {
    fn of(catalog: &Catalog) -> &Self {
        &catalog.schemas
    }
}

impl Member for TablespaceManager {
    fn of(catalog: &Catalog) -> &Self {
        &catalog.tablespaces
    }
}

impl Member for RoleManager {
    fn of(catalog: &Catalog) -> &Self {
        &catalog.roles
    }
}

impl Member for ExtensionManager {
    fn of(catalog: &Catalog) -> &Self {
        &catalog.extensions
    }
}

impl Member for SlotManager {
    fn of(catalog: &Catalog) -> &Self {
        &catalog.slots
    }
}

/// An [`AdminError`] tagged with the request it failed
#[derive(Debug)]
pub struct ApiError {
    resource: &'static str,
    command: &'static str,
    error: AdminError,
}

impl ApiError {
    fn tag(resource: &'static str, command: &'static str) -> impl FnOnce(AdminError) -> Self {
        move |error| Self { resource, command, error }
    }
}

/// HTTP status for an error code; compensated creates report the triggering error
#[must_use]
pub fn status_for(err: &AdminError) -> StatusCode {
    match err {
        AdminError::BadParameter(_) => StatusCode::BAD_REQUEST,
        AdminError::NotFound(_) => StatusCode::NOT_FOUND,
        AdminError::NotAvailable(_) => StatusCode::NOT_IMPLEMENTED,
        AdminError::ConnectionFailed(_) => StatusCode::BAD_GATEWAY,
        AdminError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
        AdminError::Internal(_) | AdminError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        AdminError::RolledBack { cause, .. } => status_for(cause),
        AdminError::RollbackFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        if status.is_server_error() {
            warn!(resource = self.resource, command = self.command, error = %self.error, "request failed");
        }
        let body = ErrorEnvelope::from_error(self.resource, self.command, &self.error);
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// `/databases/:name/<kind>/:child`
#[derive(Debug, Deserialize)]
struct NestedPath {
    name: String,
    child: String,
}

impl From<NestedPath> for ScopedName {
    fn from(path: NestedPath) -> Self {
        ScopedName::new(path.name, path.child)
    }
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    force: bool,
}

async fn list<M>(
    Extension(api): Extension<Arc<Api>>,
    Query(request): Query<M::Request>,
) -> ApiResult<Json<List<M::Item>>>
where
    M: Member + ListResources,
{
    let manager = M::of(&api.catalog);
    let page = manager.list(&api.context(), request).await.map_err(ApiError::tag(M::KIND, "list"))?;
    Ok(Json(page))
}

async fn list_in<M>(
    Extension(api): Extension<Arc<Api>>,
    Path(database): Path<String>,
    Query(mut request): Query<PartitionedListRequest>,
) -> ApiResult<Json<List<M::Item>>>
where
    M: Member + ListResources<Request = PartitionedListRequest>,
{
    request.database = Some(database);
    let manager = M::of(&api.catalog);
    let page = manager.list(&api.context(), request).await.map_err(ApiError::tag(M::KIND, "list"))?;
    Ok(Json(page))
}

async fn fetch<M, P>(
    Extension(api): Extension<Arc<Api>>,
    Path(path): Path<P>,
) -> ApiResult<Json<M::Item>>
where
    M: Member + GetResource,
    P: Into<M::Id> + DeserializeOwned + Send,
{
    let manager = M::of(&api.catalog);
    let item = manager.get(&api.context(), &path.into()).await.map_err(ApiError::tag(M::KIND, "get"))?;
    Ok(Json(item))
}

async fn create<M>(
    Extension(api): Extension<Arc<Api>>,
    Json(meta): Json<M::Meta>,
) -> ApiResult<(StatusCode, Json<M::Item>)>
where
    M: Member + CreateResource,
{
    let outcome = async {
        ensure_writable(api.readonly)?;
        M::of(&api.catalog).create(&api.context(), meta).await
    };
    let item = outcome.await.map_err(ApiError::tag(M::KIND, "create"))?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn create_in<M>(
    Extension(api): Extension<Arc<Api>>,
    Path(database): Path<String>,
    Json(mut meta): Json<M::Meta>,
) -> ApiResult<(StatusCode, Json<M::Item>)>
where
    M: Member + CreateResource,
    M::Meta: DatabaseScoped,
{
    let outcome = async {
        ensure_writable(api.readonly)?;
        meta.scope_to(&database)?;
        M::of(&api.catalog).create(&api.context(), meta).await
    };
    let item = outcome.await.map_err(ApiError::tag(M::KIND, "create"))?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn update<M, P>(
    Extension(api): Extension<Arc<Api>>,
    Path(path): Path<P>,
    Json(meta): Json<M::Meta>,
) -> ApiResult<Json<M::Item>>
where
    M: Member + UpdateResource,
    P: Into<M::Id> + DeserializeOwned + Send,
{
    let outcome = async {
        ensure_writable(api.readonly)?;
        M::of(&api.catalog).update(&api.context(), &path.into(), meta).await
    };
    Ok(Json(outcome.await.map_err(ApiError::tag(M::KIND, "update"))?))
}

async fn delete<M, P>(
    Extension(api): Extension<Arc<Api>>,
    Path(path): Path<P>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Json<M::Item>>
where
    M: Member + DeleteResource,
    P: Into<M::Id> + DeserializeOwned + Send,
{
    let outcome = async {
        ensure_writable(api.readonly)?;
        M::of(&api.catalog).delete(&api.context(), &path.into(), query.force).await
    };
    Ok(Json(outcome.await.map_err(ApiError::tag(M::KIND, "delete"))?))
}

async fn scrape(Extension(api): Extension<Arc<Api>>) -> impl IntoResponse {
    let collection = metrics::collect(&*api.exec, api.settings.metrics_timeout()).await;
    ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], collection.render())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Build the router over `api`
pub fn router(api: Arc<Api>) -> Router {
    Router::new()
        .route("/databases", get(list::<DatabaseManager>).post(create::<DatabaseManager>))
        .route(
            "/databases/:name",
            get(fetch::<DatabaseManager, ObjectName>)
                .put(update::<DatabaseManager, ObjectName>)
                .delete(delete::<DatabaseManager, ObjectName>),
        )
        .route(
            "/databases/:name/schemas",
            get(list_in::<SchemaManager>).post(create_in::<SchemaManager>),
        )
        .route(
            "/databases/:name/schemas/:child",
            get(fetch::<SchemaManager, NestedPath>)
                .put(update::<SchemaManager, NestedPath>)
                .delete(delete::<SchemaManager, NestedPath>),
        )
        .route(
            "/databases/:name/extensions",
            get(list_in::<ExtensionManager>).post(create_in::<ExtensionManager>),
        )
        .route(
            "/databases/:name/extensions/:child",
            get(fetch::<ExtensionManager, NestedPath>)
                .put(update::<ExtensionManager, NestedPath>)
                .delete(delete::<ExtensionManager, NestedPath>),
        )
        .route("/schemas", get(list::<SchemaManager>))
        .route("/extensions", get(list::<ExtensionManager>))
        .route("/tablespaces", get(list::<TablespaceManager>).post(create::<TablespaceManager>))
        .route(
            "/tablespaces/:name",
            get(fetch::<TablespaceManager, ObjectName>)
                .put(update::<TablespaceManager, ObjectName>)
                .delete(delete::<TablespaceManager, ObjectName>),
        )
        .route("/roles", get(list::<RoleManager>).post(create::<RoleManager>))
        .route(
            "/roles/:name",
            get(fetch::<RoleManager, ObjectName>)
                .put(update::<RoleManager, ObjectName>)
                .delete(delete::<RoleManager, ObjectName>),
        )
        .route("/slots", get(list::<SlotManager>).post(create::<SlotManager>))
        .route(
            "/slots/:name",
            get(fetch::<SlotManager, ObjectName>).delete(delete::<SlotManager, ObjectName>),
        )
        .route("/metrics", get(scrape))
        .route("/healthz", get(healthz))
        .layer(Extension(api))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on `settings.listen` until Ctrl-C
pub async fn serve(exec: Arc<dyn Executor>, readonly: bool, settings: ServerSettings) -> Result<()> {
    let listener = TcpListener::bind(&settings.listen)
        .await
        .map_err(|e| AdminError::config_error(format!("cannot listen on {}: {e}", settings.listen)))?;
    info!(listen = %settings.listen, readonly, "serving");

    let app = router(Arc::new(Api::new(exec, readonly, settings)));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for shutdown signal");
            }
        })
        .await
        .map_err(|e| AdminError::internal(format!("server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&AdminError::bad_parameter("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&AdminError::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&AdminError::not_available("x")), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(status_for(&AdminError::cancelled("x")), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&AdminError::internal("x")), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_clean_rollback_reports_cause_status() {
        let clean = AdminError::compensated("role 'x'", AdminError::bad_parameter("bad acl"), Ok(()));
        assert_eq!(status_for(&clean), StatusCode::BAD_REQUEST);

        let dirty = AdminError::compensated(
            "role 'x'",
            AdminError::bad_parameter("bad acl"),
            Err(AdminError::internal("drop failed")),
        );
        assert_eq!(status_for(&dirty), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_nested_path_into_scoped_name() {
        let path = NestedPath { name: "app".to_string(), child: "sales".to_string() };
        assert_eq!(ScopedName::from(path), ScopedName::new("app", "sales"));
    }
}
