//! pgctl - Administrative Control Plane for PostgreSQL
//!
//! pgctl discovers, lists, creates, updates and deletes server-level resources
//! (databases, schemas, tablespaces, roles, extensions, replication slots) through one
//! uniform CRUD contract, and exports server metrics.
//!
//! # Architecture
//! The CLI and the REST API are thin wrappers over the resource managers. Managers
//! call the federated list engine for per-database listings and the compensating
//! lifecycle (which drives the ACL reconciler) for mutations. All SQL goes through the
//! [`executor`] seam, so everything above it can be exercised without a server.
//!
//! # Module Organization
//! - [`acl`] - Grant tokens, grant lists and reconciliation
//! - [`federation`] - Offset/limit windows over several databases
//! - [`lifecycle`] - Create-with-compensation, transactional update, delete
//! - [`resource`] - One manager per resource kind
//! - [`executor`] - Query execution seam and its PostgreSQL implementation
//! - [`context`] - Cancellation and deadlines
//! - [`metrics`] - Prometheus collection
//! - [`config`] - Connection registry
//! - [`output`] - JSON envelopes
//! - [`error`] - Error types
//! - `http` - REST API (feature `server`)

pub mod acl;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod federation;
#[cfg(feature = "server")]
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod output;
pub mod resource;

pub use acl::{AclItem, AclList};
pub use config::{
    list_connections, resolve_connection, save_connection, ConfigLocation, ConnectionConfig,
    ConnectionRegistry, ServerSettings, StoredConnection,
};
pub use context::{CancelHandle, Context};
pub use error::{AdminError, Result};
pub use executor::postgres::PgExecutor;
pub use executor::{Executor, Queryable, Row, Statement, Transaction};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use resource::{
    Catalog, CreateResource, DeleteResource, GetResource, List, ListRequest, ListResources,
    ObjectName, PartitionedListRequest, ScopedName, UpdateResource,
};
