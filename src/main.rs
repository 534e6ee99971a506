//! pgctl CLI Entry Point
//!
//! Subcommands:
//! - `connect` - Validate and save a connection profile
//! - `connections` - List saved profiles
//! - `database`, `schema`, `tablespace`, `role`, `extension`, `slot` - Resource CRUD
//! - `metrics` - One metrics scrape in Prometheus text format
//! - `serve` - REST API
//!
//! All output to stdout is one JSON envelope. Logs go to stderr.

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use pgctl::config::{self, ConfigLocation, ConnectionConfig, StoredConnection};
use pgctl::context::Context;
use pgctl::error::{AdminError, Result};
use pgctl::executor::postgres::PgExecutor;
use pgctl::executor::Executor;
use pgctl::output::{ErrorEnvelope, Metadata, SuccessEnvelope};
use pgctl::resource::{
    ensure_writable, Catalog, CreateResource, DeleteResource, GetResource, ListResources,
    ObjectName, ScopedName, UpdateResource, DEFAULT_LIMIT,
};

/// pgctl - Administrative control plane for PostgreSQL
#[derive(Parser)]
#[command(name = "pgctl")]
#[command(about = "Manage PostgreSQL databases, schemas, roles and more with JSON output")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    target: Target,

    #[command(subcommand)]
    command: Commands,
}

/// Which server to talk to
#[derive(Args)]
struct Target {
    /// Saved connection profile (the default profile when omitted)
    #[arg(long, short = 'c', global = true)]
    connection: Option<String>,

    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    port: Option<u16>,

    #[arg(long, short = 'U', global = true)]
    user: Option<String>,

    #[arg(long, global = true)]
    password: Option<String>,

    /// Maintenance database to connect to
    #[arg(long, global = true)]
    dbname: Option<String>,

    /// Reject every create, update and delete
    #[arg(long, global = true)]
    readonly: bool,
}

impl Target {
    fn explicit(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.dbname.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a connection and save it as a named profile
    Connect {
        /// Profile name
        name: String,

        /// Read the password from this environment variable instead of storing it
        #[arg(long)]
        password_env: Option<String>,

        /// Save to the per-user config instead of `.pgctl/config.json`
        #[arg(long)]
        global: bool,
    },

    /// List saved connection profiles
    Connections,

    /// Databases
    #[command(subcommand)]
    Database(ResourceOp),

    /// Schemas (per database)
    #[command(subcommand)]
    Schema(ResourceOp),

    /// Tablespaces
    #[command(subcommand)]
    Tablespace(ResourceOp),

    /// Roles
    #[command(subcommand)]
    Role(ResourceOp),

    /// Extensions (per database)
    #[command(subcommand)]
    Extension(ResourceOp),

    /// Replication slots
    #[command(subcommand)]
    Slot(ResourceOp),

    /// Scrape server metrics once
    Metrics,

    /// Serve the REST API
    Serve {
        /// Listen address (overrides the configured one)
        #[arg(long)]
        listen: Option<String>,
    },
}

#[derive(Subcommand)]
enum ResourceOp {
    List {
        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: u64,

        /// Substring filter on the name
        #[arg(long)]
        name: Option<String>,

        /// Only list inside this database (schemas, extensions)
        #[arg(long)]
        database: Option<String>,
    },
    Get {
        name: String,

        /// Owning database (schemas, extensions)
        #[arg(long)]
        database: Option<String>,
    },
    Create {
        /// Resource definition as JSON, or `@path` to read it from a file
        #[arg(long)]
        body: String,
    },
    Update {
        name: String,

        #[arg(long)]
        database: Option<String>,

        /// Fields to change as JSON, or `@path`; omitted fields are left as they are
        #[arg(long)]
        body: String,
    },
    Delete {
        name: String,

        #[arg(long)]
        database: Option<String>,

        /// Cascade to dependent objects / disconnect users where the kind supports it
        #[arg(long)]
        force: bool,
    },
}

impl ResourceOp {
    fn command(&self) -> &'static str {
        match self {
            Self::List { .. } => "list",
            Self::Get { .. } => "get",
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

impl Commands {
    /// `(resource, command)` labels for the output envelope
    fn labels(&self) -> (&'static str, &'static str) {
        match self {
            Self::Connect { .. } => ("", "connect"),
            Self::Connections => ("", "connections"),
            Self::Database(op) => ("database", op.command()),
            Self::Schema(op) => ("schema", op.command()),
            Self::Tablespace(op) => ("tablespace", op.command()),
            Self::Role(op) => ("role", op.command()),
            Self::Extension(op) => ("extension", op.command()),
            Self::Slot(op) => ("slot", op.command()),
            Self::Metrics => ("", "metrics"),
            Self::Serve { .. } => ("", "serve"),
        }
    }
}

/// Command result before it is wrapped in an envelope
struct Outcome {
    data: Value,
    count: Option<u64>,
}

impl Outcome {
    fn of<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self { data: to_json(value)?, count: None })
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| AdminError::internal(format!("cannot serialize result: {e}")))
}

/// Build a resource id from a positional name and an optional `--database`
trait CliId: Sized {
    fn from_cli(name: String, database: Option<String>) -> Result<Self>;
}

impl CliId for ObjectName {
    fn from_cli(name: String, database: Option<String>) -> Result<Self> {
        match database {
            Some(_) => Err(AdminError::bad_parameter("--database only applies to per-database resources")),
            None => Ok(ObjectName::new(name)),
        }
    }
}

impl CliId for ScopedName {
    fn from_cli(name: String, database: Option<String>) -> Result<Self> {
        let database =
            database.ok_or_else(|| AdminError::bad_parameter("--database is required for this resource"))?;
        Ok(ScopedName::new(database, name))
    }
}

/// Parse `--body`: inline JSON or `@path`
fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    let text = match body.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| AdminError::bad_parameter(format!("cannot read body file '{path}': {e}")))?,
        None => body.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| AdminError::bad_parameter(format!("invalid body: {e}")))
}

/// list / get / create / delete, shared by every kind
async fn common<M>(ctx: &Context, manager: &M, op: ResourceOp, readonly: bool) -> Result<Outcome>
where
    M: ListResources + GetResource + CreateResource + DeleteResource,
    M::Id: CliId,
{
    match op {
        ResourceOp::List { offset, limit, name, database } => {
            // Server-wide request types ignore `database`
            let request = serde_json::from_value(json!({
                "offset": offset,
                "limit": limit,
                "name": name,
                "database": database,
            }))
            .map_err(|e| AdminError::bad_parameter(format!("invalid list request: {e}")))?;
            let page = manager.list(ctx, request).await?;
            Ok(Outcome { data: to_json(&page.body)?, count: Some(page.count) })
        }
        ResourceOp::Get { name, database } => {
            let id = M::Id::from_cli(name, database)?;
            Outcome::of(&manager.get(ctx, &id).await?)
        }
        ResourceOp::Create { body } => {
            ensure_writable(readonly)?;
            let meta = parse_body(&body)?;
            Outcome::of(&manager.create(ctx, meta).await?)
        }
        ResourceOp::Delete { name, database, force } => {
            ensure_writable(readonly)?;
            let id = M::Id::from_cli(name, database)?;
            Outcome::of(&manager.delete(ctx, &id, force).await?)
        }
        ResourceOp::Update { .. } => {
            Err(AdminError::bad_parameter(format!("{} resources cannot be updated", M::KIND)))
        }
    }
}

async fn updatable<M>(ctx: &Context, manager: &M, op: ResourceOp, readonly: bool) -> Result<Outcome>
where
    M: ListResources + GetResource + UpdateResource + DeleteResource,
    M::Id: CliId,
{
    match op {
        ResourceOp::Update { name, database, body } => {
            ensure_writable(readonly)?;
            let id = M::Id::from_cli(name, database)?;
            let meta = parse_body(&body)?;
            Outcome::of(&manager.update(ctx, &id, meta).await?)
        }
        other => common(ctx, manager, other, readonly).await,
    }
}

/// Resolve the target connection and open it
async fn open(ctx: &Context, target: &Target) -> Result<(Arc<dyn Executor>, bool)> {
    let (config, readonly) = config::resolve_connection(target.connection.as_deref(), &target.explicit())?;
    let exec = PgExecutor::connect(ctx, &config).await?;
    Ok((Arc::new(exec), readonly || target.readonly))
}

async fn run(ctx: &Context, cli: Cli) -> Result<Outcome> {
    let Cli { target, command } = cli;

    match command {
        Commands::Connect { name, password_env, global } => {
            let mut explicit = target.explicit();
            if let Some(var) = &password_env {
                explicit.password = std::env::var(var).ok();
            }
            let exec = PgExecutor::connect(ctx, &explicit).await?;
            let info = exec.server_info(ctx).await?;

            if password_env.is_some() {
                explicit.password = None;
            }
            let stored = StoredConnection {
                config: explicit,
                password_env,
                readonly: target.readonly.then_some(true),
            };
            let location = if global { ConfigLocation::Global } else { ConfigLocation::Local };
            config::save_connection(&name, stored, location)?;
            Ok(Outcome { data: json!({ "name": name, "server": to_json(&info)? }), count: None })
        }
        Commands::Connections => {
            let connections: Vec<Value> = config::list_connections()?
                .into_iter()
                .map(|(name, config, readonly)| {
                    json!({
                        "name": name,
                        "host": config.host,
                        "port": config.port,
                        "user": config.user,
                        "database": config.database,
                        "readonly": readonly,
                    })
                })
                .collect();
            let count = connections.len() as u64;
            Ok(Outcome { data: Value::Array(connections), count: Some(count) })
        }
        Commands::Metrics => {
            let (exec, _) = open(ctx, &target).await?;
            let settings = config::load_with_precedence()?.server_settings();
            let collection = pgctl::metrics::collect(&*exec, settings.metrics_timeout()).await;
            Ok(Outcome { data: Value::String(collection.render()), count: None })
        }
        Commands::Serve { listen } => serve(ctx, &target, listen).await,
        resource => {
            let (exec, readonly) = open(ctx, &target).await?;
            let catalog = Catalog::new(exec);
            match resource {
                Commands::Database(op) => updatable(ctx, &catalog.databases, op, readonly).await,
                Commands::Schema(op) => updatable(ctx, &catalog.schemas, op, readonly).await,
                Commands::Tablespace(op) => updatable(ctx, &catalog.tablespaces, op, readonly).await,
                Commands::Role(op) => updatable(ctx, &catalog.roles, op, readonly).await,
                Commands::Extension(op) => updatable(ctx, &catalog.extensions, op, readonly).await,
                Commands::Slot(op) => common(ctx, &catalog.slots, op, readonly).await,
                _ => Err(AdminError::internal("unhandled command")),
            }
        }
    }
}

#[cfg(feature = "server")]
async fn serve(ctx: &Context, target: &Target, listen: Option<String>) -> Result<Outcome> {
    let (exec, readonly) = open(ctx, target).await?;
    let mut settings = config::load_with_precedence()?.server_settings();
    if let Some(listen) = listen {
        settings.listen = listen;
    }
    let listen = settings.listen.clone();
    pgctl::http::serve(exec, readonly, settings).await?;
    Ok(Outcome { data: json!({ "listen": listen, "stopped": true }), count: None })
}

#[cfg(not(feature = "server"))]
async fn serve(_ctx: &Context, _target: &Target, _listen: Option<String>) -> Result<Outcome> {
    Err(AdminError::not_available("pgctl was built without the `server` feature"))
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("PGCTL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string(value).context("failed to serialize output envelope")?;
    println!("{text}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let (resource, command) = cli.command.labels();
    init_tracing(if command == "serve" { "info" } else { "warn" });

    // Ctrl-C abandons the running operation; `serve` handles it itself
    let (ctx, cancel) = Context::background().with_cancel();
    if command != "serve" {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let started = Instant::now();
    let outcome = run(&ctx, cli).await;
    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(Outcome { data, count }) => {
            let meta = match count {
                Some(count) => Metadata::with_count(elapsed, count),
                None => Metadata::new(elapsed),
            };
            print_json(&SuccessEnvelope::new(resource, command, data, meta))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            print_json(&ErrorEnvelope::from_error(resource, command, &err))?;
            Ok(ExitCode::FAILURE)
        }
    }
}
