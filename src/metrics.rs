//! Server Metrics
//!
//! [`collect`] runs four read-only collectors concurrently and renders the result in
//! the Prometheus text exposition format. Each collector owns its own result; one
//! failing collector is reported as `pgctl_collector_up{collector="..."} 0` while the
//! others are still exported.
//!
//! Collection runs under its own deadline, not the caller's, since scrapes arrive on
//! an external schedule.

use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::context::Context;
use crate::error::Result;
use crate::executor::{Executor, Row, Statement};

/// One labelled value
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Vec<(&'static str, String)>,
    pub value: f64,
}

impl Sample {
    fn new(value: f64) -> Self {
        Self { labels: Vec::new(), value }
    }

    fn label(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((name, value.into()));
        self
    }
}

/// A metric family (`# HELP`, `# TYPE`, samples)
#[derive(Debug, Clone, PartialEq)]
pub struct Family {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: &'static str,
    pub samples: Vec<Sample>,
}

impl Family {
    fn gauge(name: &'static str, help: &'static str) -> Self {
        Self { name, help, kind: "gauge", samples: Vec::new() }
    }

    fn with(mut self, sample: Sample) -> Self {
        self.samples.push(sample);
        self
    }
}

/// Everything one scrape produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    pub families: Vec<Family>,
}

impl Collection {
    /// Prometheus text exposition format
    #[must_use]
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.families.iter().try_for_each(|family| write!(f, "{family}"))
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# HELP {} {}", self.name, self.help)?;
        writeln!(f, "# TYPE {} {}", self.name, self.kind)?;
        for sample in &self.samples {
            f.write_str(self.name)?;
            if !sample.labels.is_empty() {
                let labels: Vec<String> = sample
                    .labels
                    .iter()
                    .map(|(name, value)| format!("{name}=\"{}\"", escape_label(value)))
                    .collect();
                write!(f, "{{{}}}", labels.join(","))?;
            }
            writeln!(f, " {}", sample.value)?;
        }
        Ok(())
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn float(row: &Row, column: &str) -> f64 {
    row.opt_float(column).unwrap_or(0.0)
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

async fn server(ctx: &Context, exec: &dyn Executor) -> Result<Vec<Family>> {
    let row = exec
        .query_one(
            ctx,
            &Statement::new(
                "SELECT EXTRACT(EPOCH FROM now() - pg_catalog.pg_postmaster_start_time())::float8 AS uptime,
                        current_setting('server_version_num')::int8 AS version_num,
                        current_setting('max_connections')::int8 AS max_connections,
                        pg_catalog.pg_is_in_recovery() AS in_recovery",
            ),
        )
        .await?;

    Ok(vec![
        Family::gauge("pgctl_server_uptime_seconds", "Seconds since the server started")
            .with(Sample::new(float(&row, "uptime"))),
        Family::gauge("pgctl_server_version_num", "Numeric server version")
            .with(Sample::new(float(&row, "version_num"))),
        Family::gauge("pgctl_server_max_connections", "Configured connection limit")
            .with(Sample::new(float(&row, "max_connections"))),
        Family::gauge("pgctl_server_in_recovery", "1 when the server is a standby")
            .with(Sample::new(flag(row.flag("in_recovery")))),
    ])
}

async fn connections(ctx: &Context, exec: &dyn Executor) -> Result<Vec<Family>> {
    let rows = exec
        .query(
            ctx,
            &Statement::new(
                "SELECT COALESCE(state, 'unknown') AS state, count(*)::int8 AS count
                 FROM pg_catalog.pg_stat_activity
                 WHERE backend_type = 'client backend'
                 GROUP BY 1 ORDER BY 1",
            ),
        )
        .await?;

    let mut family = Family::gauge("pgctl_connections", "Client connections by state");
    for row in &rows {
        family.samples.push(Sample::new(float(row, "count")).label("state", row.text("state")?));
    }
    Ok(vec![family])
}

async fn databases(ctx: &Context, exec: &dyn Executor) -> Result<Vec<Family>> {
    let rows = exec
        .query(
            ctx,
            &Statement::new(
                "SELECT datname::text AS name, pg_catalog.pg_database_size(oid)::int8 AS size_bytes
                 FROM pg_catalog.pg_database
                 WHERE datallowconn AND pg_catalog.has_database_privilege(oid, 'CONNECT')
                 ORDER BY 1",
            ),
        )
        .await?;

    let mut family = Family::gauge("pgctl_database_size_bytes", "Disk space used by each database");
    for row in &rows {
        family
            .samples
            .push(Sample::new(float(row, "size_bytes")).label("database", row.text("name")?));
    }
    Ok(vec![family])
}

async fn slots(ctx: &Context, exec: &dyn Executor) -> Result<Vec<Family>> {
    let rows = exec
        .query(
            ctx,
            &Statement::new(
                "SELECT slot_name::text AS name, slot_type, active,
                        CASE WHEN pg_catalog.pg_is_in_recovery() THEN NULL
                             ELSE pg_catalog.pg_wal_lsn_diff(pg_catalog.pg_current_wal_lsn(), restart_lsn)::int8
                        END AS retained_bytes
                 FROM pg_catalog.pg_replication_slots
                 ORDER BY 1",
            ),
        )
        .await?;

    let mut retained = Family::gauge("pgctl_slot_retained_bytes", "WAL retained by each replication slot");
    let mut active = Family::gauge("pgctl_slot_active", "1 when a consumer is attached to the slot");
    for row in &rows {
        let name = row.text("name")?;
        let slot_type = row.text("slot_type")?;
        retained.samples.push(
            Sample::new(float(row, "retained_bytes"))
                .label("slot", name.clone())
                .label("slot_type", slot_type),
        );
        active.samples.push(Sample::new(flag(row.flag("active"))).label("slot", name));
    }
    Ok(vec![retained, active])
}

/// Scrape the server, bounded by `timeout`
pub async fn collect(exec: &dyn Executor, timeout: Duration) -> Collection {
    let ctx = Context::detached(timeout);

    let (server_up, connections_up, databases_up, slots_up) = tokio::join!(
        server(&ctx, exec),
        connections(&ctx, exec),
        databases(&ctx, exec),
        slots(&ctx, exec),
    );

    let mut up = Family::gauge("pgctl_collector_up", "1 when the collector succeeded");
    let mut families = Vec::new();
    for (collector, outcome) in [
        ("server", server_up),
        ("connections", connections_up),
        ("databases", databases_up),
        ("slots", slots_up),
    ] {
        match outcome {
            Ok(collected) => {
                families.extend(collected);
                up.samples.push(Sample::new(1.0).label("collector", collector));
            }
            Err(err) => {
                warn!(collector, error = %err, "metrics collector failed");
                up.samples.push(Sample::new(0.0).label("collector", collector));
            }
        }
    }
    families.push(up);

    Collection { families }
}
