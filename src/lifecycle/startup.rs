//! Startup orchestration and the control loop.
//!
//! # Responsibilities
//! - Block managed signals before any other thread exists
//! - Initialize subsystems in dependency order
//! - Drive the scheduler, database and protocol until termination
//! - Tear down sessions before the runtime and the signal gateway
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The database and protocol live on the loop thread only (`Rc<RefCell>`)
//! - Timers borrow them only while firing, never across `run_once`

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::Signal;

use crate::config::{parse_destination, AgentConfig};
use crate::database::{Database, DatabaseOptions, Query, QueryError, QueryResult};
use crate::error::{AgentError, AgentResult};
use crate::identity::Identity;
use crate::lifecycle::signals::SignalGateway;
use crate::net::tls;
use crate::observability::metrics;
use crate::protocol::{Protocol, SessionSettings};
use crate::scheduler::Scheduler;
use crate::tables;

/// Signals that request an orderly shutdown.
pub const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Run the agent until a shutdown signal, a disconnect with
/// `terminate_on_disconnect`, or completion of `execute`.
pub fn run(config: AgentConfig, execute: Option<String>) -> AgentResult<()> {
    // Must happen before the runtime spawns threads so they inherit the mask.
    let gateway = SignalGateway::new(&SHUTDOWN_SIGNALS)?;
    warn_if_not_root();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("agent-io")
        .build()
        .map_err(|e| AgentError::Fatal(format!("failed to start runtime: {}", e)))?;

    let scheduler = Scheduler::new(config.agent.tick_interval());
    let mut handlers = Vec::with_capacity(SHUTDOWN_SIGNALS.len());
    for signal in SHUTDOWN_SIGNALS {
        let handle = scheduler.handle();
        handlers.push(gateway.register_handler(signal, move || {
            tracing::info!(signal = ?signal, "Shutdown requested");
            handle.terminate();
        })?);
    }

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse().map_err(|e| {
            AgentError::Fatal(format!(
                "invalid metrics address '{}': {}",
                config.observability.metrics_address, e
            ))
        })?;
        let _guard = runtime.enter();
        metrics::init_metrics(addr);
    }

    let mut database = Database::new(DatabaseOptions {
        retention: Duration::from_secs(config.tables.retention_secs),
        max_buffered_rows: config.tables.max_buffered_rows,
    });
    for provider in tables::builtin(&config.tables) {
        database.register(provider)?;
    }
    tracing::info!(tables = ?database.table_names(), "Tables registered");
    let database = Rc::new(RefCell::new(database));

    let protocol = match execute {
        Some(_) => None,
        None => Some(build_protocol(&config, runtime.handle(), &scheduler)?),
    };
    let protocol = Rc::new(RefCell::new(protocol));

    let failure: Rc<RefCell<Option<QueryError>>> = Rc::new(RefCell::new(None));
    let _statement = execute.map(|statement| {
        let database = Rc::clone(&database);
        let failure = Rc::clone(&failure);
        let handle = scheduler.handle();
        let mut statement = Some(statement);
        scheduler.schedule_after(Duration::ZERO, move || {
            if let Some(statement) = statement.take() {
                if let Err(e) = execute_statement(&mut database.borrow_mut(), &statement) {
                    *failure.borrow_mut() = Some(e);
                }
            }
            handle.terminate();
        })
    });

    let _status = config.agent.status_interval().map(|interval| {
        let database = Rc::clone(&database);
        let protocol = Rc::clone(&protocol);
        scheduler.schedule_recurring(interval, move || {
            log_status(&database.borrow(), protocol.borrow().as_ref());
        })
    });

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Agent started");
    while !scheduler.run_once() {
        let mut database = database.borrow_mut();
        database.poll();
        if let Some(protocol) = protocol.borrow_mut().as_mut() {
            protocol.poll(&mut database, Instant::now());
        }
        database.expire(SystemTime::now());
    }

    tracing::info!("Shutting down");
    if let Some(protocol) = protocol.borrow_mut().as_mut() {
        protocol.shutdown(&mut database.borrow_mut());
    }
    runtime.shutdown_timeout(Duration::from_secs(1));
    drop(handlers);
    drop(gateway);

    let failure = failure.borrow_mut().take();
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn build_protocol(
    config: &AgentConfig,
    runtime: &tokio::runtime::Handle,
    scheduler: &Scheduler,
) -> AgentResult<Protocol> {
    let destinations = config
        .peers
        .destinations
        .iter()
        .map(|d| parse_destination(d).map_err(AgentError::Fatal))
        .collect::<AgentResult<Vec<_>>>()?;

    let identity = Identity::load(config).map_err(|e| {
        AgentError::Fatal(format!(
            "cannot read or create agent ID file {}: {}",
            config.agent.id_file.display(),
            e
        ))
    })?;
    tracing::info!(
        agent_id = %identity.agent_id,
        instance_id = %identity.instance_id,
        groups = ?identity.groups,
        peers = destinations.len(),
        "Identity resolved"
    );

    let connector = tls::build_connector(&config.peers.tls)?;

    Ok(Protocol::new(
        destinations,
        SessionSettings::from(&config.peers),
        identity.hello(),
        connector,
        runtime.clone(),
        scheduler.handle(),
    ))
}

/// Parse and run one statement, printing the result table to stdout.
fn execute_statement(database: &mut Database, statement: &str) -> Result<(), QueryError> {
    let query = Query::parse(statement)?;
    database.acquire(&query.table)?;
    database.poll();
    let result = database.execute(&query);
    database.release(&query.table);

    let result = result?;
    print!("{}", render_table(&result));
    Ok(())
}

/// Render a result as an aligned text table.
pub fn render_table(result: &QueryResult) -> String {
    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(ToString::to_string).collect())
        .collect();

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.chars().count()).collect();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |values: &[String]| -> String {
        values
            .iter()
            .zip(&widths)
            .map(|(value, width)| format!("{:<width$}", value, width = *width))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    out.push_str(&line(&result.columns));
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.push('\n');
    for row in &cells {
        out.push_str(&line(row));
        out.push('\n');
    }
    let count = cells.len();
    out.push_str(&format!("({} row{})\n", count, if count == 1 { "" } else { "s" }));
    out
}

fn log_status(database: &Database, protocol: Option<&Protocol>) {
    let active = database.active_tables();
    let buffered: usize = active.iter().map(|t| database.buffered_rows(t)).sum();
    let established = protocol.map_or(0, Protocol::established);
    tracing::info!(
        active_tables = ?active,
        buffered_rows = buffered,
        established_sessions = established,
        "Status"
    );
    if let Some(protocol) = protocol {
        for session in protocol.sessions() {
            tracing::debug!(
                destination = %session.destination,
                state = %session.state,
                peer = ?session.peer_id,
                pending = session.pending_queries,
                subscriptions = session.subscriptions,
                "Session status"
            );
        }
    }
}

fn warn_if_not_root() {
    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root, some tables may return partial results");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Value;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_aligned_table() {
        let result = QueryResult {
            columns: vec!["name".into(), "pid".into()],
            rows: vec![
                vec![Value::Text("init".into()), Value::Integer(1)],
                vec![Value::Text("sshd".into()), Value::Integer(4242)],
            ],
        };
        assert_eq!(
            render_table(&result),
            "name | pid\n-----+-----\ninit | 1\nsshd | 4242\n(2 rows)\n"
        );
    }

    #[test]
    fn renders_empty_result() {
        let result = QueryResult {
            columns: vec!["pid".into()],
            rows: vec![],
        };
        assert_eq!(render_table(&result), "pid\n---\n(0 rows)\n");
    }

    #[test]
    fn statement_errors_are_reported() {
        let mut database = Database::new(DatabaseOptions::default());
        assert!(matches!(
            execute_statement(&mut database, "SELECT * FROM nowhere"),
            Err(QueryError::UnknownTable(_))
        ));
        assert!(matches!(
            execute_statement(&mut database, "DROP TABLE x"),
            Err(QueryError::Syntax(_))
        ));
    }
}
