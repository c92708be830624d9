//! Peer session manager driven by the control loop.

use std::time::Instant;

use tokio::runtime::Handle;
use tokio_rustls::TlsConnector;

use crate::database::Database;
use crate::net::connection::Endpoint;
use crate::observability::metrics;
use crate::protocol::message::Hello;
use crate::protocol::session::{Context, Session, SessionSettings, SessionState};
use crate::scheduler::SchedulerHandle;

/// Snapshot of one session for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub destination: String,
    pub state: SessionState,
    pub peer_id: Option<String>,
    pub pending_queries: usize,
    pub subscriptions: usize,
}

/// Maintains one reconnecting session per destination.
pub struct Protocol {
    settings: SessionSettings,
    hello: Hello,
    runtime: Handle,
    scheduler: SchedulerHandle,
    sessions: Vec<Session>,
    /// Session that gets the first query slot on the next poll.
    next_turn: usize,
}

impl Protocol {
    /// Create a session per `(host, port)` destination. Connections start on
    /// the first `poll`.
    pub fn new(
        destinations: Vec<(String, u16)>,
        settings: SessionSettings,
        hello: Hello,
        tls: Option<TlsConnector>,
        runtime: Handle,
        scheduler: SchedulerHandle,
    ) -> Self {
        let now = Instant::now();
        let sessions = destinations
            .into_iter()
            .map(|(host, port)| {
                let destination = if host.contains(':') {
                    format!("[{}]:{}", host, port)
                } else {
                    format!("{}:{}", host, port)
                };
                let endpoint = Endpoint {
                    host,
                    port,
                    tls: tls.clone(),
                };
                Session::new(destination, endpoint, now)
            })
            .collect();

        Self {
            settings,
            hello,
            runtime,
            scheduler,
            sessions,
            next_turn: 0,
        }
    }

    /// Advance every session by one tick, then run up to
    /// `max_queries_per_tick` queries across them.
    pub fn poll(&mut self, db: &mut Database, now: Instant) {
        let ctx = Context {
            settings: &self.settings,
            hello: &self.hello,
            runtime: &self.runtime,
            scheduler: &self.scheduler,
        };
        for session in &mut self.sessions {
            session.advance(&ctx, db, now);
        }

        self.run_queries(db, now);
        metrics::record_established_sessions(self.established());
    }

    /// Round-robin over sessions, starting after the last one served.
    fn run_queries(&mut self, db: &mut Database, now: Instant) {
        let count = self.sessions.len();
        if count == 0 {
            return;
        }

        let mut budget = self.settings.max_queries_per_tick;
        let mut idle_rounds = 0;
        let mut index = self.next_turn % count;

        while budget > 0 && idle_rounds < count {
            if self.sessions[index].run_one(db, now) {
                budget -= 1;
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
            }
            index = (index + 1) % count;
        }
        self.next_turn = index;

        if budget == 0 && self.sessions.iter().any(|s| s.has_due_work(now)) {
            tracing::debug!(
                limit = self.settings.max_queries_per_tick,
                "Query budget exhausted, deferring remaining queries"
            );
            self.scheduler.wake();
        }
    }

    /// Close every session and release their query state.
    pub fn shutdown(&mut self, db: &mut Database) {
        for session in &mut self.sessions {
            session.shutdown(db);
        }
    }

    /// Number of sessions currently established.
    pub fn established(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state() == SessionState::Established)
            .count()
    }

    pub fn session_states(&self) -> Vec<SessionState> {
        self.sessions.iter().map(Session::state).collect()
    }

    pub fn sessions(&self) -> Vec<SessionStatus> {
        self.sessions
            .iter()
            .map(|s| SessionStatus {
                destination: s.destination().to_string(),
                state: s.state(),
                peer_id: s.peer().map(|p| p.id.clone()),
                pending_queries: s.pending_queries(),
                subscriptions: s.subscriptions(),
            })
            .collect()
    }
}
