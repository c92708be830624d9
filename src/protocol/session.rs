//! One peer session: connection state, pending queries and subscriptions.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;

use crate::config::PeerConfig;
use crate::database::{Database, Query, QueryError, TableMode};
use crate::net::connection::{Endpoint, Transport, TransportEvent};
use crate::observability::metrics;
use crate::protocol::message::{Hello, Message, QueryRequest};
use crate::resilience::reconnect_delay;
use crate::scheduler::SchedulerHandle;

/// Timing and limits shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub reconnect_interval: Duration,
    /// Longest silence tolerated from the peer, in any connected state.
    pub timeout: Duration,
    pub hello_interval: Duration,
    pub terminate_on_disconnect: bool,
    pub max_queries_per_tick: usize,
}

impl From<&PeerConfig> for SessionSettings {
    fn from(config: &PeerConfig) -> Self {
        Self {
            reconnect_interval: config.reconnect_interval(),
            timeout: config.timeout(),
            hello_interval: config.hello_interval(),
            terminate_on_disconnect: config.terminate_on_disconnect,
            max_queries_per_tick: config.max_queries_per_tick,
        }
    }
}

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Established,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Established => "established",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context a session needs while advancing.
pub(crate) struct Context<'a> {
    pub settings: &'a SessionSettings,
    pub hello: &'a Hello,
    pub runtime: &'a Handle,
    pub scheduler: &'a SchedulerHandle,
}

/// A one-shot or first-run query waiting for its turn.
struct PendingQuery {
    query_id: u64,
    query: Query,
    interval: Option<Duration>,
}

/// A recurring query installed by the peer.
struct Subscription {
    query: Query,
    interval: Duration,
    next_due: Instant,
    cursor: u64,
}

pub(crate) struct Session {
    destination: String,
    endpoint: Endpoint,
    state: SessionState,
    transport: Option<Transport>,
    /// Last time anything arrived from the peer.
    last_activity: Instant,
    last_hello: Instant,
    /// `None` means connect on the next poll.
    next_reconnect: Option<Instant>,
    peer: Option<Hello>,
    pending: VecDeque<PendingQuery>,
    subscriptions: BTreeMap<u64, Subscription>,
}

impl Session {
    pub(crate) fn new(destination: String, endpoint: Endpoint, now: Instant) -> Self {
        Self {
            destination,
            endpoint,
            state: SessionState::Disconnected,
            transport: None,
            last_activity: now,
            last_hello: now,
            next_reconnect: None,
            peer: None,
            pending: VecDeque::new(),
            subscriptions: BTreeMap::new(),
        }
    }

    pub(crate) fn destination(&self) -> &str {
        &self.destination
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn peer(&self) -> Option<&Hello> {
        self.peer.as_ref()
    }

    pub(crate) fn pending_queries(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Process transport events and connection timers. Never blocks.
    pub(crate) fn advance(&mut self, ctx: &Context<'_>, db: &mut Database, now: Instant) {
        while let Some(event) = self.transport.as_mut().and_then(Transport::try_recv) {
            match event {
                TransportEvent::Connected => self.on_connected(ctx, now),
                TransportEvent::Frame(message) => self.on_message(db, message, now),
                TransportEvent::Closed(reason) => {
                    self.teardown(ctx, db, now, &reason);
                    break;
                }
            }
        }

        match self.state {
            SessionState::Disconnected => {
                if self.next_reconnect.map_or(true, |due| now >= due) {
                    self.connect(ctx, now);
                }
            }
            SessionState::Connecting | SessionState::Handshaking | SessionState::Established => {
                if now.saturating_duration_since(self.last_activity) > ctx.settings.timeout {
                    let reason = if self.state == SessionState::Established {
                        "peer timed out"
                    } else {
                        "connection setup timed out"
                    };
                    self.teardown(ctx, db, now, reason);
                } else if self.state == SessionState::Established
                    && now.saturating_duration_since(self.last_hello) >= ctx.settings.hello_interval
                {
                    self.send_hello(ctx, now);
                }
            }
        }
    }

    /// Whether a query could run now.
    pub(crate) fn has_due_work(&self, now: Instant) -> bool {
        self.state == SessionState::Established
            && (!self.pending.is_empty() || self.subscriptions.values().any(|s| s.next_due <= now))
    }

    /// Execute one pending or due query. Returns false if nothing ran.
    pub(crate) fn run_one(&mut self, db: &mut Database, now: Instant) -> bool {
        if self.state != SessionState::Established {
            return false;
        }

        if let Some(pending) = self.pending.pop_front() {
            self.run_pending(db, pending, now);
            return true;
        }

        let due = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.next_due <= now)
            .min_by_key(|(_, s)| s.next_due)
            .map(|(id, _)| *id);
        match due {
            Some(query_id) => {
                self.run_subscription(db, query_id, now);
                true
            }
            None => false,
        }
    }

    /// Drop the connection and all query state.
    pub(crate) fn shutdown(&mut self, db: &mut Database) {
        self.transport = None;
        self.discard_queries(db);
        self.state = SessionState::Disconnected;
    }

    fn connect(&mut self, ctx: &Context<'_>, now: Instant) {
        let transport = Transport::spawn(ctx.runtime, self.endpoint.clone(), ctx.scheduler.clone());
        tracing::info!(
            destination = %self.destination,
            connection_id = %transport.id(),
            tls = self.endpoint.tls.is_some(),
            "Connecting to peer"
        );
        self.transport = Some(transport);
        self.last_activity = now;
        self.next_reconnect = None;
        self.transition(SessionState::Connecting);
    }

    fn on_connected(&mut self, ctx: &Context<'_>, now: Instant) {
        if self.state != SessionState::Connecting {
            return;
        }
        self.transition(SessionState::Handshaking);
        self.send_hello(ctx, now);
    }

    fn on_message(&mut self, db: &mut Database, message: Message, now: Instant) {
        self.last_activity = now;

        match message {
            Message::Hello(peer) => {
                if self.state == SessionState::Handshaking {
                    tracing::info!(
                        destination = %self.destination,
                        peer_id = %peer.id,
                        peer_version = %peer.version,
                        "Peer session established"
                    );
                    self.transition(SessionState::Established);
                }
                self.peer = Some(peer);
            }
            Message::Heartbeat => {}
            Message::QueryRequest(request) => {
                if self.state != SessionState::Established {
                    self.send(Message::Error {
                        query_id: Some(request.query_id),
                        message: "session not established".to_string(),
                    });
                    return;
                }
                self.enqueue(db, request);
            }
            Message::CancelQuery { query_id } => self.cancel(db, query_id),
            other => {
                tracing::debug!(destination = %self.destination, kind = other.kind(), "Ignoring message from peer");
            }
        }
    }

    fn enqueue(&mut self, db: &mut Database, request: QueryRequest) {
        let query_id = request.query_id;
        let duplicate = self.subscriptions.contains_key(&query_id) || self.pending.iter().any(|p| p.query_id == query_id);
        if duplicate {
            self.send(Message::Error {
                query_id: Some(query_id),
                message: format!("query {} is already active", query_id),
            });
            return;
        }
        if request.interval_secs == Some(0) {
            self.send(Message::Error {
                query_id: Some(query_id),
                message: "interval_secs must be greater than zero".to_string(),
            });
            return;
        }

        if let Err(e) = db.acquire(&request.table) {
            tracing::debug!(destination = %self.destination, query_id, error = %e, "Rejecting query");
            self.send(Message::Error {
                query_id: Some(query_id),
                message: e.to_string(),
            });
            return;
        }

        tracing::debug!(
            destination = %self.destination,
            query_id,
            table = %request.table,
            interval_secs = ?request.interval_secs,
            "Query queued"
        );
        self.pending.push_back(PendingQuery {
            query_id,
            query: request.to_query(),
            interval: request.interval_secs.map(Duration::from_secs),
        });
    }

    fn cancel(&mut self, db: &mut Database, query_id: u64) {
        if let Some(subscription) = self.subscriptions.remove(&query_id) {
            db.release(&subscription.query.table);
        }
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            if pending.query_id == query_id {
                db.release(&pending.query.table);
            } else {
                kept.push_back(pending);
            }
        }
        self.pending = kept;
        tracing::debug!(destination = %self.destination, query_id, "Query cancelled");
    }

    fn run_pending(&mut self, db: &mut Database, pending: PendingQuery, now: Instant) {
        let PendingQuery {
            query_id,
            query,
            interval,
        } = pending;

        match db.execute_since(&query, 0) {
            Ok((result, cursor)) => {
                self.send(Message::QueryResponse {
                    query_id,
                    columns: result.columns,
                    rows: result.rows,
                });
                match interval {
                    // The interest taken at enqueue time now belongs to the subscription.
                    Some(interval) => {
                        self.subscriptions.insert(
                            query_id,
                            Subscription {
                                query,
                                interval,
                                next_due: now + interval,
                                cursor,
                            },
                        );
                    }
                    None => db.release(&query.table),
                }
            }
            Err(e) => {
                db.release(&query.table);
                self.send_error(query_id, &e);
            }
        }
    }

    fn run_subscription(&mut self, db: &mut Database, query_id: u64, now: Instant) {
        let subscription = match self.subscriptions.get_mut(&query_id) {
            Some(s) => s,
            None => return,
        };
        subscription.next_due = now + subscription.interval;

        let incremental = db.mode(&subscription.query.table) == Some(TableMode::Event);
        let from = if incremental { subscription.cursor } else { 0 };
        let outcome = db.execute_since(&subscription.query, from);

        match outcome {
            Ok((result, cursor)) => {
                subscription.cursor = cursor;
                if incremental && result.rows.is_empty() {
                    return;
                }
                self.send(Message::QueryResponse {
                    query_id,
                    columns: result.columns,
                    rows: result.rows,
                });
            }
            Err(e) => {
                if let Some(subscription) = self.subscriptions.remove(&query_id) {
                    db.release(&subscription.query.table);
                }
                self.send_error(query_id, &e);
            }
        }
    }

    fn teardown(&mut self, ctx: &Context<'_>, db: &mut Database, now: Instant, reason: &str) {
        let was = self.state;
        self.transport = None;
        self.discard_queries(db);
        self.transition(SessionState::Disconnected);

        if ctx.settings.terminate_on_disconnect {
            tracing::warn!(destination = %self.destination, reason = %reason, "Peer disconnected, terminating");
            ctx.scheduler.terminate();
            self.next_reconnect = Some(now + ctx.settings.reconnect_interval);
            return;
        }

        let delay = reconnect_delay(ctx.settings.reconnect_interval);
        self.next_reconnect = Some(now + delay);
        tracing::warn!(
            destination = %self.destination,
            previous_state = %was,
            reason = %reason,
            retry_in_ms = delay.as_millis() as u64,
            "Peer session closed"
        );
    }

    fn discard_queries(&mut self, db: &mut Database) {
        for pending in self.pending.drain(..) {
            db.release(&pending.query.table);
        }
        for (_, subscription) in std::mem::take(&mut self.subscriptions) {
            db.release(&subscription.query.table);
        }
        self.peer = None;
    }

    fn send_hello(&mut self, ctx: &Context<'_>, now: Instant) {
        self.last_hello = now;
        self.send(Message::Hello(ctx.hello.clone()));
    }

    fn send_error(&mut self, query_id: u64, error: &QueryError) {
        self.send(Message::Error {
            query_id: Some(query_id),
            message: error.to_string(),
        });
    }

    fn send(&mut self, message: Message) {
        let kind = message.kind();
        let sent = self.transport.as_ref().map_or(false, |t| t.send(message));
        if !sent {
            // The transport's Closed event drives the teardown.
            tracing::debug!(destination = %self.destination, kind, "Dropping message for closed transport");
        }
    }

    fn transition(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(destination = %self.destination, from = %self.state, to = %state, "Session state change");
        self.state = state;
        metrics::record_session_transition(state.as_str());
    }
}
