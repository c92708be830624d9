//! Peer transport tasks.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Run one tokio task per connection: TCP connect, optional TLS
//!   handshake, newline-delimited frame reading and writing
//! - Hand every outcome to the control loop as a `TransportEvent`
//!
//! # Data Flow
//! ```text
//! session (loop thread) ── send(Message) ──▶ outbound channel ──▶ task writes frame
//! task reads frame ──▶ events channel ──▶ SchedulerHandle::wake() ──▶ session.try_recv()
//! ```
//!
//! # Design Decisions
//! - The task never touches session or database state, only channels
//! - Dropping the `Transport` aborts the task, closing the socket

use std::sync::atomic::{AtomicU64, Ordering};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use crate::protocol::message::{Message, MAX_FRAME_LEN};
use crate::scheduler::SchedulerHandle;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Something the transport task observed.
#[derive(Debug)]
pub enum TransportEvent {
    /// TCP connected and, with TLS enabled, the handshake completed.
    Connected,
    /// A frame arrived from the peer.
    Frame(Message),
    /// The connection failed or ended; no further events follow.
    Closed(String),
}

/// Where and how to connect.
#[derive(Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConnector>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Loop-thread side of one connection.
pub struct Transport {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    task: JoinHandle<()>,
}

impl Transport {
    /// Start connecting to `endpoint` on `runtime`. Every event wakes the
    /// control loop through `waker`.
    pub fn spawn(runtime: &Handle, endpoint: Endpoint, waker: SchedulerHandle) -> Self {
        let id = ConnectionId::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let events = EventSink {
            tx: events_tx,
            waker,
        };
        let task = runtime.spawn(async move {
            let reason = match run(id, &endpoint, outbound_rx, &events).await {
                Ok(()) => "closed by peer".to_string(),
                Err(reason) => reason,
            };
            tracing::debug!(connection_id = %id, reason = %reason, "Transport finished");
            events.emit(TransportEvent::Closed(reason));
        });

        Self {
            id,
            outbound: outbound_tx,
            events: events_rx,
            task,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue `message` for sending. False once the task has ended.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Next pending event, without blocking.
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    waker: SchedulerHandle,
}

impl EventSink {
    fn emit(&self, event: TransportEvent) {
        if self.tx.send(event).is_ok() {
            self.waker.wake();
        }
    }
}

async fn run(
    id: ConnectionId,
    endpoint: &Endpoint,
    outbound: mpsc::UnboundedReceiver<Message>,
    events: &EventSink,
) -> Result<(), String> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| format!("connect failed: {}", e))?;
    let _ = tcp.set_nodelay(true);

    match &endpoint.tls {
        Some(connector) => {
            let server_name = ServerName::try_from(endpoint.host.clone())
                .map_err(|e| format!("invalid server name '{}': {}", endpoint.host, e))?;
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| format!("TLS handshake failed: {}", e))?;
            tracing::debug!(connection_id = %id, host = %endpoint.host, "TLS established");
            events.emit(TransportEvent::Connected);
            pump(id, stream, outbound, events).await
        }
        None => {
            events.emit(TransportEvent::Connected);
            pump(id, tcp, outbound, events).await
        }
    }
}

/// Move frames in both directions until either side ends.
async fn pump<S>(
    id: ConnectionId,
    stream: S,
    outbound: mpsc::UnboundedReceiver<Message>,
    events: &EventSink,
) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);

    tokio::select! {
        result = read_frames(id, reader, events) => result,
        result = write_frames(writer, outbound) => result,
    }
}

async fn read_frames<R>(id: ConnectionId, reader: R, events: &EventSink) -> Result<(), String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = (&mut reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_line(&mut line)
            .await
            .map_err(|e| format!("read failed: {}", e))?;
        if n == 0 {
            return Ok(());
        }
        if !line.ends_with('\n') {
            if line.len() > MAX_FRAME_LEN {
                return Err("frame too large".to_string());
            }
            // Partial final line before EOF.
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        match Message::decode(&line) {
            Ok(message) => events.emit(TransportEvent::Frame(message)),
            Err(e) => tracing::warn!(connection_id = %id, error = %e, "Dropping malformed frame"),
        }
    }
}

async fn write_frames<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Message>) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let frame = message.encode().map_err(|e| format!("encode failed: {}", e))?;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| format!("write failed: {}", e))?;
        writer.flush().await.map_err(|e| format!("write failed: {}", e))?;
    }
    Ok(())
}
