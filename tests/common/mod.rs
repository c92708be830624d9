//! Shared utilities for integration testing: a mock monitoring peer and a
//! synchronous agent harness driving one `Protocol`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use telemetry_agent::database::{
    Database, DatabaseOptions, Predicate, Row, Schema, SnapshotTable, TableError, TableProvider,
    Value, ValueType,
};
use telemetry_agent::protocol::{Hello, Message, Protocol, SessionSettings, SessionState};
use telemetry_agent::scheduler::Scheduler;

/// When the mock peer answers the agent's hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloMode {
    Never,
    /// First hello on each connection only; the peer is silent afterwards.
    Once,
    Always,
}

/// A monitoring peer accepting agent connections on 127.0.0.1.
pub struct MockPeer {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Message>>>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
}

impl MockPeer {
    pub fn start(runtime: &Runtime, mode: HelloMode, tls: Option<TlsAcceptor>) -> Self {
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = Self {
            port,
            connections: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            current: Arc::new(Mutex::new(None)),
        };

        let connections = Arc::clone(&peer.connections);
        let received = Arc::clone(&peer.received);
        let current = Arc::clone(&peer.current);
        runtime.spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                *current.lock().unwrap() = Some(tx);

                let received = Arc::clone(&received);
                let acceptor = tls.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            if let Ok(stream) = acceptor.accept(socket).await {
                                serve(stream, mode, received, rx).await;
                            }
                        }
                        None => serve(socket, mode, received, rx).await,
                    }
                });
            }
        });

        peer
    }

    /// Send a frame on the newest connection.
    pub fn send(&self, message: Message) {
        if let Some(tx) = self.current.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    /// Response or error the agent sent for `query_id`, if any.
    pub fn reply_to(&self, query_id: u64) -> Option<Message> {
        self.received().into_iter().find(|m| match m {
            Message::QueryResponse { query_id: id, .. } => *id == query_id,
            Message::Error { query_id: id, .. } => *id == Some(query_id),
            _ => false,
        })
    }
}

async fn serve<S>(
    stream: S,
    mode: HelloMode,
    received: Arc<Mutex<Vec<Message>>>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let mut greeted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                let message = Message::decode(&line).unwrap();
                let is_hello = matches!(message, Message::Hello(_));
                received.lock().unwrap().push(message);

                let reply = is_hello
                    && match mode {
                        HelloMode::Never => false,
                        HelloMode::Once => !greeted,
                        HelloMode::Always => true,
                    };
                if reply {
                    greeted = true;
                    let frame = Message::Hello(peer_hello()).encode().unwrap();
                    if writer.write_all(frame.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
            message = outbound.recv() => {
                let frame = match message {
                    Some(message) => message.encode().unwrap(),
                    None => break,
                };
                if writer.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn peer_hello() -> Hello {
    Hello {
        id: "monitor-1".into(),
        instance_id: "monitor-instance".into(),
        groups: vec![],
        hostname: "monitor".into(),
        version: "1.0.0".into(),
    }
}

/// Self-signed certificate for `name`.
pub fn certificate(name: &str) -> rcgen::CertifiedKey {
    rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap()
}

/// Server-side TLS acceptor presenting `cert`.
pub fn acceptor(cert: &rcgen::CertifiedKey) -> TlsAcceptor {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.der().clone()], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Snapshot table with the rows `n = 1, 2, 3`.
pub struct Numbers;

impl SnapshotTable for Numbers {
    fn schema(&self) -> Schema {
        Schema::new("numbers", "small integers").column("n", ValueType::Integer, "the number")
    }

    fn snapshot(&mut self, _predicates: &[Predicate]) -> Result<Vec<Row>, TableError> {
        Ok((1..=3).map(|n| vec![Value::Integer(n)]).collect())
    }
}

pub fn settings() -> SessionSettings {
    SessionSettings {
        reconnect_interval: Duration::from_secs(30),
        timeout: Duration::from_secs(30),
        hello_interval: Duration::from_secs(10),
        terminate_on_disconnect: false,
        max_queries_per_tick: 10,
    }
}

/// The agent side: scheduler, database and one session, driven like the
/// control loop.
pub struct Harness {
    pub scheduler: Scheduler,
    pub database: Database,
    pub protocol: Protocol,
}

impl Harness {
    pub fn new(
        runtime: &Runtime,
        host: &str,
        port: u16,
        settings: SessionSettings,
        tls: Option<TlsConnector>,
    ) -> Self {
        Self::with_tick(runtime, host, port, settings, tls, Duration::from_millis(10))
    }

    /// Like `new`, with a custom upper bound on one scheduler wait.
    pub fn with_tick(
        runtime: &Runtime,
        host: &str,
        port: u16,
        settings: SessionSettings,
        tls: Option<TlsConnector>,
        tick: Duration,
    ) -> Self {
        let scheduler = Scheduler::new(tick);
        let mut database = Database::new(DatabaseOptions::default());
        database.register(TableProvider::Snapshot(Box::new(Numbers))).unwrap();

        let hello = Hello {
            id: "agent-test".into(),
            instance_id: "instance-test".into(),
            groups: vec!["all".into()],
            hostname: "test-host".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        };
        let protocol = Protocol::new(
            vec![(host.to_string(), port)],
            settings,
            hello,
            tls,
            runtime.handle().clone(),
            scheduler.handle(),
        );

        Self {
            scheduler,
            database,
            protocol,
        }
    }

    /// Run loop iterations until `done` holds or `timeout` passes.
    pub fn run_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&Protocol, &Database) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.tick();
            if done(&self.protocol, &self.database) {
                return true;
            }
        }
        false
    }

    /// Run loop iterations for `duration`.
    pub fn run_for(&mut self, duration: Duration) {
        self.run_until(duration, |_, _| false);
    }

    pub fn tick(&mut self) {
        self.scheduler.run_once();
        self.database.poll();
        self.protocol.poll(&mut self.database, Instant::now());
        self.database.expire(std::time::SystemTime::now());
    }

    pub fn state(&self) -> SessionState {
        self.protocol.session_states()[0]
    }
}
