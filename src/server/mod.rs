//! Per-core asynchronous RPC server.
//!
//! One [`Server`] instance is owned by one shard: it accepts connections
//! on its configured endpoints, decodes framed requests, dispatches them
//! to registered services under the shard's memory budget, and writes
//! framed replies back in arrival order. Shutdown drains every in-flight
//! handler before returning.

mod connection;
pub mod context;
pub mod memory;
pub mod probe;
pub mod service;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context as _, Result, bail};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedMutexGuard, mpsc, oneshot};
use tokio_rustls::{TlsAcceptor, rustls};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{HEADER_SIZE, Header};
use crate::server::connection::{Connection, ConnectionRegistry, GuardedRead, ServerStream};
use crate::server::probe::{LatencyHistogram, Probe};
use crate::server::service::ServiceRegistry;

pub use crate::server::context::{RequestBody, StreamingContext};
pub use crate::server::memory::{MemoryPool, MemoryUnits};
pub use crate::server::probe::{HistogramSnapshot, ProbeSnapshot, ServerMetrics};
pub use crate::server::service::{MapService, Method, Service};

const LISTEN_BACKLOG: u32 = 1024;

/// Default per-shard memory budget for in-flight requests.
pub const DEFAULT_MAX_SERVICE_MEMORY_PER_CORE: usize = 512 * 1024 * 1024;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Listen endpoints; each is bound independently.
    pub addrs: Vec<SocketAddr>,
    /// TLS credentials for the listeners; `None` means plaintext.
    pub credentials: Option<Arc<rustls::ServerConfig>>,
    /// Initial unit count of the admission controller, in bytes.
    pub max_service_memory_per_core: usize,
    /// When true, [`Server::metrics`] returns `None`.
    pub disable_metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            credentials: None,
            max_service_memory_per_core: DEFAULT_MAX_SERVICE_MEMORY_PER_CORE,
            disable_metrics: false,
        }
    }
}

struct PendingReply {
    correlation_id: u32,
    dispatched: Instant,
    reply: oneshot::Receiver<Result<crate::protocol::ReplyBuf>>,
}

/// Per-core RPC server.
///
/// Register services, wrap in an [`Arc`], `start()`, and eventually
/// `stop()`. No new dispatches are admitted once `stop()` begins, and
/// `stop()` resolves only after every spawned dispatch has returned.
pub struct Server {
    cfg: ServerConfig,
    memory: Arc<MemoryPool>,
    tls: Option<TlsAcceptor>,
    connections: ConnectionRegistry,
    conn_gate: TaskTracker,
    abort: CancellationToken,
    probe: Arc<Probe>,
    hist: Arc<LatencyHistogram>,
    services: ServiceRegistry,
    bound: Mutex<Vec<SocketAddr>>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Self {
        let memory = Arc::new(MemoryPool::new(cfg.max_service_memory_per_core));
        let tls = cfg.credentials.clone().map(TlsAcceptor::from);
        Self {
            cfg,
            memory,
            tls,
            connections: ConnectionRegistry::new(),
            conn_gate: TaskTracker::new(),
            abort: CancellationToken::new(),
            probe: Arc::new(Probe::new()),
            hist: Arc::new(LatencyHistogram::new()),
            services: ServiceRegistry::new(),
            bound: Mutex::new(Vec::new()),
        }
    }

    /// Registers a service. Must happen before [`Server::start`];
    /// duplicate method ids resolve to the earliest registered service.
    pub fn register(&mut self, service: Box<dyn Service>) {
        self.services.register(service);
    }

    /// Binds every configured address and spawns its accept loop.
    ///
    /// Any bind failure fails the whole start.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for addr in &self.cfg.addrs {
            let listener = bind(*addr)
                .with_context(|| format!("error attempting to listen on {addr}"))?;
            let local = listener
                .local_addr()
                .context("listener has no local address")?;
            info!(addr = %local, tls = self.tls.is_some(), "Listening");
            self.bound
                .lock()
                .expect("bound address lock poisoned")
                .push(local);
            let srv = Arc::clone(self);
            let _ = self.conn_gate.spawn(srv.accept_loop(listener));
        }
        Ok(())
    }

    /// Addresses actually bound by `start()`, in configuration order.
    /// Useful when configured with port 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound
            .lock()
            .expect("bound address lock poisoned")
            .clone()
    }

    /// Metrics snapshot, or `None` when metrics are disabled.
    pub fn metrics(&self) -> Option<ServerMetrics> {
        if self.cfg.disable_metrics {
            return None;
        }
        Some(ServerMetrics {
            rpc_services: self.services.len(),
            rpc_max_service_mem: self.memory.capacity(),
            rpc_consumed_mem: self.memory.consumed(),
            rpc_dispatch_handler_latency: self.hist.snapshot(),
            memory_waiters: self.memory.waiters(),
            probe: self.probe.snapshot(),
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.abort.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            if self.abort.is_cancelled() {
                break;
            }
            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            configure_socket(&socket, peer);
            trace!(peer = %peer, "Incoming connection");
            if self.conn_gate.is_closed() {
                debug!(peer = %peer, "Gate closed, refusing connection");
                break;
            }
            let srv = Arc::clone(&self);
            let _ = self
                .conn_gate
                .spawn(async move { srv.handle_connection(socket, peer).await });
        }
    }

    /// Runs one connection from TLS handshake to teardown.
    async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let stream = match &self.tls {
            None => ServerStream::Plain(socket),
            Some(acceptor) => {
                let handshake = tokio::select! {
                    _ = self.abort.cancelled() => {
                        debug!(peer = %peer, "Abort requested during TLS handshake");
                        return;
                    }
                    handshake = acceptor.accept(socket) => handshake,
                };
                match handshake {
                    Ok(stream) => ServerStream::Tls(stream),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "TLS handshake failed");
                        return;
                    }
                }
            }
        };
        let conn = self.connections.register(stream, peer);
        let result = self.dispatch_loop(&conn).await;
        debug!(peer = %conn.addr, "Closing client");
        conn.shutdown().await;
        if let Err(e) = result {
            error!(peer = %conn.addr, error = %e, "Error dispatching method");
        }
        self.connections.deregister(&conn);
    }

    /// Parses headers and dispatches methods until EOF or abort, then
    /// waits for the reply writer to drain before the connection is torn
    /// down.
    async fn dispatch_loop(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let writer = {
            let srv = Arc::clone(self);
            let conn = Arc::clone(conn);
            self.conn_gate
                .spawn(async move { srv.write_replies(conn, reply_rx).await })
        };
        let result = self.parse_requests(conn, &reply_tx).await;
        drop(reply_tx);
        let _ = writer.await;
        result
    }

    async fn parse_requests(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        reply_tx: &mpsc::UnboundedSender<PendingReply>,
    ) -> Result<()> {
        loop {
            if self.abort.is_cancelled() || conn.is_shutdown() {
                return Ok(());
            }
            let mut input = conn.lock_input().await;
            match read_header(&mut input).await? {
                HeaderRead::Eof => return Ok(()),
                HeaderRead::Corrupt => {
                    debug!(peer = %conn.addr, "Could not parse header from client");
                    self.probe.header_corrupted();
                    continue;
                }
                HeaderRead::Complete(header) => {
                    self.dispatch_once(header, input, conn, reply_tx).await?;
                }
            }
        }
    }

    /// Dispatches one parsed request, then waits for the body-parsed
    /// signal so the next header can be read.
    async fn dispatch_once(
        self: &Arc<Self>,
        header: Header,
        input: OwnedMutexGuard<GuardedRead>,
        conn: &Arc<Connection>,
        replies: &mpsc::UnboundedSender<PendingReply>,
    ) -> Result<()> {
        let method_id = header.meta;
        let Some(method) = self.services.lookup(method_id) else {
            self.probe.method_not_found();
            bail!(
                "received invalid rpc request for method {method_id} from {}",
                conn.addr
            );
        };
        self.probe
            .add_bytes_received(HEADER_SIZE as u64 + u64::from(header.size));
        if self.conn_gate.is_closed() {
            bail!("connection gate closed");
        }
        let correlation_id = header.correlation_id;
        let body = RequestBody::new(input, u64::from(header.size));
        let (mut ctx, body_parsed) =
            StreamingContext::new(header, Arc::clone(&self.memory), Arc::clone(&self.probe));
        let (done_tx, done_rx) = oneshot::channel();
        let _ = replies.send(PendingReply {
            correlation_id,
            dispatched: Instant::now(),
            reply: done_rx,
        });
        let _ = self.conn_gate.spawn(async move {
            let result = method.handle(body, &mut ctx).await;
            let _ = done_tx.send(result);
        });
        // The next header may be parsed as soon as the current body is
        // consumed; reply production overlaps with subsequent parsing.
        let _ = body_parsed.await;
        Ok(())
    }

    /// Drains reply slots in arrival order and writes each one out.
    async fn write_replies(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut replies: mpsc::UnboundedReceiver<PendingReply>,
    ) {
        while let Some(pending) = replies.recv().await {
            let produced = match pending.reply.await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("handler finished without a reply")),
            };
            let mut reply = match produced {
                Ok(reply) => reply,
                Err(e) => {
                    error!(peer = %conn.addr, error = %e, "Method handler failed");
                    self.probe.request_completed();
                    conn.shutdown_input();
                    break;
                }
            };
            reply.set_correlation_id(pending.correlation_id);
            if self.conn_gate.is_closed() {
                debug!(
                    peer = %conn.addr,
                    bytes = reply.payload_len(),
                    "Skipping write, connection is closed"
                );
            } else if let Err(e) = conn.write_reply(&reply).await {
                warn!(peer = %conn.addr, error = %e, "Failed to write reply");
                self.probe.request_completed();
                conn.shutdown_input();
                break;
            }
            self.hist.record(pending.dispatched.elapsed());
            self.probe.request_completed();
        }
    }

    /// Stops accepting, drains in-flight dispatches, and tears down every
    /// connection. After this returns no handler is executing.
    pub async fn stop(&self) {
        info!(listeners = self.local_addrs().len(), "Stopping listeners");
        self.abort.cancel();
        debug!(probe = %self.probe, "Service probes");
        let live = self.connections.snapshot();
        info!(connections = live.len(), "Shutting down connections");
        for conn in &live {
            conn.shutdown_input();
        }
        self.conn_gate.close();
        self.conn_gate.wait().await;
        for conn in self.connections.drain() {
            conn.shutdown().await;
        }
    }
}

enum HeaderRead {
    Complete(Header),
    Corrupt,
    Eof,
}

/// Reads exactly one header's worth of bytes.
///
/// A clean EOF before the first byte ends the dispatch loop; a short read
/// mid header or a failed decode is corruption, which the caller counts
/// and survives because framing is length-prefixed.
async fn read_header(input: &mut GuardedRead) -> std::io::Result<HeaderRead> {
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = input.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                HeaderRead::Eof
            } else {
                HeaderRead::Corrupt
            });
        }
        filled += n;
    }
    Ok(match Header::decode(&buf) {
        Some(header) => HeaderRead::Complete(header),
        None => HeaderRead::Corrupt,
    })
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

fn configure_socket(socket: &TcpStream, peer: SocketAddr) {
    if let Err(e) = socket.set_nodelay(true) {
        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    if let Err(e) = socket2::SockRef::from(socket).set_keepalive(true) {
        warn!(peer = %peer, error = %e, "Failed to set SO_KEEPALIVE");
    }
}
