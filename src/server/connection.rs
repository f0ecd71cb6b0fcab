//! Accepted connections and the live-connection registry.

use std::collections::HashMap;
use std::future::Future;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::OwnedMutexGuard;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::protocol::ReplyBuf;

/// Socket accepted from a listener, before or after TLS wrapping.
pub(crate) enum ServerStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Self::Tls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(s) => s.is_write_vectored(),
            Self::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Input half of a connection whose reads resolve to EOF once the
/// connection's shutdown token fires. This is what lets `stop()` unblock
/// dispatch loops and handlers that are pending on a read.
pub(crate) struct GuardedRead {
    inner: ReadHalf<ServerStream>,
    shutdown: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl GuardedRead {
    fn new(inner: ReadHalf<ServerStream>, shutdown: CancellationToken) -> Self {
        let cancelled = Box::pin(shutdown.clone().cancelled_owned());
        Self {
            inner,
            shutdown,
            cancelled,
        }
    }
}

impl AsyncRead for GuardedRead {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.shutdown.is_cancelled() {
            // Leave the buffer unfilled: readers observe EOF.
            return Poll::Ready(Ok(()));
        }
        if me.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

/// One accepted connection.
///
/// The input half sits behind an owned async mutex so the dispatch loop can
/// hand it to a handler for the body-read phase and take it back for the
/// next header. The output half is locked only by the reply writer.
pub(crate) struct Connection {
    id: u64,
    pub(crate) addr: SocketAddr,
    input: Arc<tokio::sync::Mutex<GuardedRead>>,
    output: tokio::sync::Mutex<WriteHalf<ServerStream>>,
    shutdown: CancellationToken,
}

impl Connection {
    fn new(id: u64, stream: ServerStream, addr: SocketAddr) -> Self {
        let shutdown = CancellationToken::new();
        let (read, write) = tokio::io::split(stream);
        Self {
            id,
            addr,
            input: Arc::new(tokio::sync::Mutex::new(GuardedRead::new(
                read,
                shutdown.clone(),
            ))),
            output: tokio::sync::Mutex::new(write),
            shutdown,
        }
    }

    /// Locks the input half, waiting for any handler still holding it.
    pub(crate) async fn lock_input(&self) -> OwnedMutexGuard<GuardedRead> {
        Arc::clone(&self.input).lock_owned().await
    }

    /// Causes pending and future input reads to resolve to EOF.
    pub(crate) fn shutdown_input(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Closes both halves of the connection.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut output = self.output.lock().await;
        if let Err(e) = output.shutdown().await {
            tracing::trace!(peer = %self.addr, error = %e, "Error closing connection output");
        }
    }

    /// Writes one framed reply as a single vectored write.
    pub(crate) async fn write_reply(&self, reply: &ReplyBuf) -> io::Result<()> {
        let header = reply.header_bytes();
        let mut slices = Vec::with_capacity(1 + reply.segments().len());
        slices.push(IoSlice::new(&header));
        for segment in reply.segments() {
            slices.push(IoSlice::new(segment));
        }
        let mut output = self.output.lock().await;
        write_all_vectored(&mut *output, &mut slices).await?;
        output.flush().await
    }
}

async fn write_all_vectored<W>(writer: &mut W, mut slices: &mut [IoSlice<'_>]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while !slices.is_empty() {
        let n = writer.write_vectored(slices).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "connection closed while writing reply",
            ));
        }
        IoSlice::advance_slices(&mut slices, n);
    }
    Ok(())
}

/// Registry of live connections, iterated during teardown.
///
/// Connections insert themselves on construction and are removed after
/// their dispatch future resolves and shutdown has been awaited, so
/// `stop()` always sees exactly the connections still in flight.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, stream: ServerStream, addr: SocketAddr) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, stream, addr));
        self.live
            .lock()
            .expect("connection registry lock poisoned")
            .insert(id, Arc::clone(&conn));
        conn
    }

    pub(crate) fn deregister(&self, conn: &Connection) {
        self.live
            .lock()
            .expect("connection registry lock poisoned")
            .remove(&conn.id);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.live
            .lock()
            .expect("connection registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Connection>> {
        self.live
            .lock()
            .expect("connection registry lock poisoned")
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }
}
