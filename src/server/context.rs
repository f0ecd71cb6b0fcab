//! Per-request streaming context and the body reader handed to handlers.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{OwnedMutexGuard, oneshot};

use crate::protocol::Header;
use crate::server::connection::GuardedRead;
use crate::server::memory::{MemoryPool, MemoryUnits};
use crate::server::probe::Probe;

/// Per-request handle given to a method handler.
///
/// The context owns the parsed header, reserves memory units against the
/// shard's admission controller, and carries the one-shot signal the
/// dispatch loop awaits before parsing the next header. Dropping the
/// context without signalling also releases the loop, so a handler that
/// bails out early cannot wedge its connection.
pub struct StreamingContext {
    header: Header,
    memory: Arc<MemoryPool>,
    probe: Arc<Probe>,
    parsed: Option<oneshot::Sender<()>>,
}

impl StreamingContext {
    pub(crate) fn new(
        header: Header,
        memory: Arc<MemoryPool>,
        probe: Arc<Probe>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                header,
                memory,
                probe,
                parsed: Some(tx),
            },
            rx,
        )
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Reserves `bytes` against the shard's memory budget, suspending
    /// until units are available. The returned claim releases on drop.
    pub async fn reserve_memory(&self, bytes: u32) -> MemoryUnits {
        match self.memory.try_acquire(bytes) {
            Some(units) => units,
            None => {
                self.probe.waiting_for_available_memory();
                self.memory.acquire(bytes).await
            }
        }
    }

    /// Signals that the request body has been fully consumed, letting the
    /// dispatch loop parse the next header. Must be called exactly once,
    /// after the handler has read its `header().size` bytes and before it
    /// starts producing the reply. Extra calls are no-ops.
    pub fn signal_body_parse(&mut self) {
        if let Some(tx) = self.parsed.take() {
            let _ = tx.send(());
        }
    }
}

/// The handler's view of the connection input.
///
/// Owns the input lock for the body-read phase and caps reads at the
/// body length from the request header, so a handler can never consume
/// bytes belonging to the next frame. Reads past the body resolve to EOF.
/// Dropping the body returns the input to the dispatch loop.
pub struct RequestBody {
    input: OwnedMutexGuard<GuardedRead>,
    remaining: u64,
    scratch: Vec<u8>,
}

/// Upper bound on how much body is pulled off the connection per read.
const BODY_CHUNK_SIZE: usize = 8192;

impl RequestBody {
    pub(crate) fn new(input: OwnedMutexGuard<GuardedRead>, size: u64) -> Self {
        Self {
            input,
            remaining: size,
            scratch: Vec::new(),
        }
    }

    /// Body bytes not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl AsyncRead for RequestBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.remaining == 0 {
            return Poll::Ready(Ok(()));
        }
        let want = buf
            .remaining()
            .min(usize::try_from(me.remaining).unwrap_or(usize::MAX))
            .min(BODY_CHUNK_SIZE);
        if me.scratch.len() < want {
            me.scratch.resize(want, 0);
        }
        let mut chunk = ReadBuf::new(&mut me.scratch[..want]);
        ready!(Pin::new(&mut *me.input).poll_read(cx, &mut chunk))?;
        let n = chunk.filled().len();
        buf.put_slice(chunk.filled());
        me.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}
