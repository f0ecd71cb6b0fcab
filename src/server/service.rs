//! Service and method traits plus the ordered service registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::ReplyBuf;
use crate::server::context::{RequestBody, StreamingContext};

/// One callable RPC method.
///
/// Contract: read exactly `ctx.header().size` bytes from `body`, call
/// `ctx.signal_body_parse()` once those bytes are consumed, then produce
/// the reply payload. The correlation id is stamped by the server.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Method for Echo {
///     async fn handle(
///         &self,
///         mut body: RequestBody,
///         ctx: &mut StreamingContext,
///     ) -> anyhow::Result<ReplyBuf> {
///         let size = ctx.header().size;
///         let _units = ctx.reserve_memory(size).await;
///         let mut payload = vec![0u8; size as usize];
///         body.read_exact(&mut payload).await?;
///         drop(body);
///         ctx.signal_body_parse();
///         Ok(ReplyBuf::from_payload(payload))
///     }
/// }
/// ```
#[async_trait]
pub trait Method: Send + Sync {
    async fn handle(
        &self,
        body: RequestBody,
        ctx: &mut StreamingContext,
    ) -> anyhow::Result<ReplyBuf>;
}

/// A set of methods addressable by id.
///
/// Methods are handed out as `Arc` so a dispatched handler can hold one
/// across awaits without borrowing the service.
pub trait Service: Send + Sync {
    fn method_from_id(&self, id: u32) -> Option<Arc<dyn Method>>;
}

/// Service backed by a plain method-id map.
#[derive(Default)]
pub struct MapService {
    methods: HashMap<u32, Arc<dyn Method>>,
}

impl MapService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, id: u32, method: Arc<dyn Method>) -> Self {
        self.methods.insert(id, method);
        self
    }
}

impl Service for MapService {
    fn method_from_id(&self, id: u32) -> Option<Arc<dyn Method>> {
        self.methods.get(&id).cloned()
    }
}

/// Ordered collection of registered services.
///
/// Lookup is linear in registration order and takes the first service
/// claiming the id, so duplicate ids resolve to the earliest registered
/// service.
#[derive(Default)]
pub(crate) struct ServiceRegistry {
    services: Vec<Box<dyn Service>>,
}

impl ServiceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, service: Box<dyn Service>) {
        self.services.push(service);
    }

    pub(crate) fn len(&self) -> usize {
        self.services.len()
    }

    pub(crate) fn lookup(&self, id: u32) -> Option<Arc<dyn Method>> {
        self.services
            .iter()
            .find_map(|service| service.method_from_id(id))
    }
}
