use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crossbar::config::Config;
use crossbar::protocol::ReplyBuf;
use crossbar::server::{MapService, Method, RequestBody, Server, StreamingContext};

const ECHO_METHOD_ID: u32 = 1;

/// Echoes the request body back to the caller.
struct Echo;

#[async_trait]
impl Method for Echo {
    async fn handle(
        &self,
        mut body: RequestBody,
        ctx: &mut StreamingContext,
    ) -> Result<ReplyBuf> {
        let size = ctx.header().size;
        let _units = ctx.reserve_memory(size).await;
        let mut payload = vec![0u8; size as usize];
        body.read_exact(&mut payload).await?;
        drop(body);
        ctx.signal_body_parse();
        Ok(ReplyBuf::from_payload(payload))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Config::load();
    let mut server = Server::new(cfg.to_server_config()?);
    server.register(Box::new(
        MapService::new().with_method(ECHO_METHOD_ID, Arc::new(Echo)),
    ));

    let server = Arc::new(server);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.stop().await;

    Ok(())
}
