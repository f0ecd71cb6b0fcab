//! End-to-end tests against a live server on a loopback listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;

use crossbar::protocol::{HEADER_SIZE, Header, REPLY_HEADER_SIZE, ReplyBuf, ReplyHeader};
use crossbar::server::{
    MapService, Method, RequestBody, Server, ServerConfig, ServerMetrics, Service,
    StreamingContext,
};

use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig as TlsServerConfig};

const ECHO_METHOD: u32 = 1;
const HOLD_METHOD: u32 = 2;
const SLOW_METHOD: u32 = 3;
const FLAGGED_METHOD: u32 = 4;

/// Echoes the request body.
struct EchoMethod;

#[async_trait]
impl Method for EchoMethod {
    async fn handle(
        &self,
        mut body: RequestBody,
        ctx: &mut StreamingContext,
    ) -> anyhow::Result<ReplyBuf> {
        let size = ctx.header().size;
        let _units = ctx.reserve_memory(size).await;
        let mut payload = vec![0u8; size as usize];
        body.read_exact(&mut payload).await?;
        drop(body);
        ctx.signal_body_parse();
        Ok(ReplyBuf::from_payload(payload))
    }
}

/// Reserves a fixed amount of memory and holds it until released.
struct HoldMethod {
    reserve: u32,
    release: Arc<Notify>,
}

#[async_trait]
impl Method for HoldMethod {
    async fn handle(
        &self,
        mut body: RequestBody,
        ctx: &mut StreamingContext,
    ) -> anyhow::Result<ReplyBuf> {
        let units = ctx.reserve_memory(self.reserve).await;
        let mut payload = vec![0u8; ctx.header().size as usize];
        body.read_exact(&mut payload).await?;
        drop(body);
        ctx.signal_body_parse();
        self.release.notified().await;
        drop(units);
        Ok(ReplyBuf::from_payload(payload))
    }
}

/// Consumes the body, then takes a while to produce the reply.
struct SlowMethod;

#[async_trait]
impl Method for SlowMethod {
    async fn handle(
        &self,
        mut body: RequestBody,
        ctx: &mut StreamingContext,
    ) -> anyhow::Result<ReplyBuf> {
        let mut payload = vec![0u8; ctx.header().size as usize];
        body.read_exact(&mut payload).await?;
        drop(body);
        ctx.signal_body_parse();
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(ReplyBuf::from_payload(payload))
    }
}

/// Echoes the body in small chunks, pacing the read off `remaining()`,
/// and marks the reply with a fixed flags byte.
struct FlaggedEcho(u8);

#[async_trait]
impl Method for FlaggedEcho {
    async fn handle(
        &self,
        mut body: RequestBody,
        ctx: &mut StreamingContext,
    ) -> anyhow::Result<ReplyBuf> {
        anyhow::ensure!(
            body.remaining() == u64::from(ctx.header().size),
            "body length does not match the header"
        );
        let mut payload = Vec::with_capacity(body.remaining() as usize);
        while body.remaining() > 0 {
            let mut chunk = [0u8; 5];
            let n = body.read(&mut chunk).await?;
            anyhow::ensure!(n > 0, "body ended early");
            payload.extend_from_slice(&chunk[..n]);
        }
        anyhow::ensure!(body.remaining() == 0, "body not fully consumed");
        drop(body);
        ctx.signal_body_parse();
        let mut reply = ReplyBuf::from_payload(payload);
        reply.set_flags(self.0);
        Ok(reply)
    }
}

/// Replies with a fixed payload regardless of the request.
struct StaticReply(&'static str);

#[async_trait]
impl Method for StaticReply {
    async fn handle(
        &self,
        body: RequestBody,
        ctx: &mut StreamingContext,
    ) -> anyhow::Result<ReplyBuf> {
        drop(body);
        ctx.signal_body_parse();
        Ok(ReplyBuf::from_payload(self.0.as_bytes().to_vec()))
    }
}

fn loopback_config(max_memory: usize) -> ServerConfig {
    ServerConfig {
        addrs: vec!["127.0.0.1:0".parse().unwrap()],
        max_service_memory_per_core: max_memory,
        ..Default::default()
    }
}

async fn start_server(cfg: ServerConfig, services: Vec<Box<dyn Service>>) -> Arc<Server> {
    let mut server = Server::new(cfg);
    for service in services {
        server.register(service);
    }
    let server = Arc::new(server);
    server.start().await.expect("server failed to start");
    server
}

fn echo_service() -> Box<dyn Service> {
    Box::new(MapService::new().with_method(ECHO_METHOD, Arc::new(EchoMethod)))
}

async fn connect(server: &Server) -> TcpStream {
    let addr = server.local_addrs()[0];
    TcpStream::connect(addr).await.expect("connect failed")
}

async fn send_request<S>(stream: &mut S, method: u32, correlation_id: u32, body: &[u8])
where
    S: AsyncWrite + Unpin,
{
    let header = Header::new(method, body.len() as u32, correlation_id);
    stream.write_all(&header.encode()).await.unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();
}

async fn read_reply<S>(stream: &mut S) -> (ReplyHeader, Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; REPLY_HEADER_SIZE];
    stream.read_exact(&mut raw).await.unwrap();
    let header = ReplyHeader::decode(&raw).expect("reply header is well formed");
    let mut payload = vec![0u8; header.size as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (header, payload)
}

async fn wait_for_metrics(server: &Server, mut cond: impl FnMut(&ServerMetrics) -> bool) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(metrics) = server.metrics() {
                if cond(&metrics) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("metrics condition not reached in time");
}

#[tokio::test]
async fn test_echo_replies_in_arrival_order() {
    let server = start_server(loopback_config(1024 * 1024), vec![echo_service()]).await;
    let mut client = connect(&server).await;

    // Pipeline three requests before reading any reply.
    let bodies: [&[u8]; 3] = [&[0xaa; 100], &[0xbb; 100], &[0xcc; 100]];
    for (i, body) in bodies.iter().enumerate() {
        send_request(&mut client, ECHO_METHOD, (i + 1) as u32, body).await;
    }

    for (i, body) in bodies.iter().enumerate() {
        let (header, payload) = read_reply(&mut client).await;
        assert_eq!(header.correlation_id, (i + 1) as u32);
        assert_eq!(&payload[..], *body);
    }

    wait_for_metrics(&server, |m| {
        m.rpc_consumed_mem == 0
            && m.probe.requests_completed == 3
            && m.rpc_dispatch_handler_latency.count == 3
    })
    .await;

    let metrics = server.metrics().unwrap();
    assert_eq!(metrics.rpc_services, 1);
    assert_eq!(metrics.rpc_max_service_mem, 1024 * 1024);
    assert_eq!(metrics.probe.header_corrupted, 0);
    assert_eq!(
        metrics.probe.bytes_received,
        3 * (HEADER_SIZE as u64 + 100)
    );

    server.stop().await;
}

#[tokio::test]
async fn test_memory_backpressure_suspends_second_request() {
    let release = Arc::new(Notify::new());
    let service = MapService::new()
        .with_method(
            HOLD_METHOD,
            Arc::new(HoldMethod {
                reserve: 900,
                release: Arc::clone(&release),
            }),
        )
        .with_method(ECHO_METHOD, Arc::new(EchoMethod));
    let server = start_server(loopback_config(1024), vec![Box::new(service)]).await;
    let mut client = connect(&server).await;

    send_request(&mut client, HOLD_METHOD, 1, b"x").await;
    wait_for_metrics(&server, |m| m.rpc_consumed_mem >= 900).await;

    // The echo handler needs 200 bytes but only 124 remain, so its
    // reservation must suspend.
    send_request(&mut client, ECHO_METHOD, 2, &[0x42; 200]).await;
    wait_for_metrics(&server, |m| m.memory_waiters == 1 && m.probe.memory_waits >= 1).await;

    release.notify_one();

    let (first, payload) = read_reply(&mut client).await;
    assert_eq!(first.correlation_id, 1);
    assert_eq!(payload, b"x");

    let (second, payload) = read_reply(&mut client).await;
    assert_eq!(second.correlation_id, 2);
    assert_eq!(payload, vec![0x42; 200]);

    wait_for_metrics(&server, |m| m.rpc_consumed_mem == 0 && m.memory_waiters == 0).await;
    server.stop().await;
}

#[tokio::test]
async fn test_corrupt_header_does_not_poison_connection() {
    let server = start_server(loopback_config(1024 * 1024), vec![echo_service()]).await;
    let mut client = connect(&server).await;

    send_request(&mut client, ECHO_METHOD, 1, b"one").await;

    // A header-sized frame with a broken checksum between two valid
    // requests. Framing stays aligned, so only the counter should move.
    let mut corrupt = Header::new(ECHO_METHOD, 0, 99).encode();
    corrupt[14] ^= 0xff;
    client.write_all(&corrupt).await.unwrap();

    send_request(&mut client, ECHO_METHOD, 2, b"two").await;

    let (first, payload) = read_reply(&mut client).await;
    assert_eq!(first.correlation_id, 1);
    assert_eq!(payload, b"one");

    let (second, payload) = read_reply(&mut client).await;
    assert_eq!(second.correlation_id, 2);
    assert_eq!(payload, b"two");

    wait_for_metrics(&server, |m| {
        m.probe.header_corrupted == 1 && m.probe.requests_completed == 2
    })
    .await;

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_method_fails_the_connection() {
    let server = start_server(loopback_config(1024 * 1024), vec![echo_service()]).await;
    let mut client = connect(&server).await;

    send_request(&mut client, 999, 5, b"").await;

    wait_for_metrics(&server, |m| m.probe.method_not_found == 1).await;

    // The connection is closed before any further request is served.
    let mut buf = [0u8; 1];
    match timeout(Duration::from_secs(5), client.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("expected EOF, read {n} bytes"),
        Err(_) => panic!("connection not closed after unknown method"),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_graceful_shutdown_drains_in_flight_handlers() {
    let service = MapService::new().with_method(SLOW_METHOD, Arc::new(SlowMethod));
    let server = start_server(loopback_config(1024 * 1024), vec![Box::new(service)]).await;

    let mut clients = Vec::new();
    for _ in 0..2 {
        clients.push(connect(&server).await);
    }
    for client in &mut clients {
        for i in 0..5 {
            send_request(client, SLOW_METHOD, i + 1, b"ping").await;
        }
    }

    // All ten requests dispatched before shutdown begins.
    let expected = 10 * (HEADER_SIZE as u64 + 4);
    wait_for_metrics(&server, |m| m.probe.bytes_received == expected).await;

    timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop() did not drain in time");

    // Every started handler ran to completion; its write either finished
    // or was skipped, but it was always accounted.
    let metrics = server.metrics().unwrap();
    assert_eq!(metrics.probe.requests_completed, 10);
    assert_eq!(metrics.rpc_consumed_mem, 0);
}

#[tokio::test]
async fn test_reply_flags_survive_the_wire() {
    const FLAGS: u8 = 0b0000_0110;
    let service = MapService::new().with_method(FLAGGED_METHOD, Arc::new(FlaggedEcho(FLAGS)));
    let server = start_server(loopback_config(1024 * 1024), vec![Box::new(service)]).await;
    let mut client = connect(&server).await;

    // The body length is deliberately not a multiple of the handler's
    // chunk size, so the remaining() pacing has a short final read.
    send_request(&mut client, FLAGGED_METHOD, 11, b"flagged-body").await;

    let (header, payload) = read_reply(&mut client).await;
    assert_eq!(header.flags, FLAGS);
    assert_eq!(header.correlation_id, 11);
    assert_eq!(payload, b"flagged-body");

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_method_id_resolves_to_first_registered() {
    let first = MapService::new().with_method(7, Arc::new(StaticReply("first")));
    let second = MapService::new().with_method(7, Arc::new(StaticReply("second")));
    let server = start_server(
        loopback_config(1024 * 1024),
        vec![Box::new(first), Box::new(second)],
    )
    .await;

    let mut client = connect(&server).await;
    send_request(&mut client, 7, 1, b"").await;

    let (header, payload) = read_reply(&mut client).await;
    assert_eq!(header.correlation_id, 1);
    assert_eq!(payload, b"first");

    server.stop().await;
}

#[test]
fn test_disable_metrics_suppresses_snapshots() {
    let cfg = ServerConfig {
        disable_metrics: true,
        ..loopback_config(1024)
    };
    let server = Server::new(cfg);

    assert!(server.metrics().is_none());
}

fn tls_server_credentials() -> Arc<TlsServerConfig> {
    let certs = rustls_pemfile::certs(&mut &include_bytes!("fixtures/cert.pem")[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut &include_bytes!("fixtures/key.pem")[..])
        .unwrap()
        .expect("fixture key is present");
    Arc::new(
        TlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap(),
    )
}

async fn tls_connect(addr: SocketAddr) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &include_bytes!("fixtures/cert.pem")[..]) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(addr).await.unwrap();
    connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .expect("tls handshake failed")
}

async fn echo_session<S>(stream: &mut S) -> Vec<(ReplyHeader, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bodies: [&[u8]; 3] = [b"alpha", b"beta", b"gamma"];
    for (i, body) in bodies.iter().enumerate() {
        send_request(stream, ECHO_METHOD, (i + 1) as u32, body).await;
    }
    let mut replies = Vec::new();
    for _ in 0..bodies.len() {
        replies.push(read_reply(stream).await);
    }
    replies
}

#[tokio::test]
async fn test_tls_and_plaintext_yield_identical_replies() {
    let plain_server = start_server(loopback_config(1024 * 1024), vec![echo_service()]).await;
    let mut plain_client = connect(&plain_server).await;
    let plain_replies = echo_session(&mut plain_client).await;
    drop(plain_client);
    plain_server.stop().await;

    let tls_cfg = ServerConfig {
        credentials: Some(tls_server_credentials()),
        ..loopback_config(1024 * 1024)
    };
    let tls_server = start_server(tls_cfg, vec![echo_service()]).await;
    let mut tls_client = tls_connect(tls_server.local_addrs()[0]).await;
    let tls_replies = echo_session(&mut tls_client).await;
    drop(tls_client);
    tls_server.stop().await;

    assert_eq!(plain_replies, tls_replies);
}
