#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;

use comet::auth::{AllowAll, AuthRequest, JwtAuthenticator, Whitelist};
use comet::config::{Config, DiscoveryConfig, GatewayConfig};
use comet::gateway::listener::Listeners;
use comet::gateway::upstream::{LogUpstream, Upstream};
use comet::gateway::{Dispatcher, Server, Transport};
use comet_common::{Frame, FrameCodec, Op};

pub const SECRET: &str = "integration-test-secret";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Short timeouts so failure paths resolve quickly.
pub fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        buckets: 4,
        max_body: 4096,
        queue_size: 16,
        auth_timeout: Duration::from_secs(2),
        heartbeat_timeout: Duration::from_secs(30),
        slow_consumer_threshold: 1,
        drain_timeout: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(2),
        connection_policy: Default::default(),
    }
}

pub fn test_config(gateway: GatewayConfig) -> Config {
    let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
    Config {
        tcp_bind: loopback,
        ws_bind: loopback,
        wss_bind: None,
        tls_cert: None,
        tls_key: None,
        control_bind: loopback,
        jwt_secret: SECRET.to_string(),
        gateway,
        whitelist: Vec::new(),
        discovery: DiscoveryConfig {
            url: None,
            server_tick: Duration::from_secs(10),
            region: "test".into(),
            zone: "test".into(),
            env: "test".into(),
            hostname: "comet-test".into(),
            weight: 10,
            ip_addrs: vec!["127.0.0.1".into()],
        },
    }
}

pub struct TestGateway {
    pub server: Arc<Server>,
    pub dispatcher: Dispatcher,
    pub tcp_addr: SocketAddr,
    pub ws_addr: SocketAddr,
    /// Set when the config names a TLS listener.
    pub wss_addr: Option<SocketAddr>,
    auth: JwtAuthenticator,
}

impl TestGateway {
    pub fn token(&self, user_id: &str) -> String {
        self.auth
            .issue(user_id, None, Duration::from_secs(300))
            .expect("issue token")
    }

    /// Poll until the server's channel count reaches `expected`.
    pub async fn wait_for_channels(&self, expected: usize) {
        let server = self.server.clone();
        wait_until(move || server.channel_count() == expected).await;
    }
}

pub async fn start_gateway(gateway: GatewayConfig) -> TestGateway {
    start_gateway_with(gateway, Arc::new(AllowAll)).await
}

pub async fn start_gateway_with(gateway: GatewayConfig, whitelist: Arc<dyn Whitelist>) -> TestGateway {
    start_gateway_full(test_config(gateway), whitelist, Arc::new(LogUpstream)).await
}

/// Bind real listeners on ephemeral loopback ports and start accepting.
pub async fn start_gateway_full(
    config: Config,
    whitelist: Arc<dyn Whitelist>,
    upstream: Arc<dyn Upstream>,
) -> TestGateway {
    let server = Arc::new(Server::new(
        config.gateway.clone(),
        Arc::new(JwtAuthenticator::new(SECRET)),
        whitelist,
        upstream,
    ));
    let listeners = Listeners::bind(&config).await.expect("bind listeners");
    let tcp_addr = listeners.local_addr(Transport::Tcp).expect("tcp addr");
    let ws_addr = listeners.local_addr(Transport::WebSocket).expect("ws addr");
    let wss_addr = listeners.local_addr(Transport::WebSocketTls);
    listeners.spawn(server.clone());

    TestGateway {
        dispatcher: Dispatcher::new(server.clone()),
        server,
        tcp_addr,
        ws_addr,
        wss_addr,
        auth: JwtAuthenticator::new(SECRET),
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    time::timeout(RECV_TIMEOUT, async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn auth_frame(token: &str, rooms: &[&str]) -> Frame {
    let request = AuthRequest {
        token: token.to_string(),
        platform: None,
        rooms: rooms.iter().map(|r| r.to_string()).collect(),
        accepts: Vec::new(),
    };
    let body = serde_json::to_vec(&request).expect("encode auth request");
    Frame {
        seq: 1,
        ..Frame::new(Op::AUTH, Bytes::from(body))
    }
}

/// Frame-level TCP client.
pub struct TcpClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TcpClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("tcp connect");
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
        }
    }

    /// Connect and authenticate; panics unless AUTH_REPLY comes back.
    pub async fn authenticated(addr: SocketAddr, token: &str, rooms: &[&str]) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(auth_frame(token, rooms)).await;
        let reply = client.recv().await.expect("auth reply");
        assert_eq!(reply.op, Op::AUTH_REPLY, "unexpected frame {reply:?}");
        client
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.expect("send frame");
    }

    /// Write raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.framed.get_mut().write_all(bytes).await.expect("write raw");
    }

    /// Next frame, or `None` once the server closes the connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for frame")
            .and_then(Result::ok)
    }

    /// Read until the server hangs up, returning everything received.
    pub async fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv().await {
            frames.push(frame);
        }
        frames
    }
}

pub async fn wait_until_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    time::timeout(RECV_TIMEOUT, async {
        while !condition().await {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
