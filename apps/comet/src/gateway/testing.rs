//! Channel and server builders shared by the unit tests.

use std::net::SocketAddr;
use std::sync::Arc;

use comet_common::Frame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::channel::{Channel, ChannelOptions, Transport};
use super::server::Server;
use super::upstream::LogUpstream;
use crate::auth::{AllowAll, Identity, JwtAuthenticator};
use crate::config::GatewayConfig;

pub const SECRET: &str = "unit-test-secret";

pub fn identity(user_id: &str) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        platform: None,
    }
}

pub fn raw_channel(peer: &str, queue_size: usize) -> (Arc<Channel>, mpsc::Receiver<Frame>) {
    let peer: SocketAddr = peer.parse().unwrap();
    Channel::new(
        peer,
        Transport::Tcp,
        ChannelOptions {
            queue_size,
            slow_consumer_threshold: 1,
        },
        CancellationToken::new(),
        CancellationToken::new(),
    )
}

pub fn authenticated(
    user_id: &str,
    peer: &str,
    queue_size: usize,
) -> (Arc<Channel>, mpsc::Receiver<Frame>) {
    let (channel, rx) = raw_channel(peer, queue_size);
    assert!(channel.handshake_complete());
    assert!(channel.authenticate(identity(user_id)));
    (channel, rx)
}

pub fn server(config: GatewayConfig) -> Arc<Server> {
    Arc::new(Server::new(
        config,
        Arc::new(JwtAuthenticator::new(SECRET)),
        Arc::new(AllowAll),
        Arc::new(LogUpstream),
    ))
}

/// Create, authenticate and register a channel on `server`.
pub fn connect(
    server: &Server,
    user_id: &str,
    peer: &str,
) -> (Arc<Channel>, mpsc::Receiver<Frame>) {
    let (channel, rx) = server.new_channel(peer.parse().unwrap(), Transport::Tcp);
    assert!(channel.handshake_complete());
    assert!(channel.authenticate(identity(user_id)));
    server.register(&channel).unwrap();
    (channel, rx)
}
