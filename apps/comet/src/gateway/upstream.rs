//! Hand-off of client-originated messages to the logic tier.

use async_trait::async_trait;
use comet_common::Frame;

use crate::auth::Identity;

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// Receives what clients send after authentication, plus connect and
/// disconnect notifications.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn connected(&self, _conn_id: &str, _identity: &Identity) {}

    async fn receive(
        &self,
        conn_id: &str,
        identity: &Identity,
        frame: &Frame,
    ) -> Result<(), UpstreamError>;

    async fn disconnected(&self, _conn_id: &str, _identity: &Identity) {}
}

/// Default upstream: records traffic in the log and accepts everything.
pub struct LogUpstream;

#[async_trait]
impl Upstream for LogUpstream {
    async fn connected(&self, conn_id: &str, identity: &Identity) {
        tracing::debug!(conn_id, user_id = %identity.user_id, "upstream: connected");
    }

    async fn receive(
        &self,
        conn_id: &str,
        identity: &Identity,
        frame: &Frame,
    ) -> Result<(), UpstreamError> {
        tracing::debug!(
            conn_id,
            user_id = %identity.user_id,
            op = %frame.op,
            seq = frame.seq,
            len = frame.body.len(),
            "upstream: client message"
        );
        Ok(())
    }

    async fn disconnected(&self, conn_id: &str, identity: &Identity) {
        tracing::debug!(conn_id, user_id = %identity.user_id, "upstream: disconnected");
    }
}
