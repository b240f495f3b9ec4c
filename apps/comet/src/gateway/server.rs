//! The connection core's root: bucket array, pluggable collaborators and the
//! cancellation tree every channel hangs off.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use comet_common::Frame;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::bucket::{Bucket, BucketError};
use super::channel::{Channel, ChannelOptions, CloseReason, Transport};
use super::upstream::Upstream;
use crate::auth::{Authenticator, Whitelist};
use crate::config::GatewayConfig;

pub struct Server {
    config: GatewayConfig,
    buckets: Vec<Bucket>,
    authenticator: Arc<dyn Authenticator>,
    whitelist: Arc<dyn Whitelist>,
    upstream: Arc<dyn Upstream>,
    /// Stops the accept loops.
    listeners: CancellationToken,
    /// Parent of every channel's closing token.
    closing: CancellationToken,
    /// Parent of every channel's abort token.
    abort: CancellationToken,
    tasks: TaskTracker,
    started_at: DateTime<Utc>,
}

impl Server {
    pub fn new(
        config: GatewayConfig,
        authenticator: Arc<dyn Authenticator>,
        whitelist: Arc<dyn Whitelist>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let buckets = (0..config.buckets.max(1))
            .map(|i| Bucket::new(i, config.connection_policy))
            .collect();
        Self {
            config,
            buckets,
            authenticator,
            whitelist,
            upstream,
            listeners: CancellationToken::new(),
            closing: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn whitelist(&self) -> &Arc<dyn Whitelist> {
        &self.whitelist
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn listener_token(&self) -> CancellationToken {
        self.listeners.clone()
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Stable bucket index for a user id: the first four bytes of its
    /// SHA-256 digest, big-endian, modulo the bucket count.
    pub fn bucket_index(&self, user_id: &str) -> usize {
        let digest = Sha256::digest(user_id.as_bytes());
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        head as usize % self.buckets.len()
    }

    pub fn bucket_for(&self, user_id: &str) -> &Bucket {
        &self.buckets[self.bucket_index(user_id)]
    }

    /// The bucket a registered channel lives in.
    pub fn bucket_of(&self, channel: &Channel) -> Option<&Bucket> {
        channel.bucket().and_then(|i| self.buckets.get(i))
    }

    /// A fresh channel wired into the server's cancellation tree.
    pub fn new_channel(
        &self,
        peer: SocketAddr,
        transport: Transport,
    ) -> (Arc<Channel>, mpsc::Receiver<Frame>) {
        Channel::new(
            peer,
            transport,
            ChannelOptions {
                queue_size: self.config.queue_size,
                slow_consumer_threshold: self.config.slow_consumer_threshold,
            },
            self.closing.child_token(),
            self.abort.child_token(),
        )
    }

    /// Index an authenticated channel in its home bucket. Channels displaced
    /// by the connection policy are closed here.
    pub fn register(&self, channel: &Arc<Channel>) -> Result<(), BucketError> {
        let user_id = channel.user_id().ok_or(BucketError::NotAuthenticated)?;
        let index = self.bucket_index(user_id);
        channel.set_bucket(index);
        let displaced = self.buckets[index].register(channel)?;
        for old in displaced {
            tracing::info!(
                conn_id = %old.id(),
                user_id = %user_id,
                replaced_by = %channel.id(),
                "replacing existing channel"
            );
            old.close(CloseReason::Replaced);
        }
        Ok(())
    }

    pub fn deregister(&self, channel: &Channel) -> bool {
        self.bucket_of(channel)
            .is_some_and(|bucket| bucket.deregister(channel))
    }

    pub fn join_room(&self, room_id: &str, channel: &Arc<Channel>) -> Result<bool, BucketError> {
        self.bucket_of(channel)
            .ok_or(BucketError::NotRegistered)?
            .join_room(room_id, channel)
    }

    pub fn leave_room(&self, room_id: &str, channel: &Channel) -> Result<bool, BucketError> {
        self.bucket_of(channel)
            .ok_or(BucketError::NotRegistered)?
            .leave_room(room_id, channel)
    }

    pub fn channel_count(&self) -> usize {
        self.buckets.iter().map(Bucket::channel_count).sum()
    }

    /// Distinct client IPs across all buckets.
    pub fn ips(&self) -> HashSet<IpAddr> {
        self.buckets
            .iter()
            .flat_map(|b| b.ip_count().into_keys())
            .collect()
    }

    /// Online count per room, merged across the partial rooms.
    pub fn room_counts(&self) -> BTreeMap<String, usize> {
        let mut merged = BTreeMap::new();
        for bucket in &self.buckets {
            for (room_id, count) in bucket.room_counts() {
                *merged.entry(room_id).or_insert(0) += count;
            }
        }
        merged
    }

    /// Ask every channel, registered or not, to close gracefully. Returns the
    /// number of registered channels that were told.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut closed = 0;
        for bucket in &self.buckets {
            for channel in bucket.registered() {
                if channel.close(reason) {
                    closed += 1;
                }
            }
        }
        // Unauthenticated channels only hear about it through the token.
        self.closing.cancel();
        closed
    }

    /// Tear down whatever is still registered without waiting for writers.
    pub fn force_close_all(&self) -> usize {
        self.abort.cancel();
        let mut forced = 0;
        for bucket in &self.buckets {
            for channel in bucket.registered() {
                if channel.finish_close() {
                    bucket.deregister(&channel);
                    forced += 1;
                }
            }
        }
        forced
    }
}
