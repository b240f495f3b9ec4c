//! Push fan-out for the control plane.
//!
//! Every call resolves targets into a snapshot of `Arc<Channel>` under a
//! bucket read lock, releases the lock, then offers the frame to each
//! channel's bounded queue. Nothing here blocks on a slow client.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use comet_common::{Frame, Op};

use super::channel::{Channel, PushOutcome};
use super::server::Server;

/// Operation code used when a push request does not name one.
pub const DEFAULT_PUSH_OP: Op = Op::SEND_MSG_REPLY;

/// Cloneable handle; store in the control plane's state.
#[derive(Clone)]
pub struct Dispatcher {
    server: Arc<Server>,
}

impl Dispatcher {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Push to every live channel of one user. Returns how many channels
    /// accepted the frame.
    pub fn push_to_user(&self, user_id: &str, op: Op, body: Bytes) -> usize {
        let frame = Frame::new(op, body);
        let targets = self.server.bucket_for(user_id).lookup(user_id);
        deliver(&targets, &frame)
    }

    /// Repeated ids in `user_ids` are pushed to once.
    pub fn push_to_users(&self, user_ids: &[String], op: Op, body: Bytes) -> usize {
        let frame = Frame::new(op, body);
        let unique: HashSet<&str> = user_ids.iter().map(String::as_str).collect();
        unique
            .into_iter()
            .map(|uid| deliver(&self.server.bucket_for(uid).lookup(uid), &frame))
            .sum()
    }

    /// Rooms are partitioned across buckets, so every bucket is visited.
    pub fn push_to_room(&self, room_id: &str, op: Op, body: Bytes) -> usize {
        let frame = Frame::new(op, body);
        let delivered = self
            .server
            .buckets()
            .iter()
            .map(|bucket| deliver(&bucket.room_members(room_id), &frame))
            .sum();
        tracing::debug!(room_id, op = %op, delivered, "room push");
        delivered
    }

    pub fn broadcast(&self, op: Op, body: Bytes) -> usize {
        let frame = Frame::new(op, body);
        let delivered = self
            .server
            .buckets()
            .iter()
            .map(|bucket| deliver(&bucket.channels(), &frame))
            .sum();
        tracing::debug!(op = %op, delivered, "broadcast");
        delivered
    }
}

fn deliver(targets: &[Arc<Channel>], frame: &Frame) -> usize {
    let mut delivered = 0;
    for channel in targets {
        // Frame bodies are `Bytes`, so the clone is a refcount bump.
        if channel.push(frame.clone()) == PushOutcome::Enqueued {
            delivered += 1;
        }
    }
    delivered
}
