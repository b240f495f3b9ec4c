//! A bucket is one shard of the connection index: the channels whose user id
//! hashes to it, the partial rooms those channels joined, and a per-IP tally.
//!
//! Each bucket sits behind its own `parking_lot::RwLock`. Callers take
//! snapshots under the read lock and do any enqueueing after releasing it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::channel::{Channel, ChannelState};
use super::room::Room;

/// What happens when a user authenticates while already holding a live
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPolicy {
    /// Keep every channel; pushes reach all of them.
    #[default]
    Multi,
    /// Refuse the newcomer.
    Reject,
    /// Close the existing channels and keep the newcomer.
    Replace,
}

impl FromStr for ConnectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "multi" => Ok(Self::Multi),
            "reject" => Ok(Self::Reject),
            "replace" => Ok(Self::Replace),
            other => Err(format!("unknown connection policy: {other}")),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BucketError {
    #[error("user {0} already has a live connection")]
    DuplicateRejected(String),
    #[error("channel is not authenticated")]
    NotAuthenticated,
    #[error("channel is not registered in this bucket")]
    NotRegistered,
}

#[derive(Default)]
struct BucketInner {
    users: HashMap<String, Vec<Arc<Channel>>>,
    rooms: HashMap<String, Room>,
    ips: HashMap<IpAddr, usize>,
}

impl BucketInner {
    fn is_registered(&self, channel: &Channel) -> bool {
        channel
            .user_id()
            .and_then(|uid| self.users.get(uid))
            .is_some_and(|list| list.iter().any(|c| c.id() == channel.id()))
    }

    /// Drop room memberships and the IP tally for a channel that has just
    /// left `users`.
    fn unlink(&mut self, channel: &Channel) {
        for room_id in channel.take_rooms() {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.remove(channel.id());
                if room.is_empty() {
                    self.rooms.remove(&room_id);
                }
            }
        }
        let ip = channel.ip();
        if let Some(count) = self.ips.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                self.ips.remove(&ip);
            }
        }
    }
}

pub struct Bucket {
    index: usize,
    policy: ConnectionPolicy,
    inner: RwLock<BucketInner>,
    channel_count: AtomicUsize,
}

impl Bucket {
    pub fn new(index: usize, policy: ConnectionPolicy) -> Self {
        Self {
            index,
            policy,
            inner: RwLock::new(BucketInner::default()),
            channel_count: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Add an authenticated channel under its user id.
    ///
    /// The state check happens under the write lock, so a channel that closed
    /// concurrently is never inserted. Under `Replace` the displaced channels
    /// are returned for the caller to close.
    pub fn register(&self, channel: &Arc<Channel>) -> Result<Vec<Arc<Channel>>, BucketError> {
        let user_id = channel
            .user_id()
            .ok_or(BucketError::NotAuthenticated)?
            .to_string();

        let mut inner = self.inner.write();
        if channel.state() != ChannelState::Authenticated {
            return Err(BucketError::NotAuthenticated);
        }
        if inner.is_registered(channel) {
            return Ok(Vec::new());
        }

        let mut displaced = Vec::new();
        match self.policy {
            ConnectionPolicy::Multi => {}
            ConnectionPolicy::Reject => {
                let live = inner.users.get(&user_id).is_some_and(|list| {
                    list.iter()
                        .any(|c| c.state() == ChannelState::Authenticated)
                });
                if live {
                    return Err(BucketError::DuplicateRejected(user_id));
                }
            }
            ConnectionPolicy::Replace => {
                if let Some(previous) = inner.users.remove(&user_id) {
                    for old in previous {
                        inner.unlink(&old);
                        self.channel_count.fetch_sub(1, Ordering::Relaxed);
                        displaced.push(old);
                    }
                }
            }
        }

        *inner.ips.entry(channel.ip()).or_insert(0) += 1;
        inner.users.entry(user_id).or_default().push(channel.clone());
        self.channel_count.fetch_add(1, Ordering::Relaxed);
        Ok(displaced)
    }

    /// Remove a channel and all of its room memberships. Returns `false` if
    /// it was not registered here.
    pub fn deregister(&self, channel: &Channel) -> bool {
        let Some(user_id) = channel.user_id() else {
            return false;
        };
        let mut inner = self.inner.write();
        let (removed, now_empty) = match inner.users.get_mut(user_id) {
            Some(list) => {
                let before = list.len();
                list.retain(|c| c.id() != channel.id());
                (list.len() != before, list.is_empty())
            }
            None => (false, false),
        };
        if now_empty {
            inner.users.remove(user_id);
        }
        if removed {
            inner.unlink(channel);
            self.channel_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Live channels for a user. Never returns a channel that has closed.
    pub fn lookup(&self, user_id: &str) -> Vec<Arc<Channel>> {
        let inner = self.inner.read();
        inner
            .users
            .get(user_id)
            .map(|list| {
                list.iter()
                    .filter(|c| c.state() == ChannelState::Authenticated)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns `Ok(false)` if the channel was already in the room.
    pub fn join_room(&self, room_id: &str, channel: &Arc<Channel>) -> Result<bool, BucketError> {
        let mut inner = self.inner.write();
        if channel.state() != ChannelState::Authenticated {
            return Err(BucketError::NotAuthenticated);
        }
        if !inner.is_registered(channel) {
            return Err(BucketError::NotRegistered);
        }
        let added = inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id))
            .insert(channel);
        channel.add_room(room_id);
        Ok(added)
    }

    /// Returns `Ok(false)` if the channel was not in the room. Empty partial
    /// rooms are discarded.
    pub fn leave_room(&self, room_id: &str, channel: &Channel) -> Result<bool, BucketError> {
        let mut inner = self.inner.write();
        if channel.state() != ChannelState::Authenticated {
            return Err(BucketError::NotAuthenticated);
        }
        let Some(room) = inner.rooms.get_mut(room_id) else {
            return Ok(false);
        };
        let removed = room.remove(channel.id());
        if room.is_empty() {
            inner.rooms.remove(room_id);
        }
        channel.remove_room(room_id);
        Ok(removed)
    }

    /// Authenticated members of this bucket's share of a room.
    pub fn room_members(&self, room_id: &str) -> Vec<Arc<Channel>> {
        let inner = self.inner.read();
        inner
            .rooms
            .get(room_id)
            .map(|room| {
                room.members()
                    .filter(|c| c.state() == ChannelState::Authenticated)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every authenticated channel in the bucket.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let inner = self.inner.read();
        inner
            .users
            .values()
            .flatten()
            .filter(|c| c.state() == ChannelState::Authenticated)
            .cloned()
            .collect()
    }

    /// Snapshot of every registered channel regardless of state.
    pub fn registered(&self) -> Vec<Arc<Channel>> {
        self.inner.read().users.values().flatten().cloned().collect()
    }

    /// Distinct client IPs with the number of channels from each.
    pub fn ip_count(&self) -> HashMap<IpAddr, usize> {
        self.inner.read().ips.clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count.load(Ordering::Relaxed)
    }

    pub fn rooms(&self) -> Vec<String> {
        self.inner.read().rooms.keys().cloned().collect()
    }

    /// Member count of every partial room in this bucket.
    pub fn room_counts(&self) -> HashMap<String, usize> {
        self.inner
            .read()
            .rooms
            .iter()
            .map(|(id, room)| (id.clone(), room.len()))
            .collect()
    }
}
