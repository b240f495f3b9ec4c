//! Per-connection state machine and bounded outbound queue.
//!
//! A `Channel` is shared between its connection task (reader), its writer
//! task, the owning bucket and any dispatcher call that resolved it. All
//! state changes go through atomic compare-and-swap so the read path and an
//! external close can race safely.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use comet_common::id::{prefix, PrefixedId};
use comet_common::{Frame, Op};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Unauthenticated = 1,
    Authenticated = 2,
    Closing = 3,
    Closed = 4,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Unauthenticated,
            2 => Self::Authenticated,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Which listener accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    WebSocket,
    WebSocketTls,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "ws",
            Self::WebSocketTls => "wss",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ReadError,
    WriteError,
    AuthTimeout,
    AuthRejected,
    ProtocolError,
    HeartbeatTimeout,
    SlowConsumer,
    Replaced,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::AuthTimeout => "auth_timeout",
            Self::AuthRejected => "auth_rejected",
            Self::ProtocolError => "protocol_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::Replaced => "replaced",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Result of offering a push to one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// The channel watches a set of operations that excludes this one.
    Filtered,
    NotAuthenticated,
    Closed,
    /// Queue full; the frame was dropped and a slow-consumer strike recorded.
    Dropped,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub queue_size: usize,
    pub slow_consumer_threshold: u32,
}

pub struct Channel {
    id: String,
    peer: SocketAddr,
    transport: Transport,
    state: AtomicU8,
    identity: OnceLock<Identity>,
    /// Index of the home bucket. Set once at registration; lookup only.
    bucket: OnceLock<usize>,
    close_reason: OnceLock<CloseReason>,
    last_activity: Mutex<Instant>,
    /// Mirror of room membership. Mutated only under the home bucket's
    /// write lock.
    rooms: Mutex<HashSet<String>>,
    watch_ops: RwLock<HashSet<u32>>,
    outbound: mpsc::Sender<Frame>,
    slow_strikes: AtomicU32,
    slow_threshold: u32,
    closing: CancellationToken,
    abort: CancellationToken,
}

impl PrefixedId for Channel {
    const PREFIX: &'static str = prefix::CONNECTION;
}

impl Channel {
    /// Create a channel in `Connecting` state together with the receiving
    /// end of its outbound queue, which belongs to the writer task.
    ///
    /// `closing` asks the channel to wind down gracefully; `abort` stops the
    /// writer without draining.
    pub fn new(
        peer: SocketAddr,
        transport: Transport,
        options: ChannelOptions,
        closing: CancellationToken,
        abort: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(options.queue_size.max(1));
        let channel = Arc::new(Self {
            id: Self::generate(),
            peer,
            transport,
            state: AtomicU8::new(ChannelState::Connecting as u8),
            identity: OnceLock::new(),
            bucket: OnceLock::new(),
            close_reason: OnceLock::new(),
            last_activity: Mutex::new(Instant::now()),
            rooms: Mutex::new(HashSet::new()),
            watch_ops: RwLock::new(HashSet::new()),
            outbound,
            slow_strikes: AtomicU32::new(0),
            slow_threshold: options.slow_consumer_threshold.max(1),
            closing,
            abort,
        });
        (channel, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.get().map(|i| i.user_id.as_str())
    }

    pub fn bucket(&self) -> Option<usize> {
        self.bucket.get().copied()
    }

    pub(crate) fn set_bucket(&self, index: usize) {
        let _ = self.bucket.set(index);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ChannelState::Authenticated
    }

    pub fn is_closing(&self) -> bool {
        self.state() >= ChannelState::Closing
    }

    pub fn is_slow_consumer(&self) -> bool {
        self.slow_strikes.load(Ordering::Relaxed) > 0
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Connecting -> Unauthenticated`, once the transport handshake is done.
    pub fn handshake_complete(&self) -> bool {
        self.transition(ChannelState::Connecting, ChannelState::Unauthenticated)
    }

    /// `Unauthenticated -> Authenticated`. Fails if the channel has started
    /// closing in the meantime, in which case no identity is recorded.
    pub fn authenticate(&self, identity: Identity) -> bool {
        if !self.transition(ChannelState::Unauthenticated, ChannelState::Authenticated) {
            return false;
        }
        // Only the winning transition reaches here, so the cell is empty.
        let _ = self.identity.set(identity);
        self.touch();
        true
    }

    /// Move to `Closing` and wake the read and write paths.
    ///
    /// Returns `true` only for the call that initiated the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ChannelState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ChannelState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let _ = self.close_reason.set(reason);
        // Best effort; a full queue simply loses the notice.
        let notice = Frame::new(
            Op::DISCONNECT_REPLY,
            Bytes::from_static(reason.as_str().as_bytes()),
        );
        let _ = self.outbound.try_send(notice);
        self.closing.cancel();
        true
    }

    /// Final transition into `Closed`. Exactly one caller gets `true` and is
    /// responsible for deregistering the channel.
    pub fn finish_close(&self) -> bool {
        let previous = self.state.swap(ChannelState::Closed as u8, Ordering::AcqRel);
        if previous == ChannelState::Closed as u8 {
            return false;
        }
        let _ = self.close_reason.set(CloseReason::Shutdown);
        self.closing.cancel();
        true
    }

    pub(crate) fn closing_token(&self) -> &CancellationToken {
        &self.closing
    }

    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Refresh the heartbeat deadline.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_deadline(&self, timeout: Duration) -> Instant {
        self.last_activity() + timeout
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms.lock().iter().cloned().collect()
    }

    pub fn in_room(&self, room_id: &str) -> bool {
        self.rooms.lock().contains(room_id)
    }

    pub(crate) fn add_room(&self, room_id: &str) {
        self.rooms.lock().insert(room_id.to_string());
    }

    pub(crate) fn remove_room(&self, room_id: &str) {
        self.rooms.lock().remove(room_id);
    }

    pub(crate) fn take_rooms(&self) -> HashSet<String> {
        std::mem::take(&mut *self.rooms.lock())
    }

    pub fn watch(&self, ops: &[u32]) {
        self.watch_ops.write().extend(ops.iter().copied());
    }

    pub fn unwatch(&self, ops: &[u32]) {
        let mut watched = self.watch_ops.write();
        for op in ops {
            watched.remove(op);
        }
    }

    /// An empty watch set accepts every operation.
    pub fn accepts(&self, op: Op) -> bool {
        let watched = self.watch_ops.read();
        watched.is_empty() || watched.contains(&op.code())
    }

    /// Offer a push frame without waiting.
    ///
    /// A full queue drops the frame and counts a strike; reaching the
    /// configured threshold schedules the channel for closure.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        match self.state() {
            ChannelState::Authenticated => {}
            ChannelState::Closing | ChannelState::Closed => return PushOutcome::Closed,
            _ => return PushOutcome::NotAuthenticated,
        }
        if !self.accepts(frame.op) {
            return PushOutcome::Filtered;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => PushOutcome::Enqueued,
            Err(TrySendError::Full(_)) => {
                self.strike();
                PushOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Queue a reply produced by the read path. Replies skip the watch filter
    /// but share the queue bound with pushes.
    pub fn reply(&self, frame: Frame) -> bool {
        if self.is_closing() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.close(CloseReason::SlowConsumer);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn strike(&self) {
        let strikes = self.slow_strikes.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(conn_id = %self.id, strikes, "outbound queue full, push dropped");
        if strikes >= self.slow_threshold && self.close(CloseReason::SlowConsumer) {
            tracing::warn!(
                conn_id = %self.id,
                user_id = self.user_id().unwrap_or("-"),
                strikes,
                "closing slow consumer"
            );
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .field("user_id", &self.user_id())
            .finish()
    }
}
