//! Client-facing connection core: channels, rooms and buckets, the
//! listeners that feed them, and the push fan-out used by the control plane.

pub mod bucket;
pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod lifecycle;
pub mod listener;
pub mod room;
pub mod server;
pub mod tls;
pub mod transport;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{Channel, ChannelState, CloseReason, Transport};
pub use dispatcher::Dispatcher;
pub use server::Server;
