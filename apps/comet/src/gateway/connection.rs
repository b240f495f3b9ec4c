//! Per-connection task: authenticate, serve the read loop, drain the writer,
//! deregister.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use comet_common::{Frame, Op};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::channel::{Channel, CloseReason, Transport};
use super::server::Server;
use super::transport::{FrameSink, FrameStream};
use crate::auth::{AuthError, AuthRequest, Identity};

/// Body of AUTH_REPLY.
#[derive(Debug, Serialize)]
struct AuthReply<'a> {
    conn_id: &'a str,
    user_id: &'a str,
    heartbeat_secs: u64,
}

/// Drive one client connection from first frame to deregistration.
///
/// `auth_deadline` bounds the wait for a successful AUTH exchange.
pub async fn serve(
    server: Arc<Server>,
    peer: SocketAddr,
    transport: Transport,
    auth_deadline: Instant,
    sink: FrameSink,
    mut stream: FrameStream,
) {
    let (channel, outbound) = server.new_channel(peer, transport);
    channel.handshake_complete();
    tracing::debug!(conn_id = %channel.id(), %peer, transport = transport.as_str(), "connection accepted");

    let writer = tokio::spawn(write_loop(channel.clone(), sink, outbound));

    let auth = tokio::select! {
        _ = channel.closing_token().cancelled() => {
            Err(channel.close_reason().unwrap_or(CloseReason::Shutdown))
        }
        res = time::timeout_at(auth_deadline, authenticate(&server, &channel, &mut stream)) => {
            res.unwrap_or(Err(CloseReason::AuthTimeout))
        }
    };

    // The upstream hears `disconnected` only for sessions it saw `connected`.
    let (reason, session) = match auth {
        Ok(identity) => {
            tracing::info!(
                conn_id = %channel.id(),
                user_id = %identity.user_id,
                %peer,
                transport = transport.as_str(),
                "channel authenticated"
            );
            server.upstream().connected(channel.id(), &identity).await;
            let reason = read_loop(&server, &channel, &mut stream).await;
            (reason, Some(identity))
        }
        Err(reason) => (reason, None),
    };

    channel.close(reason);
    drop(stream);
    finish(&server, &channel, writer, session.as_ref()).await;
}

async fn authenticate(
    server: &Server,
    channel: &Arc<Channel>,
    stream: &mut FrameStream,
) -> Result<Identity, CloseReason> {
    let first = match stream.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
            tracing::debug!(conn_id = %channel.id(), error = %e, "read failed before auth");
            return Err(e.close_reason());
        }
        None => return Err(CloseReason::ClientClosed),
    };

    if first.op != Op::AUTH {
        tracing::debug!(conn_id = %channel.id(), op = %first.op, "first frame is not AUTH");
        return Err(if first.op.is_known() {
            CloseReason::AuthRejected
        } else {
            CloseReason::ProtocolError
        });
    }

    let request = AuthRequest::parse(&first.body).map_err(|e| rejected(channel, &e))?;
    let identity = server
        .authenticator()
        .authenticate(&request)
        .await
        .map_err(|e| rejected(channel, &e))?;
    if !server.whitelist().is_whitelisted(&identity.user_id) {
        return Err(rejected(
            channel,
            &AuthError::NotWhitelisted(identity.user_id.clone()),
        ));
    }

    if !channel.authenticate(identity.clone()) {
        return Err(channel.close_reason().unwrap_or(CloseReason::Shutdown));
    }
    server.register(channel).map_err(|e| {
        tracing::info!(conn_id = %channel.id(), user_id = %identity.user_id, error = %e, "registration refused");
        CloseReason::AuthRejected
    })?;

    for room_id in request.rooms.iter().filter(|r| !r.is_empty()) {
        if let Err(e) = server.join_room(room_id, channel) {
            tracing::debug!(conn_id = %channel.id(), room_id, error = %e, "initial room join failed");
        }
    }
    channel.watch(&request.accepts);

    let body = serde_json::to_vec(&AuthReply {
        conn_id: channel.id(),
        user_id: &identity.user_id,
        heartbeat_secs: server.config().heartbeat_timeout.as_secs(),
    })
    .map_err(|_| CloseReason::WriteError)?;
    reply(channel, first.reply(Op::AUTH_REPLY, Bytes::from(body)))?;

    Ok(identity)
}

fn rejected(channel: &Channel, error: &AuthError) -> CloseReason {
    tracing::info!(conn_id = %channel.id(), peer = %channel.peer(), %error, "auth rejected");
    CloseReason::AuthRejected
}

async fn read_loop(server: &Server, channel: &Arc<Channel>, stream: &mut FrameStream) -> CloseReason {
    let heartbeat_timeout = server.config().heartbeat_timeout;
    loop {
        let deadline = channel.idle_deadline(heartbeat_timeout);
        let frame = tokio::select! {
            _ = channel.closing_token().cancelled() => {
                return channel.close_reason().unwrap_or(CloseReason::Shutdown);
            }
            _ = time::sleep_until(deadline) => {
                if channel.idle_deadline(heartbeat_timeout) <= Instant::now() {
                    tracing::debug!(conn_id = %channel.id(), "heartbeat timeout");
                    return CloseReason::HeartbeatTimeout;
                }
                continue;
            }
            next = stream.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %channel.id(), error = %e, "read failed");
                    return e.close_reason();
                }
                None => return CloseReason::ClientClosed,
            },
        };

        if let Err(reason) = operate(server, channel, frame).await {
            return reason;
        }
    }
}

/// Handle one frame from an authenticated client.
async fn operate(server: &Server, channel: &Arc<Channel>, frame: Frame) -> Result<(), CloseReason> {
    let Some(identity) = channel.identity() else {
        return Err(CloseReason::ProtocolError);
    };
    match frame.op {
        Op::HEARTBEAT => {
            channel.touch();
            reply(channel, frame.reply(Op::HEARTBEAT_REPLY, Bytes::new()))
        }
        Op::ROOM_JOIN | Op::ROOM_LEAVE => {
            let room_id = std::str::from_utf8(&frame.body)
                .ok()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .ok_or(CloseReason::ProtocolError)?;
            let (result, reply_op) = if frame.op == Op::ROOM_JOIN {
                (server.join_room(room_id, channel), Op::ROOM_JOIN_REPLY)
            } else {
                (server.leave_room(room_id, channel), Op::ROOM_LEAVE_REPLY)
            };
            if let Err(e) = result {
                tracing::debug!(conn_id = %channel.id(), room_id, error = %e, "room change refused");
                return Err(CloseReason::ProtocolError);
            }
            reply(channel, frame.reply(reply_op, frame.body.clone()))
        }
        Op::SUB | Op::UNSUB => {
            let ops = parse_ops(&frame.body).ok_or(CloseReason::ProtocolError)?;
            let reply_op = if frame.op == Op::SUB {
                channel.watch(&ops);
                Op::SUB_REPLY
            } else {
                channel.unwatch(&ops);
                Op::UNSUB_REPLY
            };
            reply(channel, frame.reply(reply_op, frame.body.clone()))
        }
        Op::SEND_MSG | Op::RAW => {
            match server.upstream().receive(channel.id(), identity, &frame).await {
                Ok(()) => reply(channel, frame.reply(Op::SEND_MSG_REPLY, Bytes::new())),
                Err(e) => {
                    tracing::warn!(conn_id = %channel.id(), error = %e, "upstream refused client message");
                    Ok(())
                }
            }
        }
        op => {
            tracing::debug!(conn_id = %channel.id(), %op, "unexpected operation");
            Err(CloseReason::ProtocolError)
        }
    }
}

/// Comma-separated decimal operation codes, e.g. `1000,1001`.
fn parse_ops(body: &[u8]) -> Option<Vec<u32>> {
    let text = std::str::from_utf8(body).ok()?;
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

fn reply(channel: &Channel, frame: Frame) -> Result<(), CloseReason> {
    if channel.reply(frame) {
        Ok(())
    } else {
        Err(channel.close_reason().unwrap_or(CloseReason::WriteError))
    }
}

async fn write_loop(channel: Arc<Channel>, mut sink: FrameSink, mut outbound: mpsc::Receiver<Frame>) {
    loop {
        tokio::select! {
            biased;
            _ = channel.abort_token().cancelled() => return,
            next = outbound.recv() => {
                let Some(frame) = next else { break };
                if let Err(e) = write_batch(&mut sink, &mut outbound, frame).await {
                    tracing::debug!(conn_id = %channel.id(), error = %e, "write failed");
                    channel.close(CloseReason::WriteError);
                    return;
                }
            }
            _ = channel.closing_token().cancelled() => {
                // Flush whatever was queued before the close, then stop.
                outbound.close();
                while let Some(frame) = outbound.recv().await {
                    if sink.feed(frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Write one frame plus anything else already queued, then flush once.
async fn write_batch(
    sink: &mut FrameSink,
    outbound: &mut mpsc::Receiver<Frame>,
    first: Frame,
) -> Result<(), super::transport::TransportError> {
    sink.feed(first).await?;
    while let Ok(frame) = outbound.try_recv() {
        sink.feed(frame).await?;
    }
    sink.flush().await
}

async fn finish(
    server: &Server,
    channel: &Arc<Channel>,
    mut writer: JoinHandle<()>,
    session: Option<&Identity>,
) {
    if time::timeout(server.config().drain_timeout, &mut writer).await.is_err() {
        tracing::debug!(conn_id = %channel.id(), "writer did not drain in time");
        channel.abort_token().cancel();
        writer.abort();
    }

    if channel.finish_close() {
        server.deregister(channel);
    }
    if let Some(identity) = session {
        server.upstream().disconnected(channel.id(), identity).await;
    }
    tracing::info!(
        conn_id = %channel.id(),
        user_id = channel.user_id().unwrap_or("-"),
        reason = channel.close_reason().map(CloseReason::as_str).unwrap_or("-"),
        "channel closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ops_accepts_comma_separated_codes() {
        assert_eq!(parse_ops(b"1000, 1001,"), Some(vec![1000, 1001]));
        assert_eq!(parse_ops(b""), Some(vec![]));
        assert_eq!(parse_ops(b"1000,abc"), None);
        assert_eq!(parse_ops(&[0xff]), None);
    }
}
