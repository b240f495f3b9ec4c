//! Adapters that turn an accepted socket into a frame stream and a frame
//! sink, so the connection task never knows which transport it is on.

use std::pin::Pin;

use comet_common::frame::{self, FrameCodec, FrameError, HEADER_LEN};
use comet_common::Frame;
use futures_util::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::channel::CloseReason;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("tls handshake: {0}")]
    Tls(std::io::Error),
}

impl TransportError {
    /// How a read failure is reported when it ends a channel.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Frame(FrameError::Io(_)) | Self::Tls(_) => CloseReason::ReadError,
            Self::Frame(_) => CloseReason::ProtocolError,
            Self::WebSocket(tungstenite::Error::Protocol(_))
            | Self::WebSocket(tungstenite::Error::Capacity(_)) => CloseReason::ProtocolError,
            Self::WebSocket(_) => CloseReason::ReadError,
        }
    }
}

/// Length-prefixed frames straight over a byte stream (TCP, or TLS over TCP).
pub fn framed<S>(io: S, max_body: usize) -> (FrameSink, FrameStream)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(io);
    let stream = FramedRead::new(read, FrameCodec::new(max_body))
        .map(|r| r.map_err(TransportError::from));
    let sink = FramedWrite::new(write, FrameCodec::new(max_body))
        .sink_map_err(TransportError::from);
    (Box::pin(sink), Box::pin(stream))
}

/// Message and frame limits sized to one gateway frame, so an oversized
/// message fails on its websocket header instead of being buffered.
fn websocket_config(max_body: usize) -> WebSocketConfig {
    let limit = HEADER_LEN + max_body;
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(limit);
    config.max_frame_size = Some(limit);
    config
}

/// Run the server side of the WebSocket upgrade, then carry exactly one
/// frame per binary (or text) message. Control messages are skipped.
pub async fn websocket<S>(io: S, max_body: usize) -> Result<(FrameSink, FrameStream), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async_with_config(io, Some(websocket_config(max_body))).await?;
    let (write, read) = ws.split();

    let stream = read.filter_map(move |message| {
        future::ready(match message {
            Ok(Message::Binary(data)) => {
                Some(frame::decode_message(&data[..], max_body).map_err(TransportError::from))
            }
            Ok(Message::Text(text)) => Some(
                frame::decode_message(text.as_str().as_bytes(), max_body)
                    .map_err(TransportError::from),
            ),
            // Close ends the underlying stream once the handshake completes.
            Ok(_) => None,
            Err(e) => Some(Err(TransportError::from(e))),
        })
    });
    let sink = write
        .sink_map_err(TransportError::from)
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::Binary(frame.encode()))));

    Ok((Box::pin(sink), Box::pin(stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use comet_common::Op;

    #[tokio::test]
    async fn framed_transport_moves_frames_both_ways() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut client_sink, mut client_stream) = framed(client, 64);
        let (mut server_sink, mut server_stream) = framed(server, 64);

        client_sink
            .send(Frame::new(Op::HEARTBEAT, Bytes::from_static(b"ping")))
            .await
            .unwrap();
        let got = server_stream.next().await.unwrap().unwrap();
        assert_eq!(got.op, Op::HEARTBEAT);
        assert_eq!(&got.body[..], b"ping");

        server_sink.send(got.reply(Op::HEARTBEAT_REPLY, Bytes::new())).await.unwrap();
        let reply = client_stream.next().await.unwrap().unwrap();
        assert_eq!(reply.op, Op::HEARTBEAT_REPLY);
    }

    #[tokio::test]
    async fn oversized_frame_is_a_protocol_error() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut client_sink, _client_stream) = framed(client, 1024);
        let (_server_sink, mut server_stream) = framed(server, 8);

        client_sink
            .send(Frame::new(Op::SEND_MSG, Bytes::from(vec![0u8; 32])))
            .await
            .unwrap();
        let err = server_stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.close_reason(), CloseReason::ProtocolError);
    }

    #[tokio::test]
    async fn oversized_websocket_message_is_refused_before_buffering() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = tokio::spawn(websocket(server_io, 64));
        let (mut client, _) = tokio_tungstenite::client_async("ws://localhost/", client_io)
            .await
            .unwrap();
        let (_server_sink, mut server_stream) = server.await.unwrap().unwrap();

        // The pipe holds 4 KiB, so the writer stalls unless the server
        // keeps consuming the 1 MiB payload.
        let writer = tokio::spawn(async move {
            let _ = client.send(Message::Binary(Bytes::from(vec![0u8; 1 << 20]))).await;
        });
        let err = server_stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::WebSocket(tungstenite::Error::Capacity(_))));
        assert_eq!(err.close_reason(), CloseReason::ProtocolError);
        assert!(!writer.is_finished());
        writer.abort();
    }

    #[tokio::test]
    async fn websocket_message_up_to_the_limit_is_accepted() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = tokio::spawn(websocket(server_io, 64));
        let (mut client, _) = tokio_tungstenite::client_async("ws://localhost/", client_io)
            .await
            .unwrap();
        let (_server_sink, mut server_stream) = server.await.unwrap().unwrap();

        let frame = Frame::new(Op::SEND_MSG, Bytes::from(vec![7u8; 64]));
        client.send(Message::Binary(frame.encode())).await.unwrap();
        assert_eq!(server_stream.next().await.unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn peer_hangup_ends_the_stream() {
        let (client, server) = tokio::io::duplex(64);
        let (_server_sink, mut server_stream) = framed(server, 64);
        drop(client);
        assert!(server_stream.next().await.is_none());
    }
}
