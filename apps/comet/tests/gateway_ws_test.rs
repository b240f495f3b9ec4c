mod common;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use comet::gateway::CloseReason;
use comet_common::frame;
use comet_common::{Frame, Op};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: std::net::SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/sub"))
        .await
        .expect("ws connect");
    ws
}

async fn send(ws: &mut Ws, frame: Frame) {
    ws.send(Message::Binary(frame.encode())).await.expect("ws send");
}

/// Next frame from a binary message; `None` once the socket closes.
async fn recv(ws: &mut Ws) -> Option<Frame> {
    loop {
        let msg = time::timeout(common::RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for ws message")?;
        match msg {
            Ok(Message::Binary(data)) => return Some(frame::decode_message(&data, 4096).expect("decode")),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

// ===========================================================================
// WebSocket transport
// ===========================================================================

#[tokio::test]
async fn websocket_client_authenticates_and_receives_room_push() {
    let gw = common::start_gateway(common::gateway_config()).await;
    let mut ws = connect(gw.ws_addr).await;

    send(&mut ws, common::auth_frame(&gw.token("alice"), &["live://1"])).await;
    let reply = recv(&mut ws).await.expect("auth reply");
    assert_eq!(reply.op, Op::AUTH_REPLY);

    // Control frames are ignored by the gateway.
    ws.send(Message::Ping(Bytes::from_static(b"p"))).await.unwrap();

    send(&mut ws, Frame { seq: 9, ..Frame::empty(Op::HEARTBEAT) }).await;
    let hb = recv(&mut ws).await.unwrap();
    assert_eq!((hb.op, hb.seq), (Op::HEARTBEAT_REPLY, 9));

    assert_eq!(
        gw.dispatcher
            .push_to_room("live://1", Op(1000), Bytes::from_static(b"hi")),
        1
    );
    let pushed = recv(&mut ws).await.unwrap();
    assert_eq!(pushed.op, Op(1000));
    assert_eq!(&pushed.body[..], b"hi");
}

#[tokio::test]
async fn websocket_and_tcp_channels_share_one_index() {
    let gw = common::start_gateway(common::gateway_config()).await;
    let token = gw.token("alice");
    let mut ws = connect(gw.ws_addr).await;
    send(&mut ws, common::auth_frame(&token, &[])).await;
    assert_eq!(recv(&mut ws).await.unwrap().op, Op::AUTH_REPLY);
    let mut tcp = common::TcpClient::authenticated(gw.tcp_addr, &token, &[]).await;

    assert_eq!(gw.dispatcher.broadcast(Op(1000), Bytes::new()), 2);
    assert_eq!(recv(&mut ws).await.unwrap().op, Op(1000));
    assert_eq!(tcp.recv().await.unwrap().op, Op(1000));
}

#[tokio::test]
async fn message_with_trailing_bytes_closes_the_channel() {
    let gw = common::start_gateway(common::gateway_config()).await;
    let mut ws = connect(gw.ws_addr).await;
    send(&mut ws, common::auth_frame(&gw.token("alice"), &[])).await;
    assert_eq!(recv(&mut ws).await.unwrap().op, Op::AUTH_REPLY);
    gw.wait_for_channels(1).await;

    let mut payload = Frame::empty(Op::HEARTBEAT).encode().to_vec();
    payload.extend_from_slice(b"junk");
    ws.send(Message::Binary(payload.into())).await.unwrap();

    let mut saw_notice = false;
    while let Some(frame) = recv(&mut ws).await {
        if frame.op == Op::DISCONNECT_REPLY {
            assert_eq!(&frame.body[..], b"protocol_error");
            saw_notice = true;
        }
    }
    assert!(saw_notice);
    gw.wait_for_channels(0).await;
}

#[tokio::test]
async fn oversized_message_closes_the_channel() {
    let gw = common::start_gateway(common::gateway_config()).await;
    let mut ws = connect(gw.ws_addr).await;
    send(&mut ws, common::auth_frame(&gw.token("alice"), &[])).await;
    assert_eq!(recv(&mut ws).await.unwrap().op, Op::AUTH_REPLY);
    gw.wait_for_channels(1).await;
    let channel = gw.server.bucket_for("alice").lookup("alice").remove(0);

    // Well past max_body (4096) plus the header.
    let _ = ws.send(Message::Binary(Bytes::from(vec![0u8; 64 * 1024]))).await;

    while let Some(frame) = recv(&mut ws).await {
        assert_eq!(frame.op, Op::DISCONNECT_REPLY);
    }
    gw.wait_for_channels(0).await;
    assert_eq!(channel.close_reason(), Some(CloseReason::ProtocolError));
}
