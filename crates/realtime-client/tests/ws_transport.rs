//! End-to-end tests over the shipped WebSocket transport, against an
//! in-process server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use realtime_client::{ClientConfig, Frame, Realtime, Token, TokenProvider, WsTransport};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn token_provider() -> TokenProvider {
    Box::new(|| {
        Box::pin(async {
            Ok(Token {
                token: "tok-ws".to_string(),
                expires: now_ms() + 86_400_000,
                issued: now_ms(),
                client_id: None,
            })
        })
    })
}

/// Accept one connection, capturing the request URI (with its query).
async fn accept_ws(listener: &TcpListener, uri: Arc<Mutex<Option<String>>>) -> WsStream {
    let (tcp, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_hdr_async(tcp, move |req: &Request, response: Response| {
        *uri.lock().unwrap() = Some(req.uri().to_string());
        Ok(response)
    })
    .await
    .unwrap()
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) {
    let text = serde_json::to_string(frame).unwrap();
    ws.send(tungstenite::Message::Text(text.into())).await.unwrap();
}

async fn recv_frame(ws: &mut WsStream) -> Frame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        match msg {
            tungstenite::Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            tungstenite::Message::Binary(data) => return serde_json::from_slice(&data).unwrap(),
            _ => continue,
        }
    }
}

/// Like [`recv_frame`], but skips attach requests (an attach may be
/// requested twice when a subscribe races the connection handshake).
async fn recv_frame_skip_attach(ws: &mut WsStream) -> Frame {
    loop {
        match recv_frame(ws).await {
            Frame::Attach { .. } => continue,
            frame => return frame,
        }
    }
}

fn connected_frame(conn_id: &str) -> Frame {
    Frame::Connected {
        connection_id: conn_id.to_string(),
        resume_key: Some(format!("{conn_id}!key")),
        connection_state_ttl_ms: Some(120_000),
        max_idle_interval_ms: Some(60_000),
    }
}

// ---------------------------------------------------------------------------
// Test 1: full round trip over a real socket
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ws_end_to_end_subscribe_and_publish() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let uri = Arc::new(Mutex::new(None));

    let server_uri = uri.clone();
    let server_task = tokio::spawn(async move {
        let mut ws = accept_ws(&listener, server_uri).await;
        send_frame(&mut ws, &connected_frame("conn-1")).await;

        match recv_frame(&mut ws).await {
            Frame::Attach { channel } => assert_eq!(channel, "news"),
            other => panic!("expected Attach, got {other:?}"),
        }
        send_frame(&mut ws, &Frame::Attached { channel: "news".into() }).await;

        send_frame(
            &mut ws,
            &Frame::Message {
                channel: "news".into(),
                name: "headline".into(),
                data: b"hello".as_slice().into(),
                id: Some("msg-1".into()),
                client_id: None,
                timestamp: Some(now_ms()),
            },
        )
        .await;

        match recv_frame_skip_attach(&mut ws).await {
            Frame::Message { name, data, client_id, .. } => {
                assert_eq!(name, "reply");
                assert_eq!(data.as_ref(), b"ok");
                assert_eq!(client_id.as_deref(), Some("ws-client"));
            }
            other => panic!("expected Message, got {other:?}"),
        }

        match recv_frame(&mut ws).await {
            Frame::Close => {}
            other => panic!("expected Close, got {other:?}"),
        }
    });

    let mut config = ClientConfig::new(
        Arc::new(WsTransport::new(format!("ws://127.0.0.1:{port}/"))),
        token_provider(),
    );
    config.client_id = Some("ws-client".into());
    let client = Realtime::new(config);
    client.connect();

    let news = client.channel("news");
    let (msg_tx, mut msg_rx) = tokio::sync::mpsc::unbounded_channel();
    news.subscribe(move |m| {
        let _ = msg_tx.send(m);
    });

    let msg = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("timed out waiting for message")
        .unwrap();
    assert_eq!(msg.name, "headline");
    assert_eq!(msg.data.as_ref(), b"hello");
    assert_eq!(msg.id.as_deref(), Some("msg-1"));

    news.publish("reply", &b"ok"[..]).unwrap();
    client.close();
    server_task.await.unwrap();

    let uri = uri.lock().unwrap().clone().unwrap();
    assert!(uri.contains("access_token=tok-ws"), "uri: {uri}");
    assert!(uri.contains("client_id=ws-client"), "uri: {uri}");
    assert!(uri.contains("format=json"), "uri: {uri}");
}

// ---------------------------------------------------------------------------
// Test 2: undecodable and unrecognized frames are skipped
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ws_bad_frames_are_skipped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let uri = Arc::new(Mutex::new(None));

    let server_uri = uri.clone();
    let server_task = tokio::spawn(async move {
        let mut ws = accept_ws(&listener, server_uri).await;
        send_frame(&mut ws, &connected_frame("conn-1")).await;

        match recv_frame(&mut ws).await {
            Frame::Attach { channel } => assert_eq!(channel, "news"),
            other => panic!("expected Attach, got {other:?}"),
        }
        send_frame(&mut ws, &Frame::Attached { channel: "news".into() }).await;

        // Garbage, an unrecognized action, then a valid binary-encoded
        // message; only the last one should reach the subscriber.
        ws.send(tungstenite::Message::Text("not json at all".into())).await.unwrap();
        ws.send(tungstenite::Message::Text(r#"{"action":"presence_update"}"#.into()))
            .await
            .unwrap();
        let valid = Frame::Message {
            channel: "news".into(),
            name: "survives".into(),
            data: b"1".as_slice().into(),
            id: None,
            client_id: None,
            timestamp: None,
        };
        ws.send(tungstenite::Message::Binary(serde_json::to_vec(&valid).unwrap().into()))
            .await
            .unwrap();

        match recv_frame_skip_attach(&mut ws).await {
            Frame::Close => {}
            other => panic!("expected Close, got {other:?}"),
        }
    });

    let config = ClientConfig::new(
        Arc::new(WsTransport::new(format!("ws://127.0.0.1:{port}/"))),
        token_provider(),
    );
    let client = Realtime::new(config);
    client.connect();

    let news = client.channel("news");
    let (msg_tx, mut msg_rx) = tokio::sync::mpsc::unbounded_channel();
    news.subscribe(move |m| {
        let _ = msg_tx.send(m);
    });

    let msg = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("timed out waiting for message")
        .unwrap();
    assert_eq!(msg.name, "survives");

    client.close();
    server_task.await.unwrap();
}

// ---------------------------------------------------------------------------
// Test 3: connection refused surfaces as a retryable failure, not a hang
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ws_connect_failure_keeps_client_responsive() {
    // Bind then drop, so the port is very likely unbound.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = ClientConfig::new(
        Arc::new(WsTransport::new(format!("ws://127.0.0.1:{port}/"))),
        token_provider(),
    );
    let client = Realtime::new(config);

    let (state_tx, mut state_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_state_change(move |s| {
        let _ = state_tx.send(s);
    });
    client.connect();

    // The failed attempt reports disconnected, and close() still works.
    let state = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let s = state_rx.recv().await.unwrap();
            if s == realtime_client::ConnectionState::Disconnected {
                return s;
            }
        }
    })
    .await
    .expect("never saw disconnected");
    assert_eq!(state, realtime_client::ConnectionState::Disconnected);

    client.close();
    let last = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let s = state_rx.recv().await.unwrap();
            if s == realtime_client::ConnectionState::Closed {
                return s;
            }
        }
    })
    .await
    .expect("never saw closed");
    assert_eq!(last, realtime_client::ConnectionState::Closed);
}
