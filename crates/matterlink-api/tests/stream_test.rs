#![allow(clippy::unwrap_used)]
// Integration tests for the event stream against a local WebSocket server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use matterlink_api::{StreamConnection, StreamOptions};

// ── Helpers ─────────────────────────────────────────────────────────

async fn listener() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/api/v4/websocket")).unwrap();
    (listener, url)
}

fn options(url: Url) -> StreamOptions {
    StreamOptions::new(url, SecretString::from("tok".to_string()))
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_events_and_pong_are_split() {
    let (listener, url) = listener().await;

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        let hello = json!({ "event": "hello", "data": {}, "broadcast": {}, "seq": 0 });
        ws.send(Message::Text(hello.to_string().into())).await.unwrap();

        // Answer the first action with a pong carrying its seq.
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let action: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(action["action"], "ping");
                let reply = json!({
                    "status": "OK",
                    "seq_reply": action["seq"],
                    "data": { "text": "pong" }
                });
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                break;
            }
        }
        // Keep the socket open until the client hangs up.
        while ws.next().await.is_some() {}
    });

    let StreamConnection { handle, mut inbound } =
        StreamConnection::connect(options(url)).await.unwrap();

    let event = inbound.events.recv().await.unwrap();
    assert_eq!(event.event, "hello");

    let seq = handle.ping().await.unwrap();
    assert_eq!(seq, 1);

    let response = inbound.responses.recv().await.unwrap();
    assert!(response.is_pong());
    assert_eq!(response.seq_reply, 1);
    assert_eq!(handle.listen_error(), None);

    handle.close();
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_silent_server_trips_hard_timeout() {
    let (listener, url) = listener().await;

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let mut opts = options(url);
    opts.ping_timeout = Duration::from_millis(200);
    let StreamConnection { handle, .. } = StreamConnection::connect(opts).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle.hard_timeout().cancelled())
        .await
        .expect("hard timeout should fire");
    assert!(handle.listen_error().is_some());
}

#[tokio::test]
async fn test_server_close_records_listen_error() {
    let (listener, url) = listener().await;

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.close(None).await.unwrap();
    });

    let StreamConnection { handle, mut inbound } =
        StreamConnection::connect(options(url)).await.unwrap();

    // The reader exits, closing the event channel.
    assert!(inbound.events.recv().await.is_none());
    assert!(handle.listen_error().is_some());
}

#[tokio::test]
async fn test_connect_refused() {
    let (listener, url) = listener().await;
    drop(listener);

    let result = StreamConnection::connect(options(url)).await;
    assert!(matches!(result, Err(matterlink_api::Error::WebSocketConnect(_))));
}
