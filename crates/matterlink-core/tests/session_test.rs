#![allow(clippy::unwrap_used)]
// End-to-end session tests: wiremock for REST, a local WebSocket server for
// the event stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use matterlink_core::{
    BackoffConfig, CoreError, Credentials, EventKind, InboundEvents, Session, SessionConfig,
    SessionState,
};

// ── Helpers ─────────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(10);

fn credentials(server: &MockServer, secret: &str) -> Credentials {
    Credentials {
        login: "bot".into(),
        secret: SecretString::from(secret.to_owned()),
        team: "eng".into(),
        server: server.uri(),
        no_tls: true,
        skip_tls_verify: false,
        mfa_token: None,
    }
}

fn config(server: &MockServer, secret: &str, stream: &Url) -> SessionConfig {
    let mut config = SessionConfig::new(credentials(server, secret));
    config.stream_url = Some(stream.clone());
    config.backoff = BackoffConfig {
        min: Duration::from_millis(50),
        max: Duration::from_millis(200),
    };
    config
}

async fn mount_probe(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v4/system/ping"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Version-Id", "9.11.0")
                .set_body_json(json!({ "status": "OK" })),
        )
        .mount(server)
        .await;
}

fn me_json() -> serde_json::Value {
    json!({ "id": "u1", "username": "bot" })
}

async fn mount_login(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/api/v4/users/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Token", "session-token")
                .set_body_json(me_json()),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn mount_teams(server: &MockServer, teams: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api/v4/users/u1/teams"))
        .respond_with(ResponseTemplate::new(200).set_body_json(teams))
        .mount(server)
        .await;
}

async fn mount_directory(server: &MockServer) {
    mount_teams(server, json!([{ "id": "t1", "name": "eng", "display_name": "Engineering" }]))
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v4/users"))
        .and(query_param("in_team", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            me_json(),
            { "id": "u2", "username": "alice" }
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v4/users/u1/teams/t1/channels"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "c1", "team_id": "t1", "type": "O", "name": "town-square", "display_name": "Town Square" },
            { "id": "d1", "team_id": "", "type": "D", "name": "u1__u2", "display_name": "" }
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v4/teams/t1/channels"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "c1", "team_id": "t1", "type": "O", "name": "town-square" },
            { "id": "c2", "team_id": "t1", "type": "O", "name": "random" }
        ])))
        .mount(server)
        .await;
}

fn posted_frame(post_id: &str, channel_id: &str, message: &str) -> String {
    let post = json!({
        "id": post_id,
        "channel_id": channel_id,
        "user_id": "u2",
        "message": message,
        "create_at": 1_700_000_000_000_i64
    })
    .to_string();
    json!({
        "event": "posted",
        "data": { "post": post, "team_id": "" },
        "broadcast": { "channel_id": channel_id, "team_id": "", "user_id": "" },
        "seq": 1
    })
    .to_string()
}

fn hello_frame(n: usize) -> String {
    posted_frame(&format!("p{n}"), "c1", &format!("hello {n}"))
}

/// Accept stream connections forever. Every connection gets one posted
/// event, numbered by connection. With `drop_first`, the first connection
/// is closed right after its event.
async fn spawn_stream_server(drop_first: bool) -> (Url, Arc<AtomicUsize>) {
    spawn_stream_server_with(drop_first, hello_frame).await
}

/// [`spawn_stream_server`] with a custom first frame per connection.
async fn spawn_stream_server_with(
    drop_first: bool,
    frame_for: fn(usize) -> String,
) -> (Url, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}/api/v4/websocket", listener.local_addr().unwrap()))
        .unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                if ws.send(Message::Text(frame_for(n).into())).await.is_err() {
                    return;
                }
                if drop_first && n == 0 {
                    let _ = ws.close(None).await;
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        let action: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                        let reply = json!({
                            "status": "OK",
                            "seq_reply": action["seq"],
                            "data": { "text": "pong" }
                        });
                        if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    (url, accepted)
}

async fn next_event(events: &mut InboundEvents) -> matterlink_core::InboundEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

async fn drain_until_closed(events: &mut InboundEvents) {
    tokio::time::timeout(WAIT, async {
        while events.recv().await.is_some() {}
    })
    .await
    .expect("event stream did not end");
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_delivers_normalized_events_and_logout_closes() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    mount_login(&server, 1).await;
    mount_directory(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v4/users/logout"))
        .and(header("Authorization", "Bearer session-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "OK" })))
        .expect(1)
        .mount(&server)
        .await;

    let (stream_url, _) = spawn_stream_server(false).await;
    let session = Session::new(config(&server, "hunter2", &stream_url)).unwrap();
    let mut events = session.events().unwrap();

    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Live);
    assert!(session.is_connected());
    assert_eq!(session.server_version().as_deref(), Some("9.11.0"));

    let event = next_event(&mut events).await;
    assert_eq!(event.kind, EventKind::Posted);
    assert_eq!(event.team, "eng");
    assert_eq!(event.team_id, "t1");
    assert_eq!(event.channel, "town-square");
    assert_eq!(event.channel_id, "c1");
    assert_eq!(event.username, "alice");
    assert_eq!(event.user_id, "u2");
    assert_eq!(event.text, "hello 0");
    assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);

    let more: Vec<_> = session
        .cache()
        .more_channels()
        .await
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(more, vec!["random".to_string()]);

    session.logout().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.is_connected());
    drain_until_closed(&mut events).await;

    // Idempotent.
    session.logout().await.unwrap();
}

#[tokio::test]
async fn test_stream_drop_triggers_reconnect() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    mount_login(&server, 2).await;
    mount_directory(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v4/users/logout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "OK" })))
        .mount(&server)
        .await;

    let (stream_url, accepted) = spawn_stream_server(true).await;
    let session = Session::new(config(&server, "hunter2", &stream_url)).unwrap();
    let mut events = session.events().unwrap();

    let connects = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&connects);
    session.add_observer(Arc::new(move |_: &Session| {
        observed.fetch_add(1, Ordering::SeqCst);
    }));

    session.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await.text, "hello 0");

    // The first connection is closed by the server; the session must come
    // back on its own and deliver the second connection's event.
    assert_eq!(next_event(&mut events).await.text, "hello 1");

    let mut state = session.subscribe_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Live))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    session.logout().await.unwrap();
    drain_until_closed(&mut events).await;
}

#[tokio::test]
async fn test_personal_token_session_is_not_logged_out_server_side() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    mount_directory(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v4/users/me"))
        .and(header("Authorization", "Bearer pat-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(me_json()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v4/users/login"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v4/users/logout"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (stream_url, _) = spawn_stream_server(false).await;
    let session = Session::new(config(&server, "token=pat-123", &stream_url)).unwrap();
    let _events = session.events().unwrap();

    session.connect().await.unwrap();
    assert_eq!(session.auth_mode().label(), "personal token");
    session.logout().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

// ── Fatal startup errors ────────────────────────────────────────────

#[tokio::test]
async fn test_rejected_login_is_fatal_on_first_connect() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v4/users/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "id": "api.user.login.invalid_credentials_email_username",
            "message": "Enter a valid email or username and/or password.",
            "status_code": 401
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (stream_url, accepted) = spawn_stream_server(false).await;
    let session = Session::new(config(&server, "wrong", &stream_url)).unwrap();

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, CoreError::AuthenticationFailed { .. }), "{err:?}");
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.rest(), Err(CoreError::NotConnected)));
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_team_lists_valid_teams() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    mount_login(&server, 1).await;
    mount_teams(
        &server,
        json!([
            { "id": "t2", "name": "sales" },
            { "id": "t3", "name": "support" }
        ]),
    )
    .await;

    let (stream_url, _) = spawn_stream_server(false).await;
    let session = Session::new(config(&server, "hunter2", &stream_url)).unwrap();

    let err = session.connect().await.unwrap_err();
    match err {
        CoreError::TeamNotFound { ref team, ref valid } => {
            assert_eq!(team, "eng");
            assert_eq!(valid, &vec!["sales".to_string(), "support".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("sales, support"));
}

#[tokio::test]
async fn test_second_connect_on_live_session_is_rejected() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    mount_login(&server, 1).await;
    mount_directory(&server).await;
    mount_logout(&server).await;

    let (stream_url, accepted) = spawn_stream_server(false).await;
    let session = Session::new(config(&server, "hunter2", &stream_url)).unwrap();
    let _events = session.events().unwrap();

    session.connect().await.unwrap();
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyConnected), "{err:?}");
    assert_eq!(session.state(), SessionState::Live);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    session.logout().await.unwrap();
}

// ── Rate limits and retries ─────────────────────────────────────────

async fn mount_logout(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v4/users/logout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "OK" })))
        .mount(server)
        .await;
}

fn rate_limited() -> ResponseTemplate {
    ResponseTemplate::new(429).insert_header("X-RateLimit-Reset", "1")
}

#[tokio::test]
async fn test_rate_limited_login_and_team_listing_wait_for_reset() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v4/users/login"))
        .respond_with(rate_limited())
        .up_to_n_times(1)
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_login(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/api/v4/users/u1/teams"))
        .respond_with(rate_limited())
        .up_to_n_times(1)
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_directory(&server).await;
    mount_logout(&server).await;

    let (stream_url, _) = spawn_stream_server(false).await;
    let session = Session::new(config(&server, "hunter2", &stream_url)).unwrap();
    let _events = session.events().unwrap();

    let start = std::time::Instant::now();
    session.connect().await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Live);
    assert_eq!(session.cache().primary_team().await.unwrap().name, "eng");

    session.logout().await.unwrap();
}

#[tokio::test]
async fn test_rejected_login_during_reconnect_is_retried() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    let accept = || {
        ResponseTemplate::new(200)
            .insert_header("Token", "session-token")
            .set_body_json(me_json())
    };
    Mock::given(method("POST"))
        .and(path("/api/v4/users/login"))
        .respond_with(accept())
        .up_to_n_times(1)
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v4/users/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "id": "api.user.login.invalid_credentials_email_username",
            "message": "Enter a valid email or username and/or password.",
            "status_code": 401
        })))
        .up_to_n_times(1)
        .expect(1)
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v4/users/login"))
        .respond_with(accept())
        .expect(1)
        .with_priority(3)
        .mount(&server)
        .await;
    mount_directory(&server).await;
    mount_logout(&server).await;

    let (stream_url, accepted) = spawn_stream_server(true).await;
    let session = Session::new(config(&server, "hunter2", &stream_url)).unwrap();
    let mut events = session.events().unwrap();

    session.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await.text, "hello 0");

    // The stream drops, the next login is rejected once, and the session
    // keeps going instead of giving up.
    assert_eq!(next_event(&mut events).await.text, "hello 1");
    let mut state = session.subscribe_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Live))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    session.logout().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_reconnect_triggers_run_one_sequence() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    mount_login(&server, 2).await;
    mount_directory(&server).await;
    mount_logout(&server).await;

    let (stream_url, accepted) = spawn_stream_server(false).await;
    let session = Session::new(config(&server, "hunter2", &stream_url)).unwrap();
    let _events = session.events().unwrap();

    let connects = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&connects);
    session.add_observer(Arc::new(move |_: &Session| {
        observed.fetch_add(1, Ordering::SeqCst);
    }));

    session.connect().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    let from_dispatch = {
        let session = session.clone();
        tokio::spawn(async move { session.trigger_reconnect("dispatch: stream closed") })
    };
    let from_keepalive = {
        let session = session.clone();
        tokio::spawn(async move { session.trigger_reconnect("keepalive: no pong") })
    };
    from_dispatch.await.unwrap();
    from_keepalive.await.unwrap();

    tokio::time::timeout(WAIT, async {
        while connects.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Give a stray second sequence time to show up.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert_eq!(session.state(), SessionState::Live);

    session.logout().await.unwrap();
}

// ── Normalization fallbacks ─────────────────────────────────────────

fn unknown_sender_frame(_: usize) -> String {
    let post = json!({
        "id": "p-ghost",
        "channel_id": "c1",
        "user_id": "u404",
        "message": "boo",
        "create_at": 1_700_000_000_000_i64
    })
    .to_string();
    json!({
        "event": "posted",
        "data": { "post": post, "team_id": "t1", "sender_name": "@ghost" },
        "broadcast": { "channel_id": "c1", "team_id": "", "user_id": "" },
        "seq": 1
    })
    .to_string()
}

#[tokio::test]
async fn test_sender_name_stands_in_for_unresolvable_user() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    mount_login(&server, 1).await;
    mount_directory(&server).await;
    mount_logout(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v4/users/u404"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "id": "app.user.missing_account.const",
            "message": "Unable to find the user.",
            "status_code": 404
        })))
        .mount(&server)
        .await;

    let (stream_url, _) = spawn_stream_server_with(false, unknown_sender_frame).await;
    let session = Session::new(config(&server, "hunter2", &stream_url)).unwrap();
    let mut events = session.events().unwrap();

    session.connect().await.unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.username, "ghost");
    assert_eq!(event.user_id, "u404");
    assert_eq!(event.channel, "town-square");

    session.logout().await.unwrap();
}

// ── Outbound helpers ────────────────────────────────────────────────

#[tokio::test]
async fn test_outbound_helpers_on_live_session() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    mount_login(&server, 1).await;
    mount_directory(&server).await;
    mount_logout(&server).await;

    Mock::given(method("PUT"))
        .and(path("/api/v4/posts/p1/patch"))
        .and(body_json(json!({ "message": "edited" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "p1", "channel_id": "c1", "user_id": "u1", "message": "edited"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/v4/posts/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "OK" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v4/files/f1/link"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "link": "https://files.example/f1" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v4/files/f2/link"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "id": "api.file.get_public_link.disabled.app_error",
            "message": "Public links have been disabled",
            "status_code": 403
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v4/channels/c1/members/u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "channel_id": "c1", "user_id": "u1", "last_viewed_at": 1_650_000_000_000_i64
        })))
        .mount(&server)
        .await;

    let (stream_url, _) = spawn_stream_server(false).await;
    let session = Session::new(config(&server, "hunter2", &stream_url)).unwrap();
    let _events = session.events().unwrap();
    session.connect().await.unwrap();

    let edited = session.edit_message("p1", "edited").await.unwrap();
    assert_eq!(edited.message, "edited");
    session.delete_message("p1").await.unwrap();

    let links = session
        .file_links(&["f1".to_string(), "f2".to_string()])
        .await
        .unwrap();
    assert_eq!(
        links,
        vec![
            "https://files.example/f1".to_string(),
            format!("{}/api/v4/files/f2", server.uri()),
        ]
    );

    assert_eq!(session.last_viewed_at("c1").await, 1_650_000_000_000);

    // Unknown membership falls back to "now".
    let before = chrono::Utc::now().timestamp_millis();
    let viewed = session.last_viewed_at("c2").await;
    let after = chrono::Utc::now().timestamp_millis();
    assert!((before..=after).contains(&viewed), "{before} <= {viewed} <= {after}");

    session.logout().await.unwrap();
}
