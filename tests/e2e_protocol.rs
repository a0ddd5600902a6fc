//! End-to-end tests that drive the Hub's real WebSocket endpoint, playing
//! Intent and Sentinel the way the SDK's own client would (§8 scenarios).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use starlight_hub::auth::AuthValidator;
use starlight_hub::config::HubConfig;
use starlight_hub::driver::NullDriver;
use starlight_hub::hub::Hub;
use starlight_hub::server;

/// Spin up a real Hub (control loop + housekeeping loop + axum server) on an
/// OS-assigned port and return its `ws://` URL.
async fn spawn_hub(mut config: HubConfig, dir: &std::path::Path) -> String {
    config.trace_file = dir.join("mission_trace.json");
    config.report_file = dir.join("report.html");
    config.memory_file = Some(dir.join("starlight_memory.json"));
    config.ghost_file = Some(dir.join("temporal_ghosting.json"));
    config.screenshots_dir = dir.join("screenshots");

    let hub = Arc::new(Hub::new(config.clone(), Arc::new(NullDriver)));
    let auth = Arc::new(AuthValidator::new(config.security.auth_token.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let control_hub = Arc::clone(&hub);
    tokio::spawn(async move { control_hub.run_control_loop().await });
    let housekeeping_hub = Arc::clone(&hub);
    tokio::spawn(async move { housekeeping_hub.run_housekeeping_loop().await });

    let router = server::router(hub, auth);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    // Give the listener a moment to actually start accepting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    format!("ws://{addr}/ws")
}

async fn send_frame<S>(ws: &mut S, method: &str, params: serde_json::Value, id: Option<&str>)
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let mut obj = json!({ "jsonrpc": "2.0", "method": method, "params": params });
    if let Some(id) = id {
        obj["id"] = json!(id);
    }
    ws.send(Message::Text(obj.to_string())).await.unwrap();
}

async fn recv_json<S>(ws: &mut S) -> serde_json::Value
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Keep reading frames until one satisfies `pred`, ignoring unrelated
/// broadcasts (e.g. `entropy_stream` ticks from the housekeeping loop).
async fn recv_matching<S>(ws: &mut S, pred: impl Fn(&serde_json::Value) -> bool) -> serde_json::Value
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let value = recv_json(ws).await;
        if pred(&value) {
            return value;
        }
    }
}

fn test_config() -> HubConfig {
    let mut config = HubConfig::default();
    // Keep the housekeeping tick slow enough that entropy_stream noise
    // doesn't dominate the Sentinel's inbox during assertions.
    config.entropy_throttle_ms = 200;
    config
}

/// §8 scenario 1: a single clearing Sentinel lets a `goto` proceed end to end.
#[tokio::test]
async fn goto_with_unanimous_clear_completes_successfully() {
    let dir = tempfile::tempdir().unwrap();
    let url = spawn_hub(test_config(), dir.path()).await;

    let (mut sentinel, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send_frame(
        &mut sentinel,
        "starlight.registration",
        json!({ "layer": "Janitor", "priority": 5, "selectors": [".modal"], "capabilities": [], "is_sentinel": true }),
        None,
    )
    .await;

    let (mut intent, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send_frame(
        &mut intent,
        "starlight.registration",
        json!({ "layer": "Intent", "priority": 0, "is_sentinel": false }),
        None,
    )
    .await;

    send_frame(
        &mut intent,
        "starlight.intent",
        json!({ "cmd": "goto", "url": "about:blank" }),
        Some("cmd-1"),
    )
    .await;

    let pre_check = recv_matching(&mut sentinel, |v| v["method"] == "starlight.pre_check").await;
    let round_id = pre_check["id"].as_str().unwrap().to_string();
    assert_eq!(pre_check["params"]["command"], "goto");

    send_frame(&mut sentinel, "starlight.clear", json!({ "confidence": 1.0 }), Some(&round_id)).await;

    let complete = tokio::time::timeout(
        Duration::from_secs(5),
        recv_matching(&mut intent, |v| v.get("success").is_some()),
    )
    .await
    .expect("COMMAND_COMPLETE should arrive within the grace period");

    assert_eq!(complete["id"], "cmd-1");
    assert_eq!(complete["success"], true);
}

/// §8 scenario 3: a higher-priority Sentinel preempts a lower-priority lock
/// holder, observable over the wire as a `starlight.preempted` notification.
#[tokio::test]
async fn higher_priority_hijack_preempts_lower_priority_holder() {
    let dir = tempfile::tempdir().unwrap();
    let url = spawn_hub(test_config(), dir.path()).await;

    let (mut janitor, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send_frame(
        &mut janitor,
        "starlight.registration",
        json!({ "layer": "Janitor", "priority": 5, "is_sentinel": true }),
        None,
    )
    .await;

    let (mut pulse, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send_frame(
        &mut pulse,
        "starlight.registration",
        json!({ "layer": "Pulse", "priority": 1, "is_sentinel": true }),
        None,
    )
    .await;

    send_frame(&mut janitor, "starlight.hijack", json!({ "reason": "modal present" }), None).await;
    // Give the Hub a moment to process the first hijack before the second.
    tokio::time::sleep(Duration::from_millis(50)).await;

    send_frame(&mut pulse, "starlight.hijack", json!({ "reason": "urgent takeover" }), None).await;

    let preempted = tokio::time::timeout(
        Duration::from_secs(5),
        recv_matching(&mut janitor, |v| v["method"] == "starlight.preempted"),
    )
    .await
    .expect("Janitor should be notified it was preempted");
    assert_eq!(preempted["params"]["reason"], "preempted");
}

/// §8: a single `wait` vote blocks the handshake regardless of other votes,
/// and the command's retry eventually succeeds once the Sentinel clears.
#[tokio::test]
async fn single_veto_blocks_then_clear_proceeds_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.self_heal_retry_delay_ms = 10;
    config.settle_delay_ms = 10;
    let url = spawn_hub(config, dir.path()).await;

    let (mut sentinel, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send_frame(
        &mut sentinel,
        "starlight.registration",
        json!({ "layer": "Janitor", "priority": 5, "is_sentinel": true }),
        None,
    )
    .await;

    let (mut intent, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send_frame(
        &mut intent,
        "starlight.registration",
        json!({ "layer": "Intent", "priority": 0, "is_sentinel": false }),
        None,
    )
    .await;

    send_frame(&mut intent, "starlight.intent", json!({ "cmd": "click", "selector": "#ok" }), Some("cmd-veto")).await;

    let first_check = recv_matching(&mut sentinel, |v| v["method"] == "starlight.pre_check").await;
    let first_id = first_check["id"].as_str().unwrap().to_string();
    send_frame(&mut sentinel, "starlight.wait", json!({ "retryAfterMs": 10 }), Some(&first_id)).await;

    let second_check = tokio::time::timeout(
        Duration::from_secs(5),
        recv_matching(&mut sentinel, |v| v["method"] == "starlight.pre_check" && v["id"] != first_id),
    )
    .await
    .expect("executor should re-broadcast the pre-check after the veto's back-off");
    let second_id = second_check["id"].as_str().unwrap().to_string();
    send_frame(&mut sentinel, "starlight.clear", json!({ "confidence": 1.0 }), Some(&second_id)).await;

    let complete = tokio::time::timeout(
        Duration::from_secs(5),
        recv_matching(&mut intent, |v| v.get("success").is_some()),
    )
    .await
    .expect("COMMAND_COMPLETE should arrive after the retried handshake clears");
    assert_eq!(complete["id"], "cmd-veto");
    assert_eq!(complete["success"], true);
}

/// §7 Authorization: a bad registration token gets the connection closed
/// with code 4001 instead of being silently dropped.
#[tokio::test]
async fn bad_auth_token_closes_connection_with_4001() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.security.auth_token = Some("correct-horse-battery-staple".to_string());
    let url = spawn_hub(config, dir.path()).await;

    let (mut conn, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send_frame(
        &mut conn,
        "starlight.registration",
        json!({ "layer": "Intruder", "priority": 1, "is_sentinel": true, "authToken": "wrong" }),
        None,
    )
    .await;

    match tokio::time::timeout(Duration::from_secs(5), conn.next()).await {
        Ok(Some(Ok(Message::Close(Some(frame))))) => assert_eq!(frame.code, 4001),
        other => panic!("expected a 4001 close frame, got {other:?}"),
    }
}
