use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use std::{fs, net::TcpListener, process::Command, time::Duration};
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A structurally valid event that passes with VERIFY_SIG=0.
fn fake_event(seed: u8, kind: u16, created_at: i64) -> serde_json::Value {
    serde_json::json!({
        "id": hex::encode([seed; 32]),
        "pubkey": hex::encode([0xabu8; 32]),
        "created_at": created_at,
        "kind": kind,
        "tags": [],
        "content": format!("event {seed}"),
        "sig": hex::encode([0u8; 64]),
    })
}

#[tokio::test]
async fn serve_cli_runs_http_and_ws() {
    let dir = TempDir::new().unwrap();
    let http_port = free_port();
    let ws_port = free_port();
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            "STORE_ROOT={}\nBIND_HTTP=127.0.0.1:{}\nBIND_WS=127.0.0.1:{}\nVERIFY_SIG=0\nREJECT_OLDER_SECS=9999999999\n",
            dir.path().display(),
            http_port,
            ws_port
        ),
    )
    .unwrap();

    let mut child = Command::cargo_bin("quern")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "serve"])
        .spawn()
        .unwrap();

    // allow servers to start
    sleep(Duration::from_millis(400)).await;

    // HTTP health check and relay info
    let url = format!("http://127.0.0.1:{}/healthz", http_port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    let info: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{}/", http_port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["software"], "quern");

    // Subscribe, publish, and get the event delivered live.
    let ws_url = format!("ws://127.0.0.1:{}/", ws_port);
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    let req = serde_json::json!(["REQ", "s", {"kinds": [1]}]);
    ws.send(Message::Text(req.to_string())).await.unwrap();

    let mut got_eose = false;
    while let Some(msg) = ws.next().await {
        if let Message::Text(t) = msg.unwrap() {
            if t.contains("EOSE") {
                got_eose = true;
                break;
            }
        }
    }
    assert!(got_eose);

    let ev = fake_event(1, 1, 1000);
    ws.send(Message::Text(serde_json::json!(["EVENT", ev]).to_string()))
        .await
        .unwrap();
    let mut got_ok = false;
    let mut got_event = false;
    while !(got_ok && got_event) {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(t) => {
                let frame: serde_json::Value = serde_json::from_str(&t).unwrap();
                match frame[0].as_str().unwrap() {
                    "OK" => {
                        assert_eq!(frame[2], serde_json::json!(true));
                        got_ok = true;
                    }
                    "EVENT" => {
                        assert_eq!(frame[2]["id"], ev["id"]);
                        got_event = true;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    // The metrics endpoint has counted the traffic.
    let metrics = reqwest::get(format!("http://127.0.0.1:{}/metrics", http_port))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("nostr_client_messages_total{verb=\"EVENT\"}"));

    child.kill().unwrap();
    let _ = child.wait();
}

#[tokio::test]
async fn serve_persists_across_restart() {
    let dir = TempDir::new().unwrap();
    let http_port = free_port();
    let ws_port = free_port();
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            "STORE_ROOT={}\nBIND_HTTP=127.0.0.1:{}\nBIND_WS=127.0.0.1:{}\nVERIFY_SIG=0\nREJECT_OLDER_SECS=9999999999\n",
            dir.path().display(),
            http_port,
            ws_port
        ),
    )
    .unwrap();

    let mut child = Command::cargo_bin("quern")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "serve"])
        .spawn()
        .unwrap();
    sleep(Duration::from_millis(400)).await;

    let ws_url = format!("ws://127.0.0.1:{}/", ws_port);
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let ev = fake_event(7, 1, 1234);
    ws.send(Message::Text(serde_json::json!(["EVENT", ev]).to_string()))
        .await
        .unwrap();
    let mut acked = false;
    while let Some(msg) = ws.next().await {
        if let Message::Text(t) = msg.unwrap() {
            if t.contains("OK") {
                acked = true;
                break;
            }
        }
    }
    assert!(acked);
    drop(ws);
    child.kill().unwrap();
    let _ = child.wait();

    // Restart on the same store and query the event back.
    let mut child = Command::cargo_bin("quern")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "serve"])
        .spawn()
        .unwrap();
    sleep(Duration::from_millis(400)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let req = serde_json::json!(["REQ", "s", {"ids": [ev["id"]]}]);
    ws.send(Message::Text(req.to_string())).await.unwrap();
    let mut got_event = false;
    while let Some(msg) = ws.next().await {
        if let Message::Text(t) = msg.unwrap() {
            if t.contains("\"EVENT\"") {
                got_event = true;
            }
            if t.contains("EOSE") {
                break;
            }
        }
    }
    assert!(got_event);

    child.kill().unwrap();
    let _ = child.wait();
}
