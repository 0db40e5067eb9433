//! The HTTP/websocket surface, exercised with a real client.

use codebox::{http_server, AppState, EngineConfig, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

struct Server {
    addr: SocketAddr,
    _root: TempDir,
}

async fn spawn_server(token: Option<&str>) -> Server {
    let root = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        token: token.map(str::to_string),
        engine: EngineConfig {
            workspace_root: Some(root.path().to_path_buf()),
            ..EngineConfig::default()
        },
        ..ServerConfig::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(http_server::serve(listener, AppState::new(config)));
    Server { addr, _root: root }
}

/// Send `init` and collect JSON frames until `done`.
async fn collect(url: &str, init: Value) -> Vec<Value> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws.send(Message::Text(init.to_string())).await.unwrap();

    let mut frames = Vec::new();
    let read = async {
        while let Some(msg) = ws.next().await {
            match msg.unwrap() {
                Message::Text(text) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    let done = frame["type"] == "done";
                    frames.push(frame);
                    if done {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(20), read)
        .await
        .expect("no done frame");
    frames
}

fn outputs(frames: &[Value]) -> String {
    frames
        .iter()
        .filter(|f| f["type"] == "output")
        .filter_map(|f| f["output"].as_str())
        .collect()
}

#[tokio::test]
async fn health_check() {
    let server = spawn_server(None).await;
    let body = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn bad_token_closes_with_policy_violation() {
    let server = spawn_server(Some("letmein")).await;
    let url = format!("ws://{}/ws?token=wrong", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match msg {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_init_gets_error_then_done() {
    let server = spawn_server(None).await;
    let url = format!("ws://{}/ws", server.addr);

    let frames = collect(&url, json!({ "language": "python" })).await;
    assert_eq!(frames.len(), 2, "{frames:?}");
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[1], json!({ "type": "done" }));
}

#[tokio::test]
async fn python_session_over_websocket() {
    if which::which("python3").is_err() {
        return;
    }
    let server = spawn_server(Some("letmein")).await;
    let url = format!("ws://{}/ws?token=letmein", server.addr);

    let frames = collect(&url, json!({ "code": "print('hello over ws')", "language": "python" })).await;
    assert!(outputs(&frames).contains("hello over ws"), "{frames:?}");
    assert_eq!(frames.last(), Some(&json!({ "type": "done" })));
}

#[tokio::test]
async fn interactive_input_over_websocket() {
    if which::which("python3").is_err() {
        return;
    }
    let server = spawn_server(None).await;
    let url = format!("ws://{}/ws", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let init = json!({ "code": "name = input('name? ')\nprint('hi ' + name)\n", "language": "python" });
    ws.send(Message::Text(init.to_string())).await.unwrap();
    ws.send(Message::Text("ada\n".to_string())).await.unwrap();

    let mut text = String::new();
    let read = async {
        while let Some(Ok(Message::Text(raw))) = ws.next().await {
            let frame: Value = serde_json::from_str(&raw).unwrap();
            if frame["type"] == "done" {
                break;
            }
            text.push_str(frame["output"].as_str().unwrap_or_default());
        }
    };
    tokio::time::timeout(Duration::from_secs(20), read).await.unwrap();
    assert!(text.contains("hi ada"), "{text}");
}

#[tokio::test]
async fn delete_stops_a_live_session() {
    if which::which("python3").is_err() {
        return;
    }
    let server = spawn_server(None).await;
    let url = format!("ws://{}/ws", server.addr);
    let base = format!("http://{}", server.addr);

    let session = tokio::spawn(collect_owned(
        url,
        json!({ "code": "import time\ntime.sleep(30)\n", "language": "python", "session": "remote-stop" }),
    ));

    let client = reqwest::Client::new();
    let mut listed = false;
    for _ in 0..200 {
        let list: Value = client
            .get(format!("{base}/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if list.as_array().unwrap().iter().any(|s| s["id"] == "remote-stop") {
            listed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(listed, "session never listed");

    let status = client
        .delete(format!("{base}/sessions/remote-stop"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 204);

    let frames = session.await.unwrap();
    assert_eq!(frames.last(), Some(&json!({ "type": "done" })));

    let status = client
        .delete(format!("{base}/sessions/remote-stop"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 404);
}

async fn collect_owned(url: String, init: Value) -> Vec<Value> {
    collect(&url, init).await
}

#[tokio::test]
async fn session_admin_requires_token() {
    let server = spawn_server(Some("letmein")).await;
    let client = reqwest::Client::new();

    let status = client
        .get(format!("http://{}/sessions", server.addr))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 401);

    let status = client
        .get(format!("http://{}/sessions?token=letmein", server.addr))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 200);
}

#[tokio::test]
async fn format_rejects_unknown_language() {
    let server = spawn_server(None).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{}/format", server.addr))
        .json(&json!({ "code": "x", "language": "cobol" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unsupported language");
}
