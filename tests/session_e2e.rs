mod common;

use std::time::Duration;

use common::{next_server_message, read_output_until, send_json, TestServer};
use futures_util::SinkExt;
use runner_sandbox::models::ServerMessage;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminal_input_reaches_shell_and_output_comes_back() {
    let server = TestServer::start().await;
    let key = server.project("u1", "p1").await;
    let mut ws = server.connect("u1", "p1").await;

    send_json(
        &mut ws,
        json!({"type": "terminal:input", "input": "echo ready-$((20+22))\n"}),
    )
    .await;
    read_output_until(&mut ws, "ready-42").await;

    assert_eq!(
        server.container_name(&key).await.as_deref(),
        Some("runner-u1-p1")
    );
    assert_eq!(server.runtime.create_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_starts_in_project_directory() {
    let server = TestServer::start().await;
    server.project("u1", "p1").await;
    let mut ws = server.connect("u1", "p1").await;

    send_json(&mut ws, json!({"type": "terminal:input", "input": "ls\n"})).await;
    read_output_until(&mut ws, "app.py").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_update_is_visible_over_http() {
    let server = TestServer::start().await;
    let key = server.project("u1", "p1").await;
    let mut ws = server.connect("u1", "p1").await;
    server.wait_for_container(&key).await;

    send_json(
        &mut ws,
        json!({
            "type": "file:update",
            "userId": "u1",
            "projectId": "p1",
            "filePath": "notes/a.txt",
            "content": "x"
        }),
    )
    .await;

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let content = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let resp = client
                .get(server.http("/api/file-content?userId=u1&projectId=p1&filepath=notes/a.txt"))
                .send()
                .await
                .unwrap();
            if resp.status().is_success() {
                let body: Value = resp.json().await.unwrap();
                return body["fileContent"].as_str().unwrap_or_default().to_string();
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("file never appeared");
    assert_eq!(content, "x");

    // New files are reflected in the stored tree.
    let record = server.state.registry.get(&key).await.unwrap();
    assert!(record
        .file_tree
        .iter()
        .any(|node| node.name == "notes" && node.children.as_ref().is_some_and(|c| c.len() == 1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn escaping_edit_is_dropped_and_session_survives() {
    let server = TestServer::start().await;
    let key = server.project("u1", "p1").await;
    let mut ws = server.connect("u1", "p1").await;
    server.wait_for_container(&key).await;

    send_json(
        &mut ws,
        json!({
            "type": "file:update",
            "userId": "u1",
            "projectId": "p1",
            "filePath": "../../escape.txt",
            "content": "pwned"
        }),
    )
    .await;
    send_json(
        &mut ws,
        json!({
            "type": "file:update",
            "userId": "u1",
            "projectId": "someone-else",
            "filePath": "b.txt",
            "content": "nope"
        }),
    )
    .await;

    send_json(&mut ws, json!({"type": "terminal:input", "input": "echo still-$((1+1))\n"})).await;
    read_output_until(&mut ws, "still-2").await;

    let data = server.dir.path().join("data");
    assert!(!data.join("escape.txt").exists());
    assert!(!data.join("code").join("escape.txt").exists());
    assert!(!data.join("code/u1/p1/b.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_stops_container_and_clears_registry() {
    let server = TestServer::start().await;
    let key = server.project("u1", "p1").await;
    let mut ws = server.connect("u1", "p1").await;
    server.wait_for_container(&key).await;

    ws.close(None).await.unwrap();
    drop(ws);

    server.wait_for_teardown(&key).await;
    assert_eq!(server.runtime.remove_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abrupt_disconnect_also_tears_down() {
    let server = TestServer::start().await;
    let key = server.project("u1", "p1").await;
    let ws = server.connect("u1", "p1").await;
    server.wait_for_container(&key).await;

    drop(ws);

    server.wait_for_teardown(&key).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_exit_ends_session_with_teardown() {
    let server = TestServer::start().await;
    let key = server.project("u1", "p1").await;
    let mut ws = server.connect("u1", "p1").await;
    server.wait_for_container(&key).await;

    send_json(&mut ws, json!({"type": "terminal:input", "input": "exit\n"})).await;

    server.wait_for_teardown(&key).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_after_teardown_gets_fresh_sandbox() {
    let server = TestServer::start().await;
    let key = server.project("u1", "p1").await;

    let mut ws = server.connect("u1", "p1").await;
    server.wait_for_container(&key).await;
    ws.close(None).await.unwrap();
    drop(ws);
    server.wait_for_teardown(&key).await;

    let mut ws = server.connect("u1", "p1").await;
    send_json(&mut ws, json!({"type": "terminal:input", "input": "echo again-$((2+2))\n"})).await;
    read_output_until(&mut ws, "again-4").await;
    assert_eq!(server.runtime.create_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_project_gets_error_then_close() {
    let server = TestServer::start().await;
    let mut ws = server.connect("u1", "missing").await;

    let message = tokio::time::timeout(Duration::from_secs(10), next_server_message(&mut ws))
        .await
        .expect("no reply");
    match message {
        Some(ServerMessage::Error { message }) => assert!(message.contains("not found")),
        other => panic!("expected error message, got {other:?}"),
    }
    assert_eq!(server.runtime.create_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_identifiers_are_refused() {
    let server = TestServer::start().await;
    let url = format!("ws://{}/ws?userId=u1", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(10), next_server_message(&mut ws))
        .await
        .expect("no reply");
    assert!(matches!(message, Some(ServerMessage::Error { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_are_ignored() {
    let server = TestServer::start().await;
    let key = server.project("u1", "p1").await;
    let mut ws = server.connect("u1", "p1").await;
    server.wait_for_container(&key).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    send_json(&mut ws, json!({"type": "terminal:unknown"})).await;
    send_json(&mut ws, json!({"type": "terminal:resize", "cols": 120, "rows": 40})).await;
    ws.send(Message::Binary(b"echo raw-$((3*3))\n".to_vec()))
        .await
        .unwrap();

    read_output_until(&mut ws, "raw-9").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_write_is_reported_and_session_continues() {
    let server = TestServer::start().await;
    let key = server.project("u1", "p1").await;

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let resp = client
        .post(server.http("/api/file-tree?userId=u1&projectId=p1&filepath=data&type=folder"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let mut ws = server.connect("u1", "p1").await;
    server.wait_for_container(&key).await;

    send_json(
        &mut ws,
        json!({
            "type": "file:update",
            "userId": "u1",
            "projectId": "p1",
            "filePath": "data",
            "content": "x"
        }),
    )
    .await;

    let reported = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(message) = next_server_message(&mut ws).await {
            if let ServerMessage::Error { message } = message {
                return Some(message);
            }
        }
        None
    })
    .await
    .expect("no error reported");
    let message = reported.expect("socket closed before the error arrived");
    assert!(message.contains("failed to write 'data'"), "{message}");

    send_json(&mut ws, json!({"type": "terminal:input", "input": "echo alive-$((5+5))\n"})).await;
    read_output_until(&mut ws, "alive-10").await;
    assert!(server.dir.path().join("data/code/u1/p1/data").is_dir());
}
