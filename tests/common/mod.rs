#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use runner_sandbox::models::{ProjectKey, ProjectRecord, ServerMessage, Template};
use runner_sandbox::terminal::ShellLauncher;
use runner_sandbox::{build_router, AppState, MemoryRuntime, RunnerConfig, ShellMode};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub dir: TempDir,
    pub state: AppState,
    pub runtime: Arc<MemoryRuntime>,
    pub addr: SocketAddr,
}

impl TestServer {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig::new(dir.path().join("data"), dir.path().join("templates"))
            .with_shell_mode(ShellMode::Host);
        let runtime = Arc::new(MemoryRuntime::new());
        let state = AppState::with_runtime(
            config,
            runtime.clone(),
            ShellLauncher::Host {
                shell: "/bin/sh".to_string(),
            },
        )
        .await
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            dir,
            state,
            runtime,
            addr,
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Registers a python project directly through the library.
    pub async fn project(&self, user: &str, project: &str) -> ProjectKey {
        let key = ProjectKey::new(user, project).unwrap();
        let tree = self
            .state
            .files
            .bootstrap(&key, Template::Python)
            .await
            .unwrap();
        self.state
            .registry
            .create(ProjectRecord::new(&key, "demo".into(), Template::Python, tree))
            .await
            .unwrap();
        key
    }

    pub async fn connect(&self, user: &str, project: &str) -> Ws {
        let url = format!("ws://{}/ws?userId={}&projectId={}", self.addr, user, project);
        let (ws, _resp) = tokio::time::timeout(
            Duration::from_secs(10),
            tokio_tungstenite::connect_async(url),
        )
        .await
        .expect("ws connect timed out")
        .unwrap();
        ws
    }

    pub async fn container_name(&self, key: &ProjectKey) -> Option<String> {
        self.state.registry.get(key).await.unwrap().container_name
    }

    /// Polls until the project's registry entry and container are both gone.
    pub async fn wait_for_teardown(&self, key: &ProjectKey) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if self.container_name(key).await.is_none()
                    && !self.runtime.contains(&key.container_name())
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("sandbox was not torn down");
    }

    pub async fn wait_for_container(&self, key: &ProjectKey) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if self.container_name(key).await.is_some() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("sandbox never became active");
    }
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub async fn next_server_message(ws: &mut Ws) -> Option<ServerMessage> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Reads terminal output until it contains `needle`.
pub async fn read_output_until(ws: &mut Ws, needle: &str) -> String {
    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(message) = next_server_message(ws).await {
            if let ServerMessage::TerminalOutput { data } = message {
                seen.push_str(&data);
                if seen.contains(needle) {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "never saw {needle:?} in output: {seen:?}");
    seen
}
