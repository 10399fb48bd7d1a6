//! One client connection bound to one project sandbox.
//!
//! ```text
//! Connecting ──establish ok──▶ Active ──client close / transport error / shell exit──▶ Closing ──▶ Closed
//!      └────────────establish failed──────────────────────────────────────────────────▶ Closing ──▶ Closed
//! ```
//!
//! Teardown (kill the shell, stop the container, clear the registry's
//! `containerName`) runs exactly once per session, whichever way it ends. It
//! runs on its own task, so it completes even if the connection task is
//! cancelled half way through.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::container::ContainerDescriptor;
use crate::errors::{RunnerError, RunnerResult};
use crate::files::EditOutcome;
use crate::models::{ClientMessage, ProjectKey, ServerMessage};
use crate::service::AppState;
use crate::terminal::{AttachTarget, ShellHandle, TerminalSize, Utf8Decoder};
use crate::SANDBOX_MOUNT_PATH;

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportError,
    ShellExited,
    SetupFailed,
    Dropped,
}

pub struct SandboxSession {
    key: ProjectKey,
    state: SessionState,
    container_name: Option<String>,
    shell: Option<ShellHandle>,
    services: AppState,
}

impl SandboxSession {
    pub fn new(key: ProjectKey, services: AppState) -> Self {
        Self {
            key,
            state: SessionState::Connecting,
            container_name: None,
            shell: None,
            services,
        }
    }

    pub fn key(&self) -> &ProjectKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn container_name(&self) -> Option<&str> {
        self.container_name.as_deref()
    }

    /// Ensures the project's container is running, records it in the
    /// registry and attaches a shell. On error the session stays in
    /// `Connecting`; call [`SandboxSession::close`] to release whatever was
    /// acquired.
    pub async fn establish(&mut self, size: TerminalSize) -> RunnerResult<()> {
        if self.state != SessionState::Connecting {
            return Err(RunnerError::Internal(format!(
                "session for {} is {:?}, not connecting",
                self.key, self.state
            )));
        }

        let record = self.services.registry.get(&self.key).await?;
        let host_dir = self.services.files.project_dir(&self.key);
        tokio::fs::create_dir_all(&host_dir).await?;

        let descriptor =
            ContainerDescriptor::for_project(&record, &self.services.config, &host_dir);
        // Recorded before any side effect so teardown covers a half-created container.
        self.container_name = Some(descriptor.name.clone());

        // The registry is written under the container's lock so a concurrent
        // teardown of the same project cannot clear it after this start.
        let recorded = self
            .services
            .registry
            .set_container_name(&self.key, Some(descriptor.name.clone()));
        self.services
            .lifecycle
            .ensure_running_then(&descriptor, recorded)
            .await?;

        let target = AttachTarget {
            container_name: descriptor.name.clone(),
            workdir: SANDBOX_MOUNT_PATH.to_string(),
            host_dir,
        };
        let shell = self.services.bridge.attach(&target, size).await?;
        self.shell = Some(shell);
        self.state = SessionState::Active;

        info!("[session:{}] active in {}", self.key, descriptor.name);
        Ok(())
    }

    /// Drives the session over `socket` until it ends, then tears it down.
    pub async fn run(mut self, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();

        if let Err(error) = self.establish(TerminalSize::default()).await {
            error!("[session:{}] setup failed: {}", self.key, error);
            send_message(
                &mut sender,
                &ServerMessage::Error {
                    message: error.to_string(),
                },
            )
            .await;
            let _ = sender.close().await;
            self.close(CloseReason::SetupFailed).await;
            return;
        }

        let reason = match self.shell.as_mut() {
            Some(shell) => {
                bridge(shell, &self.key, &self.services, &mut sender, &mut receiver).await
            }
            None => CloseReason::ShellExited,
        };
        if reason != CloseReason::ClientClosed {
            let _ = sender.close().await;
        }
        self.close(reason).await;
    }

    /// Tears the session down. Only the first call does any work.
    pub async fn close(&mut self, reason: CloseReason) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;
        info!("[session:{}] closing ({:?})", self.key, reason);

        let teardown = self.take_teardown();
        if let Err(e) = tokio::spawn(teardown.run()).await {
            error!("[session:{}] teardown task failed: {}", self.key, e);
        }
        self.state = SessionState::Closed;
    }

    fn take_teardown(&mut self) -> Teardown {
        Teardown {
            key: self.key.clone(),
            container_name: self.container_name.take(),
            shell: self.shell.take(),
            services: self.services.clone(),
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if !matches!(self.state, SessionState::Connecting | SessionState::Active) {
            return;
        }
        self.state = SessionState::Closed;
        if self.container_name.is_none() && self.shell.is_none() {
            return;
        }

        let teardown = self.take_teardown();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("[session:{}] dropped while open, tearing down", self.key);
                handle.spawn(teardown.run());
            }
            Err(_) => error!(
                "[session:{}] dropped outside a runtime; container {:?} left behind",
                self.key, teardown.container_name
            ),
        }
    }
}

struct Teardown {
    key: ProjectKey,
    container_name: Option<String>,
    shell: Option<ShellHandle>,
    services: AppState,
}

impl Teardown {
    async fn run(self) {
        if let Some(shell) = self.shell {
            shell.close().await;
        }

        let Some(name) = self.container_name else {
            return;
        };
        // Cleared even when stop failed so the registry never points at a
        // session that is gone.
        let cleared = self.services.registry.set_container_name(&self.key, None);
        let (stopped, cleared) = self.services.lifecycle.stop_then(&name, cleared).await;
        if let Err(error) = stopped {
            error!("[session:{}] failed to stop {}: {}", self.key, name, error);
        }
        if let Err(error) = cleared {
            warn!(
                "[session:{}] failed to clear container name: {}",
                self.key, error
            );
        }
        debug!("[session:{}] teardown complete", self.key);
    }
}

/// Sends the handshake error and closes the socket without touching any
/// sandbox state.
pub async fn refuse(socket: WebSocket, error: RunnerError) {
    let (mut sender, _receiver) = socket.split();
    send_message(
        &mut sender,
        &ServerMessage::Error {
            message: error.to_string(),
        },
    )
    .await;
    let _ = sender.close().await;
}

async fn send_message(sender: &mut WsSender, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("failed to encode server message: {}", e);
            false
        }
    }
}

async fn bridge(
    shell: &mut ShellHandle,
    key: &ProjectKey,
    services: &AppState,
    sender: &mut WsSender,
    receiver: &mut WsReceiver,
) -> CloseReason {
    let mut decoder = Utf8Decoder::new();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(reason) =
                            handle_client_text(text.as_str(), shell, key, services, sender).await
                        {
                            return reason;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if shell.write(data.into()).await.is_err() {
                            return CloseReason::ShellExited;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("[session:{}] websocket error: {}", key, e);
                        return CloseReason::TransportError;
                    }
                }
            }
            output = shell.recv_output() => {
                match output {
                    Some(chunk) => {
                        let data = decoder.push(&chunk);
                        if data.is_empty() {
                            continue;
                        }
                        if !send_message(sender, &ServerMessage::TerminalOutput { data }).await {
                            return CloseReason::TransportError;
                        }
                    }
                    None => {
                        let data = decoder.finish();
                        if !data.is_empty() {
                            send_message(sender, &ServerMessage::TerminalOutput { data }).await;
                        }
                        info!("[session:{}] shell exited", key);
                        return CloseReason::ShellExited;
                    }
                }
            }
        }
    }
}

async fn handle_client_text(
    text: &str,
    shell: &ShellHandle,
    key: &ProjectKey,
    services: &AppState,
    sender: &mut WsSender,
) -> Result<(), CloseReason> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("[session:{}] ignoring malformed message: {}", key, e);
            return Ok(());
        }
    };

    match message {
        ClientMessage::TerminalInput { input } => {
            if shell.write(input.into_bytes()).await.is_err() {
                return Err(CloseReason::ShellExited);
            }
        }
        ClientMessage::TerminalResize { cols, rows } => {
            if cols == 0 || rows == 0 {
                debug!("[session:{}] ignoring resize to {}x{}", key, cols, rows);
            } else if let Err(e) = shell.resize(TerminalSize { cols, rows }) {
                warn!("[session:{}] resize failed: {}", key, e);
            }
        }
        ClientMessage::FileUpdate {
            user_id,
            project_id,
            file_path,
            content,
        } => {
            if user_id != key.user_id || project_id != key.project_id {
                warn!(
                    "[session:{}] ignoring file:update for {}/{}",
                    key, user_id, project_id
                );
                return Ok(());
            }
            apply_file_update(&file_path, &content, key, services, sender).await?;
        }
    }
    Ok(())
}

async fn apply_file_update(
    file_path: &str,
    content: &str,
    key: &ProjectKey,
    services: &AppState,
    sender: &mut WsSender,
) -> Result<(), CloseReason> {
    match services.files.apply_edit(key, file_path, content).await {
        Ok(EditOutcome::Overwritten) => {}
        Ok(EditOutcome::Created) => {
            let refreshed = match services.files.scan_tree(key).await {
                Ok(tree) => services.registry.set_file_tree(key, tree).await,
                Err(e) => Err(e),
            };
            if let Err(e) = refreshed {
                warn!("[session:{}] failed to refresh file tree: {}", key, e);
            }
        }
        Err(RunnerError::InvalidPath(path)) => {
            warn!("[session:{}] rejected edit outside project: {}", key, path);
        }
        Err(e) => {
            warn!("[session:{}] edit of {} failed: {}", key, file_path, e);
            let message = ServerMessage::Error {
                message: e.to_string(),
            };
            if !send_message(sender, &message).await {
                return Err(CloseReason::TransportError);
            }
        }
    }
    Ok(())
}
