//! Container lifecycle: one sandbox container per project, driven through a
//! [`ContainerRuntime`].
//!
//! [`LifecycleController`] serializes operations per container name so that
//! concurrent `ensure_running` calls for the same project create at most one
//! container, and `stop` on an absent container is a no-op.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use which::which;

use crate::config::RunnerConfig;
use crate::errors::{RunnerError, RunnerResult};
use crate::locks::KeyedLocks;
use crate::models::ProjectRecord;
use crate::SANDBOX_MOUNT_PATH;

const MANAGED_LABEL: &str = "runner.managed=true";
const MANAGED_FILTER: &str = "label=runner.managed=true";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Stopped,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another caller created a container with the same name first.
    AlreadyExists,
}

/// Everything needed to create a project's sandbox container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub host_dir: PathBuf,
    pub mount_path: String,
    pub memory_limit: String,
    pub cpu_shares: u32,
}

impl ContainerDescriptor {
    pub fn for_project(record: &ProjectRecord, config: &RunnerConfig, project_dir: &Path) -> Self {
        Self {
            name: record.key().container_name(),
            image: config.image_for(record.template).to_string(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            host_dir: project_dir.to_path_buf(),
            mount_path: SANDBOX_MOUNT_PATH.to_string(),
            memory_limit: config.memory_limit.clone(),
            cpu_shares: config.cpu_shares,
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn inspect(&self, name: &str) -> RunnerResult<ContainerState>;
    async fn create(&self, descriptor: &ContainerDescriptor) -> RunnerResult<CreateOutcome>;
    async fn start(&self, name: &str) -> RunnerResult<()>;
    /// Force-removes the container. Returns `false` when it did not exist.
    async fn remove(&self, name: &str) -> RunnerResult<bool>;
    /// Names of every container this server created, running or not.
    async fn list_managed(&self) -> RunnerResult<Vec<String>>;
}

// =============================================================================
// Docker CLI runtime
// =============================================================================

pub struct DockerCli {
    docker_path: String,
}

impl DockerCli {
    /// Locates the `docker` binary on `PATH`.
    pub fn new() -> RunnerResult<Self> {
        let docker_path = which("docker")
            .map_err(|_| RunnerError::RuntimeUnavailable("docker binary not found in PATH".into()))?
            .to_string_lossy()
            .to_string();
        Ok(Self { docker_path })
    }

    pub fn with_binary(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
        }
    }

    pub fn docker_path(&self) -> &str {
        &self.docker_path
    }

    async fn run(&self, args: &[String]) -> RunnerResult<std::process::Output> {
        debug!("[docker] {} {}", self.docker_path, args.join(" "));
        Command::new(&self.docker_path)
            .args(args)
            .output()
            .await
            .map_err(|error| {
                RunnerError::RuntimeUnavailable(format!(
                    "failed to run {}: {error}",
                    self.docker_path
                ))
            })
    }

    fn command_failed(&self, args: &[String], stderr: &str) -> RunnerError {
        if daemon_unreachable(stderr) {
            return RunnerError::RuntimeUnavailable(stderr.trim().to_string());
        }
        RunnerError::CommandFailed {
            command: format!("{} {}", self.docker_path, args.join(" ")),
            message: stderr.trim().to_string(),
        }
    }
}

pub fn create_args(descriptor: &ContainerDescriptor) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        descriptor.name.clone(),
        "--memory".to_string(),
        descriptor.memory_limit.clone(),
        "--cpu-shares".to_string(),
        descriptor.cpu_shares.to_string(),
        "--mount".to_string(),
        format!(
            "type=bind,source={},target={}",
            descriptor.host_dir.to_string_lossy(),
            descriptor.mount_path
        ),
        "--workdir".to_string(),
        descriptor.mount_path.clone(),
        "--label".to_string(),
        MANAGED_LABEL.to_string(),
        descriptor.image.clone(),
    ];
    args.extend(descriptor.command.iter().cloned());
    args
}

pub fn list_managed_args() -> Vec<String> {
    [
        "ps",
        "--all",
        "--filter",
        MANAGED_FILTER,
        "--format",
        "{{.Names}}",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

fn daemon_unreachable(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("error during connect")
}

fn no_such_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

fn name_in_use(stderr: &str) -> bool {
    stderr.contains("Conflict") || stderr.contains("already in use")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, name: &str) -> RunnerResult<ContainerState> {
        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            name.to_string(),
        ];
        let output = self.run(&args).await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(if stdout.trim() == "true" {
                ContainerState::Running
            } else {
                ContainerState::Stopped
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if no_such_container(&stderr) {
            return Ok(ContainerState::Absent);
        }
        Err(self.command_failed(&args, &stderr))
    }

    async fn create(&self, descriptor: &ContainerDescriptor) -> RunnerResult<CreateOutcome> {
        let args = create_args(descriptor);
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(CreateOutcome::Created);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if name_in_use(&stderr) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if daemon_unreachable(&stderr) {
            return Err(RunnerError::RuntimeUnavailable(stderr.trim().to_string()));
        }
        Err(RunnerError::CreateFailed {
            name: descriptor.name.clone(),
            message: stderr.trim().to_string(),
        })
    }

    async fn start(&self, name: &str) -> RunnerResult<()> {
        let args = vec!["start".to_string(), name.to_string()];
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if daemon_unreachable(&stderr) {
            return Err(RunnerError::RuntimeUnavailable(stderr.trim().to_string()));
        }
        Err(RunnerError::CreateFailed {
            name: name.to_string(),
            message: stderr.trim().to_string(),
        })
    }

    async fn remove(&self, name: &str) -> RunnerResult<bool> {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if no_such_container(&stderr) {
            return Ok(false);
        }
        Err(self.command_failed(&args, &stderr))
    }

    async fn list_managed(&self) -> RunnerResult<Vec<String>> {
        let args = list_managed_args();
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.command_failed(&args, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }
}

// =============================================================================
// In-memory runtime
// =============================================================================

/// Bookkeeping-only runtime. Backs host shell mode and tests.
#[derive(Default)]
pub struct MemoryRuntime {
    containers: parking_lot::Mutex<HashMap<String, ContainerState>>,
    unavailable: AtomicBool,
    latency: Option<Duration>,
    creates: AtomicUsize,
    removes: AtomicUsize,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `latency` first, widening race windows in tests.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.containers.lock().contains_key(name)
    }

    pub fn state(&self, name: &str) -> ContainerState {
        self.containers
            .lock()
            .get(name)
            .copied()
            .unwrap_or(ContainerState::Absent)
    }

    async fn enter(&self) -> RunnerResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RunnerError::RuntimeUnavailable(
                "memory runtime marked unavailable".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn inspect(&self, name: &str) -> RunnerResult<ContainerState> {
        self.enter().await?;
        Ok(self.state(name))
    }

    async fn create(&self, descriptor: &ContainerDescriptor) -> RunnerResult<CreateOutcome> {
        self.enter().await?;
        let mut containers = self.containers.lock();
        if containers.contains_key(&descriptor.name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        containers.insert(descriptor.name.clone(), ContainerState::Stopped);
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(CreateOutcome::Created)
    }

    async fn start(&self, name: &str) -> RunnerResult<()> {
        self.enter().await?;
        match self.containers.lock().get_mut(name) {
            Some(state) => {
                *state = ContainerState::Running;
                Ok(())
            }
            None => Err(RunnerError::CreateFailed {
                name: name.to_string(),
                message: "no such container".into(),
            }),
        }
    }

    async fn remove(&self, name: &str) -> RunnerResult<bool> {
        self.enter().await?;
        let removed = self.containers.lock().remove(name).is_some();
        if removed {
            self.removes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn list_managed(&self) -> RunnerResult<Vec<String>> {
        self.enter().await?;
        let mut names: Vec<String> = self.containers.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// =============================================================================
// Lifecycle controller
// =============================================================================

pub struct LifecycleController {
    runtime: Arc<dyn ContainerRuntime>,
    locks: KeyedLocks<String>,
}

impl LifecycleController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            locks: KeyedLocks::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Brings the descriptor's container to the running state, creating it if
    /// needed. Safe to call repeatedly and concurrently.
    pub async fn ensure_running(&self, descriptor: &ContainerDescriptor) -> RunnerResult<()> {
        let _guard = self.locks.lock(&descriptor.name).await;
        self.ensure_running_locked(descriptor).await
    }

    /// Like [`LifecycleController::ensure_running`], then runs `then` before
    /// releasing the container's lock. `then` is skipped if the container
    /// could not be started.
    pub async fn ensure_running_then<F, T>(
        &self,
        descriptor: &ContainerDescriptor,
        then: F,
    ) -> RunnerResult<T>
    where
        F: Future<Output = RunnerResult<T>>,
    {
        let _guard = self.locks.lock(&descriptor.name).await;
        self.ensure_running_locked(descriptor).await?;
        then.await
    }

    /// Stops and removes the named container. Absent containers are not an
    /// error.
    pub async fn stop(&self, name: &str) -> RunnerResult<()> {
        let _guard = self.locks.lock(&name.to_string()).await;
        self.stop_locked(name).await
    }

    /// Like [`LifecycleController::stop`], then runs `then` before releasing
    /// the container's lock. `then` runs even when the stop failed.
    pub async fn stop_then<F, T>(&self, name: &str, then: F) -> (RunnerResult<()>, T)
    where
        F: Future<Output = T>,
    {
        let _guard = self.locks.lock(&name.to_string()).await;
        let stopped = self.stop_locked(name).await;
        (stopped, then.await)
    }

    /// Containers labelled as ours in the runtime.
    pub async fn managed_containers(&self) -> RunnerResult<Vec<String>> {
        self.runtime.list_managed().await
    }

    async fn ensure_running_locked(&self, descriptor: &ContainerDescriptor) -> RunnerResult<()> {
        match self.runtime.inspect(&descriptor.name).await? {
            ContainerState::Running => {
                debug!("[lifecycle] {} already running", descriptor.name);
                return Ok(());
            }
            ContainerState::Stopped => {}
            ContainerState::Absent => match self.runtime.create(descriptor).await? {
                CreateOutcome::Created => {
                    info!(
                        "[lifecycle] created {} from {}",
                        descriptor.name, descriptor.image
                    );
                }
                CreateOutcome::AlreadyExists => {
                    debug!("[lifecycle] {} created concurrently", descriptor.name);
                }
            },
        }

        self.runtime.start(&descriptor.name).await?;
        info!("[lifecycle] started {}", descriptor.name);
        Ok(())
    }

    async fn stop_locked(&self, name: &str) -> RunnerResult<()> {
        if self.runtime.remove(name).await? {
            info!("[lifecycle] removed {name}");
        } else {
            warn!("[lifecycle] {name} was already gone");
        }
        Ok(())
    }

    /// Number of container names with a lock currently held or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }
}
