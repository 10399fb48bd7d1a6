use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{RunnerConfig, ShellMode};
use crate::container::{ContainerRuntime, DockerCli, LifecycleController, MemoryRuntime};
use crate::errors::RunnerResult;
use crate::files::SandboxFs;
use crate::registry::ProjectRegistry;
use crate::terminal::{PtyBridge, ShellLauncher, TerminalBridge};

/// Shared services handed to every request handler and session.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProjectRegistry>,
    pub lifecycle: Arc<LifecycleController>,
    pub bridge: Arc<dyn TerminalBridge>,
    pub files: Arc<SandboxFs>,
    pub config: Arc<RunnerConfig>,
}

impl AppState {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        lifecycle: Arc<LifecycleController>,
        bridge: Arc<dyn TerminalBridge>,
        files: Arc<SandboxFs>,
        config: Arc<RunnerConfig>,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            bridge,
            files,
            config,
        }
    }

    /// Wires the production services for `config.shell_mode`.
    ///
    /// In Docker mode a missing `docker` binary does not abort startup: the
    /// server still serves the project and file APIs, and sessions fail with
    /// `RuntimeUnavailable` until the binary appears on `PATH`.
    pub async fn from_config(config: RunnerConfig) -> RunnerResult<Self> {
        let (runtime, launcher): (Arc<dyn ContainerRuntime>, ShellLauncher) =
            match config.shell_mode {
                ShellMode::Docker => {
                    let docker = match DockerCli::new() {
                        Ok(docker) => docker,
                        Err(error) => {
                            tracing::error!(
                                ?error,
                                "docker not available; sessions will fail until it is installed"
                            );
                            DockerCli::with_binary("docker")
                        }
                    };
                    let launcher = ShellLauncher::DockerExec {
                        docker_path: docker.docker_path().to_string(),
                        shell: config.shell.clone(),
                    };
                    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
                    (runtime, launcher)
                }
                ShellMode::Host => {
                    tracing::warn!("host shell mode: shells run unsandboxed on this machine");
                    let runtime: Arc<dyn ContainerRuntime> = Arc::new(MemoryRuntime::new());
                    let launcher = ShellLauncher::Host {
                        shell: config.shell.clone(),
                    };
                    (runtime, launcher)
                }
            };

        let state = Self::with_runtime(config, runtime, launcher).await?;
        state.reconcile().await;
        Ok(state)
    }

    /// Opens the on-disk state under `config.data_dir` and wires it to the
    /// given runtime and shell launcher.
    pub async fn with_runtime(
        config: RunnerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        launcher: ShellLauncher,
    ) -> RunnerResult<Self> {
        let registry = Arc::new(ProjectRegistry::open(config.registry_dir()).await?);
        tokio::fs::create_dir_all(config.code_dir()).await?;
        let files = Arc::new(SandboxFs::new(config.code_dir(), config.templates_dir.clone()));

        Ok(Self::new(
            registry,
            Arc::new(LifecycleController::new(runtime)),
            Arc::new(PtyBridge::new(launcher)),
            files,
            Arc::new(config),
        ))
    }

    /// Removes sandboxes no live session owns: every container the registry
    /// still names and every container carrying our label. Run before
    /// serving and after shutdown, when no sessions exist. Returns how many
    /// containers were cleaned up.
    pub async fn reconcile(&self) -> usize {
        let records = match self.registry.list_all().await {
            Ok(records) => records,
            Err(error) => {
                warn!("[reconcile] failed to read registry: {error}");
                Vec::new()
            }
        };

        let mut names = BTreeSet::new();
        let mut owners = Vec::new();
        for record in records {
            if let Some(name) = record.container_name.clone() {
                names.insert(name.clone());
                owners.push((record.key(), name));
            }
        }
        match self.lifecycle.managed_containers().await {
            Ok(managed) => names.extend(managed),
            Err(error) => warn!("[reconcile] failed to list managed containers: {error}"),
        }

        let mut removed = 0;
        for name in &names {
            let registry = &self.registry;
            let owned: Vec<_> = owners.iter().filter(|(_, owned)| owned == name).collect();
            let clear = async {
                for (key, _) in &owned {
                    if let Err(error) = registry.set_container_name(key, None).await {
                        warn!("[reconcile] failed to clear container name of {key}: {error}");
                    }
                }
            };
            match self.lifecycle.stop_then(name, clear).await {
                (Ok(()), ()) => removed += 1,
                (Err(error), ()) => warn!("[reconcile] failed to remove {name}: {error}"),
            }
        }
        if !names.is_empty() {
            info!("[reconcile] cleaned up {removed} of {} orphaned sandboxes", names.len());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use tempfile::tempdir;

    use crate::container::ContainerDescriptor;
    use crate::models::{ProjectKey, ProjectRecord, Template};
    use crate::session::SandboxSession;
    use crate::terminal::TerminalSize;

    async fn host_state(root: &Path, runtime: Arc<MemoryRuntime>) -> AppState {
        let config = RunnerConfig::new(root.join("data"), root.join("templates"))
            .with_shell_mode(ShellMode::Host);
        AppState::with_runtime(
            config,
            runtime,
            ShellLauncher::Host {
                shell: "/bin/sh".to_string(),
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn restart_reclaims_sandboxes_left_by_a_shutdown() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        let key = ProjectKey::new("u1", "p1").unwrap();

        // A server with one live session is shut down without closing it.
        let server = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        server.block_on(async {
            let state = host_state(dir.path(), runtime.clone()).await;
            let tree = state.files.bootstrap(&key, Template::Python).await.unwrap();
            state
                .registry
                .create(ProjectRecord::new(&key, "demo".into(), Template::Python, tree))
                .await
                .unwrap();
            let mut session = SandboxSession::new(key.clone(), state);
            session.establish(TerminalSize::default()).await.unwrap();
            tokio::spawn(async move {
                let _session = session;
                std::future::pending::<()>().await;
            });
        });
        server.shutdown_timeout(Duration::from_secs(2));

        let restarted = tokio::runtime::Runtime::new().unwrap();
        restarted.block_on(async {
            let state = host_state(dir.path(), runtime.clone()).await;
            assert_eq!(
                state.registry.get(&key).await.unwrap().container_name.as_deref(),
                Some("runner-u1-p1")
            );
            assert!(runtime.contains("runner-u1-p1"));

            assert_eq!(state.reconcile().await, 1);
            assert_eq!(state.registry.get(&key).await.unwrap().container_name, None);
            assert!(!runtime.contains("runner-u1-p1"));
            assert_eq!(state.reconcile().await, 0);
        });
    }

    #[tokio::test]
    async fn reconcile_removes_labelled_containers_without_a_record() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        let state = host_state(dir.path(), runtime.clone()).await;

        let key = ProjectKey::new("u9", "gone").unwrap();
        let record = ProjectRecord::new(&key, "gone".into(), Template::Node, Vec::new());
        let descriptor = ContainerDescriptor::for_project(
            &record,
            &state.config,
            &state.files.project_dir(&key),
        );
        state.lifecycle.ensure_running(&descriptor).await.unwrap();

        assert_eq!(state.reconcile().await, 1);
        assert!(!runtime.contains(&descriptor.name));
    }

    #[tokio::test]
    async fn reconcile_clears_registry_even_if_runtime_is_down() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        let state = host_state(dir.path(), runtime.clone()).await;
        let key = ProjectKey::new("u1", "p1").unwrap();
        state
            .registry
            .create(ProjectRecord::new(&key, "demo".into(), Template::Python, Vec::new()))
            .await
            .unwrap();
        state
            .registry
            .set_container_name(&key, Some(key.container_name()))
            .await
            .unwrap();

        runtime.set_available(false);
        assert_eq!(state.reconcile().await, 0);
        assert_eq!(state.registry.get(&key).await.unwrap().container_name, None);
    }
}
