pub mod api;
pub mod config;
pub mod container;
pub mod errors;
pub mod files;
pub mod locks;
pub mod models;
pub mod registry;
pub mod service;
pub mod session;
pub mod terminal;

pub use api::build_router;
pub use config::{RunnerConfig, ShellMode};
pub use container::{DockerCli, LifecycleController, MemoryRuntime};
pub use registry::ProjectRegistry;
pub use service::AppState;
pub use session::SandboxSession;

pub const DEFAULT_HTTP_PORT: u16 = 4000;

/// Fixed path the project directory is mounted at inside every sandbox.
pub const SANDBOX_MOUNT_PATH: &str = "/workspace";

pub const DEFAULT_PYTHON_IMAGE: &str = "python:3.12-slim";
pub const DEFAULT_NODE_IMAGE: &str = "node:20-slim";
pub const DEFAULT_SHELL: &str = "/bin/sh";
