//! Runtime configuration consumed by the library.
//!
//! The binary builds this from CLI flags and environment variables; tests build
//! it directly with [`RunnerConfig::new`].

use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::models::{ProjectKey, Template};
use crate::{DEFAULT_NODE_IMAGE, DEFAULT_PYTHON_IMAGE, DEFAULT_SHELL};

/// Where interactive shells run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ShellMode {
    /// One Docker container per project, shells attached with `docker exec`.
    Docker,
    /// Shells run directly on the host inside the project directory. Container
    /// bookkeeping is kept in memory. Meant for local development.
    Host,
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub data_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub shell_mode: ShellMode,
    pub shell: String,
    pub python_image: String,
    pub node_image: String,
    /// Passed to `docker create --memory`.
    pub memory_limit: String,
    pub cpu_shares: u32,
}

impl RunnerConfig {
    pub fn new(data_dir: impl Into<PathBuf>, templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            templates_dir: templates_dir.into(),
            shell_mode: ShellMode::Docker,
            shell: DEFAULT_SHELL.to_string(),
            python_image: DEFAULT_PYTHON_IMAGE.to_string(),
            node_image: DEFAULT_NODE_IMAGE.to_string(),
            memory_limit: "512m".to_string(),
            cpu_shares: 512,
        }
    }

    pub fn with_shell_mode(mut self, mode: ShellMode) -> Self {
        self.shell_mode = mode;
        self
    }

    /// Root of all project working trees: `{data_dir}/code/{userId}/{projectId}`.
    pub fn code_dir(&self) -> PathBuf {
        self.data_dir.join("code")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("registry")
    }

    pub fn project_dir(&self, key: &ProjectKey) -> PathBuf {
        project_dir_in(&self.code_dir(), key)
    }

    pub fn template_dir(&self, template: Template) -> PathBuf {
        self.templates_dir.join(template.as_str())
    }

    pub fn image_for(&self, template: Template) -> &str {
        match template {
            Template::Python => &self.python_image,
            Template::Node => &self.node_image,
        }
    }
}

pub(crate) fn project_dir_in(code_dir: &Path, key: &ProjectKey) -> PathBuf {
    code_dir.join(&key.user_id).join(&key.project_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_data_dir() {
        let config = RunnerConfig::new("/srv/runner", "/srv/templates");
        let key = ProjectKey::new("u1", "p1").unwrap();
        assert_eq!(config.project_dir(&key), PathBuf::from("/srv/runner/code/u1/p1"));
        assert_eq!(config.registry_dir(), PathBuf::from("/srv/runner/registry"));
        assert_eq!(
            config.template_dir(Template::Node),
            PathBuf::from("/srv/templates/node")
        );
        assert_eq!(config.image_for(Template::Python), DEFAULT_PYTHON_IMAGE);
    }
}
