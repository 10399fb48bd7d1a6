//! Project files on the host: path confinement, edits, and tree scans.
//!
//! Every client-supplied path goes through [`SandboxFs::resolve`], which
//! accepts only plain relative paths and re-checks the result after resolving
//! symlinks, so nothing outside `{code_root}/{userId}/{projectId}` is ever
//! touched.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::project_dir_in;
use crate::errors::{RunnerError, RunnerResult};
use crate::models::{FileKind, FileNode, ProjectKey, Template};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditOutcome {
    Created,
    Overwritten,
}

pub struct SandboxFs {
    code_root: PathBuf,
    templates_root: PathBuf,
}

impl SandboxFs {
    pub fn new(code_root: impl Into<PathBuf>, templates_root: impl Into<PathBuf>) -> Self {
        Self {
            code_root: code_root.into(),
            templates_root: templates_root.into(),
        }
    }

    pub fn project_dir(&self, key: &ProjectKey) -> PathBuf {
        project_dir_in(&self.code_root, key)
    }

    async fn project_root(&self, key: &ProjectKey) -> RunnerResult<PathBuf> {
        match fs::canonicalize(self.project_dir(key)).await {
            Ok(root) => Ok(root),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(RunnerError::project_not_found(key))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Maps a client path onto the host, refusing anything that would land
    /// outside the project directory.
    pub async fn resolve(&self, key: &ProjectKey, relative: &str) -> RunnerResult<PathBuf> {
        let clean = lexical_relative(relative)?;
        let root = self.project_root(key).await?;
        let candidate = root.join(&clean);

        // Deepest ancestor (or the path itself) that exists on disk.
        let mut existing = candidate.clone();
        loop {
            match fs::symlink_metadata(&existing).await {
                Ok(_) => break,
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    if !existing.pop() {
                        return Err(RunnerError::InvalidPath(relative.to_string()));
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }

        let real = fs::canonicalize(&existing)
            .await
            .map_err(|_| RunnerError::InvalidPath(relative.to_string()))?;
        if !real.starts_with(&root) {
            warn!("[files] {key}: '{relative}' escapes project root");
            return Err(RunnerError::InvalidPath(relative.to_string()));
        }
        Ok(candidate)
    }

    /// Writes `content` to the file, creating it and any missing parent
    /// directories.
    pub async fn apply_edit(
        &self,
        key: &ProjectKey,
        relative: &str,
        content: &str,
    ) -> RunnerResult<EditOutcome> {
        let path = self.resolve(key, relative).await?;
        let existed = fs::try_exists(&path).await.unwrap_or(false);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| RunnerError::WriteFailed {
                    path: relative.to_string(),
                    source,
                })?;
        }
        fs::write(&path, content)
            .await
            .map_err(|source| RunnerError::WriteFailed {
                path: relative.to_string(),
                source,
            })?;

        debug!("[files] {key}: wrote {} bytes to {relative}", content.len());
        Ok(if existed {
            EditOutcome::Overwritten
        } else {
            EditOutcome::Created
        })
    }

    pub async fn read_file(&self, key: &ProjectKey, relative: &str) -> RunnerResult<String> {
        let path = self.resolve(key, relative).await?;
        let bytes = fs::read(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Creates an empty file or a folder. An existing file is left untouched.
    pub async fn create_entry(
        &self,
        key: &ProjectKey,
        relative: &str,
        kind: FileKind,
    ) -> RunnerResult<()> {
        let path = self.resolve(key, relative).await?;
        let write_failed = |source| RunnerError::WriteFailed {
            path: relative.to_string(),
            source,
        };

        match kind {
            FileKind::Folder => fs::create_dir_all(&path).await.map_err(write_failed)?,
            FileKind::File => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await.map_err(write_failed)?;
                }
                match fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .await
                {
                    Ok(_) => {}
                    Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                        debug!("[files] {key}: {relative} already exists");
                    }
                    Err(error) => return Err(write_failed(error)),
                }
            }
        }
        Ok(())
    }

    pub async fn rename_entry(&self, key: &ProjectKey, from: &str, to: &str) -> RunnerResult<()> {
        let source = self.resolve(key, from).await?;
        let target = self.resolve(key, to).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &target).await?;
        Ok(())
    }

    /// Removes a file or a folder with its contents. Missing entries are fine.
    pub async fn remove_entry(&self, key: &ProjectKey, relative: &str) -> RunnerResult<()> {
        let path = self.resolve(key, relative).await?;
        let result = match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Current tree of the project directory: folders first, then by name.
    pub async fn scan_tree(&self, key: &ProjectKey) -> RunnerResult<Vec<FileNode>> {
        let root = self.project_root(key).await?;
        tokio::task::spawn_blocking(move || scan_dir(&root, ""))
            .await
            .map_err(|e| RunnerError::Internal(format!("tree scan task failed: {e}")))?
    }

    /// Lays down a new project's files from its template directory and
    /// returns the resulting tree. Falls back to the template's default
    /// (empty) files when no template directory is present.
    pub async fn bootstrap(&self, key: &ProjectKey, template: Template) -> RunnerResult<Vec<FileNode>> {
        let target = self.project_dir(key);
        fs::create_dir_all(&target).await?;

        let source = self.templates_root.join(template.as_str());
        if fs::try_exists(&source).await.unwrap_or(false) {
            let copy_target = target.clone();
            let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &copy_target))
                .await
                .map_err(|e| RunnerError::Internal(format!("template copy task failed: {e}")))??;
            info!("[files] {key}: copied {copied} files from {} template", template.as_str());
        } else {
            warn!(
                "[files] {key}: no template directory for {}, using default files",
                template.as_str()
            );
            for name in template.default_files() {
                fs::write(target.join(name), "").await?;
            }
        }

        self.scan_tree(key).await
    }
}

/// Accepts only non-empty relative paths made of plain segments.
fn lexical_relative(relative: &str) -> RunnerResult<PathBuf> {
    let invalid = || RunnerError::InvalidPath(relative.to_string());
    if relative.trim().is_empty() || relative.contains('\0') {
        return Err(invalid());
    }

    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid())
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(clean)
}

fn scan_dir(dir: &Path, prefix: &str) -> RunnerResult<Vec<FileNode>> {
    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let fullpath = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };

        if entry.file_type()?.is_dir() {
            let children = scan_dir(&entry.path(), &fullpath)?;
            nodes.push(FileNode::folder(&name, &fullpath, children));
        } else {
            nodes.push(FileNode::file(&name, &fullpath));
        }
    }

    nodes.sort_by(|a, b| {
        let rank = |node: &FileNode| match node.kind {
            FileKind::Folder => 0,
            FileKind::File => 1,
        };
        rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
    });
    Ok(nodes)
}

fn copy_tree(source: &Path, target: &Path) -> RunnerResult<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| RunnerError::Internal(format!("template walk failed: {e}")))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| RunnerError::Internal(e.to_string()))?;
        let destination = target.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &destination)?;
            copied += 1;
        }
    }
    Ok(copied)
}
