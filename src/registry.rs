//! Project registry: the durable `(userId, projectId) -> ProjectRecord` map.
//!
//! Each project is one JSON document under `{root}/{userId}/{projectId}.json`.
//! Every mutation is a read-modify-write performed while holding that
//! project's lock, and documents are replaced atomically (temp file + rename),
//! so readers never observe a torn write and concurrent writers never lose
//! each other's updates.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{RunnerError, RunnerResult};
use crate::locks::KeyedLocks;
use crate::models::{FileNode, ProjectKey, ProjectRecord};

pub struct ProjectRegistry {
    root: PathBuf,
    locks: KeyedLocks<ProjectKey>,
}

impl ProjectRegistry {
    pub async fn open(root: impl Into<PathBuf>) -> RunnerResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        info!("[registry] using {}", root.display());
        Ok(Self {
            root,
            locks: KeyedLocks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &ProjectKey) -> PathBuf {
        self.root
            .join(&key.user_id)
            .join(format!("{}.json", key.project_id))
    }

    async fn read_record(&self, key: &ProjectKey) -> RunnerResult<ProjectRecord> {
        match fs::read(self.record_path(key)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(RunnerError::project_not_found(key))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn write_record(&self, key: &ProjectKey, record: &ProjectRecord) -> RunnerResult<()> {
        let path = self.record_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, bytes).await?;
        if let Err(error) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(error.into());
        }
        Ok(())
    }

    pub async fn get(&self, key: &ProjectKey) -> RunnerResult<ProjectRecord> {
        self.read_record(key).await
    }

    /// Inserts a new record. Fails if the project already exists.
    pub async fn create(&self, record: ProjectRecord) -> RunnerResult<ProjectRecord> {
        let key = ProjectKey::new(record.user_id.clone(), record.project_id.clone())?;
        let _guard = self.locks.lock(&key).await;

        if fs::try_exists(self.record_path(&key)).await? {
            return Err(RunnerError::InvalidRequest(format!(
                "project {key} already exists"
            )));
        }
        self.write_record(&key, &record).await?;
        info!("[registry] created project {key} ({})", record.template.as_str());
        Ok(record)
    }

    /// Applies `mutate` to the stored record under the project's lock and
    /// persists the result.
    pub async fn update<F, T>(&self, key: &ProjectKey, mutate: F) -> RunnerResult<T>
    where
        F: FnOnce(&mut ProjectRecord) -> T,
    {
        let _guard = self.locks.lock(key).await;

        let mut record = self.read_record(key).await?;
        let output = mutate(&mut record);
        self.write_record(key, &record).await?;
        Ok(output)
    }

    pub async fn set_container_name(
        &self,
        key: &ProjectKey,
        name: Option<String>,
    ) -> RunnerResult<()> {
        debug!("[registry] {key} containerName -> {:?}", name);
        self.update(key, move |record| record.container_name = name)
            .await
    }

    pub async fn set_file_tree(&self, key: &ProjectKey, tree: Vec<FileNode>) -> RunnerResult<()> {
        self.update(key, move |record| record.file_tree = tree).await
    }

    /// All projects of one user, oldest first.
    pub async fn list(&self, user_id: &str) -> RunnerResult<Vec<ProjectRecord>> {
        crate::models::validate_identifier("userId", user_id)?;
        let dir = self.root.join(user_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<ProjectRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(error) => warn!("[registry] skipping unreadable {}: {error}", path.display()),
            }
        }
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    /// Every stored project across all users.
    pub async fn list_all(&self) -> RunnerResult<Vec<ProjectRecord>> {
        let mut users = fs::read_dir(&self.root).await?;
        let mut records = Vec::new();
        while let Some(entry) = users.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let user_id = entry.file_name().to_string_lossy().to_string();
            match self.list(&user_id).await {
                Ok(mut projects) => records.append(&mut projects),
                Err(error) => warn!("[registry] skipping user dir {user_id}: {error}"),
            }
        }
        Ok(records)
    }

    /// Number of projects with a lock currently held or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }
}
