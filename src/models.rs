use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::errors::{RunnerError, RunnerResult};

const MAX_IDENTIFIER_LEN: usize = 64;

/// Compound identity of a project: `(userId, projectId)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProjectKey {
    pub user_id: String,
    pub project_id: String,
}

impl ProjectKey {
    /// Both parts end up as path segments and inside container names, so only
    /// `[A-Za-z0-9_-]` is accepted.
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> RunnerResult<Self> {
        let user_id = user_id.into();
        let project_id = project_id.into();
        validate_identifier("userId", &user_id)?;
        validate_identifier("projectId", &project_id)?;
        Ok(Self {
            user_id,
            project_id,
        })
    }

    /// Deterministic container name for this project.
    pub fn container_name(&self) -> String {
        format!("runner-{}-{}", self.user_id, self.project_id)
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.project_id)
    }
}

pub fn validate_identifier(field: &str, value: &str) -> RunnerResult<()> {
    if value.is_empty() {
        return Err(RunnerError::InvalidRequest(format!("{field} is required")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(RunnerError::InvalidRequest(format!(
            "{field} must be at most {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RunnerError::InvalidRequest(format!(
            "{field} may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    Python,
    Node,
}

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Template::Python => "python",
            Template::Node => "node",
        }
    }

    /// File layout a fresh project of this template starts with.
    pub fn default_files(&self) -> &'static [&'static str] {
        match self {
            Template::Python => &["app.py"],
            Template::Node => &["index.js", "main.js"],
        }
    }

    pub fn default_tree(&self) -> Vec<FileNode> {
        self.default_files()
            .iter()
            .map(|name| FileNode::file(name, name))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// Path relative to the project root, `/`-separated.
    pub fullpath: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(no_recursion)]
    pub children: Option<Vec<FileNode>>,
}

impl FileNode {
    pub fn file(name: &str, fullpath: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FileKind::File,
            fullpath: fullpath.to_string(),
            children: None,
        }
    }

    pub fn folder(name: &str, fullpath: &str, children: Vec<FileNode>) -> Self {
        Self {
            name: name.to_string(),
            kind: FileKind::Folder,
            fullpath: fullpath.to_string(),
            children: Some(children),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub user_id: String,
    pub project_id: String,
    pub name: String,
    pub template: Template,
    pub created_at: DateTime<Utc>,
    /// `None` means no live sandbox for this project.
    pub container_name: Option<String>,
    #[serde(default)]
    pub file_tree: Vec<FileNode>,
}

impl ProjectRecord {
    pub fn new(key: &ProjectKey, name: String, template: Template, file_tree: Vec<FileNode>) -> Self {
        Self {
            user_id: key.user_id.clone(),
            project_id: key.project_id.clone(),
            name,
            template,
            created_at: Utc::now(),
            container_name: None,
            file_tree,
        }
    }

    pub fn key(&self) -> ProjectKey {
        ProjectKey {
            user_id: self.user_id.clone(),
            project_id: self.project_id.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub template: Template,
    pub created_at: DateTime<Utc>,
}

impl From<&ProjectRecord> for ProjectSummary {
    fn from(record: &ProjectRecord) -> Self {
        Self {
            id: record.project_id.clone(),
            name: record.name.clone(),
            template: record.template,
            created_at: record.created_at,
        }
    }
}

// =============================================================================
// Session protocol
// =============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "terminal:input")]
    TerminalInput { input: String },

    #[serde(rename = "terminal:resize")]
    TerminalResize { cols: u16, rows: u16 },

    #[serde(rename = "file:update", rename_all = "camelCase")]
    FileUpdate {
        user_id: String,
        project_id: String,
        file_path: String,
        content: String,
    },
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "terminal:output")]
    TerminalOutput { data: String },

    #[serde(rename = "error")]
    Error { message: String },
}

/// Query parameters carried by the session handshake.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
}

impl ConnectParams {
    pub fn project_key(&self) -> RunnerResult<ProjectKey> {
        ProjectKey::new(
            self.user_id.clone().unwrap_or_default(),
            self.project_id.clone().unwrap_or_default(),
        )
    }
}

// =============================================================================
// HTTP API
// =============================================================================

#[derive(Clone, Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct CreateProjectParams {
    pub user_id: String,
    pub template: Template,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct UserParams {
    pub user_id: String,
}

#[derive(Clone, Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ProjectParams {
    pub user_id: String,
    pub project_id: String,
}

impl ProjectParams {
    pub fn key(&self) -> RunnerResult<ProjectKey> {
        ProjectKey::new(self.user_id.clone(), self.project_id.clone())
    }
}

#[derive(Clone, Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct FileParams {
    pub user_id: String,
    pub project_id: String,
    pub filepath: String,
}

#[derive(Clone, Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct CreateEntryParams {
    pub user_id: String,
    pub project_id: String,
    pub filepath: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

#[derive(Clone, Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct RenameEntryParams {
    pub user_id: String,
    pub project_id: String,
    pub filepath: String,
    pub new_filepath: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectResponse {
    pub project_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct ProjectsResponse {
    pub projects: Vec<ProjectSummary>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct ProjectResponse {
    pub project: ProjectRecord,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileContentResponse {
    pub file_content: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileTreeResponse {
    pub file_tree: Vec<FileNode>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}
