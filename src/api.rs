use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi as UtoipaOpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::errors::{ErrorBody, RunnerError, RunnerResult};
use crate::models::{
    ConnectParams, CreateEntryParams, CreateProjectParams, CreateProjectResponse,
    FileContentResponse, FileKind, FileNode, FileParams, FileTreeResponse, HealthResponse,
    ProjectKey, ProjectParams, ProjectRecord, ProjectResponse, ProjectSummary, ProjectsResponse,
    RenameEntryParams, SuccessResponse, Template, UserParams,
};
use crate::service::AppState;
use crate::session::{self, SandboxSession};

const MAX_PROJECT_NAME_LEN: usize = 128;

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(
        health,
        create_project,
        list_projects,
        get_project,
        get_file_content,
        get_file_tree,
        create_file_entry,
        rename_file_entry,
        delete_file_entry,
    ),
    components(schemas(
        CreateProjectResponse,
        ProjectsResponse,
        ProjectSummary,
        ProjectResponse,
        ProjectRecord,
        Template,
        FileKind,
        FileNode,
        FileContentResponse,
        FileTreeResponse,
        SuccessResponse,
        HealthResponse,
        ErrorBody
    )),
    tags((name = "projects", description = "Projects and their files"))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let swagger_routes: Router<AppState> =
        SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()).into();

    Router::new()
        .route("/healthz", get(health))
        .route("/ws", any(connect_session))
        .route("/api/create-project", post(create_project))
        .route("/api/projects", get(list_projects))
        .route("/api/project", get(get_project))
        .route("/api/file-content", get(get_file_content))
        .route(
            "/api/file-tree",
            get(get_file_tree)
                .post(create_file_entry)
                .put(rename_file_entry)
                .delete(delete_file_entry),
        )
        .merge(swagger_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn connect_session(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match params.project_key() {
        Ok(key) => {
            info!("session requested for {key}");
            ws.on_upgrade(move |socket| SandboxSession::new(key, state).run(socket))
        }
        Err(error) => {
            warn!("refusing session: {error}");
            ws.on_upgrade(move |socket| session::refuse(socket, error))
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/create-project",
    tag = "projects",
    params(CreateProjectParams),
    responses(
        (status = 201, description = "Project created", body = CreateProjectResponse),
        (status = 400, description = "Bad request", body = ErrorBody)
    )
)]
async fn create_project(
    State(state): State<AppState>,
    Query(params): Query<CreateProjectParams>,
) -> RunnerResult<(StatusCode, Json<CreateProjectResponse>)> {
    let name = params.name.trim();
    if name.is_empty() || name.len() > MAX_PROJECT_NAME_LEN {
        return Err(RunnerError::InvalidRequest(format!(
            "name must be 1 to {MAX_PROJECT_NAME_LEN} characters"
        )));
    }

    let key = ProjectKey::new(params.user_id, Uuid::new_v4().simple().to_string())?;
    let tree = state.files.bootstrap(&key, params.template).await?;
    let record = ProjectRecord::new(&key, name.to_string(), params.template, tree);

    if let Err(error) = state.registry.create(record).await {
        let _ = tokio::fs::remove_dir_all(state.files.project_dir(&key)).await;
        return Err(error);
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateProjectResponse {
            project_id: key.project_id,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/projects",
    tag = "projects",
    params(UserParams),
    responses((status = 200, description = "Projects owned by the user", body = ProjectsResponse))
)]
async fn list_projects(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> RunnerResult<Json<ProjectsResponse>> {
    let records = state.registry.list(&params.user_id).await?;
    Ok(Json(ProjectsResponse {
        projects: records.iter().map(ProjectSummary::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/project",
    tag = "projects",
    params(ProjectParams),
    responses(
        (status = 200, description = "Project record", body = ProjectResponse),
        (status = 404, description = "Project not found", body = ErrorBody)
    )
)]
async fn get_project(
    State(state): State<AppState>,
    Query(params): Query<ProjectParams>,
) -> RunnerResult<Json<ProjectResponse>> {
    let project = state.registry.get(&params.key()?).await?;
    Ok(Json(ProjectResponse { project }))
}

#[utoipa::path(
    get,
    path = "/api/file-content",
    tag = "projects",
    params(FileParams),
    responses(
        (status = 200, description = "File content", body = FileContentResponse),
        (status = 400, description = "Path outside the project", body = ErrorBody),
        (status = 404, description = "Project or file not found", body = ErrorBody)
    )
)]
async fn get_file_content(
    State(state): State<AppState>,
    Query(params): Query<FileParams>,
) -> RunnerResult<Json<FileContentResponse>> {
    let key = ProjectKey::new(params.user_id, params.project_id)?;
    let file_content = state.files.read_file(&key, &params.filepath).await?;
    Ok(Json(FileContentResponse { file_content }))
}

#[utoipa::path(
    get,
    path = "/api/file-tree",
    tag = "projects",
    params(ProjectParams),
    responses(
        (status = 200, description = "Current file tree", body = FileTreeResponse),
        (status = 404, description = "Project not found", body = ErrorBody)
    )
)]
async fn get_file_tree(
    State(state): State<AppState>,
    Query(params): Query<ProjectParams>,
) -> RunnerResult<Json<FileTreeResponse>> {
    let key = params.key()?;
    let record = state.registry.get(&key).await?;
    // Shell commands change the disk without telling the registry, so the
    // stored tree is only a cache of this scan.
    let file_tree = state.files.scan_tree(&key).await?;
    if file_tree != record.file_tree {
        state.registry.set_file_tree(&key, file_tree.clone()).await?;
    }
    Ok(Json(FileTreeResponse { file_tree }))
}

#[utoipa::path(
    post,
    path = "/api/file-tree",
    tag = "projects",
    params(CreateEntryParams),
    responses(
        (status = 200, description = "Entry created", body = SuccessResponse),
        (status = 400, description = "Path outside the project", body = ErrorBody)
    )
)]
async fn create_file_entry(
    State(state): State<AppState>,
    Query(params): Query<CreateEntryParams>,
) -> RunnerResult<Json<SuccessResponse>> {
    let key = ProjectKey::new(params.user_id, params.project_id)?;
    state.registry.get(&key).await?;
    state
        .files
        .create_entry(&key, &params.filepath, params.kind)
        .await?;
    refresh_tree(&state, &key).await
}

#[utoipa::path(
    put,
    path = "/api/file-tree",
    tag = "projects",
    params(RenameEntryParams),
    responses(
        (status = 200, description = "Entry renamed", body = SuccessResponse),
        (status = 404, description = "Entry not found", body = ErrorBody)
    )
)]
async fn rename_file_entry(
    State(state): State<AppState>,
    Query(params): Query<RenameEntryParams>,
) -> RunnerResult<Json<SuccessResponse>> {
    let key = ProjectKey::new(params.user_id, params.project_id)?;
    state.registry.get(&key).await?;
    state
        .files
        .rename_entry(&key, &params.filepath, &params.new_filepath)
        .await?;
    refresh_tree(&state, &key).await
}

#[utoipa::path(
    delete,
    path = "/api/file-tree",
    tag = "projects",
    params(FileParams),
    responses((status = 200, description = "Entry removed", body = SuccessResponse))
)]
async fn delete_file_entry(
    State(state): State<AppState>,
    Query(params): Query<FileParams>,
) -> RunnerResult<Json<SuccessResponse>> {
    let key = ProjectKey::new(params.user_id, params.project_id)?;
    state.registry.get(&key).await?;
    state.files.remove_entry(&key, &params.filepath).await?;
    refresh_tree(&state, &key).await
}

async fn refresh_tree(state: &AppState, key: &ProjectKey) -> RunnerResult<Json<SuccessResponse>> {
    let tree = state.files.scan_tree(key).await?;
    state.registry.set_file_tree(key, tree).await?;
    Ok(Json(SuccessResponse { success: true }))
}
