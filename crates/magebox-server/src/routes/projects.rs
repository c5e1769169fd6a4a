//! Project administration: `/api/admin/projects/*`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use magebox_storage::models::{Environment, Project};

use crate::auth::Caller;
use crate::client_ip::ClientIp;
use crate::error::{ApiJson, AppError};
use crate::routes::validate_name;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_projects).post(create_project))
        .route("/{name}", get(get_project).delete(delete_project))
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub environments: Vec<Environment>,
    pub members: Vec<String>,
}

async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Project>>, AppError> {
    Ok(Json(state.store.list_projects().await?))
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    ApiJson(body): ApiJson<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), AppError> {
    validate_name("project", &body.name)?;
    let project = state
        .store
        .create_project(&body.name, &body.description, &caller.name)
        .await?;
    state
        .audit(&caller.name, "project.created", &project.name, ip)
        .await;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ProjectDetail>, AppError> {
    let project = state.store.get_project(&name).await?;
    let environments = state.store.list_environments(Some(&name)).await?;
    let members = state.store.project_members(&name).await?;
    Ok(Json(ProjectDetail {
        project,
        environments,
        members,
    }))
}

/// Delete a project with its environments and grants. Keys already on its
/// hosts stay there; the hosts are no longer managed.
async fn delete_project(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    caller: Caller,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.store.delete_project(&name).await?;
    state.audit(&caller.name, "project.deleted", &name, ip).await;
    Ok(StatusCode::NO_CONTENT)
}
