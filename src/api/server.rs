//! API Server module
//!
//! This module provides the HTTP API for projects, model results, the
//! comparison view and the editable task tree.

use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::models::{
    ComparisonResult, IdGenerator, Project, ProjectError, StoreError, TaskStatus,
};
use crate::mutate::DeletePolicy;
use crate::project::Core;

/// Request to create a project
#[derive(Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub id: Option<String>,
    pub name: String,
    pub file_key: String,
}

/// Request to analyze a project's document
#[derive(Serialize, Deserialize, Default)]
pub struct AnalyzeRequest {
    pub document: Option<String>,
    pub models: Option<Vec<String>>,
}

/// Request to refine one model's results
#[derive(Serialize, Deserialize)]
pub struct RefineRequest {
    pub instructions: String,
}

/// Request to add a task after `after`, or at the end of the roots
#[derive(Serialize, Deserialize, Default)]
pub struct InsertTaskRequest {
    pub after: Option<String>,
    pub name: Option<String>,
}

/// Request to delete a task
#[derive(Serialize, Deserialize)]
pub struct DeleteTaskRequest {
    pub node_id: String,
    #[serde(default = "default_delete_policy")]
    pub policy: DeletePolicy,
}

fn default_delete_policy() -> DeletePolicy {
    DeletePolicy::Cascade
}

/// Request to move a task under a new parent
#[derive(Serialize, Deserialize)]
pub struct MoveTaskRequest {
    pub node_id: String,
    pub new_parent: Option<String>,
    pub new_index: usize,
}

/// Request to rename a task
#[derive(Serialize, Deserialize)]
pub struct RenameTaskRequest {
    pub node_id: String,
    pub name: String,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 3000).into(),
        }
    }
}

/// API responses
#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

fn status_for(error: &ProjectError) -> StatusCode {
    match error {
        ProjectError::ProjectNotFound(_) | ProjectError::ModelNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        ProjectError::ModelFailed { .. }
        | ProjectError::MissingDocument(_)
        | ProjectError::Forest(_)
        | ProjectError::Store(StoreError::InvalidId(_)) => StatusCode::BAD_REQUEST,
        ProjectError::RefineFailed { .. } => StatusCode::BAD_GATEWAY,
        ProjectError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Helper function to map Core results to Axum responses
fn map_core_result<T: Serialize>(result: Result<T, ProjectError>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!("Request failed: {}", e);
            }
            (status, Json(ApiResponse::<T>::error(e.to_string()))).into_response()
        }
    }
}

/// Builds the application router
pub fn router(core: Core) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::temporary("/ui") }))
        // --- Projects --- //
        .route(
            "/api/projects",
            get(list_projects_handler).post(create_project_handler),
        )
        .route("/api/projects/:id", get(get_project_handler))
        .route("/api/projects/:id/analyze", post(analyze_handler))
        .route("/api/projects/:id/comparison", get(comparison_handler))
        // --- Model results --- //
        .route(
            "/api/projects/:id/models/:model",
            delete(delete_model_handler),
        )
        .route(
            "/api/projects/:id/models/:model/rerun",
            post(rerun_model_handler),
        )
        .route(
            "/api/projects/:id/models/:model/refine",
            post(refine_model_handler),
        )
        .route(
            "/api/projects/:id/models/:model/promote",
            post(promote_handler),
        )
        // --- Active tree --- //
        .route("/api/projects/:id/tree", get(tree_handler))
        .route("/api/projects/:id/tree/insert", post(insert_task_handler))
        .route("/api/projects/:id/tree/delete", post(delete_task_handler))
        .route("/api/projects/:id/tree/move", post(move_task_handler))
        .route("/api/projects/:id/tree/rename", post(rename_task_handler))
        .route("/api/projects/:id/tree/undo", post(undo_handler))
        .route("/api/projects/:id/tree/redo", post(redo_handler))
        .route("/api/projects/:id/tree/save", post(save_tree_handler))
        // --- UI --- //
        .route("/ui", get(list_projects_ui_handler))
        .route("/ui/:id", get(ui_handler))
        .with_state(core)
}

/// Starts the API server
pub async fn serve(core: Core, config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(core)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    tracing::info!("Starting server on {}", config.address);
    let listener = TcpListener::bind(config.address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Project Handlers --- //

async fn list_projects_handler(State(core): State<Core>) -> impl IntoResponse {
    map_core_result(core.list_projects().await)
}

async fn create_project_handler(
    State(core): State<Core>,
    Json(payload): Json<CreateProjectRequest>,
) -> impl IntoResponse {
    let id = payload
        .id
        .unwrap_or_else(|| IdGenerator::new().next_id());
    map_core_result(
        core.create_project(&id, &payload.name, &payload.file_key)
            .await,
    )
}

async fn get_project_handler(
    State(core): State<Core>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    map_core_result(core.get_project(&id).await)
}

async fn analyze_handler(
    State(core): State<Core>,
    Path(id): Path<String>,
    payload: Option<Json<AnalyzeRequest>>,
) -> impl IntoResponse {
    let request = payload.map(|json| json.0).unwrap_or_default();
    let result = core
        .analyze(&id, request.document.as_deref(), request.models.as_deref())
        .await;
    map_core_result(result)
}

async fn comparison_handler(
    State(core): State<Core>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    map_core_result(core.comparison(&id).await)
}

// --- Model Result Handlers --- //

async fn delete_model_handler(
    State(core): State<Core>,
    Path((id, model)): Path<(String, String)>,
) -> impl IntoResponse {
    map_core_result(core.delete_model(&id, &model).await)
}

async fn rerun_model_handler(
    State(core): State<Core>,
    Path((id, model)): Path<(String, String)>,
) -> impl IntoResponse {
    map_core_result(core.rerun_model(&id, &model).await)
}

async fn refine_model_handler(
    State(core): State<Core>,
    Path((id, model)): Path<(String, String)>,
    Json(payload): Json<RefineRequest>,
) -> impl IntoResponse {
    map_core_result(
        core.refine_model(&id, &model, &payload.instructions)
            .await,
    )
}

async fn promote_handler(
    State(core): State<Core>,
    Path((id, model)): Path<(String, String)>,
) -> impl IntoResponse {
    map_core_result(core.promote(&id, &model).await)
}

// --- Tree Handlers --- //

async fn tree_handler(State(core): State<Core>, Path(id): Path<String>) -> impl IntoResponse {
    map_core_result(core.tree(&id).await)
}

async fn insert_task_handler(
    State(core): State<Core>,
    Path(id): Path<String>,
    payload: Option<Json<InsertTaskRequest>>,
) -> impl IntoResponse {
    let request = payload.map(|json| json.0).unwrap_or_default();
    let result = core
        .insert_task(&id, request.after.as_deref(), request.name)
        .await;
    map_core_result(result)
}

async fn delete_task_handler(
    State(core): State<Core>,
    Path(id): Path<String>,
    Json(payload): Json<DeleteTaskRequest>,
) -> impl IntoResponse {
    map_core_result(
        core.delete_task(&id, &payload.node_id, payload.policy)
            .await,
    )
}

async fn move_task_handler(
    State(core): State<Core>,
    Path(id): Path<String>,
    Json(payload): Json<MoveTaskRequest>,
) -> impl IntoResponse {
    let result = core
        .move_task(
            &id,
            &payload.node_id,
            payload.new_parent.as_deref(),
            payload.new_index,
        )
        .await;
    map_core_result(result)
}

async fn rename_task_handler(
    State(core): State<Core>,
    Path(id): Path<String>,
    Json(payload): Json<RenameTaskRequest>,
) -> impl IntoResponse {
    map_core_result(
        core.rename_task(&id, &payload.node_id, payload.name)
            .await,
    )
}

async fn undo_handler(State(core): State<Core>, Path(id): Path<String>) -> impl IntoResponse {
    map_core_result(core.undo(&id).await)
}

async fn redo_handler(State(core): State<Core>, Path(id): Path<String>) -> impl IntoResponse {
    map_core_result(core.redo(&id).await)
}

async fn save_tree_handler(State(core): State<Core>, Path(id): Path<String>) -> impl IntoResponse {
    map_core_result(core.save_tree(&id).await)
}

// --- UI Handlers --- //

fn escape(text: &str) -> String {
    html_escape::encode_text(text).to_string()
}

async fn list_projects_ui_handler(State(core): State<Core>) -> impl IntoResponse {
    match core.list_projects().await {
        Ok(projects) => {
            let mut html_content = String::from(HTML_TEMPLATE_HEADER);
            html_content.push_str("<h1>Projects</h1>");

            if projects.is_empty() {
                html_content.push_str(
                    "<p>No projects yet. Create one with <code>wbs-engine project create</code></p>",
                );
            } else {
                html_content.push_str("<ul>");
                for project in &projects {
                    let id = html_escape::encode_double_quoted_attribute(&project.id);
                    html_content.push_str(&format!(
                        "<li><a href=\"/ui/{}\">{}</a> <span class='muted'>{}</span></li>",
                        id,
                        escape(&project.name),
                        escape(&project.file_key)
                    ));
                }
                html_content.push_str("</ul>");
            }

            html_content.push_str(HTML_TEMPLATE_FOOTER);
            Html(html_content).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to list projects for UI: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!(
                    "<h1>Error</h1><p>Could not load project list: {}</p>",
                    escape(&e.to_string())
                )),
            )
                .into_response()
        }
    }
}

async fn ui_handler(State(core): State<Core>, Path(id): Path<String>) -> impl IntoResponse {
    match core.get_project(&id).await {
        Ok(project) => Html(render_project_page(&project)).into_response(),
        Err(e) => (
            status_for(&e),
            Html(format!("<h1>{}</h1>", escape(&e.to_string()))),
        )
            .into_response(),
    }
}

/// Renders the side-by-side comparison page for a project
pub fn render_project_page(project: &Project) -> String {
    let mut html = String::from(HTML_TEMPLATE_HEADER);
    html.push_str(&format!("<h1>{}</h1>", escape(&project.name)));
    html.push_str(&format!(
        "<p class='muted'>{} &middot; created {}</p>",
        escape(&project.file_key),
        project.created_at.format("%Y-%m-%d %H:%M UTC")
    ));

    // --- Models ---
    html.push_str("<div class='panel'><h2>Models</h2><ul>");
    if project.model_results.is_empty() {
        html.push_str("<li>Not analyzed yet.</li>");
    }
    for result in &project.model_results {
        match &result.error {
            Some(error) => html.push_str(&format!(
                "<li class='failed'><strong>{}</strong> failed: {}</li>",
                escape(&result.model),
                escape(error)
            )),
            None => html.push_str(&format!(
                "<li><strong>{}</strong> {} tasks</li>",
                escape(&result.model),
                result.results.len()
            )),
        }
    }
    html.push_str("</ul></div>");

    // --- Comparison ---
    html.push_str("<div class='panel'><h2>Comparison</h2>");
    match &project.comparison_result {
        Some(comparison) => render_comparison(&mut html, comparison),
        None => html.push_str("<p>At least two models are needed for a comparison.</p>"),
    }
    html.push_str("</div>");

    // --- Active tree ---
    html.push_str("<div class='panel'><h2>Active Task List</h2>");
    if project.tree.is_empty() {
        html.push_str("<p>No model promoted yet.</p>");
    } else {
        html.push_str("<ul class='task-tree'>");
        for row in &project.tree {
            html.push_str(&format!(
                "<li style='padding-left: {}px'><span class='wbs'>{}</span>{}</li>",
                row.indent_level.saturating_sub(1) * 20,
                escape(row.wbs_id.as_deref().unwrap_or("")),
                escape(&row.name)
            ));
        }
        html.push_str("</ul>");
    }
    html.push_str("</div>");

    html.push_str(HTML_TEMPLATE_FOOTER);
    html
}

fn render_comparison(html: &mut String, comparison: &ComparisonResult) {
    html.push_str(&format!("<p>{}</p>", escape(&comparison.summary)));
    html.push_str(
        "<table><thead><tr><th>WBS</th><th>Task</th><th>Status</th><th>Sources</th><th>Discrepancies</th></tr></thead><tbody>",
    );
    for task in &comparison.tasks {
        let (class, label) = match task.status {
            TaskStatus::Pass => ("pass", "pass"),
            TaskStatus::NeedsReview => ("review", "needs review"),
        };
        html.push_str(&format!(
            "<tr class='{}'><td class='wbs'>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            class,
            escape(&task.wbs_id),
            escape(&task.name),
            label,
            escape(&task.sources.join(", ")),
            escape(task.discrepancies.as_deref().unwrap_or(""))
        ));
    }
    html.push_str("</tbody></table>");
}

const HTML_TEMPLATE_HEADER: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>WBS Engine</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, 'Helvetica Neue', sans-serif;
            line-height: 1.6;
            color: #333;
            max-width: 1200px;
            margin: 0 auto;
            padding: 20px;
            background-color: #f7f9fc;
        }
        h1 {
            color: #2c3e50;
            border-bottom: 2px solid #3498db;
            padding-bottom: 10px;
        }
        h2 {
            color: #3498db;
        }
        .panel {
            background: white;
            padding: 20px;
            margin-bottom: 20px;
            border-radius: 8px;
            box-shadow: 0 2px 10px rgba(0,0,0,0.1);
        }
        .muted {
            color: #7f8c8d;
        }
        table {
            width: 100%;
            border-collapse: collapse;
        }
        th, td {
            text-align: left;
            padding: 6px 10px;
            border-bottom: 1px solid #ecf0f1;
        }
        tr.pass td:nth-child(3) {
            color: #27ae60;
            font-weight: bold;
        }
        tr.review {
            background-color: #fdf2e9;
        }
        tr.review td:nth-child(3) {
            color: #d35400;
            font-weight: bold;
        }
        .failed {
            color: #c0392b;
        }
        .task-tree {
            list-style-type: none;
            padding-left: 0;
        }
        .wbs {
            font-family: monospace;
            color: #7f8c8d;
            display: inline-block;
            min-width: 60px;
        }
    </style>
</head>
<body>
"#;

const HTML_TEMPLATE_FOOTER: &str = r#"
</body>
</html>
"#;
