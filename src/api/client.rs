//! API client module
//!
//! This module provides HTTP client functionality to interact with the wbs-engine API server.

use std::sync::Arc;

use reqwest::{Client as ReqwestClient, Error as ReqwestError, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::server::{
    AnalyzeRequest, CreateProjectRequest, DeleteTaskRequest, InsertTaskRequest, MoveTaskRequest,
    RefineRequest, RenameTaskRequest,
};
use crate::models::{ComparisonResult, Project};
use crate::mutate::{DeletePolicy, Edit};
use crate::session::SessionView;

/// API client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
        }
    }
}

/// Generic API response structure
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] ReqwestError),

    #[error("API error: {0}")]
    Api(String),

    #[error("Missing data in response")]
    MissingData,
}

/// API client for the wbs-engine service
#[derive(Debug, Clone)]
pub struct Client {
    http_client: Arc<ReqwestClient>,
    config: ClientConfig,
}

impl Client {
    /// Create a new client with default configuration
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a new client with custom configuration
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            http_client: Arc::new(ReqwestClient::new()),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    // Sends a request and unwraps the API envelope
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await?;
        let status = response.status();
        let api_response: ApiResponse<T> = match response.json().await {
            Ok(api_response) => api_response,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => return Err(ClientError::Api(format!("HTTP error: {}", status))),
        };

        if api_response.success {
            api_response.data.ok_or(ClientError::MissingData)
        } else {
            Err(ClientError::Api(
                api_response
                    .error
                    .unwrap_or_else(|| "Unknown API error".to_string()),
            ))
        }
    }

    /// List all projects
    pub async fn list_projects(&self) -> Result<Vec<Project>, ClientError> {
        self.send(self.http_client.get(self.url("/api/projects")))
            .await
    }

    /// Get one project with its model results and comparison
    pub async fn get_project(&self, id: &str) -> Result<Project, ClientError> {
        self.send(self.http_client.get(self.url(&format!("/api/projects/{}", id))))
            .await
    }

    /// Create a project, or fetch it if the id already exists
    pub async fn create_project(
        &self,
        id: Option<String>,
        name: String,
        file_key: String,
    ) -> Result<Project, ClientError> {
        let request = CreateProjectRequest { id, name, file_key };
        self.send(
            self.http_client
                .post(self.url("/api/projects"))
                .json(&request),
        )
        .await
    }

    /// Analyze a project's document with some or all configured models
    pub async fn analyze(
        &self,
        id: &str,
        document: Option<String>,
        models: Option<Vec<String>>,
    ) -> Result<Project, ClientError> {
        let request = AnalyzeRequest { document, models };
        self.send(
            self.http_client
                .post(self.url(&format!("/api/projects/{}/analyze", id)))
                .json(&request),
        )
        .await
    }

    pub async fn comparison(&self, id: &str) -> Result<Option<ComparisonResult>, ClientError> {
        let url = self.url(&format!("/api/projects/{}/comparison", id));
        // A missing comparison arrives as `data: null`
        let response: Result<ComparisonResult, ClientError> =
            self.send(self.http_client.get(url)).await;
        match response {
            Ok(comparison) => Ok(Some(comparison)),
            Err(ClientError::MissingData) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn rerun_model(&self, id: &str, model: &str) -> Result<Project, ClientError> {
        let url = self.url(&format!("/api/projects/{}/models/{}/rerun", id, model));
        self.send(self.http_client.post(url)).await
    }

    /// Refine one model's results following `instructions`
    pub async fn refine_model(
        &self,
        id: &str,
        model: &str,
        instructions: String,
    ) -> Result<Project, ClientError> {
        let url = self.url(&format!("/api/projects/{}/models/{}/refine", id, model));
        let request = RefineRequest { instructions };
        self.send(self.http_client.post(url).json(&request)).await
    }

    pub async fn delete_model(&self, id: &str, model: &str) -> Result<Project, ClientError> {
        let url = self.url(&format!("/api/projects/{}/models/{}", id, model));
        self.send(self.http_client.delete(url)).await
    }

    pub async fn promote(&self, id: &str, model: &str) -> Result<Project, ClientError> {
        let url = self.url(&format!("/api/projects/{}/models/{}/promote", id, model));
        self.send(self.http_client.post(url)).await
    }

    /// Get the project's editable tree
    pub async fn tree(&self, id: &str) -> Result<SessionView, ClientError> {
        let url = self.url(&format!("/api/projects/{}/tree", id));
        self.send(self.http_client.get(url)).await
    }

    pub async fn insert_task(
        &self,
        id: &str,
        after: Option<String>,
        name: Option<String>,
    ) -> Result<Edit, ClientError> {
        let url = self.url(&format!("/api/projects/{}/tree/insert", id));
        let request = InsertTaskRequest { after, name };
        self.send(self.http_client.post(url).json(&request)).await
    }

    pub async fn delete_task(
        &self,
        id: &str,
        node_id: String,
        policy: DeletePolicy,
    ) -> Result<Edit, ClientError> {
        let url = self.url(&format!("/api/projects/{}/tree/delete", id));
        let request = DeleteTaskRequest { node_id, policy };
        self.send(self.http_client.post(url).json(&request)).await
    }

    pub async fn move_task(
        &self,
        id: &str,
        node_id: String,
        new_parent: Option<String>,
        new_index: usize,
    ) -> Result<Edit, ClientError> {
        let url = self.url(&format!("/api/projects/{}/tree/move", id));
        let request = MoveTaskRequest {
            node_id,
            new_parent,
            new_index,
        };
        self.send(self.http_client.post(url).json(&request)).await
    }

    pub async fn rename_task(&self, id: &str, node_id: String, name: String) -> Result<Edit, ClientError> {
        let url = self.url(&format!("/api/projects/{}/tree/rename", id));
        let request = RenameTaskRequest { node_id, name };
        self.send(self.http_client.post(url).json(&request)).await
    }

    pub async fn undo(&self, id: &str) -> Result<SessionView, ClientError> {
        let url = self.url(&format!("/api/projects/{}/tree/undo", id));
        self.send(self.http_client.post(url)).await
    }

    pub async fn redo(&self, id: &str) -> Result<SessionView, ClientError> {
        let url = self.url(&format!("/api/projects/{}/tree/redo", id));
        self.send(self.http_client.post(url)).await
    }

    /// Persist the edited tree as the project's active task list
    pub async fn save_tree(&self, id: &str) -> Result<Project, ClientError> {
        let url = self.url(&format!("/api/projects/{}/tree/save", id));
        self.send(self.http_client.post(url)).await
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
