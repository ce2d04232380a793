//! Analysis pipeline
//!
//! Runs the configured model adapters concurrently, stores each model's
//! result against the project, and recomputes the comparison from the full
//! stored set. Every stage is safe to re-run: project creation is an upsert,
//! model results replace the entry for the same model, and the comparison is
//! always derived from scratch. Writes to one project are serialized, so a
//! stage always merges into the copy the previous stage stored.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use lazy_static::lazy_static;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::consensus;
use crate::models::{
    AdapterError, ComparisonResult, IdGenerator, ModelResults, Project, ProjectError, StoreError,
    TaskList, TaskRow,
};
use crate::tree;

lazy_static! {
    /// Models analyzed when a request names none
    pub static ref DEFAULT_MODELS: Vec<String> = vec![
        "gemini".to_string(),
        "openai".to_string(),
        "anthropic".to_string(),
    ];
}

/// Turns a document into one model's task list
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn model(&self) -> &str;

    async fn extract(&self, document: &str) -> Result<TaskList, AdapterError>;

    /// Reworks a stored task list following user instructions
    async fn refine(
        &self,
        _current: &TaskList,
        _instructions: &str,
    ) -> Result<TaskList, AdapterError> {
        Err(AdapterError::RefineUnsupported(self.model().to_string()))
    }
}

/// Persistence for project documents
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Project>, StoreError>;

    async fn save(&self, project: &Project) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Project>, StoreError>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    projects: RwLock<HashMap<String, Project>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.read().await.get(id).cloned())
    }

    async fn save(&self, project: &Project) -> Result<(), StoreError> {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Project>, StoreError> {
        let mut projects: Vec<Project> = self.projects.read().await.values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(projects)
    }
}

/// Store keeping one JSON document per project in a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Project ids become file names, so only `[A-Za-z0-9_-]` is accepted
    fn path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

fn backend(e: std::io::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl ProjectStore for FileStore {
    async fn load(&self, id: &str) -> Result<Option<Project>, StoreError> {
        match tokio::fs::read_to_string(self.path(id)?).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(backend(e)),
        }
    }

    async fn save(&self, project: &Project) -> Result<(), StoreError> {
        let path = self.path(&project.id)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(backend)?;
        let text = serde_json::to_string_pretty(project)?;
        tokio::fs::write(path, text)
            .await
            .map_err(backend)
    }

    async fn list(&self) -> Result<Vec<Project>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(backend(e)),
        };

        let mut projects = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(backend)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await.map_err(backend)?;
            match serde_json::from_str::<Project>(&text) {
                Ok(project) => projects.push(project),
                Err(e) => tracing::warn!("Skipping unreadable project file {}: {}", path.display(), e),
            }
        }
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(projects)
    }
}

/// Reads a model response body. Accepts a tagged task list, a `{"tasks": [..]}`
/// envelope, or a bare array; the last two are classified heuristically.
pub fn parse_task_list(body: Value) -> Result<TaskList, AdapterError> {
    let invalid = |e: serde_json::Error| AdapterError::InvalidOutput(e.to_string());
    match body {
        Value::Object(mut map) => {
            if map.contains_key("representation") {
                return serde_json::from_value(Value::Object(map)).map_err(invalid);
            }
            match map.remove("tasks") {
                Some(Value::Array(items)) => TaskList::from_untyped(items).map_err(invalid),
                _ => Err(AdapterError::InvalidOutput(
                    "expected a 'tasks' array".to_string(),
                )),
            }
        }
        Value::Array(items) => TaskList::from_untyped(items).map_err(invalid),
        other => Err(AdapterError::InvalidOutput(format!(
            "unexpected response: {}",
            other
        ))),
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    model: &'a str,
    document: &'a str,
}

#[derive(Serialize)]
struct RefineRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    tasks: &'a TaskList,
}

/// Calls an extraction service over HTTP: `POST {endpoint}` with
/// `{model, document}`, and `POST {endpoint}/refine` with
/// `{model, instructions, tasks}`
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    model: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelAdapter for HttpAdapter {
    fn model(&self) -> &str {
        &self.model
    }

    async fn extract(&self, document: &str) -> Result<TaskList, AdapterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ExtractRequest {
                model: &self.model,
                document,
            })
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        parse_task_list(body)
    }

    async fn refine(&self, current: &TaskList, instructions: &str) -> Result<TaskList, AdapterError> {
        let url = format!("{}/refine", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .json(&RefineRequest {
                model: &self.model,
                instructions,
                tasks: current,
            })
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        parse_task_list(body)
    }
}

/// Replays recorded model output from `<dir>/<model>.json`, and refinements
/// from `<dir>/<model>.refined.json`
#[derive(Debug, Clone)]
pub struct ReplayAdapter {
    model: String,
    dir: PathBuf,
}

impl ReplayAdapter {
    pub fn new(model: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            dir: dir.into(),
        }
    }

    async fn replay(&self, file: String) -> Result<TaskList, AdapterError> {
        let path = self.dir.join(file);
        let text = tokio::fs::read_to_string(&path).await?;
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| AdapterError::InvalidOutput(format!("{}: {}", path.display(), e)))?;
        parse_task_list(body)
    }
}

#[async_trait]
impl ModelAdapter for ReplayAdapter {
    fn model(&self) -> &str {
        &self.model
    }

    async fn extract(&self, _document: &str) -> Result<TaskList, AdapterError> {
        self.replay(format!("{}.json", self.model)).await
    }

    async fn refine(&self, _current: &TaskList, _instructions: &str) -> Result<TaskList, AdapterError> {
        self.replay(format!("{}.refined.json", self.model)).await
    }
}

/// Configuration for the pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub models: Vec<String>,
    pub timeout: Duration,
    /// Extra attempts for a failed storage stage
    pub stage_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models: DEFAULT_MODELS.clone(),
            timeout: Duration::from_secs(120),
            stage_retries: 2,
        }
    }
}

pub struct Pipeline {
    adapters: HashMap<String, Arc<dyn ModelAdapter>>,
    store: Arc<dyn ProjectStore>,
    config: PipelineConfig,
    ids: Mutex<IdGenerator>,
    /// One writer per project while a stage merges and persists
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ProjectStore>, config: PipelineConfig) -> Self {
        Self {
            adapters: HashMap::new(),
            store,
            config,
            ids: Mutex::new(IdGenerator::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an adapter under its model name, replacing any previous one
    pub fn with_adapter(mut self, adapter: Arc<dyn ModelAdapter>) -> Self {
        self.adapters.insert(adapter.model().to_string(), adapter);
        self
    }

    pub fn with_ids(mut self, ids: IdGenerator) -> Self {
        self.ids = Mutex::new(ids);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    async fn with_retries<T, F, Fut>(&self, stage: &str, op: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.config.stage_retries => {
                    attempt += 1;
                    tracing::warn!("Stage {} failed (attempt {}): {}", stage, attempt, e);
                }
                Err(e) => {
                    tracing::error!("Stage {} failed after {} attempts: {}", stage, attempt + 1, e);
                    return Err(e);
                }
            }
        }
    }

    async fn load(&self, project_id: &str) -> Result<Project, ProjectError> {
        self.with_retries("load-project", || self.store.load(project_id))
            .await?
            .ok_or_else(|| ProjectError::ProjectNotFound(project_id.to_string()))
    }

    async fn persist(&self, project: &mut Project) -> Result<(), ProjectError> {
        project.touch();
        let snapshot: &Project = project;
        self.with_retries("persist-db", || self.store.save(snapshot))
            .await?;
        Ok(())
    }

    fn project_lock(&self, project_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(project_id.to_string()).or_default().clone()
    }

    fn release_lock(&self, project_id: &str, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this caller still hold it
        if Arc::strong_count(lock) == 2 {
            locks.remove(project_id);
        }
    }

    /// Loads the latest stored copy, applies `change` and persists the result.
    /// Updates to the same project run one at a time.
    async fn update<F>(&self, project_id: &str, change: F) -> Result<Project, ProjectError>
    where
        F: FnOnce(&mut Project) -> Result<(), ProjectError> + Send,
    {
        let lock = self.project_lock(project_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply(project_id, change).await
        };
        self.release_lock(project_id, &lock);
        result
    }

    async fn apply<F>(&self, project_id: &str, change: F) -> Result<Project, ProjectError>
    where
        F: FnOnce(&mut Project) -> Result<(), ProjectError> + Send,
    {
        let mut project = self.load(project_id).await?;
        change(&mut project)?;
        self.persist(&mut project).await?;
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project, ProjectError> {
        self.load(project_id).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, ProjectError> {
        Ok(self.with_retries("list-projects", || self.store.list()).await?)
    }

    pub async fn comparison(&self, project_id: &str) -> Result<Option<ComparisonResult>, ProjectError> {
        Ok(self.load(project_id).await?.comparison_result)
    }

    /// Creates the project record if it does not exist yet. An existing
    /// record is returned untouched.
    pub async fn create_project(
        &self,
        project_id: &str,
        name: &str,
        file_key: &str,
    ) -> Result<Project, ProjectError> {
        let existing = self
            .with_retries("create-project", || self.store.load(project_id))
            .await?;
        if let Some(project) = existing {
            tracing::debug!("Project {} already exists", project_id);
            return Ok(project);
        }

        let project = Project::new(project_id, name, file_key);
        self.with_retries("create-project", || self.store.save(&project))
            .await?;
        tracing::info!("Created project {} ({})", project_id, file_key);
        Ok(project)
    }

    /// Runs `models` (or the configured defaults) over the project's document.
    /// A supplied `document` replaces the stored one. Only the entries of the
    /// models that ran are replaced.
    pub async fn analyze(
        &self,
        project_id: &str,
        document: Option<&str>,
        models: Option<&[String]>,
    ) -> Result<Project, ProjectError> {
        let project = self.load(project_id).await?;
        let document = match document {
            Some(document) => document.to_string(),
            None => project
                .document
                .clone()
                .ok_or_else(|| ProjectError::MissingDocument(project_id.to_string()))?,
        };

        let mut selected: Vec<String> = Vec::new();
        for model in models.unwrap_or(&self.config.models) {
            if !selected.contains(model) {
                selected.push(model.clone());
            }
        }

        tracing::info!(
            "Analyzing project {} with models: {}",
            project_id,
            selected.join(", ")
        );
        let results = join_all(selected.iter().map(|model| self.run_model(model, &document))).await;

        self.update(project_id, move |project| {
            project.document = Some(document);
            for result in results {
                project.upsert_model_result(result);
            }
            recompare(project);
            Ok(())
        })
        .await
    }

    /// Re-runs one model against the stored document
    pub async fn rerun_model(&self, project_id: &str, model: &str) -> Result<Project, ProjectError> {
        let models = [model.to_string()];
        self.analyze(project_id, None, Some(&models[..])).await
    }

    /// Replaces one model's results with a refinement of them that follows
    /// `instructions`, then recomputes the comparison
    pub async fn refine_model(
        &self,
        project_id: &str,
        model: &str,
        instructions: &str,
    ) -> Result<Project, ProjectError> {
        let project = self.load(project_id).await?;
        let current = project
            .model_result(model)
            .ok_or_else(|| model_not_found(project_id, model))?;
        if let Some(error) = &current.error {
            return Err(ProjectError::ModelFailed {
                model: model.to_string(),
                error: error.clone(),
            });
        }
        let adapter = self
            .adapters
            .get(model)
            .ok_or_else(|| ProjectError::RefineFailed {
                model: model.to_string(),
                error: AdapterError::NotConfigured(model.to_string()).to_string(),
            })?;

        tracing::info!("Refining {} results for project {}", model, project_id);
        let mut tasks = self
            .call_model(adapter.refine(&current.results, instructions))
            .await
            .map_err(|e| {
                tracing::warn!("Refining {} failed: {}", model, e);
                ProjectError::RefineFailed {
                    model: model.to_string(),
                    error: e.to_string(),
                }
            })?;
        tasks.sort_by_wbs_id();
        let refined = ModelResults::success(model, tasks);

        self.update(project_id, move |project| {
            project.upsert_model_result(refined);
            recompare(project);
            Ok(())
        })
        .await
    }

    /// Drops one model's results and recomputes the comparison
    pub async fn delete_model(&self, project_id: &str, model: &str) -> Result<Project, ProjectError> {
        let project = self
            .update(project_id, |project| {
                if !project.remove_model_result(model) {
                    return Err(model_not_found(project_id, model));
                }
                recompare(project);
                Ok(())
            })
            .await?;
        tracing::info!("Deleted {} results from project {}", model, project_id);
        Ok(project)
    }

    /// Makes one model's output the project's active task list
    pub async fn promote(&self, project_id: &str, model: &str) -> Result<Project, ProjectError> {
        self.update(project_id, |project| {
            let result = project
                .model_result(model)
                .ok_or_else(|| model_not_found(project_id, model))?;
            let forest = {
                let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
                consensus::promote(result, &mut ids)?
            };
            project.tree = tree::to_rows(&forest);
            Ok(())
        })
        .await
    }

    /// Overwrites the project's active task list
    pub async fn save_tree(&self, project_id: &str, rows: Vec<TaskRow>) -> Result<Project, ProjectError> {
        self.update(project_id, move |project| {
            project.tree = rows;
            Ok(())
        })
        .await
    }

    async fn call_model<F>(&self, call: F) -> Result<TaskList, AdapterError>
    where
        F: Future<Output = Result<TaskList, AdapterError>>,
    {
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AdapterError::Timeout(self.config.timeout.as_secs())),
        }
    }

    async fn run_model(&self, model: &str, document: &str) -> ModelResults<TaskList> {
        let Some(adapter) = self.adapters.get(model) else {
            let error = AdapterError::NotConfigured(model.to_string());
            tracing::warn!("{}", error);
            return ModelResults::failure(model, error.to_string());
        };

        match self.call_model(adapter.extract(document)).await {
            Ok(mut tasks) => {
                tasks.sort_by_wbs_id();
                tracing::info!("Model {} returned {} tasks", model, tasks.len());
                ModelResults::success(model, tasks)
            }
            Err(e) => {
                tracing::warn!("Model {} failed: {}", model, e);
                ModelResults::failure(model, e.to_string())
            }
        }
    }
}

fn model_not_found(project_id: &str, model: &str) -> ProjectError {
    ProjectError::ModelNotFound {
        project: project_id.to_string(),
        model: model.to_string(),
    }
}

/// Recomputes the comparison from every stored result; fewer than two models
/// have nothing to compare
fn recompare(project: &mut Project) {
    project.comparison_result = if project.model_results.len() < 2 {
        None
    } else {
        Some(consensus::compare(&project.model_results))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FlatTask, TaskStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAdapter {
        model: String,
        output: Result<Vec<(&'static str, &'static str)>, String>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl FakeAdapter {
        fn ok(model: &str, tasks: Vec<(&'static str, &'static str)>) -> Arc<Self> {
            Arc::new(Self {
                model: model.to_string(),
                output: Ok(tasks),
                delay: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(model: &str, error: &str) -> Arc<Self> {
            Arc::new(Self {
                model: model.to_string(),
                output: Err(error.to_string()),
                delay: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(model: &str) -> Arc<Self> {
            Arc::new(Self {
                model: model.to_string(),
                output: Ok(vec![("1", "Site Prep")]),
                delay: Some(Duration::from_secs(30)),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelAdapter for FakeAdapter {
        fn model(&self) -> &str {
            &self.model
        }

        async fn extract(&self, _document: &str) -> Result<TaskList, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.output {
                Ok(tasks) => Ok(TaskList::Flat(
                    tasks
                        .iter()
                        .map(|(wbs, name)| FlatTask::with_wbs(*wbs, *name))
                        .collect(),
                )),
                Err(e) => Err(AdapterError::InvalidOutput(e.clone())),
            }
        }

        async fn refine(&self, current: &TaskList, instructions: &str) -> Result<TaskList, AdapterError> {
            let mut tasks = current.entries();
            tasks.push(FlatTask::with_wbs("9", instructions));
            Ok(TaskList::Flat(tasks))
        }
    }

    /// Adapter that only knows how to extract
    struct ExtractOnly;

    #[async_trait]
    impl ModelAdapter for ExtractOnly {
        fn model(&self) -> &str {
            "plain"
        }

        async fn extract(&self, _document: &str) -> Result<TaskList, AdapterError> {
            Ok(TaskList::Flat(vec![FlatTask::with_wbs("1", "Site Prep")]))
        }
    }

    fn config(models: &[&str]) -> PipelineConfig {
        PipelineConfig {
            models: models.iter().map(|m| m.to_string()).collect(),
            timeout: Duration::from_millis(200),
            stage_retries: 1,
        }
    }

    fn plan() -> Vec<(&'static str, &'static str)> {
        vec![("1.1", "Clearing"), ("1", "Site Prep")]
    }

    #[tokio::test]
    async fn test_analyze_records_partial_failure() {
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&["a", "b", "c"]))
            .with_adapter(FakeAdapter::ok("a", plan()))
            .with_adapter(FakeAdapter::ok("b", plan()))
            .with_adapter(FakeAdapter::failing("c", "quota exceeded"));

        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();
        let project = pipeline.analyze("p1", Some("document"), None).await.unwrap();

        assert_eq!(project.model_results.len(), 3);
        assert!(project.model_result("c").unwrap().is_error());

        // Output is stored sorted by WBS id
        let a = project.model_result("a").unwrap().results.entries();
        assert_eq!(a[0].wbs_id.as_deref(), Some("1"));

        let comparison = project.comparison_result.unwrap();
        assert_eq!(comparison.tasks.len(), 2);
        assert!(comparison
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::NeedsReview && t.sources == vec!["a", "b"]));
        assert!(project.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_slow_model_times_out() {
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&["a", "slow"]))
            .with_adapter(FakeAdapter::ok("a", plan()))
            .with_adapter(FakeAdapter::slow("slow"));

        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();
        let project = pipeline.analyze("p1", Some("document"), None).await.unwrap();

        let slow = project.model_result("slow").unwrap();
        assert!(slow.error.as_deref().unwrap().contains("timed out"));
        assert!(slow.results.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_replaces_only_that_model() {
        let a = FakeAdapter::ok("a", plan());
        let b = FakeAdapter::ok("b", vec![("1", "Site Preparation")]);
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&["a", "b"]))
            .with_adapter(a.clone())
            .with_adapter(b.clone());

        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();
        let first = pipeline.analyze("p1", Some("document"), None).await.unwrap();
        let project = pipeline.rerun_model("p1", "b").await.unwrap();

        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
        assert_eq!(project.model_results.len(), 2);
        assert_eq!(project.model_results[0], first.model_results[0]);
        assert_eq!(project.model_results[1].model, "b");
        assert_eq!(project.comparison_result, first.comparison_result);
    }

    #[tokio::test]
    async fn test_rerun_without_document_fails() {
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&["a"]))
            .with_adapter(FakeAdapter::ok("a", plan()));
        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();

        let err = pipeline.rerun_model("p1", "a").await.unwrap_err();
        assert!(matches!(err, ProjectError::MissingDocument(_)));

        let err = pipeline.rerun_model("nope", "a").await.unwrap_err();
        assert!(matches!(err, ProjectError::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_model_recomputes_comparison() {
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&["a", "b"]))
            .with_adapter(FakeAdapter::ok("a", plan()))
            .with_adapter(FakeAdapter::ok("b", plan()));

        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();
        let project = pipeline.analyze("p1", Some("document"), None).await.unwrap();
        assert_eq!(project.comparison_result.unwrap().pass_count(), 2);

        let project = pipeline.delete_model("p1", "b").await.unwrap();
        assert_eq!(project.model_results.len(), 1);
        assert_eq!(project.comparison_result, None);

        let err = pipeline.delete_model("p1", "b").await.unwrap_err();
        assert!(matches!(err, ProjectError::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_project_is_idempotent() {
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&[]));
        let first = pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();
        let second = pipeline.create_project("p1", "Other", "other.mpp").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pipeline.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_model_is_recorded_as_failed() {
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&["a"]))
            .with_adapter(FakeAdapter::ok("a", plan()));
        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();

        let models = vec!["a".to_string(), "mystery".to_string(), "a".to_string()];
        let project = pipeline.analyze("p1", Some("doc"), Some(&models)).await.unwrap();
        assert_eq!(project.model_results.len(), 2);
        assert!(project
            .model_result("mystery")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("not configured"));
    }

    #[tokio::test]
    async fn test_promote_writes_active_rows() {
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&["a", "b"]))
            .with_adapter(FakeAdapter::ok("a", vec![("1", "Site Prep"), ("1.4", "Grading")]))
            .with_adapter(FakeAdapter::failing("b", "boom"))
            .with_ids(IdGenerator::seeded(3));

        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();
        pipeline.analyze("p1", Some("doc"), None).await.unwrap();

        let project = pipeline.promote("p1", "a").await.unwrap();
        let wbs: Vec<_> = project.tree.iter().map(|r| r.wbs_id.as_deref().unwrap()).collect();
        assert_eq!(wbs, vec!["1", "1.1"]);
        assert_eq!(project.tree[1].parent_id.as_deref(), Some(project.tree[0].id.as_str()));

        let err = pipeline.promote("p1", "b").await.unwrap_err();
        assert!(matches!(err, ProjectError::ModelFailed { .. }));
    }

    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ProjectStore for FlakyStore {
        async fn load(&self, id: &str) -> Result<Option<Project>, StoreError> {
            self.inner.load(id).await
        }

        async fn save(&self, project: &Project) -> Result<(), StoreError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            self.inner.save(project).await
        }

        async fn list(&self) -> Result<Vec<Project>, StoreError> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_storage_stages_are_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(1),
        });
        let pipeline = Pipeline::new(store.clone(), config(&[]));
        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();
        assert!(store.inner.load("p1").await.unwrap().is_some());

        store.failures.store(5, Ordering::SeqCst);
        let err = pipeline.save_tree("p1", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ProjectError::Store(StoreError::Backend(_))));
    }

    #[test]
    fn test_parse_task_list_shapes() {
        let tagged = parse_task_list(json!({
            "representation": "tree",
            "tasks": [{"id": "a", "name": "A", "children": []}]
        }))
        .unwrap();
        assert!(matches!(tagged, TaskList::Tree(_)));

        let envelope = parse_task_list(json!({
            "tasks": [{"name": "A", "wbsId": "1"}, {"name": "B", "wbsId": "1.1"}]
        }))
        .unwrap();
        assert!(matches!(envelope, TaskList::Flat(ref t) if t.len() == 2));

        assert!(parse_task_list(json!([])).is_ok());
        assert!(matches!(
            parse_task_list(json!("nope")),
            Err(AdapterError::InvalidOutput(_))
        ));
        assert!(matches!(
            parse_task_list(json!({"items": []})),
            Err(AdapterError::InvalidOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_adapter_reads_recorded_output() {
        let dir = std::env::temp_dir().join(format!("wbs-replay-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("gemini.json"),
            json!({"tasks": [{"name": "Site Prep", "wbsId": "1"}]}).to_string(),
        )
        .await
        .unwrap();

        let tasks = ReplayAdapter::new("gemini", &dir).extract("").await.unwrap();
        assert_eq!(tasks.len(), 1);

        let missing = ReplayAdapter::new("openai", &dir).extract("").await;
        assert!(matches!(missing, Err(AdapterError::Io(_))));

        tokio::fs::write(
            dir.join("gemini.refined.json"),
            json!([{"name": "Site Prep", "wbsId": "1"}, {"name": "Clearing", "wbsId": "1.1"}])
                .to_string(),
        )
        .await
        .unwrap();
        let refined = ReplayAdapter::new("gemini", &dir)
            .refine(&tasks, "split clearing out")
            .await
            .unwrap();
        assert_eq!(refined.len(), 2);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("wbs-store-{}", std::process::id()));
        let store = FileStore::new(&dir);
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.load("p1").await.unwrap().is_none());

        let project = Project::new("p1", "Plan", "plan.pdf");
        store.save(&project).await.unwrap();
        assert_eq!(store.load("p1").await.unwrap(), Some(project));
        assert_eq!(store.list().await.unwrap().len(), 1);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_ids_outside_its_directory() {
        let base = std::env::temp_dir().join(format!("wbs-ids-{}", std::process::id()));
        let store = FileStore::new(base.join("data"));

        for id in ["../escaped", "a/b", "..", "", "p1.json", "dir\\x"] {
            let err = store.save(&Project::new(id, "Plan", "plan.pdf")).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidId(_)), "{:?}", id);
            assert!(matches!(store.load(id).await, Err(StoreError::InvalidId(_))));
        }
        assert!(!base.join("escaped.json").exists());

        store.save(&Project::new("site-prep_2", "Plan", "plan.pdf")).await.unwrap();
        assert!(store.load("site-prep_2").await.unwrap().is_some());

        tokio::fs::remove_dir_all(&base).await.unwrap();
    }

    /// Memory store whose writes take a while, widening the window between
    /// loading a project and saving it
    struct SlowStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ProjectStore for SlowStore {
        async fn load(&self, id: &str) -> Result<Option<Project>, StoreError> {
            self.inner.load(id).await
        }

        async fn save(&self, project: &Project) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.save(project).await
        }

        async fn list(&self) -> Result<Vec<Project>, StoreError> {
            self.inner.list().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_keep_each_others_results() {
        let pipeline = Arc::new(
            Pipeline::new(
                Arc::new(SlowStore {
                    inner: MemoryStore::new(),
                }),
                config(&["a", "b", "c"]),
            )
            .with_adapter(FakeAdapter::ok("a", plan()))
            .with_adapter(FakeAdapter::ok("b", plan()))
            .with_adapter(FakeAdapter::ok("c", plan())),
        );
        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();

        let runs = ["a", "b", "c"].map(|model| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let models = [model.to_string()];
                pipeline.analyze("p1", Some("doc"), Some(&models[..])).await
            })
        });
        for run in runs {
            run.await.unwrap().unwrap();
        }

        let project = pipeline.get_project("p1").await.unwrap();
        let mut models: Vec<_> = project.model_results.iter().map(|r| r.model.as_str()).collect();
        models.sort();
        assert_eq!(models, vec!["a", "b", "c"]);
        assert_eq!(project.comparison_result.unwrap().pass_count(), 2);
        assert!(pipeline.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refine_replaces_only_that_model() {
        let a = FakeAdapter::ok("a", plan());
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&["a", "b"]))
            .with_adapter(a.clone())
            .with_adapter(FakeAdapter::ok("b", plan()));

        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();
        let first = pipeline.analyze("p1", Some("document"), None).await.unwrap();
        assert_eq!(first.comparison_result.as_ref().unwrap().review_count(), 0);

        let project = pipeline
            .refine_model("p1", "a", "Add demobilization")
            .await
            .unwrap();
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(project.model_results[1], first.model_results[1]);

        let refined = project.model_result("a").unwrap().results.entries();
        assert_eq!(refined.len(), 3);
        assert_eq!(refined[2].name, "Add demobilization");

        let comparison = project.comparison_result.unwrap();
        assert_eq!(comparison.tasks.len(), 3);
        assert_eq!(comparison.review_count(), 1);
    }

    #[tokio::test]
    async fn test_refine_errors() {
        let pipeline = Pipeline::new(Arc::new(MemoryStore::new()), config(&["plain", "bad"]))
            .with_adapter(Arc::new(ExtractOnly))
            .with_adapter(FakeAdapter::failing("bad", "boom"));
        pipeline.create_project("p1", "Plan", "plan.pdf").await.unwrap();
        let before = pipeline.analyze("p1", Some("doc"), None).await.unwrap();

        let err = pipeline.refine_model("p1", "plain", "more detail").await.unwrap_err();
        assert!(matches!(err, ProjectError::RefineFailed { .. }));
        assert!(err.to_string().contains("does not support refinement"));

        let err = pipeline.refine_model("p1", "bad", "more detail").await.unwrap_err();
        assert!(matches!(err, ProjectError::ModelFailed { .. }));

        let err = pipeline.refine_model("p1", "ghost", "more detail").await.unwrap_err();
        assert!(matches!(err, ProjectError::ModelNotFound { .. }));

        // Nothing was stored by the failed refinements
        let after = pipeline.get_project("p1").await.unwrap();
        assert_eq!(after.model_results, before.model_results);
    }
}
