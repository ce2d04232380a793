//! Service core
//!
//! `Core` ties the pipeline to the per-project edit sessions the UI works in.
//! It is cheap to clone and shared by the HTTP handlers. Sessions with no
//! unsaved edits are dropped once they sit idle; the next read reopens them
//! from the stored rows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::models::{ComparisonResult, IdGenerator, Project, ProjectError};
use crate::mutate::{DeletePolicy, Edit};
use crate::pipeline::Pipeline;
use crate::session::{EditSession, SessionView};

/// How long a clean session stays open without being used
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

struct OpenSession {
    session: EditSession,
    last_used: Instant,
}

/// Shared handle to the pipeline and the open edit sessions
#[derive(Clone)]
pub struct Core {
    pipeline: Arc<Pipeline>,
    sessions: Arc<Mutex<HashMap<String, OpenSession>>>,
    session_idle: Duration,
}

impl Core {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            session_idle: DEFAULT_SESSION_IDLE,
        }
    }

    /// Sets how long a session without unsaved edits is kept open
    pub fn with_session_idle(mut self, idle: Duration) -> Self {
        self.session_idle = idle;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, OpenSession>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of sessions currently held in memory
    pub fn open_sessions(&self) -> usize {
        self.sessions().len()
    }

    /// Drops clean sessions that have not been used for `session_idle`.
    /// Sessions with unsaved edits are kept.
    fn evict_idle(&self) {
        let idle = self.session_idle;
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, open| open.session.is_dirty() || open.last_used.elapsed() < idle);
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} idle edit sessions", evicted);
        }
    }

    async fn ensure_session(&self, project_id: &str) -> Result<(), ProjectError> {
        self.evict_idle();
        let open = self.sessions().contains_key(project_id);
        if open {
            return Ok(());
        }

        let project = self.pipeline.get_project(project_id).await?;
        let session = EditSession::from_rows(&project.tree, IdGenerator::new());
        tracing::debug!(
            "Opened edit session for {} with {} rows",
            project_id,
            project.tree.len()
        );
        self.sessions()
            .entry(project_id.to_string())
            .or_insert(OpenSession {
                session,
                last_used: Instant::now(),
            });
        Ok(())
    }

    // Helper method to run an operation against a project's edit session
    async fn with_session<F, R>(&self, project_id: &str, f: F) -> Result<R, ProjectError>
    where
        F: FnOnce(&mut EditSession) -> R,
    {
        self.ensure_session(project_id).await?;
        let mut sessions = self.sessions();
        let open = sessions
            .get_mut(project_id)
            .ok_or_else(|| ProjectError::ProjectNotFound(project_id.to_string()))?;
        open.last_used = Instant::now();
        Ok(f(&mut open.session))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, ProjectError> {
        self.pipeline.list_projects().await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project, ProjectError> {
        self.pipeline.get_project(project_id).await
    }

    pub async fn create_project(
        &self,
        project_id: &str,
        name: &str,
        file_key: &str,
    ) -> Result<Project, ProjectError> {
        self.pipeline
            .create_project(project_id, name, file_key)
            .await
    }

    pub async fn analyze(
        &self,
        project_id: &str,
        document: Option<&str>,
        models: Option<&[String]>,
    ) -> Result<Project, ProjectError> {
        self.pipeline.analyze(project_id, document, models).await
    }

    pub async fn rerun_model(&self, project_id: &str, model: &str) -> Result<Project, ProjectError> {
        self.pipeline.rerun_model(project_id, model).await
    }

    pub async fn refine_model(
        &self,
        project_id: &str,
        model: &str,
        instructions: &str,
    ) -> Result<Project, ProjectError> {
        self.pipeline
            .refine_model(project_id, model, instructions)
            .await
    }

    pub async fn delete_model(&self, project_id: &str, model: &str) -> Result<Project, ProjectError> {
        self.pipeline.delete_model(project_id, model).await
    }

    pub async fn comparison(&self, project_id: &str) -> Result<Option<ComparisonResult>, ProjectError> {
        self.pipeline.comparison(project_id).await
    }

    /// Promotes a model's output and restarts the project's edit session on it
    pub async fn promote(&self, project_id: &str, model: &str) -> Result<Project, ProjectError> {
        let project = self.pipeline.promote(project_id, model).await?;
        self.sessions().remove(project_id);
        Ok(project)
    }

    pub async fn tree(&self, project_id: &str) -> Result<SessionView, ProjectError> {
        self.with_session(project_id, |session| session.view()).await
    }

    pub async fn insert_task(
        &self,
        project_id: &str,
        after: Option<&str>,
        name: Option<String>,
    ) -> Result<Edit, ProjectError> {
        Ok(self
            .with_session(project_id, |session| session.add_task(after, name))
            .await??)
    }

    pub async fn delete_task(
        &self,
        project_id: &str,
        node_id: &str,
        policy: DeletePolicy,
    ) -> Result<Edit, ProjectError> {
        Ok(self
            .with_session(project_id, |session| session.delete(node_id, policy))
            .await??)
    }

    pub async fn move_task(
        &self,
        project_id: &str,
        node_id: &str,
        new_parent: Option<&str>,
        new_index: usize,
    ) -> Result<Edit, ProjectError> {
        Ok(self
            .with_session(project_id, |session| {
                session.move_node(node_id, new_parent, new_index)
            })
            .await??)
    }

    pub async fn rename_task(
        &self,
        project_id: &str,
        node_id: &str,
        name: String,
    ) -> Result<Edit, ProjectError> {
        self.with_session(project_id, |session| session.rename(node_id, name))
            .await
    }

    pub async fn undo(&self, project_id: &str) -> Result<SessionView, ProjectError> {
        self.with_session(project_id, |session| {
            session.undo();
            session.view()
        })
        .await
    }

    pub async fn redo(&self, project_id: &str) -> Result<SessionView, ProjectError> {
        self.with_session(project_id, |session| {
            session.redo();
            session.view()
        })
        .await
    }

    /// Writes the session's forest back as the project's active rows. Edits
    /// made while the write is in flight keep the session dirty.
    pub async fn save_tree(&self, project_id: &str) -> Result<Project, ProjectError> {
        let (rows, revision) = self
            .with_session(project_id, |session| session.snapshot())
            .await?;
        let project = self.pipeline.save_tree(project_id, rows).await?;
        self.with_session(project_id, |session| session.mark_saved(revision))
            .await?;
        Ok(project)
    }

    /// Throws away unsaved edits
    pub fn discard_session(&self, project_id: &str) -> bool {
        self.sessions().remove(project_id).is_some()
    }
}
