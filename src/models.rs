//! Core models for the wbs-engine library
//!
//! This module contains the data types shared by the tree, consensus and
//! pipeline layers, plus the conversions the storage boundary needs.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tree;

/// A single `{key, value}` metadata pair
///
/// Metadata is an ordered list rather than a map: duplicate keys and insertion
/// order must survive round-trips through the model and UI layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: MetadataValue,
}

impl MetadataEntry {
    pub fn new(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Metadata values are either numbers or free text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(f64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Number(value)
    }
}

/// Converts ordered metadata into the record form the storage layer keeps.
/// Later duplicates win.
pub fn metadata_to_record(metadata: &[MetadataEntry]) -> Map<String, Value> {
    let mut record = Map::new();
    for entry in metadata {
        let value = match &entry.value {
            MetadataValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(n.to_string())),
            MetadataValue::Text(s) => Value::String(s.clone()),
        };
        record.insert(entry.key.clone(), value);
    }
    record
}

/// Converts a stored metadata record back into ordered entries.
/// Strings that look like numbers become numbers.
pub fn metadata_from_record(record: &Map<String, Value>) -> Vec<MetadataEntry> {
    record
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(MetadataValue::Number)
                    .unwrap_or_else(|| MetadataValue::Text(n.to_string())),
                Value::String(s) => match s.trim().parse::<f64>() {
                    Ok(n) if n.is_finite() && !s.trim().is_empty() => MetadataValue::Number(n),
                    _ => MetadataValue::Text(s.clone()),
                },
                other => MetadataValue::Text(other.to_string()),
            };
            MetadataEntry {
                key: key.clone(),
                value,
            }
        })
        .collect()
}

fn default_outline_level() -> u32 {
    1
}

/// One task as stored or as received from a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_outline_level", alias = "indentLevel")]
    pub outline_level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wbs_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

impl FlatTask {
    /// Creates a top-level task with only a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            outline_level: 1,
            wbs_id: None,
            parent_id: None,
            description: None,
            metadata: Vec::new(),
        }
    }

    /// Creates a WBS-addressed task
    pub fn with_wbs(wbs_id: impl Into<String>, name: impl Into<String>) -> Self {
        let wbs_id = wbs_id.into();
        Self {
            outline_level: crate::wbs_id::depth(&wbs_id) as u32 + 1,
            wbs_id: Some(wbs_id),
            ..Self::named(name)
        }
    }

    /// Creates a parent-addressed task
    pub fn with_parent(
        id: impl Into<String>,
        parent_id: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            parent_id: parent_id.map(str::to_string),
            ..Self::named(name)
        }
    }
}

/// A task placed in a forest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeTask {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "default_outline_level", alias = "indentLevel")]
    pub outline_level: u32,
    #[serde(default)]
    pub wbs_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    #[serde(default)]
    pub children: Vec<TreeTask>,
    #[serde(default)]
    pub order_index: usize,
}

impl TreeTask {
    /// Creates a detached node; positional fields are filled in by renumbering
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            outline_level: 1,
            wbs_id: None,
            parent_id: None,
            description: None,
            metadata: Vec::new(),
            children: Vec::new(),
            order_index: 0,
        }
    }

    /// Creates a placeholder node for an "add task" action
    pub fn placeholder(ids: &mut IdGenerator) -> Self {
        Self::new(ids.next_id(), "New Task")
    }

    /// Builder-style helper to attach children
    pub fn with_children(mut self, children: Vec<TreeTask>) -> Self {
        self.children = children;
        self
    }

    /// Number of nodes in this subtree, including this one
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(TreeTask::subtree_len).sum::<usize>()
    }

    /// Returns true if a node with `id` is part of this subtree
    pub fn contains(&self, id: &str) -> bool {
        self.id == id || self.children.iter().any(|c| c.contains(id))
    }
}

/// A rooted forest of tasks; sibling order is the vector order
pub type Forest = Vec<TreeTask>;

/// A model's task list with its representation declared explicitly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "representation", content = "tasks", rename_all = "snake_case")]
pub enum TaskList {
    Flat(Vec<FlatTask>),
    Tree(Forest),
}

impl Default for TaskList {
    fn default() -> Self {
        TaskList::Flat(Vec::new())
    }
}

impl TaskList {
    /// Classifies an untyped list with [`tree::is_flat_representation`].
    /// Only for callers that cannot declare the representation themselves.
    pub fn from_untyped(items: Vec<Value>) -> Result<Self, serde_json::Error> {
        if tree::is_flat_representation(&items) {
            Ok(TaskList::Flat(serde_json::from_value(Value::Array(items))?))
        } else {
            Ok(TaskList::Tree(serde_json::from_value(Value::Array(items))?))
        }
    }

    /// Every task in pre-order with its declared WBS id, children edges dropped
    pub fn entries(&self) -> Vec<FlatTask> {
        match self {
            TaskList::Flat(tasks) => tasks.clone(),
            TaskList::Tree(forest) => tree::preorder(forest)
                .into_iter()
                .map(|node| FlatTask {
                    id: Some(node.id.clone()),
                    name: node.name.clone(),
                    outline_level: node.outline_level,
                    wbs_id: node.wbs_id.clone(),
                    parent_id: None,
                    description: node.description.clone(),
                    metadata: node.metadata.clone(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TaskList::Flat(tasks) => tasks.len(),
            TaskList::Tree(forest) => forest.iter().map(TreeTask::subtree_len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorts a model's output by WBS id. Trees are sorted sibling by sibling.
    pub fn sort_by_wbs_id(&mut self) {
        fn sort_forest(forest: &mut [TreeTask]) {
            forest.sort_by(|a, b| {
                crate::wbs_id::compare_optional(a.wbs_id.as_deref(), b.wbs_id.as_deref())
            });
            for node in forest.iter_mut() {
                sort_forest(&mut node.children);
            }
        }

        match self {
            TaskList::Flat(tasks) => crate::wbs_id::sort_by_wbs_id(tasks),
            TaskList::Tree(forest) => sort_forest(forest),
        }
    }

    /// Builds a forest out of this list. Flat lists are addressed the way
    /// [`tree::detect_addressing`] reads them.
    pub fn to_forest(&self, ids: &mut IdGenerator) -> Forest {
        match self {
            TaskList::Flat(tasks) => tree::build_tree(tasks, tree::detect_addressing(tasks), ids),
            TaskList::Tree(forest) => {
                let mut forest = forest.clone();
                tree::ensure_ids(&mut forest, ids);
                forest
            }
        }
    }
}

/// A storage row, addressed by `parent_id` and `indent_level`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: String,
    pub name: String,
    pub indent_level: u32,
    pub parent_id: Option<String>,
    pub order_index: usize,
    pub wbs_id: Option<String>,
    /// JSON object text
    pub metadata: String,
}

/// A model's output, or the reason it has none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResults<T> {
    pub model: String,
    pub results: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Default> ModelResults<T> {
    pub fn success(model: impl Into<String>, results: T) -> Self {
        Self {
            model: model.into(),
            results,
            error: None,
        }
    }

    pub fn failure(model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            results: T::default(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Agreement status of a compared task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pass,
    NeedsReview,
}

/// One row of the cross-model comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparedTask {
    pub wbs_id: String,
    pub name: String,
    pub status: TaskStatus,
    /// Models that contributed this task, in input order
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discrepancies: Option<String>,
}

/// The consolidated cross-model view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub tasks: Vec<ComparedTask>,
    pub summary: String,
}

impl ComparisonResult {
    pub fn pass_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pass)
            .count()
    }

    pub fn review_count(&self) -> usize {
        self.tasks.len() - self.pass_count()
    }
}

/// The persisted project document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub file_key: String,
    /// Extracted document text, reused when a single model is rerun
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default)]
    pub model_results: Vec<ModelResults<TaskList>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_result: Option<ComparisonResult>,
    /// The active, user-editable task list
    #[serde(default)]
    pub tree: Vec<TaskRow>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, file_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            file_key: file_key.into(),
            document: None,
            model_results: Vec::new(),
            comparison_result: None,
            tree: Vec::new(),
            created_at: Utc::now(),
            last_updated: None,
        }
    }

    pub fn model_result(&self, model: &str) -> Option<&ModelResults<TaskList>> {
        self.model_results.iter().find(|r| r.model == model)
    }

    /// Replaces the entry for the same model, or appends a new one
    pub fn upsert_model_result(&mut self, result: ModelResults<TaskList>) {
        match self.model_results.iter_mut().find(|r| r.model == result.model) {
            Some(existing) => *existing = result,
            None => self.model_results.push(result),
        }
    }

    /// Removes a model's entry; returns whether one existed
    pub fn remove_model_result(&mut self, model: &str) -> bool {
        let before = self.model_results.len();
        self.model_results.retain(|r| r.model != model);
        before != self.model_results.len()
    }

    pub fn touch(&mut self) {
        self.last_updated = Some(Utc::now());
    }
}

/// Generates ids for new nodes
#[derive(Debug, Clone)]
pub struct IdGenerator {
    rng: StdRng,
}

impl IdGenerator {
    /// An entropy-seeded generator
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// A deterministic generator, for tests and replays
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_id(&mut self) -> String {
        format!("{:016x}", self.rng.gen::<u64>())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents a single state transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: Option<String>,
}

impl TransitionLogEntry {
    pub fn new(action: String, details: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            details,
        }
    }
}

/// Violations of the forest's exclusive-ownership invariant.
/// These are programmer errors, never the result of untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForestError {
    #[error("node id '{0}' appears more than once in the forest")]
    DuplicateId(String),

    #[error("node id must not be empty")]
    EmptyId,
}

/// Errors from the persistence collaborator
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid project id '{0}'")]
    InvalidId(String),
}

/// Errors from a model adapter call
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid model output: {0}")]
    InvalidOutput(String),

    #[error("model call timed out after {0}s")]
    Timeout(u64),

    #[error("model '{0}' is not configured")]
    NotConfigured(String),

    #[error("model '{0}' does not support refinement")]
    RefineUnsupported(String),
}

/// Errors surfaced by project-level operations
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("model '{model}' has no results in project '{project}'")]
    ModelNotFound { project: String, model: String },

    #[error("model '{model}' failed and has no usable results: {error}")]
    ModelFailed { model: String, error: String },

    #[error("refining model '{model}' failed: {error}")]
    RefineFailed { model: String, error: String },

    #[error("project '{0}' has no extracted document to analyze")]
    MissingDocument(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Forest(#[from] ForestError),
}
