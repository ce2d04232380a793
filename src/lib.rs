//! wbs-engine library crate
//!
//! Builds, numbers and edits work breakdown structure (WBS) task trees, and
//! compares the task lists several models extract from the same document.

pub mod api;
pub mod cli;
pub mod consensus;
pub mod models;
pub mod mutate;
pub mod pipeline;
pub mod project;
pub mod renumber;
pub mod session;
pub mod tree;
pub mod wbs_id;

// Re-export key types for convenience
pub use models::{
    ComparedTask, ComparisonResult, FlatTask, Forest, IdGenerator, ModelResults, Project,
    ProjectError, TaskList, TaskRow, TaskStatus, TreeTask,
};
pub use mutate::{DeletePolicy, Edit, EditOutcome};
pub use pipeline::{MemoryStore, ModelAdapter, Pipeline, PipelineConfig, ProjectStore};
pub use project::Core;
pub use session::{EditSession, SessionView};
pub use tree::Addressing;
pub use wbs_id::WbsId;
