//! Edit sessions
//!
//! An edit session holds the forest a user is editing. Each applied edit
//! replaces the current snapshot and pushes the previous one on the undo
//! stack, so undo and redo are snapshot swaps rather than inverse operations.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::models::{Forest, ForestError, IdGenerator, TaskRow, TransitionLogEntry, TreeTask};
use crate::mutate::{self, DeletePolicy, Edit, EditOutcome};
use crate::renumber::renumber;
use crate::tree::{self, Addressing};

// Define the maximum size for the history buffer
const MAX_HISTORY_SIZE: usize = 20;
const MAX_UNDO_DEPTH: usize = 50;

/// A user's editable forest, with undo/redo and a transition log
#[derive(Debug, Clone)]
pub struct EditSession {
    forest: Forest,
    undo: VecDeque<Forest>,
    redo: Vec<Forest>,
    history: VecDeque<TransitionLogEntry>,
    ids: IdGenerator,
    dirty: bool,
    /// Bumped whenever the forest changes
    revision: u64,
}

/// Serializable view of a session for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub forest: Forest,
    pub can_undo: bool,
    pub can_redo: bool,
    pub dirty: bool,
    pub transition_history: Vec<TransitionLogEntry>,
}

impl EditSession {
    /// Starts a session on `forest`, renumbered
    pub fn new(forest: Forest, ids: IdGenerator) -> Self {
        Self {
            forest: renumber(forest),
            undo: VecDeque::with_capacity(MAX_UNDO_DEPTH),
            redo: Vec::new(),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            ids,
            dirty: false,
            revision: 0,
        }
    }

    /// Starts a session on stored rows
    pub fn from_rows(rows: &[TaskRow], mut ids: IdGenerator) -> Self {
        let forest = tree::build_tree(&tree::rows_to_flat(rows), Addressing::ParentRef, &mut ids);
        Self::new(forest, ids)
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionLogEntry> {
        self.history.iter()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            forest: self.forest.clone(),
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
            dirty: self.dirty,
            transition_history: self.history.iter().cloned().collect(),
        }
    }

    /// Logs a state transition, maintaining the history buffer size.
    fn log_transition(&mut self, action: &str, details: Option<String>) {
        if self.history.len() == MAX_HISTORY_SIZE {
            self.history.pop_front(); // Remove the oldest entry
        }
        self.history
            .push_back(TransitionLogEntry::new(action.to_string(), details));
    }

    fn commit(&mut self, action: &str, details: String, edit: Edit) -> Edit {
        if edit.is_applied() {
            if self.undo.len() == MAX_UNDO_DEPTH {
                self.undo.pop_front();
            }
            let previous = std::mem::replace(&mut self.forest, edit.forest.clone());
            self.undo.push_back(previous);
            self.redo.clear();
            self.dirty = true;
            self.revision += 1;
            self.log_transition(action, Some(details));
        } else {
            self.log_transition(
                &format!("{}_rejected", action),
                Some(format!("{} ({:?})", details, edit.outcome)),
            );
        }
        edit
    }

    /// Adds a placeholder task after `after`, or at the end of the roots
    pub fn add_task(&mut self, after: Option<&str>, name: Option<String>) -> Result<Edit, ForestError> {
        let mut node = TreeTask::placeholder(&mut self.ids);
        if let Some(name) = name {
            node.name = name;
        }
        self.insert(after, node)
    }

    /// Inserts a prepared node after `after`, or at the end of the roots
    pub fn insert(&mut self, after: Option<&str>, node: TreeTask) -> Result<Edit, ForestError> {
        let details = format!("Inserting '{}' after {:?}", node.name, after);
        let edit = mutate::insert_sibling(&self.forest, after, node)?;
        Ok(self.commit("insert_sibling", details, edit))
    }

    pub fn delete(&mut self, node_id: &str, policy: DeletePolicy) -> Result<Edit, ForestError> {
        let edit = mutate::delete(&self.forest, node_id, policy)?;
        Ok(self.commit(
            "delete",
            format!("Deleting {} ({:?})", node_id, policy),
            edit,
        ))
    }

    pub fn move_node(
        &mut self,
        node_id: &str,
        new_parent: Option<&str>,
        new_index: usize,
    ) -> Result<Edit, ForestError> {
        let edit = mutate::move_node(&self.forest, node_id, new_parent, new_index)?;
        Ok(self.commit(
            "move",
            format!("Moving {} under {:?} at {}", node_id, new_parent, new_index),
            edit,
        ))
    }

    /// Renames a node. Not structural, but still undoable.
    pub fn rename(&mut self, node_id: &str, name: String) -> Edit {
        let mut next = self.forest.clone();
        let outcome = match tree::find_path(&next, node_id) {
            Some(path) => {
                if let Some(node) = node_at_mut(&mut next, &path) {
                    node.name = name.clone();
                }
                EditOutcome::Applied
            }
            None => EditOutcome::NodeNotFound,
        };
        let edit = Edit {
            forest: if outcome == EditOutcome::Applied {
                next
            } else {
                self.forest.clone()
            },
            outcome,
        };
        self.commit("rename", format!("Renaming {} to '{}'", node_id, name), edit)
    }

    /// Restores the previous snapshot; returns false when there is none
    pub fn undo(&mut self) -> bool {
        match self.undo.pop_back() {
            Some(previous) => {
                let current = std::mem::replace(&mut self.forest, previous);
                self.redo.push(current);
                self.dirty = true;
                self.revision += 1;
                self.log_transition("undo", None);
                true
            }
            None => false,
        }
    }

    /// Re-applies the last undone snapshot; returns false when there is none
    pub fn redo(&mut self) -> bool {
        match self.redo.pop() {
            Some(next) => {
                let current = std::mem::replace(&mut self.forest, next);
                self.undo.push_back(current);
                self.dirty = true;
                self.revision += 1;
                self.log_transition("redo", None);
                true
            }
            None => false,
        }
    }

    /// Flattens the current forest into storage rows
    pub fn to_rows(&self) -> Vec<TaskRow> {
        tree::to_rows(&self.forest)
    }

    /// Rows to persist, tagged with the revision they were taken at
    pub fn snapshot(&self) -> (Vec<TaskRow>, u64) {
        (self.to_rows(), self.revision)
    }

    /// Marks the session clean if nothing changed since `revision` was
    /// saved. Returns whether it did.
    pub fn mark_saved(&mut self, revision: u64) -> bool {
        if revision != self.revision {
            self.log_transition(
                "save_superseded",
                Some(format!("saved revision {}, now at {}", revision, self.revision)),
            );
            return false;
        }
        self.dirty = false;
        self.log_transition("save", Some(format!("{} rows", self.to_rows().len())));
        true
    }
}

fn node_at_mut<'a>(forest: &'a mut [TreeTask], index: &[usize]) -> Option<&'a mut TreeTask> {
    let (&first, rest) = index.split_first()?;
    let mut current = forest.get_mut(first)?;
    for &idx in rest {
        current = current.children.get_mut(idx)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlatTask;

    fn session() -> EditSession {
        let flat = vec![
            FlatTask::with_wbs("1", "Site Prep"),
            FlatTask::with_wbs("1.1", "Clearing"),
            FlatTask::with_wbs("2", "Foundation"),
        ];
        let mut ids = IdGenerator::seeded(11);
        let forest = tree::build_tree(&flat, Addressing::WbsId, &mut ids);
        EditSession::new(forest, ids)
    }

    #[test]
    fn test_undo_redo_swaps_snapshots() {
        let mut session = session();
        let original = session.forest().clone();

        let edit = session.add_task(None, Some("Framing".to_string())).unwrap();
        assert!(edit.is_applied());
        assert_eq!(session.forest().len(), 3);
        assert!(session.is_dirty());

        assert!(session.undo());
        assert_eq!(session.forest(), &original);
        assert!(session.can_redo());

        assert!(session.redo());
        assert_eq!(session.forest().len(), 3);
        assert_eq!(session.forest()[2].wbs_id.as_deref(), Some("3"));
        assert!(!session.redo());
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut session = session();
        session.add_task(None, None).unwrap();
        session.undo();
        let first_id = session.forest()[0].id.clone();
        session.delete(&first_id, DeletePolicy::Cascade).unwrap();
        assert!(!session.can_redo());
        assert_eq!(session.forest().len(), 1);
    }

    #[test]
    fn test_rejected_edits_do_not_touch_undo_stack() {
        let mut session = session();
        let root = session.forest()[0].id.clone();
        let child = session.forest()[0].children[0].id.clone();

        let edit = session.move_node(&root, Some(&child), 0).unwrap();
        assert_eq!(edit.outcome, EditOutcome::CycleRejected);
        assert!(!session.can_undo());
        assert!(!session.is_dirty());
        assert_eq!(
            session.history().last().map(|e| e.action.as_str()),
            Some("move_rejected")
        );
    }

    #[test]
    fn test_rename_and_rows() {
        let mut session = session();
        let child = session.forest()[0].children[0].id.clone();
        assert!(session.rename(&child, "Clearing & Grubbing".to_string()).is_applied());

        let rows = session.to_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].name, "Clearing & Grubbing");
        assert_eq!(rows[1].wbs_id.as_deref(), Some("1.1"));

        assert!(session.mark_saved(session.revision()));
        assert!(!session.is_dirty());

        let reloaded = EditSession::from_rows(&rows, IdGenerator::seeded(1));
        assert_eq!(reloaded.forest(), session.forest());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut session = session();
        for _ in 0..(MAX_HISTORY_SIZE + 5) {
            session.rename("missing", "x".to_string());
        }
        assert_eq!(session.history().count(), MAX_HISTORY_SIZE);
    }

    #[test]
    fn test_edit_after_snapshot_stays_dirty() {
        let mut session = session();
        session.add_task(None, Some("Framing".to_string())).unwrap();
        let (rows, revision) = session.snapshot();
        assert_eq!(rows.len(), 4);

        // Edited while the snapshot was being written
        let first = session.forest()[0].id.clone();
        session.rename(&first, "Site Preparation".to_string());
        assert!(!session.mark_saved(revision));
        assert!(session.is_dirty());

        let (_, revision) = session.snapshot();
        assert!(session.mark_saved(revision));
        assert!(!session.is_dirty());

        // Undo moves away from the saved forest too
        session.undo();
        assert!(session.is_dirty());
        assert_ne!(session.revision(), revision);
    }
}
