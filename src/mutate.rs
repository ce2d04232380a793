//! Structural edits on a forest
//!
//! Every operation takes a forest snapshot and returns a new, renumbered one;
//! the input is never touched. Edits that cannot apply (unknown ids, a move
//! under the node's own subtree) leave the forest unchanged and say why in
//! [`EditOutcome`]. Only a forest that already breaks the ownership invariant
//! (duplicate ids) is an error.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::{Forest, ForestError, TreeTask};
use crate::renumber::renumber;
use crate::tree::{children_mut, find_path, siblings_mut, task_at};

/// What happens to a deleted node's children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Remove the node and its whole subtree
    Cascade,
    /// Remove only the node; its children take its place among its siblings
    PromoteChildren,
}

/// Whether an edit applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOutcome {
    Applied,
    /// The node being edited is not in the forest
    NodeNotFound,
    /// The anchor or destination node is not in the forest
    TargetNotFound,
    /// The move would place a node beneath itself
    CycleRejected,
}

/// The result of an edit: the forest to show next, and whether it changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub forest: Forest,
    pub outcome: EditOutcome,
}

impl Edit {
    fn applied(forest: Forest) -> Self {
        Self {
            forest: renumber(forest),
            outcome: EditOutcome::Applied,
        }
    }

    fn unchanged(forest: &[TreeTask], outcome: EditOutcome) -> Self {
        tracing::debug!("Edit not applied: {:?}", outcome);
        Self {
            forest: renumber(forest.to_vec()),
            outcome,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.outcome == EditOutcome::Applied
    }
}

/// Checks the exclusive-ownership invariant: every node id is non-empty and
/// appears exactly once
pub fn validate(forest: &[TreeTask]) -> Result<(), ForestError> {
    fn walk(nodes: &[TreeTask], seen: &mut HashSet<String>) -> Result<(), ForestError> {
        for node in nodes {
            if node.id.is_empty() {
                return Err(ForestError::EmptyId);
            }
            if !seen.insert(node.id.clone()) {
                return Err(ForestError::DuplicateId(node.id.clone()));
            }
            walk(&node.children, seen)?;
        }
        Ok(())
    }

    walk(forest, &mut HashSet::new())
}

/// Inserts `node` (with its subtree) right after `after` among that node's
/// siblings, or appends it to the roots when `after` is `None`.
pub fn insert_sibling(
    forest: &[TreeTask],
    after: Option<&str>,
    node: TreeTask,
) -> Result<Edit, ForestError> {
    validate(forest)?;
    validate(std::slice::from_ref(&node))?;
    for incoming in crate::tree::preorder(std::slice::from_ref(&node)) {
        if forest.iter().any(|n| n.contains(&incoming.id)) {
            return Err(ForestError::DuplicateId(incoming.id.clone()));
        }
    }

    let mut next = forest.to_vec();
    match after {
        None => next.push(node),
        Some(anchor) => {
            let Some(path) = find_path(&next, anchor) else {
                return Ok(Edit::unchanged(forest, EditOutcome::TargetNotFound));
            };
            let position = path[path.len() - 1] + 1;
            match siblings_mut(&mut next, &path) {
                Some(siblings) => siblings.insert(position, node),
                None => return Ok(Edit::unchanged(forest, EditOutcome::TargetNotFound)),
            }
        }
    }

    Ok(Edit::applied(next))
}

/// Deletes the node with `node_id` according to `policy`. Unknown ids are a
/// no-op.
pub fn delete(forest: &[TreeTask], node_id: &str, policy: DeletePolicy) -> Result<Edit, ForestError> {
    validate(forest)?;

    let mut next = forest.to_vec();
    let Some(path) = find_path(&next, node_id) else {
        return Ok(Edit::unchanged(forest, EditOutcome::NodeNotFound));
    };
    let position = path[path.len() - 1];
    let Some(siblings) = siblings_mut(&mut next, &path) else {
        return Ok(Edit::unchanged(forest, EditOutcome::NodeNotFound));
    };

    let removed = siblings.remove(position);
    if policy == DeletePolicy::PromoteChildren {
        for (offset, child) in removed.children.into_iter().enumerate() {
            siblings.insert(position + offset, child);
        }
    }

    Ok(Edit::applied(next))
}

/// Moves the node with `node_id` (and its subtree) to `new_index` among the
/// children of `new_parent`, or among the roots when `new_parent` is `None`.
///
/// `new_index` counts positions after the node has been detached and is
/// clamped to the end of the destination. Moving a node under itself or any of
/// its descendants is rejected.
pub fn move_node(
    forest: &[TreeTask],
    node_id: &str,
    new_parent: Option<&str>,
    new_index: usize,
) -> Result<Edit, ForestError> {
    validate(forest)?;

    let Some(path) = find_path(forest, node_id) else {
        return Ok(Edit::unchanged(forest, EditOutcome::NodeNotFound));
    };

    if let Some(parent) = new_parent {
        let moving = task_at(forest, &path);
        if moving.map_or(false, |node| node.contains(parent)) {
            return Ok(Edit::unchanged(forest, EditOutcome::CycleRejected));
        }
        if find_path(forest, parent).is_none() {
            return Ok(Edit::unchanged(forest, EditOutcome::TargetNotFound));
        }
    }

    let mut next = forest.to_vec();
    let position = path[path.len() - 1];
    let node = match siblings_mut(&mut next, &path) {
        Some(siblings) => siblings.remove(position),
        None => return Ok(Edit::unchanged(forest, EditOutcome::NodeNotFound)),
    };

    let destination = match new_parent {
        None => Some(&mut next),
        Some(parent) => match find_path(&next, parent) {
            Some(parent_path) => children_mut(&mut next, &parent_path),
            None => None,
        },
    };
    let Some(destination) = destination else {
        return Ok(Edit::unchanged(forest, EditOutcome::TargetNotFound));
    };

    let index = new_index.min(destination.len());
    destination.insert(index, node);

    Ok(Edit::applied(next))
}
