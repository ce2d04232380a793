//! Conversions between flat task lists and forests
//!
//! Upstream producers address tasks two ways: model output carries WBS ids,
//! storage rows carry parent references. Both are accepted here. Input is never
//! trusted to be well formed, so nothing in this module fails or drops a task:
//! unresolved parents, malformed ids and reference cycles all degrade to root
//! placement.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::models::{
    metadata_from_record, metadata_to_record, FlatTask, Forest, IdGenerator, TaskRow, TreeTask,
};
use crate::wbs_id::{self, WbsId};

/// Shorthand for the position of a node: child offsets from the forest root
pub type Index = Vec<usize>;

/// How a flat list expresses its hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// The parent is derived from each task's WBS id
    WbsId,
    /// The parent is the task whose `id` equals `parent_id`
    ParentRef,
}

/// Builds a forest out of a flat list.
///
/// Declared WBS ids are kept as they are; use [`crate::renumber::renumber`]
/// to make them positional. Input ids are kept when present and unique,
/// anything else gets a fresh id.
pub fn build_tree(flat: &[FlatTask], addressing: Addressing, ids: &mut IdGenerator) -> Forest {
    let mut used = HashSet::new();
    let nodes: Vec<TreeTask> = flat
        .iter()
        .map(|task| {
            let id = match task.id.as_deref() {
                Some(id) if !id.is_empty() && !used.contains(id) => id.to_string(),
                _ => fresh_id(ids, &used),
            };
            used.insert(id.clone());

            TreeTask {
                id,
                name: task.name.clone(),
                outline_level: task.outline_level,
                wbs_id: task.wbs_id.clone(),
                parent_id: None,
                description: task.description.clone(),
                metadata: task.metadata.clone(),
                children: Vec::new(),
                order_index: 0,
            }
        })
        .collect();

    let mut parents = match addressing {
        Addressing::WbsId => wbs_parents(flat),
        Addressing::ParentRef => reference_parents(flat),
    };
    break_cycles(&mut parents);

    let mut children_of: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut roots = Vec::new();
    for (idx, parent) in parents.iter().enumerate() {
        match parent {
            Some(p) => children_of[*p].push(idx),
            None => roots.push(idx),
        }
    }

    roots
        .iter()
        .enumerate()
        .map(|(position, &idx)| assemble(idx, position, None, 1, &nodes, &children_of))
        .collect()
}

fn fresh_id(ids: &mut IdGenerator, used: &HashSet<String>) -> String {
    loop {
        let candidate = ids.next_id();
        if !used.contains(&candidate) {
            return candidate;
        }
    }
}

/// Parent slot per task, found through the WBS id. The first task carrying a
/// given id is the one children attach to.
fn wbs_parents(flat: &[FlatTask]) -> Vec<Option<usize>> {
    let parsed: Vec<Option<WbsId>> = flat
        .iter()
        .map(|t| t.wbs_id.as_deref().and_then(wbs_id::parse_lenient))
        .collect();

    let mut by_id: HashMap<&WbsId, usize> = HashMap::new();
    for (idx, id) in parsed.iter().enumerate() {
        if let Some(id) = id {
            by_id.entry(id).or_insert(idx);
        }
    }

    parsed
        .iter()
        .map(|id| {
            id.as_ref()
                .and_then(WbsId::parent)
                .and_then(|parent| by_id.get(&parent).copied())
        })
        .collect()
}

/// Parent slot per task, found through `parent_id`
fn reference_parents(flat: &[FlatTask]) -> Vec<Option<usize>> {
    let mut by_id: HashMap<&str, usize> = HashMap::new();
    for (idx, task) in flat.iter().enumerate() {
        if let Some(id) = task.id.as_deref().filter(|id| !id.is_empty()) {
            by_id.entry(id).or_insert(idx);
        }
    }

    flat.iter()
        .map(|task| {
            task.parent_id
                .as_deref()
                .and_then(|parent| by_id.get(parent).copied())
        })
        .collect()
}

/// Any node whose ancestor chain leads back to itself becomes a root
fn break_cycles(parents: &mut [Option<usize>]) {
    for idx in 0..parents.len() {
        let mut cursor = parents[idx];
        let mut steps = 0;
        while let Some(p) = cursor {
            if p == idx {
                parents[idx] = None;
                break;
            }
            steps += 1;
            if steps > parents.len() {
                break;
            }
            cursor = parents[p];
        }
    }
}

fn assemble(
    idx: usize,
    position: usize,
    parent_id: Option<&str>,
    level: u32,
    nodes: &[TreeTask],
    children_of: &[Vec<usize>],
) -> TreeTask {
    let mut node = nodes[idx].clone();
    node.parent_id = parent_id.map(str::to_string);
    node.order_index = position;
    node.outline_level = level;
    node.children = children_of[idx]
        .iter()
        .enumerate()
        .map(|(child_pos, &child)| {
            assemble(
                child,
                child_pos,
                Some(nodes[idx].id.as_str()),
                level + 1,
                nodes,
                children_of,
            )
        })
        .collect();
    node
}

/// Flattens a forest depth-first (parent before children, children in sibling
/// order).
///
/// WBS ids are emitted positionally, so the output is self-consistent in
/// either addressing mode. With [`Addressing::ParentRef`] each task carries its
/// parent's id; with [`Addressing::WbsId`] the id alone encodes the hierarchy.
pub fn flatten_tree(forest: &[TreeTask], addressing: Addressing) -> Vec<FlatTask> {
    fn walk(
        nodes: &[TreeTask],
        parent: Option<(&str, &str)>,
        level: u32,
        addressing: Addressing,
        out: &mut Vec<FlatTask>,
    ) {
        for (position, node) in nodes.iter().enumerate() {
            let wbs = wbs_id::render(parent.map(|(_, wbs)| wbs), position + 1);
            out.push(FlatTask {
                id: Some(node.id.clone()),
                name: node.name.clone(),
                outline_level: level,
                wbs_id: Some(wbs.clone()),
                parent_id: match addressing {
                    Addressing::ParentRef => parent.map(|(id, _)| id.to_string()),
                    Addressing::WbsId => None,
                },
                description: node.description.clone(),
                metadata: node.metadata.clone(),
            });
            walk(
                &node.children,
                Some((node.id.as_str(), wbs.as_str())),
                level + 1,
                addressing,
                out,
            );
        }
    }

    let mut out = Vec::new();
    walk(forest, None, 1, addressing, &mut out);
    out
}

/// Every node in pre-order, as declared (no renumbering)
pub fn preorder(forest: &[TreeTask]) -> Vec<&TreeTask> {
    fn walk<'a>(nodes: &'a [TreeTask], out: &mut Vec<&'a TreeTask>) {
        for node in nodes {
            out.push(node);
            walk(&node.children, out);
        }
    }

    let mut out = Vec::new();
    walk(forest, &mut out);
    out
}

/// Picks how a flat list links its tasks: by WBS id when every task carries a
/// usable one, by parent reference when some do not and any task names a
/// parent, by WBS id otherwise
pub fn detect_addressing(flat: &[FlatTask]) -> Addressing {
    let numbered = flat
        .iter()
        .all(|t| t.wbs_id.as_deref().and_then(wbs_id::parse_lenient).is_some());
    if !numbered && flat.iter().any(|t| t.parent_id.is_some()) {
        Addressing::ParentRef
    } else {
        Addressing::WbsId
    }
}

/// Guesses whether an untyped list is flat.
///
/// Any non-empty `children` means it is already a tree. Otherwise a non-null
/// parent reference, or a dotted WBS id (a tree would have nested it), means
/// it is flat. A list of bare roots is treated as a tree.
pub fn is_flat_representation(items: &[Value]) -> bool {
    let has_children = items.iter().any(|item| {
        item.get("children")
            .and_then(Value::as_array)
            .map_or(false, |children| !children.is_empty())
    });
    if has_children {
        return false;
    }

    let has_parent = items.iter().any(|item| {
        item.get("parentId")
            .or_else(|| item.get("parent_id"))
            .map_or(false, |p| !p.is_null())
    });
    if has_parent {
        return true;
    }

    items.iter().any(|item| {
        item.get("wbsId")
            .and_then(Value::as_str)
            .map_or(false, |id| id.contains('.'))
    })
}

/// Flattens a forest into storage rows; `order_index` is the pre-order position
pub fn to_rows(forest: &[TreeTask]) -> Vec<TaskRow> {
    flatten_tree(forest, Addressing::ParentRef)
        .into_iter()
        .enumerate()
        .map(|(order_index, task)| TaskRow {
            id: task.id.unwrap_or_default(),
            name: task.name,
            indent_level: task.outline_level,
            parent_id: task.parent_id,
            order_index,
            wbs_id: task.wbs_id,
            metadata: Value::Object(metadata_to_record(&task.metadata)).to_string(),
        })
        .collect()
}

/// Reads storage rows back into parent-addressed flat tasks, in `order_index`
/// order. Unreadable metadata is dropped rather than failing the load.
pub fn rows_to_flat(rows: &[TaskRow]) -> Vec<FlatTask> {
    let mut sorted: Vec<&TaskRow> = rows.iter().collect();
    sorted.sort_by_key(|row| row.order_index);

    sorted
        .into_iter()
        .map(|row| {
            let metadata = match serde_json::from_str::<Map<String, Value>>(&row.metadata) {
                Ok(record) => metadata_from_record(&record),
                Err(e) => {
                    if !row.metadata.trim().is_empty() {
                        tracing::warn!("Dropping unreadable metadata on row {}: {}", row.id, e);
                    }
                    Vec::new()
                }
            };
            FlatTask {
                id: Some(row.id.clone()),
                name: row.name.clone(),
                outline_level: row.indent_level,
                wbs_id: row.wbs_id.clone(),
                parent_id: row.parent_id.clone(),
                description: None,
                metadata,
            }
        })
        .collect()
}

/// Gives every node a non-empty id that is unique in the forest
pub fn ensure_ids(forest: &mut [TreeTask], ids: &mut IdGenerator) {
    fn walk(nodes: &mut [TreeTask], used: &mut HashSet<String>, ids: &mut IdGenerator) {
        for node in nodes.iter_mut() {
            if node.id.is_empty() || used.contains(&node.id) {
                node.id = fresh_id(ids, used);
            }
            used.insert(node.id.clone());
            walk(&mut node.children, used, ids);
        }
    }

    let mut used = HashSet::new();
    walk(forest, &mut used, ids);
}

/// Finds the index path of the node with `id`
pub fn find_path(forest: &[TreeTask], id: &str) -> Option<Index> {
    for (i, node) in forest.iter().enumerate() {
        if node.id == id {
            return Some(vec![i]);
        }
        if let Some(mut rest) = find_path(&node.children, id) {
            rest.insert(0, i);
            return Some(rest);
        }
    }
    None
}

/// Gets the node at the given index path
pub fn task_at<'a>(forest: &'a [TreeTask], index: &[usize]) -> Option<&'a TreeTask> {
    let (&first, rest) = index.split_first()?;
    let mut current = forest.get(first)?;
    for &idx in rest {
        current = current.children.get(idx)?;
    }
    Some(current)
}

/// Gets the sibling list that contains the node at `index` (the forest itself
/// for a root), mutably
pub(crate) fn siblings_mut<'a>(
    forest: &'a mut Vec<TreeTask>,
    index: &[usize],
) -> Option<&'a mut Vec<TreeTask>> {
    match index.split_last() {
        None => None,
        Some((_, [])) => Some(forest),
        Some((_, parent)) => children_mut(forest, parent),
    }
}

/// Gets the children of the node at `index` mutably
pub(crate) fn children_mut<'a>(
    forest: &'a mut Vec<TreeTask>,
    index: &[usize],
) -> Option<&'a mut Vec<TreeTask>> {
    let (&first, rest) = index.split_first()?;
    let mut current = forest.get_mut(first)?;
    for &idx in rest {
        current = current.children.get_mut(idx)?;
    }
    Some(&mut current.children)
}
