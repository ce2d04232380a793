//! WBS renumbering
//!
//! After any structural change the WBS id of every node must again encode its
//! position: `parent.wbs_id + "." + (sibling position)`, or just the position
//! for roots. Renumbering is the only place positional fields are written.

use crate::models::{Forest, TreeTask};
use crate::wbs_id;

/// Recomputes WBS ids, parent links, outline levels and sibling order indexes
/// for the whole forest, preserving sibling order. Idempotent.
pub fn renumber(mut forest: Forest) -> Forest {
    renumber_in_place(&mut forest);
    forest
}

/// In-place form of [`renumber`]
pub fn renumber_in_place(forest: &mut [TreeTask]) {
    fn walk(nodes: &mut [TreeTask], parent: Option<(&str, &str)>, level: u32) {
        for (position, node) in nodes.iter_mut().enumerate() {
            let wbs = wbs_id::render(parent.map(|(_, wbs)| wbs), position + 1);
            node.parent_id = parent.map(|(id, _)| id.to_string());
            node.order_index = position;
            node.outline_level = level;

            let id = node.id.clone();
            walk(&mut node.children, Some((id.as_str(), wbs.as_str())), level + 1);
            node.wbs_id = Some(wbs);
        }
    }

    walk(forest, None, 1);
}

/// Returns true if every positional field already matches what [`renumber`]
/// would assign
pub fn is_renumbered(forest: &[TreeTask]) -> bool {
    fn check(nodes: &[TreeTask], parent: Option<(&str, &str)>, level: u32) -> bool {
        nodes.iter().enumerate().all(|(position, node)| {
            let wbs = wbs_id::render(parent.map(|(_, wbs)| wbs), position + 1);
            node.wbs_id.as_deref() == Some(wbs.as_str())
                && node.parent_id.as_deref() == parent.map(|(id, _)| id)
                && node.order_index == position
                && node.outline_level == level
                && check(&node.children, Some((node.id.as_str(), wbs.as_str())), level + 1)
        })
    }

    check(forest, None, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Forest {
        let mut stale = TreeTask::new("b", "B");
        stale.wbs_id = Some("7.7".to_string());
        stale.parent_id = Some("nowhere".to_string());

        vec![
            TreeTask::new("a", "A").with_children(vec![
                stale.with_children(vec![TreeTask::new("c", "C")]),
                TreeTask::new("d", "D"),
            ]),
            TreeTask::new("e", "E"),
        ]
    }

    #[test]
    fn test_renumber_assigns_positional_ids() {
        let forest = renumber(sample());

        assert_eq!(forest[0].wbs_id.as_deref(), Some("1"));
        assert_eq!(forest[0].children[0].wbs_id.as_deref(), Some("1.1"));
        assert_eq!(forest[0].children[0].parent_id.as_deref(), Some("a"));
        assert_eq!(forest[0].children[0].children[0].wbs_id.as_deref(), Some("1.1.1"));
        assert_eq!(forest[0].children[0].children[0].outline_level, 3);
        assert_eq!(forest[0].children[1].wbs_id.as_deref(), Some("1.2"));
        assert_eq!(forest[0].children[1].order_index, 1);
        assert_eq!(forest[1].wbs_id.as_deref(), Some("2"));
        assert_eq!(forest[1].parent_id, None);
        assert!(is_renumbered(&forest));
    }

    #[test]
    fn test_renumber_is_idempotent() {
        let once = renumber(sample());
        let twice = renumber(once.clone());
        assert_eq!(twice, once);
    }

    #[test]
    fn test_is_renumbered_detects_stale_ids() {
        assert!(!is_renumbered(&sample()));
        assert!(is_renumbered(&[]));
    }
}
