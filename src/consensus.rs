//! Cross-model consensus
//!
//! Reconciles independently numbered task lists into one comparison. Rows are
//! keyed by WBS id; a model that lacks the id may still contribute through an
//! exact name match, which is reported as a discrepancy. Each task contributes
//! to at most one row.

use std::collections::BTreeSet;

use crate::models::{
    ComparedTask, ComparisonResult, FlatTask, Forest, IdGenerator, ModelResults, ProjectError,
    TaskList, TaskStatus,
};
use crate::renumber::renumber;
use crate::tree::{self, Addressing};
use crate::wbs_id::{self, WbsId};

/// One model's tasks, with the entries already claimed by a row
struct Candidate<'a> {
    model: &'a str,
    error: Option<&'a str>,
    entries: Vec<FlatTask>,
    parsed: Vec<Option<WbsId>>,
    claimed: Vec<bool>,
}

impl<'a> Candidate<'a> {
    fn new(result: &'a ModelResults<TaskList>) -> Self {
        let entries = if result.is_error() {
            Vec::new()
        } else {
            result.results.entries()
        };
        let parsed = entries
            .iter()
            .map(|e| e.wbs_id.as_deref().and_then(wbs_id::parse_lenient))
            .collect();
        let claimed = vec![false; entries.len()];

        Self {
            model: &result.model,
            error: result.error.as_deref(),
            entries,
            parsed,
            claimed,
        }
    }

    fn unclaimed_exact(&self, id: &WbsId) -> Option<usize> {
        (0..self.entries.len()).find(|&i| !self.claimed[i] && self.parsed[i].as_ref() == Some(id))
    }

    fn unclaimed_named(&self, name: &str) -> Vec<usize> {
        (0..self.entries.len())
            .filter(|&i| !self.claimed[i] && self.entries[i].name == name)
            .collect()
    }

    fn next_unclaimed(&self) -> Option<usize> {
        self.claimed.iter().position(|claimed| !claimed)
    }
}

/// Compares every model's task list. Must be called with the complete set of
/// current results; rows are never patched incrementally.
pub fn compare(results: &[ModelResults<TaskList>]) -> ComparisonResult {
    let mut candidates: Vec<Candidate<'_>> = results.iter().map(Candidate::new).collect();

    let buckets: BTreeSet<WbsId> = candidates
        .iter()
        .flat_map(|c| c.parsed.iter().flatten().cloned())
        .collect();

    let mut tasks = Vec::new();
    for bucket in &buckets {
        let representative = candidates
            .iter()
            .enumerate()
            .find_map(|(m, c)| c.unclaimed_exact(bucket).map(|i| (m, i)));
        // Every task with this id was already taken by a name match
        if let Some(representative) = representative {
            tasks.push(reconcile(&mut candidates, Some(bucket), representative));
        }
    }

    // Unnumbered tasks and duplicate ids nobody claimed
    loop {
        let next = candidates
            .iter()
            .enumerate()
            .find_map(|(m, c)| c.next_unclaimed().map(|i| (m, i)));
        match next {
            Some(representative) => tasks.push(reconcile(&mut candidates, None, representative)),
            None => break,
        }
    }

    let summary = summarize(results, &tasks);
    tracing::debug!("{}", summary);
    ComparisonResult { tasks, summary }
}

fn reconcile(
    candidates: &mut [Candidate<'_>],
    bucket: Option<&WbsId>,
    (rep_model, rep_entry): (usize, usize),
) -> ComparedTask {
    let rep = candidates[rep_model].entries[rep_entry].clone();
    let rep_parsed = candidates[rep_model].parsed[rep_entry].is_some();
    let wbs_label = match bucket {
        Some(id) => id.to_string(),
        None => rep.wbs_id.clone().unwrap_or_default(),
    };

    let mut sources = Vec::new();
    let mut names: Vec<(&str, String)> = Vec::new();
    let mut missing = Vec::new();
    let mut failed = Vec::new();
    let mut misnumbered = Vec::new();
    let mut ambiguous = Vec::new();

    for (m, candidate) in candidates.iter_mut().enumerate() {
        let model = candidate.model;
        if let Some(error) = candidate.error {
            failed.push(format!("{} ({})", model, error));
            continue;
        }

        let found = if m == rep_model {
            Some(rep_entry)
        } else if let Some(i) = bucket.and_then(|id| candidate.unclaimed_exact(id)) {
            Some(i)
        } else {
            let named = candidate.unclaimed_named(&rep.name);
            if named.len() > 1 {
                ambiguous.push(format!("{} has {} tasks named \"{}\"", model, named.len(), rep.name));
            }
            named.first().copied()
        };

        let Some(i) = found else {
            missing.push(model);
            continue;
        };

        candidate.claimed[i] = true;
        let entry = &candidate.entries[i];
        let aligned = match bucket {
            Some(id) => candidate.parsed[i].as_ref() == Some(id),
            None => entry.wbs_id == rep.wbs_id,
        };
        if !aligned {
            misnumbered.push(format!(
                "{}={}",
                model,
                entry.wbs_id.as_deref().unwrap_or("none")
            ));
        }
        sources.push(model.to_string());
        names.push((model, entry.name.clone()));
    }

    let mut notes = Vec::new();
    if bucket.is_none() {
        if rep_parsed {
            notes.push(format!("duplicate WBS id {}", wbs_label));
        } else {
            notes.push("no usable WBS id".to_string());
        }
    }
    if !missing.is_empty() {
        notes.push(format!("missing in {}", missing.join(", ")));
    }
    if !failed.is_empty() {
        notes.push(format!("failed: {}", failed.join(", ")));
    }
    if names.iter().any(|(_, name)| *name != rep.name) {
        let listed: Vec<String> = names
            .iter()
            .map(|(model, name)| format!("{}=\"{}\"", model, name))
            .collect();
        notes.push(format!("name mismatch: {}", listed.join(", ")));
    }
    if !misnumbered.is_empty() {
        notes.push(format!(
            "matched by name with a different WBS id: {}",
            misnumbered.join(", ")
        ));
    }
    if !ambiguous.is_empty() {
        notes.push(format!("ambiguous name match, first taken: {}", ambiguous.join(", ")));
    }

    let (status, discrepancies) = if notes.is_empty() {
        (TaskStatus::Pass, None)
    } else {
        (TaskStatus::NeedsReview, Some(notes.join("; ")))
    };

    ComparedTask {
        wbs_id: wbs_label,
        name: rep.name,
        status,
        sources,
        discrepancies,
    }
}

fn summarize(results: &[ModelResults<TaskList>], tasks: &[ComparedTask]) -> String {
    if results.is_empty() {
        return "No model results to compare.".to_string();
    }

    let models: Vec<&str> = results.iter().map(|r| r.model.as_str()).collect();
    let pass = tasks.iter().filter(|t| t.status == TaskStatus::Pass).count();
    let mut summary = format!(
        "Compared {} model{} ({}): {} tasks, {} pass, {} need review.",
        models.len(),
        if models.len() == 1 { "" } else { "s" },
        models.join(", "),
        tasks.len(),
        pass,
        tasks.len() - pass
    );

    let failed: Vec<&str> = results
        .iter()
        .filter(|r| r.is_error())
        .map(|r| r.model.as_str())
        .collect();
    if !failed.is_empty() {
        summary.push_str(&format!(" Failed: {}.", failed.join(", ")));
    }
    summary
}

/// Turns one model's output into the authoritative forest.
///
/// Structure is re-derived from the model's own declared WBS ids, then
/// renumbered. A tree whose nodes do not all carry a usable WBS id keeps its
/// own nesting instead, and a flat list without them links through parent
/// references.
pub fn promote(
    result: &ModelResults<TaskList>,
    ids: &mut IdGenerator,
) -> Result<Forest, ProjectError> {
    if let Some(error) = &result.error {
        return Err(ProjectError::ModelFailed {
            model: result.model.clone(),
            error: error.clone(),
        });
    }

    let mut entries = result.results.entries();
    let numbered = entries
        .iter()
        .all(|e| e.wbs_id.as_deref().and_then(wbs_id::parse_lenient).is_some());

    let forest = match &result.results {
        TaskList::Tree(_) if !numbered => result.results.to_forest(ids),
        TaskList::Flat(tasks) if tree::detect_addressing(tasks) == Addressing::ParentRef => {
            tree::build_tree(tasks, Addressing::ParentRef, ids)
        }
        _ => {
            wbs_id::sort_by_wbs_id(&mut entries);
            tree::build_tree(&entries, Addressing::WbsId, ids)
        }
    };

    tracing::info!(
        "Promoting {} tasks from model {}",
        result.results.len(),
        result.model
    );
    Ok(renumber(forest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TreeTask;
    use pretty_assertions::assert_eq;

    fn flat(model: &str, tasks: &[(&str, &str)]) -> ModelResults<TaskList> {
        ModelResults::success(
            model,
            TaskList::Flat(
                tasks
                    .iter()
                    .map(|(wbs, name)| FlatTask::with_wbs(*wbs, *name))
                    .collect(),
            ),
        )
    }

    #[test]
    fn test_identical_models_pass() {
        let tasks = [("1", "Site Prep"), ("1.1", "Clearing")];
        let result = compare(&[
            flat("gemini", &tasks),
            flat("openai", &tasks),
            flat("anthropic", &tasks),
        ]);

        assert_eq!(result.tasks.len(), 2);
        for task in &result.tasks {
            assert_eq!(task.status, TaskStatus::Pass);
            assert_eq!(task.sources, vec!["gemini", "openai", "anthropic"]);
            assert_eq!(task.discrepancies, None);
        }
        assert_eq!(result.tasks[0].wbs_id, "1");
        assert_eq!(result.tasks[1].name, "Clearing");
        assert_eq!(result.pass_count(), 2);
    }

    #[test]
    fn test_disjoint_models_need_review() {
        let result = compare(&[
            flat("a", &[("1", "Survey")]),
            flat("b", &[("2", "Excavate")]),
            flat("c", &[("3", "Backfill")]),
        ]);

        assert_eq!(result.tasks.len(), 3);
        for task in &result.tasks {
            assert_eq!(task.status, TaskStatus::NeedsReview);
            assert_eq!(task.sources.len(), 1);
            assert!(task.discrepancies.as_deref().unwrap().contains("missing in"));
        }
        assert_eq!(result.review_count(), 3);
    }

    #[test]
    fn test_name_fallback_under_first_bucket() {
        let result = compare(&[
            flat("a", &[("2", "Foundation")]),
            flat("b", &[("9", "Foundation")]),
        ]);

        assert_eq!(result.tasks.len(), 1);
        let task = &result.tasks[0];
        assert_eq!(task.wbs_id, "2");
        assert_eq!(task.status, TaskStatus::NeedsReview);
        assert_eq!(task.sources, vec!["a", "b"]);
        assert!(task
            .discrepancies
            .as_deref()
            .unwrap()
            .contains("different WBS id: b=9"));
    }

    #[test]
    fn test_exact_id_beats_name_fallback() {
        let result = compare(&[
            flat("a", &[("1", "Foundation"), ("2", "Framing")]),
            flat("b", &[("1", "Footings"), ("2", "Foundation")]),
        ]);

        assert_eq!(result.tasks.len(), 2);
        let first = &result.tasks[0];
        assert_eq!(first.sources, vec!["a", "b"]);
        assert!(first
            .discrepancies
            .as_deref()
            .unwrap()
            .contains("name mismatch: a=\"Foundation\", b=\"Footings\""));
    }

    #[test]
    fn test_failed_model_forces_review() {
        let tasks = [("1", "Site Prep")];
        let result = compare(&[
            flat("a", &tasks),
            flat("b", &tasks),
            ModelResults::failure("c", "timed out"),
        ]);

        assert_eq!(result.tasks.len(), 1);
        assert_eq!(result.tasks[0].status, TaskStatus::NeedsReview);
        assert_eq!(result.tasks[0].sources, vec!["a", "b"]);
        assert_eq!(
            result.tasks[0].discrepancies.as_deref(),
            Some("failed: c (timed out)")
        );
        assert!(result.summary.contains("Failed: c."));
    }

    #[test]
    fn test_unnumbered_tasks_come_last() {
        let mut a = flat("a", &[("1", "Site Prep")]);
        let mut b = flat("b", &[("1", "Site Prep")]);
        for result in [&mut a, &mut b] {
            if let TaskList::Flat(tasks) = &mut result.results {
                tasks.insert(0, FlatTask::named("Mobilization"));
            }
        }

        let result = compare(&[a, b]);
        assert_eq!(result.tasks.len(), 2);
        assert_eq!(result.tasks[0].status, TaskStatus::Pass);
        let last = &result.tasks[1];
        assert_eq!(last.wbs_id, "");
        assert_eq!(last.name, "Mobilization");
        assert_eq!(last.sources, vec!["a", "b"]);
        assert_eq!(last.status, TaskStatus::NeedsReview);
    }

    #[test]
    fn test_tree_and_flat_inputs_compare_alike() {
        let mut root = TreeTask::new("r", "Site Prep");
        root.wbs_id = Some("1".to_string());
        let mut child = TreeTask::new("c", "Clearing");
        child.wbs_id = Some("1.1".to_string());
        let tree = ModelResults::success("tree", TaskList::Tree(vec![root.with_children(vec![child])]));

        let result = compare(&[tree, flat("flat", &[("1.1", "Clearing"), ("1", "Site Prep")])]);
        assert_eq!(result.pass_count(), 2);
        assert_eq!(result.tasks[0].wbs_id, "1");
    }

    #[test]
    fn test_empty_input() {
        let result = compare(&[]);
        assert!(result.tasks.is_empty());
        assert_eq!(result.summary, "No model results to compare.");
    }

    #[test]
    fn test_promote_renumbers_declared_structure() {
        let result = flat(
            "openai",
            &[("2", "Foundation"), ("1", "Site Prep"), ("1.3", "Grading"), ("1.1", "Clearing")],
        );
        let forest = promote(&result, &mut IdGenerator::seeded(5)).unwrap();

        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].name, "Site Prep");
        let children: Vec<_> = forest[0]
            .children
            .iter()
            .map(|c| (c.wbs_id.as_deref().unwrap(), c.name.as_str()))
            .collect();
        assert_eq!(children, vec![("1.1", "Clearing"), ("1.2", "Grading")]);
        assert_eq!(forest[1].wbs_id.as_deref(), Some("2"));
    }

    #[test]
    fn test_promote_failed_model_is_an_error() {
        let err = promote(
            &ModelResults::failure("gemini", "quota"),
            &mut IdGenerator::seeded(5),
        )
        .unwrap_err();
        assert!(matches!(err, ProjectError::ModelFailed { ref model, .. } if model == "gemini"));
    }

    #[test]
    fn test_promote_tree_without_ids_keeps_nesting() {
        let tree = TaskList::Tree(vec![
            TreeTask::new("a", "A").with_children(vec![TreeTask::new("b", "B")])
        ]);
        let forest = promote(
            &ModelResults::success("x", tree),
            &mut IdGenerator::seeded(5),
        )
        .unwrap();
        assert_eq!(forest[0].children[0].wbs_id.as_deref(), Some("1.1"));
    }

    #[test]
    fn test_promote_flat_list_linked_by_parent_reference() {
        let list = TaskList::Flat(vec![
            FlatTask::with_parent("a", None, "Site Prep"),
            FlatTask::with_parent("b", Some("a"), "Clearing"),
            FlatTask::with_parent("c", Some("a"), "Grading"),
            FlatTask::with_parent("d", None, "Foundation"),
        ]);
        let forest = promote(
            &ModelResults::success("x", list),
            &mut IdGenerator::seeded(5),
        )
        .unwrap();

        assert_eq!(forest.len(), 2);
        let children: Vec<_> = forest[0]
            .children
            .iter()
            .map(|c| (c.wbs_id.as_deref().unwrap(), c.name.as_str()))
            .collect();
        assert_eq!(children, vec![("1.1", "Clearing"), ("1.2", "Grading")]);
        assert_eq!(forest[1].name, "Foundation");
    }
}
