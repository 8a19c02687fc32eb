//! Dependency graph — derived view over a task set.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use uuid::Uuid;

use crate::error::DependencyError;
use crate::fleet::model::Task;
use crate::fleet::state::TaskStatus;

/// A snapshot of tasks and the dependency edges between them.
///
/// Task order is preserved from construction and breaks ties that priority
/// and creation time leave open.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    tasks: Vec<Task>,
    index: HashMap<Uuid, usize>,
    dependents: HashMap<Uuid, Vec<usize>>,
}

impl DependencyGraph {
    pub fn new(tasks: Vec<Task>) -> Self {
        let mut index = HashMap::with_capacity(tasks.len());
        let mut dependents: HashMap<Uuid, Vec<usize>> = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            index.insert(task.id, i);
            for dep in &task.depends_on {
                dependents.entry(*dep).or_default().push(i);
            }
        }
        Self {
            tasks,
            index,
            dependents,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.index.get(&id).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.contains_key(&id)
    }

    /// Pending tasks with nothing left to wait on, most urgent first.
    pub fn runnable(&self) -> Vec<&Task> {
        let mut runnable: Vec<&Task> = self.tasks.iter().filter(|t| t.is_runnable()).collect();
        // Stable sort keeps construction order for equal keys.
        runnable.sort_by_key(|t| (Reverse(t.priority), t.created_at));
        runnable
    }

    /// Tasks whose `depends_on` contains `id`.
    pub fn dependents_of(&self, id: Uuid) -> Vec<&Task> {
        self.dependents
            .get(&id)
            .map(|idxs| idxs.iter().map(|&i| &self.tasks[i]).collect())
            .unwrap_or_default()
    }

    /// Dependencies that will never be released automatically:
    /// unknown ids, failed or cancelled dependencies still blocking a live
    /// task, and cycles.
    pub fn dependency_errors(&self) -> Vec<DependencyError> {
        let mut errors = Vec::new();
        for task in &self.tasks {
            if task.status.is_terminal() {
                continue;
            }
            for dep in &task.blocked_by {
                match self.get(*dep) {
                    None => errors.push(DependencyError::Missing {
                        task_id: task.id,
                        dependency: *dep,
                    }),
                    Some(d) if matches!(d.status, TaskStatus::Failed | TaskStatus::Cancelled) => {
                        errors.push(DependencyError::TerminalDependency {
                            task_id: task.id,
                            dependency: *dep,
                            status: d.status,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        if let Some(path) = self.find_cycle() {
            errors.push(DependencyError::Cycle { path });
        }
        errors
    }

    /// First dependency cycle found, as a closed path `a -> b -> a`.
    pub fn find_cycle(&self) -> Option<Vec<Uuid>> {
        find_cycle(&self.tasks, |id| self.get(id).map(|t| &t.depends_on))
    }

    /// Check a batch of new tasks against this graph before insertion.
    ///
    /// New tasks may depend on each other or on tasks already in the graph,
    /// but not on themselves, not on unknown ids, not on failed or cancelled
    /// tasks, and never in a cycle.
    pub fn validate_submission(&self, batch: &[Task]) -> Result<(), DependencyError> {
        let batch_ids: HashSet<Uuid> = batch.iter().map(|t| t.id).collect();

        for task in batch {
            if task.depends_on.contains(&task.id) {
                return Err(DependencyError::SelfDependency { task_id: task.id });
            }
            for dep in &task.depends_on {
                if batch_ids.contains(dep) {
                    continue;
                }
                match self.get(*dep) {
                    None => {
                        return Err(DependencyError::Missing {
                            task_id: task.id,
                            dependency: *dep,
                        });
                    }
                    Some(d) if matches!(d.status, TaskStatus::Failed | TaskStatus::Cancelled) => {
                        return Err(DependencyError::TerminalDependency {
                            task_id: task.id,
                            dependency: *dep,
                            status: d.status,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        let by_id: HashMap<Uuid, &BTreeSet<Uuid>> =
            batch.iter().map(|t| (t.id, &t.depends_on)).collect();
        let lookup = |id: Uuid| {
            by_id
                .get(&id)
                .copied()
                .or_else(|| self.get(id).map(|t| &t.depends_on))
        };
        match find_cycle(batch, lookup) {
            Some(path) => Err(DependencyError::Cycle { path }),
            None => Ok(()),
        }
    }
}

/// Iterative depth-first search for a back edge, starting from each of
/// `roots` in order. Unknown ids are treated as leaves. Never recurses, so
/// deep chains cannot overflow the stack.
fn find_cycle<'a, F>(roots: &[Task], deps_of: F) -> Option<Vec<Uuid>>
where
    F: Fn(Uuid) -> Option<&'a BTreeSet<Uuid>>,
{
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        OnPath,
        Done,
    }

    let mut marks: HashMap<Uuid, Mark> = HashMap::new();

    for root in roots {
        if marks.contains_key(&root.id) {
            continue;
        }
        // (node, its dependencies, next dependency to visit)
        let mut stack: Vec<(Uuid, Vec<Uuid>, usize)> = Vec::new();
        let root_deps = deps_of(root.id).map(|d| d.iter().copied().collect()).unwrap_or_default();
        marks.insert(root.id, Mark::OnPath);
        stack.push((root.id, root_deps, 0));

        while let Some((node, deps, next)) = stack.last_mut() {
            if *next >= deps.len() {
                marks.insert(*node, Mark::Done);
                stack.pop();
                continue;
            }
            let dep = deps[*next];
            *next += 1;

            match marks.get(&dep) {
                Some(Mark::OnPath) => {
                    let start = stack.iter().position(|(id, _, _)| *id == dep).unwrap_or(0);
                    let mut path: Vec<Uuid> = stack[start..].iter().map(|(id, _, _)| *id).collect();
                    path.push(dep);
                    return Some(path);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(children) = deps_of(dep) {
                        let children = children.iter().copied().collect();
                        marks.insert(dep, Mark::OnPath);
                        stack.push((dep, children, 0));
                    } else {
                        marks.insert(dep, Mark::Done);
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn task(title: &str, priority: i32) -> Task {
        Task::new(title).with_priority(priority)
    }

    #[test]
    fn runnable_orders_by_priority_then_age() {
        let now = Utc::now();
        let mut low = task("low", 1);
        low.created_at = now - Duration::seconds(60);
        let mut high_new = task("high new", 5);
        high_new.created_at = now;
        let mut high_old = task("high old", 5);
        high_old.created_at = now - Duration::seconds(30);
        let blocked = task("blocked", 5).with_depends_on([low.id]);

        let graph = DependencyGraph::new(vec![low, high_new, high_old, blocked]);
        let titles: Vec<&str> = graph.runnable().iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["high old", "high new", "low"]);
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let now = Utc::now();
        let mut a = task("first", 3);
        let mut b = task("second", 3);
        a.created_at = now;
        b.created_at = now;
        let graph = DependencyGraph::new(vec![a, b]);
        let titles: Vec<&str> = graph.runnable().iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[test]
    fn dependents_of_follows_depends_on() {
        let root = task("root", 3);
        let child = task("child", 3).with_depends_on([root.id]);
        let other = task("other", 3);
        let (root_id, child_id) = (root.id, child.id);
        let graph = DependencyGraph::new(vec![root, child, other]);

        let deps: Vec<Uuid> = graph.dependents_of(root_id).iter().map(|t| t.id).collect();
        assert_eq!(deps, vec![child_id]);
        assert!(graph.dependents_of(child_id).is_empty());
    }

    #[test]
    fn submission_rejects_two_task_cycle() {
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();
        let a = task("a", 3).with_id(a_id).with_depends_on([b_id]);
        let b = task("b", 3).with_id(b_id).with_depends_on([a_id]);

        let err = DependencyGraph::default()
            .validate_submission(&[a, b])
            .unwrap_err();
        match err {
            DependencyError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 3);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn submission_rejects_self_and_missing() {
        let id = Uuid::new_v4();
        let selfish = task("self", 3).with_id(id).with_depends_on([id]);
        assert_eq!(
            DependencyGraph::default().validate_submission(&[selfish]),
            Err(DependencyError::SelfDependency { task_id: id })
        );

        let ghost = Uuid::new_v4();
        let orphan = task("orphan", 3).with_depends_on([ghost]);
        assert!(matches!(
            DependencyGraph::default().validate_submission(&[orphan]),
            Err(DependencyError::Missing { dependency, .. }) if dependency == ghost
        ));
    }

    #[test]
    fn submission_rejects_failed_dependency() {
        let mut failed = task("failed", 3);
        failed.status = TaskStatus::Failed;
        let failed_id = failed.id;
        let graph = DependencyGraph::new(vec![failed]);

        let dependent = task("next", 3).with_depends_on([failed_id]);
        assert!(matches!(
            graph.validate_submission(&[dependent]),
            Err(DependencyError::TerminalDependency { status: TaskStatus::Failed, .. })
        ));
    }

    #[test]
    fn submission_accepts_chain_onto_existing() {
        let existing = task("existing", 3);
        let existing_id = existing.id;
        let graph = DependencyGraph::new(vec![existing]);

        let a = task("a", 3).with_depends_on([existing_id]);
        let b = task("b", 3).with_depends_on([a.id, existing_id]);
        assert!(graph.validate_submission(&[a, b]).is_ok());
    }

    #[test]
    fn cycle_detection_terminates_on_long_chain() {
        let mut tasks: Vec<Task> = Vec::new();
        let mut prev: Option<Uuid> = None;
        for i in 0..10_000 {
            let t = match prev {
                Some(p) => task(&format!("t{i}"), 3).with_depends_on([p]),
                None => task("t0", 3),
            };
            prev = Some(t.id);
            tasks.push(t);
        }
        let graph = DependencyGraph::new(tasks);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn existing_cycle_is_reported_not_looped() {
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();
        let a = task("a", 3).with_id(a_id).with_depends_on([b_id]);
        let b = task("b", 3).with_id(b_id).with_depends_on([a_id]);
        let graph = DependencyGraph::new(vec![a, b]);

        assert!(graph.runnable().is_empty());
        let errors = graph.dependency_errors();
        assert!(errors.iter().any(|e| matches!(e, DependencyError::Cycle { .. })));
    }

    #[test]
    fn blocked_on_cancelled_dependency_is_an_error() {
        let mut cancelled = task("cancelled", 3);
        cancelled.status = TaskStatus::Cancelled;
        let dependent = task("dependent", 3).with_depends_on([cancelled.id]);
        let ghost_dependent = task("ghost", 3).with_depends_on([Uuid::new_v4()]);
        let graph = DependencyGraph::new(vec![cancelled, dependent, ghost_dependent]);

        let errors = graph.dependency_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| matches!(e, DependencyError::TerminalDependency { .. })));
        assert!(errors.iter().any(|e| matches!(e, DependencyError::Missing { .. })));
    }
}
