//! Graph algorithms over a locked graph snapshot.

use crate::graph::GraphInner;
use cadence_core::{CadenceError, CadenceResult, CriticalPath, TaskId, TaskStatus};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

/// Depth-first search from `from` along depends-on edges. Returns the path
/// `from, ..., to` when `to` is reachable.
pub(crate) fn find_path(inner: &GraphInner, from: &TaskId, to: &TaskId) -> Option<Vec<TaskId>> {
    let mut parent: HashMap<&TaskId, &TaskId> = HashMap::new();
    let mut visited: HashSet<&TaskId> = HashSet::new();
    let mut stack = vec![from];
    visited.insert(from);

    while let Some(node) = stack.pop() {
        if node == to {
            let mut path = vec![node.clone()];
            let mut cursor = node;
            while let Some(prev) = parent.get(cursor) {
                path.push((*prev).clone());
                cursor = prev;
            }
            path.reverse();
            return Some(path);
        }
        if let Some(deps) = inner.deps.get(node) {
            for dep in deps.keys() {
                if visited.insert(dep) {
                    parent.insert(dep, node);
                    stack.push(dep);
                }
            }
        }
    }
    None
}

/// Hard dependencies of `id` that are not Completed.
pub(crate) fn unsatisfied_dependencies(inner: &GraphInner, id: &TaskId) -> Vec<TaskId> {
    inner
        .deps
        .get(id)
        .into_iter()
        .flat_map(|deps| deps.iter())
        .filter(|(_, kind)| kind.is_blocking())
        .filter(|(dep, _)| {
            inner
                .tasks
                .get(*dep)
                .map(|t| t.status != TaskStatus::Completed)
                .unwrap_or(true)
        })
        .map(|(dep, _)| dep.clone())
        .collect()
}

pub(crate) fn is_executable(inner: &GraphInner, id: &TaskId) -> bool {
    inner
        .tasks
        .get(id)
        .map(|t| t.status == TaskStatus::Pending)
        .unwrap_or(false)
        && unsatisfied_dependencies(inner, id).is_empty()
}

/// Kahn's algorithm, dependencies before dependents, ties broken by id.
pub(crate) fn topological_order(inner: &GraphInner) -> CadenceResult<Vec<TaskId>> {
    let mut indegree: HashMap<&TaskId, usize> = inner
        .tasks
        .keys()
        .map(|id| (id, inner.deps.get(id).map(|d| d.len()).unwrap_or(0)))
        .collect();
    let mut ready: BTreeSet<&TaskId> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(inner.tasks.len());
    while let Some(id) = ready.pop_first() {
        order.push(id.clone());
        if let Some(dependents) = inner.dependents.get(id) {
            for dependent in dependents {
                if let Some(degree) = indegree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
    }

    if order.len() != inner.tasks.len() {
        let placed: HashSet<&TaskId> = order.iter().collect();
        let mut remaining: Vec<String> = inner
            .tasks
            .keys()
            .filter(|id| !placed.contains(id))
            .map(|id| id.to_string())
            .collect();
        remaining.sort();
        return Err(CadenceError::CircularDependency { cycle: remaining });
    }
    Ok(order)
}

/// Longest chain by summed estimate. Equal durations prefer the chain with
/// more tasks, then the smaller task id.
pub(crate) fn critical_path(inner: &GraphInner) -> CadenceResult<CriticalPath> {
    let order = topological_order(inner)?;
    // (duration, task count, predecessor on the best chain)
    let mut best: HashMap<&TaskId, (Duration, usize, Option<&TaskId>)> =
        HashMap::with_capacity(order.len());

    for id in &order {
        let own = inner
            .tasks
            .get(id)
            .map(|t| t.estimated_duration)
            .unwrap_or_default();
        let mut chosen: Option<(&TaskId, Duration, usize)> = None;
        if let Some(deps) = inner.deps.get(id) {
            for dep in deps.keys() {
                let Some(&(duration, count, _)) = best.get(dep) else {
                    continue;
                };
                let better = match chosen {
                    None => true,
                    Some((_, d, c)) => (duration, count) > (d, c),
                };
                if better {
                    chosen = Some((dep, duration, count));
                }
            }
        }
        let entry = match chosen {
            Some((dep, duration, count)) => (duration.saturating_add(own), count + 1, Some(dep)),
            None => (own, 1, None),
        };
        best.insert(id, entry);
    }

    let mut end: Option<(&TaskId, Duration, usize)> = None;
    for id in &order {
        let Some(&(duration, count, _)) = best.get(id) else {
            continue;
        };
        let better = match end {
            None => true,
            Some((current, d, c)) => {
                (duration, count) > (d, c) || ((duration, count) == (d, c) && id < current)
            }
        };
        if better {
            end = Some((id, duration, count));
        }
    }

    let Some((end_id, total_duration, _)) = end else {
        return Ok(CriticalPath::default());
    };
    let mut tasks = vec![end_id.clone()];
    let mut cursor = end_id;
    while let Some(&(_, _, Some(prev))) = best.get(cursor) {
        tasks.push(prev.clone());
        cursor = prev;
    }
    tasks.reverse();
    Ok(CriticalPath {
        total_duration,
        tasks,
    })
}
