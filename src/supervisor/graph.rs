//! Dependency graph over registered workers
//!
//! All functions take descriptors in registration order; that order is the
//! stable tie-break when several workers are ready at once.

use std::collections::{HashMap, HashSet};

use crate::domain::WorkerDescriptor;
use crate::error::{Result, WardenError};

/// Reject unknown dependencies and cycles for the given descriptor set
pub fn validate(descriptors: &[WorkerDescriptor]) -> Result<()> {
    let ids: HashSet<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();
    for desc in descriptors {
        for dep in &desc.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(WardenError::UnknownDependency {
                    worker_id: desc.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    match find_cycle(descriptors) {
        Some(path) => Err(WardenError::CyclicDependency { path }),
        None => Ok(()),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// First cycle found by DFS, as a closed path (`a -> b -> a`)
pub fn find_cycle(descriptors: &[WorkerDescriptor]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = descriptors
        .iter()
        .map(|d| (d.id.as_str(), d.depends_on.as_slice()))
        .collect();
    let mut marks: HashMap<&str, Mark> =
        descriptors.iter().map(|d| (d.id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id).copied() {
            Some(Mark::Done) | None => return None,
            Some(Mark::InProgress) => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(id.to_string());
                return Some(path);
            }
            Some(Mark::Unvisited) => {}
        }

        marks.insert(id, Mark::InProgress);
        stack.push(id);
        if let Some(children) = deps.get(id).copied() {
            for dep in children.iter() {
                if let Some(path) = visit(dep.as_str(), deps, marks, stack) {
                    return Some(path);
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let mut stack = Vec::new();
    for desc in descriptors {
        if let Some(path) = visit(desc.id.as_str(), &deps, &mut marks, &mut stack) {
            return Some(path);
        }
    }
    None
}

/// Topological order of `selected` (dependencies first), registration order
/// breaking ties. Dependencies outside the selection are ignored.
pub fn start_order(descriptors: &[WorkerDescriptor], selected: &HashSet<String>) -> Vec<String> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(selected.len());
    let candidates: Vec<&WorkerDescriptor> = descriptors
        .iter()
        .filter(|d| selected.contains(&d.id))
        .collect();

    while order.len() < candidates.len() {
        let next = candidates.iter().find(|d| {
            !placed.contains(d.id.as_str())
                && d.depends_on
                    .iter()
                    .all(|dep| !selected.contains(dep) || placed.contains(dep.as_str()))
        });
        match next {
            Some(&d) => {
                placed.insert(d.id.as_str());
                order.push(d.id.clone());
            }
            // Only reachable with a cycle, which registration rejects
            None => break,
        }
    }
    order
}

/// Reverse of [`start_order`]: dependents stop before their dependencies
pub fn stop_order(descriptors: &[WorkerDescriptor], selected: &HashSet<String>) -> Vec<String> {
    let mut order = start_order(descriptors, selected);
    order.reverse();
    order
}

/// `roots` plus everything they transitively depend on
pub fn with_dependencies(descriptors: &[WorkerDescriptor], roots: &[String]) -> HashSet<String> {
    let by_id: HashMap<&str, &WorkerDescriptor> =
        descriptors.iter().map(|d| (d.id.as_str(), d)).collect();
    let mut out = HashSet::new();
    let mut queue: Vec<&str> = roots.iter().map(|s| s.as_str()).collect();
    while let Some(id) = queue.pop() {
        if !out.insert(id.to_string()) {
            continue;
        }
        if let Some(desc) = by_id.get(id) {
            queue.extend(desc.depends_on.iter().map(|s| s.as_str()));
        }
    }
    out
}

/// Every worker that depends on `id`, directly or transitively
pub fn dependents_of(descriptors: &[WorkerDescriptor], id: &str) -> HashSet<String> {
    let mut out: HashSet<String> = HashSet::new();
    let mut frontier = vec![id.to_string()];
    while let Some(current) = frontier.pop() {
        for desc in descriptors {
            if desc.depends_on.iter().any(|d| *d == current) && out.insert(desc.id.clone()) {
                frontier.push(desc.id.clone());
            }
        }
    }
    out
}
