// SPDX-License-Identifier: MIT

//! Dependency graph validation and layering
//!
//! A step set is valid when names are non-empty and unique, every
//! dependency names a step in the set, and the dependency relation is
//! acyclic. Checks run in that order and the first failure is reported.
//!
//! Layers come from repeated frontier extraction: layer 0 has no
//! dependencies, and a step sits one layer after its deepest dependency.
//! Within a layer, steps keep their declaration order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::sdk::error::ValidationError;
use crate::sdk::step::Step;

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<String>>,
    dependents: Vec<Vec<usize>>,
    layer_of: Vec<usize>,
    layers: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Validate `(name, dependencies)` pairs and compute execution layers
    pub fn build<'a, I>(steps: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut names = Vec::new();
        let mut dependencies = Vec::new();
        let mut index = HashMap::new();

        for (name, deps) in steps {
            if name.trim().is_empty() {
                return Err(ValidationError::EmptyStepName);
            }
            if index.insert(name.to_string(), names.len()).is_some() {
                return Err(ValidationError::DuplicateStep(name.to_string()));
            }
            names.push(name.to_string());

            // repeated entries collapse to one edge
            let mut seen = HashSet::new();
            let deps: Vec<String> = deps
                .iter()
                .filter(|d| seen.insert(d.as_str()))
                .cloned()
                .collect();
            dependencies.push(deps);
        }

        for (i, deps) in dependencies.iter().enumerate() {
            if let Some(missing) = deps.iter().find(|d| !index.contains_key(d.as_str())) {
                return Err(ValidationError::UnknownDependency {
                    step: names[i].clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let edges: Vec<Vec<usize>> = dependencies
            .iter()
            .map(|deps| deps.iter().map(|d| index[d.as_str()]).collect())
            .collect();

        if let Some(cycle) = find_cycle(&edges) {
            return Err(ValidationError::CycleDetected(
                cycle.into_iter().map(|i| names[i].clone()).collect(),
            ));
        }

        let mut dependents = vec![Vec::new(); names.len()];
        for (i, deps) in edges.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        let layer_of = assign_layers(&edges, &dependents);
        let depth = layer_of.iter().map(|l| l + 1).max().unwrap_or(0);
        let mut layers = vec![Vec::new(); depth];
        for (i, &layer) in layer_of.iter().enumerate() {
            layers[layer].push(names[i].clone());
        }

        Ok(Self {
            names,
            index,
            dependencies,
            dependents,
            layer_of,
            layers,
        })
    }

    pub fn from_steps(steps: &[Arc<dyn Step>]) -> Result<Self, ValidationError> {
        Self::build(steps.iter().map(|s| (s.name(), s.depends_on())))
    }

    /// Execution layers; every dependency of a step sits in an earlier layer
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn layer_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).map(|&i| self.layer_of[i])
    }

    /// Step names in declaration order
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Flattened layers: a valid topological order
    pub fn topological_order(&self) -> Vec<&str> {
        self.layers.iter().flatten().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Direct dependencies; empty for unknown names
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.index
            .get(name)
            .map(|&i| self.dependencies[i].as_slice())
            .unwrap_or(&[])
    }

    /// Steps that list `name` as a direct dependency
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&d| self.names[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every step reachable from `name` through dependents, in declaration order
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut reached = vec![false; self.names.len()];
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            for &d in &self.dependents[i] {
                if !reached[d] {
                    reached[d] = true;
                    stack.push(d);
                }
            }
        }
        reached
            .iter()
            .enumerate()
            .filter(|&(_, &r)| r)
            .map(|(i, _)| self.names[i].as_str())
            .collect()
    }
}

/// Depth-first search for a back edge, with an explicit stack. Returns the
/// cycle as a path that starts and ends on the same node.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnPath,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; edges.len()];
    for root in 0..edges.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::OnPath;
        // (node, index of the next edge to follow)
        let mut stack = vec![(root, 0usize)];

        while let Some(top) = stack.last_mut() {
            let (node, cursor) = *top;
            let Some(&next) = edges[node].get(cursor) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            top.1 += 1;

            match marks[next] {
                Mark::OnPath => {
                    let start = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    let mut cycle: Vec<usize> = stack[start..].iter().map(|&(n, _)| n).collect();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[next] = Mark::OnPath;
                    stack.push((next, 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}

/// Kahn frontier extraction over an acyclic graph: a step joins the
/// frontier once its last dependency has been placed, so its layer is the
/// length of its longest dependency chain.
fn assign_layers(edges: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut unplaced: Vec<usize> = edges.iter().map(Vec::len).collect();
    let mut layer = vec![0; edges.len()];
    let mut frontier: Vec<usize> = (0..edges.len()).filter(|&i| unplaced[i] == 0).collect();
    let mut depth = 0;

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for &node in &frontier {
            layer[node] = depth;
            for &d in &dependents[node] {
                unplaced[d] -= 1;
                if unplaced[d] == 0 {
                    next.push(d);
                }
            }
        }
        frontier = next;
        depth += 1;
    }
    layer
}
