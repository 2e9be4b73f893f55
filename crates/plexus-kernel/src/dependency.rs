//! Dependency resolution over named nodes.
//!
//! Used for the plugin graph at bootstrap and for service factory chains.
//! Resolution is a depth-first walk with a "visiting" set (the current
//! path) and a "visited" set (finalised nodes). Roots are walked
//! in insertion order, so the output is deterministic for a given
//! registration order and every node follows all of its dependencies.

use std::collections::{HashMap, HashSet};

/// Dependency resolution failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DependencyError {
    /// `path` lists the cycle from its first node back to `plugin`.
    #[error("circular dependency detected at '{plugin}': {}", .path.join(" -> "))]
    CircularDependency { plugin: String, path: Vec<String> },

    #[error("'{plugin}' depends on '{dependency}', which is not registered")]
    MissingDependency { plugin: String, dependency: String },

    #[error("duplicate node: {0}")]
    DuplicateNode(String),
}

impl DependencyError {
    /// The node the error was detected at.
    pub fn plugin(&self) -> &str {
        match self {
            DependencyError::CircularDependency { plugin, .. } => plugin,
            DependencyError::MissingDependency { plugin, .. } => plugin,
            DependencyError::DuplicateNode(plugin) => plugin,
        }
    }
}

pub type DependencyResult<T> = Result<T, DependencyError>;

/// A directed "requires" graph keyed by node name.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Insertion order of nodes
    order: Vec<String>,
    /// node -> declared dependencies
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(name, dependencies)` pairs, rejecting duplicates.
    pub fn from_nodes<I, N, D>(nodes: I) -> DependencyResult<Self>
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let mut graph = Self::new();
        for (name, deps) in nodes {
            graph.add_node(name, deps)?;
        }
        Ok(graph)
    }

    pub fn add_node<N, D>(&mut self, name: N, dependencies: D) -> DependencyResult<()>
    where
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let name = name.into();
        if self.edges.contains_key(&name) {
            return Err(DependencyError::DuplicateNode(name));
        }
        let deps = dependencies.into_iter().map(Into::into).collect();
        self.order.push(name.clone());
        self.edges.insert(name, deps);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    pub fn get_dependencies(&self, name: &str) -> Option<&[String]> {
        self.edges.get(name).map(Vec::as_slice)
    }

    /// Nodes that directly depend on `name`, in insertion order.
    pub fn get_dependents(&self, name: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.edges
                    .get(*id)
                    .is_some_and(|deps| deps.iter().any(|d| d == name))
            })
            .cloned()
            .collect()
    }

    /// Linear order in which every node appears after all of its dependencies.
    pub fn resolve(&self) -> DependencyResult<Vec<String>> {
        let mut walk = Walk::default();
        let mut sorted = Vec::with_capacity(self.order.len());

        for name in &self.order {
            if !walk.visited.contains(name.as_str()) {
                self.visit(name, &mut walk, &mut sorted)?;
            }
        }

        Ok(sorted)
    }

    /// Order restricted to `target` and its transitive dependencies.
    pub fn resolve_for(&self, target: &str) -> DependencyResult<Vec<String>> {
        let mut walk = Walk::default();
        let mut sorted = Vec::new();
        self.visit(target, &mut walk, &mut sorted)?;
        Ok(sorted)
    }

    /// Depth-first walk from `root` on an explicit stack, so chain length is
    /// bounded by memory rather than the call stack.
    fn visit<'a>(
        &'a self,
        root: &str,
        walk: &mut Walk<'a>,
        sorted: &mut Vec<String>,
    ) -> DependencyResult<()> {
        let Some((root, _)) = self.edges.get_key_value(root) else {
            return Err(DependencyError::MissingDependency {
                plugin: root.to_string(),
                dependency: root.to_string(),
            });
        };
        if walk.visited.contains(root.as_str()) {
            return Ok(());
        }
        walk.enter(root);

        while let Some(&(name, next)) = walk.path.last() {
            let deps = self.edges.get(name).map(Vec::as_slice).unwrap_or_default();
            let Some(dep) = deps.get(next) else {
                walk.leave(name);
                sorted.push(name.to_string());
                continue;
            };
            if let Some(frame) = walk.path.last_mut() {
                frame.1 += 1;
            }

            let Some((dep, _)) = self.edges.get_key_value(dep.as_str()) else {
                return Err(DependencyError::MissingDependency {
                    plugin: name.to_string(),
                    dependency: dep.clone(),
                });
            };
            if walk.on_path.contains(dep.as_str()) {
                return Err(walk.cycle_at(dep));
            }
            if !walk.visited.contains(dep.as_str()) {
                walk.enter(dep);
            }
        }
        Ok(())
    }

    /// Fails on the first cycle or missing dependency.
    pub fn validate(&self) -> DependencyResult<()> {
        self.resolve().map(|_| ())
    }
}

/// Traversal state: the current path with each node's next dependency
/// index, the same path as a set, and finished nodes.
#[derive(Default)]
struct Walk<'a> {
    path: Vec<(&'a str, usize)>,
    on_path: HashSet<&'a str>,
    visited: HashSet<&'a str>,
}

impl<'a> Walk<'a> {
    fn enter(&mut self, name: &'a str) {
        self.path.push((name, 0));
        self.on_path.insert(name);
    }

    fn leave(&mut self, name: &'a str) {
        self.path.pop();
        self.on_path.remove(name);
        self.visited.insert(name);
    }

    fn cycle_at(&self, name: &str) -> DependencyError {
        let start = self
            .path
            .iter()
            .position(|(node, _)| *node == name)
            .unwrap_or(0);
        let mut path: Vec<String> = self.path[start..]
            .iter()
            .map(|(node, _)| node.to_string())
            .collect();
        path.push(name.to_string());
        DependencyError::CircularDependency {
            plugin: name.to_string(),
            path,
        }
    }
}

/// Stateless front-end used by the kernel.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Resolve `(name, dependencies)` pairs given in registration order.
    pub fn resolve<I, N, D>(nodes: I) -> DependencyResult<Vec<String>>
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        DependencyGraph::from_nodes(nodes)?.resolve()
    }
}
