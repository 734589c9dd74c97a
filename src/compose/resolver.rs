//! Dependency graph resolution
//!
//! Services are nodes keyed by name; edges point from a service to the
//! services it depends on. Startup proceeds in layers: every member of a
//! layer has all of its dependencies in earlier layers.

use super::config::ServiceSpec;
use crate::error::{Result, WardenError};
use std::collections::{BTreeMap, BTreeSet};

/// Resolved dependency graph
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Service name to the names it depends on
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Startup layers, each sorted by name
    layers: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build and resolve the graph for a set of services
    pub fn new<'a>(specs: impl IntoIterator<Item = &'a ServiceSpec>) -> Result<Self> {
        let dependencies: BTreeMap<String, BTreeSet<String>> = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), spec.depends_on.clone()))
            .collect();

        for (service, deps) in &dependencies {
            if let Some(missing) = deps.iter().find(|dep| !dependencies.contains_key(*dep)) {
                return Err(WardenError::UnknownDependency {
                    service: service.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let layers = Self::resolve_layers(&dependencies)?;
        Ok(Self {
            dependencies,
            layers,
        })
    }

    /// Kahn's algorithm, grouping nodes whose dependencies are all discharged
    fn resolve_layers(dependencies: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<Vec<String>>> {
        let mut pending: BTreeMap<&str, usize> = dependencies
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, deps) in dependencies {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut layers = Vec::new();
        let mut ready: Vec<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();

        while !ready.is_empty() {
            for name in &ready {
                pending.remove(name);
            }

            let mut next = BTreeSet::new();
            for name in &ready {
                for dependent in dependents.get(name).into_iter().flatten() {
                    if let Some(count) = pending.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.insert(*dependent);
                        }
                    }
                }
            }

            layers.push(ready.iter().map(|s| s.to_string()).collect());
            ready = next.into_iter().collect();
        }

        if !pending.is_empty() {
            let remaining: BTreeSet<&str> = pending.keys().copied().collect();
            return Err(WardenError::CyclicDependency {
                cycle: Self::find_cycle(dependencies, &remaining),
            });
        }

        Ok(layers)
    }

    /// Walk undischarged dependency edges until a node repeats
    fn find_cycle(
        dependencies: &BTreeMap<String, BTreeSet<String>>,
        remaining: &BTreeSet<&str>,
    ) -> Vec<String> {
        let Some(start) = remaining.iter().next() else {
            return Vec::new();
        };

        let mut path: Vec<&str> = Vec::new();
        let mut current = *start;
        loop {
            if let Some(pos) = path.iter().position(|n| *n == current) {
                return path[pos..].iter().map(|s| s.to_string()).collect();
            }
            path.push(current);

            // Every undischarged node has at least one undischarged dependency
            let next = dependencies
                .get(current)
                .and_then(|deps| deps.iter().find(|d| remaining.contains(d.as_str())));
            match next {
                Some(dep) => current = dep.as_str(),
                None => return path.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    /// Startup layers
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Flattened start order
    pub fn start_order(&self) -> Vec<String> {
        self.layers.iter().flatten().cloned().collect()
    }

    /// Reverse of the start order
    pub fn shutdown_order(&self) -> Vec<String> {
        let mut order = self.start_order();
        order.reverse();
        order
    }

    /// Direct dependencies of a service
    pub fn dependencies_of(&self, service: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(service)
    }

    /// Services that directly depend on `service`
    pub fn dependents_of(&self, service: &str) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(service))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}
