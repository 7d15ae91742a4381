//! Topic dependency graph over a loaded seed's modules (§4.6 step 1-2).
//!
//! Grounded on the same acyclic-ordering shape as `crate::migration`'s dependency
//! checks, but edges here come from `Provides`/`Requires` topic sets rather than
//! explicit predecessor names.

use std::collections::{BTreeSet, HashSet, VecDeque};

use crate::error::SeedError;
use crate::seed::{SeedModule, INIT_MODULE};

/// A validated, ready-to-schedule view over a seed's modules: each module's index
/// plus the set of module indices it depends on (must complete first).
#[derive(Debug, Clone)]
pub struct SeedGraph {
    modules: Vec<SeedModule>,
    depends_on: Vec<BTreeSet<usize>>,
}

impl SeedGraph {
    /// Builds and validates the topic graph for `modules`. Returns
    /// [`SeedError::UnprovidedTopic`] or [`SeedError::Cycle`] if validation fails.
    pub fn build(modules: Vec<SeedModule>) -> Result<Self, SeedError> {
        let n = modules.len();
        let mut depends_on: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];

        let init_idx = modules.iter().position(|m| m.name.eq_ignore_ascii_case(INIT_MODULE));
        let explicit_init_providers: HashSet<usize> =
            modules.iter().enumerate().filter(|(_, m)| m.provides_topic(INIT_MODULE)).map(|(i, _)| i).collect();

        // Implicit predecessor: every module that neither is nor explicitly provides
        // `init` depends on the synthetic init module, per §4.6 step 1.
        if let Some(init_idx) = init_idx {
            for i in 0..n {
                if i != init_idx && !explicit_init_providers.contains(&i) {
                    depends_on[i].insert(init_idx);
                }
            }
        }

        for (i, module) in modules.iter().enumerate() {
            for topic in &module.requires {
                let providers: Vec<usize> = modules
                    .iter()
                    .enumerate()
                    .filter(|(j, m)| *j != i && m.provides_topic(topic))
                    .map(|(j, _)| j)
                    .collect();
                if providers.is_empty() {
                    return Err(SeedError::UnprovidedTopic(topic.clone()));
                }
                depends_on[i].extend(providers);
            }
        }

        if has_cycle(&depends_on) {
            return Err(SeedError::Cycle);
        }

        Ok(SeedGraph { modules, depends_on })
    }

    pub fn modules(&self) -> &[SeedModule] {
        &self.modules
    }

    pub fn depends_on(&self, index: usize) -> &BTreeSet<usize> {
        &self.depends_on[index]
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules with no unmet dependencies among `completed`.
    pub fn ready(&self, completed: &BTreeSet<usize>) -> Vec<usize> {
        (0..self.len())
            .filter(|i| !completed.contains(i) && self.depends_on[*i].is_subset(completed))
            .collect()
    }
}

fn has_cycle(depends_on: &[BTreeSet<usize>]) -> bool {
    let n = depends_on.len();
    // Kahn's algorithm: an edge i -> d (i depends on d) means d must be processed
    // before i, so in-degree here counts unresolved dependencies of i.
    let mut in_degree: Vec<usize> = depends_on.iter().map(|d| d.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, deps) in depends_on.iter().enumerate() {
        for &d in deps {
            dependents[d].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &dep in &dependents[i] {
            in_degree[dep] -= 1;
            if in_degree[dep] == 0 {
                queue.push_back(dep);
            }
        }
    }
    visited != n
}
