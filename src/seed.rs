//! Seed data model: [`Seed`], [`SeedModule`], and [`LoadedSeed`] (§3, §4.5).

use std::collections::BTreeSet;
use std::path::PathBuf;

/// `WorkerId` sentinel meaning "runs on exactly one worker, any worker".
pub const WORKER_ANY: i32 = 0;
/// `WorkerId` sentinel meaning "runs once on every worker".
pub const WORKER_ALL: i32 = -1;

/// The synthetic module name always present in a loaded seed.
pub const INIT_MODULE: &str = "init";

/// A `(Name, Path)` pair identifying a seed root (`<Path>/_Main.sql`).
#[derive(Clone, Debug)]
pub struct Seed {
    name: String,
    main_file: PathBuf,
}

impl Seed {
    pub fn new(name: impl Into<String>, main_file: PathBuf) -> Self {
        Seed {
            name: name.into(),
            main_file,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn main_file(&self) -> &PathBuf {
        &self.main_file
    }
}

/// A named collection of batches within a seed, with the topics it provides/requires.
#[derive(Clone, Debug)]
pub struct SeedModule {
    pub name: String,
    pub worker_id: i32,
    pub batches: Vec<String>,
    pub provides: BTreeSet<String>,
    pub requires: BTreeSet<String>,
}

impl SeedModule {
    pub fn new(name: impl Into<String>) -> Self {
        SeedModule {
            name: name.into(),
            worker_id: WORKER_ANY,
            batches: Vec::new(),
            provides: BTreeSet::new(),
            requires: BTreeSet::new(),
        }
    }

    pub fn runs_on_every_worker(&self) -> bool {
        self.worker_id == WORKER_ALL
    }

    pub fn provides_topic(&self, topic: &str) -> bool {
        self.provides.iter().any(|p| p.eq_ignore_ascii_case(topic))
    }
}

/// A fully parsed seed: its root plus the ordered modules found within it, in source
/// order.
#[derive(Clone, Debug)]
pub struct LoadedSeed {
    pub seed: Seed,
    pub modules: Vec<SeedModule>,
}

impl LoadedSeed {
    pub fn module(&self, name: &str) -> Option<&SeedModule> {
        self.modules.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.modules.iter().all(|m| m.batches.is_empty())
    }
}
