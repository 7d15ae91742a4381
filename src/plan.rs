//! The migration planner (§4.3 steps 1-5): merges applied state, resolves
//! dependencies, promotes phase content to satisfy them, and composes the ordered
//! per-phase apply lists.

use crate::connection::AppliedMigrationRow;
use crate::error::MigrationError;
use crate::migration::{sort_migrations, Migration, Phase};

/// Per-phase ordered apply lists for one (target, session) pair. Migrations are
/// referenced by index into the `migrations` slice passed to [`build_plan`] (and
/// returned, since merging applied state can append "missing" migrations).
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    /// Migrations whose own `Pre` content is due to run in the `Pre` pass.
    pub pre: Vec<usize>,
    /// `(migration, authoredPhase)` pairs due to run in the `Core` pass; `authoredPhase`
    /// is `Pre` or `Core` depending on whether the content was promoted.
    pub core: Vec<(usize, Phase)>,
    /// Migrations with content (own `Post`, or promoted from an earlier phase) due to
    /// run in the `Post` pass.
    pub post: Vec<usize>,
}

impl MigrationPlan {
    pub fn is_core_required(&self, migrations: &[Migration]) -> bool {
        self.core.iter().any(|(i, p)| migrations[*i].content(*p).is_required)
    }

    /// `IsEmpty(phase)` ignores pseudo-migrations (§4.3 step 5).
    pub fn is_empty(&self, phase: Phase, migrations: &[Migration]) -> bool {
        match phase {
            Phase::Pre => self.pre.iter().all(|&i| migrations[i].is_pseudo()),
            Phase::Core => self.core.iter().all(|&(i, _)| migrations[i].is_pseudo()),
            Phase::Post => self.post.iter().all(|&i| migrations[i].is_pseudo()),
        }
    }
}

/// Builds a plan against `migrations` (discovered and loaded, not yet sorted against
/// applied state) and `applied` (externally fetched rows). `migrations` may grow:
/// applied rows with no matching discovered migration become synthetic "missing"
/// entries.
pub fn build_plan(migrations: &mut Vec<Migration>, applied: &[AppliedMigrationRow]) -> Result<MigrationPlan, MigrationError> {
    merge_applied_state(migrations, applied);
    sort_migrations(migrations);
    resolve_dependencies(migrations)?;
    compute_planned_phases(migrations)?;
    Ok(compose_plan(migrations))
}

fn merge_applied_state(migrations: &mut Vec<Migration>, applied: &[AppliedMigrationRow]) {
    for row in applied {
        if let Some(m) = migrations.iter_mut().find(|m| m.name().eq_ignore_ascii_case(&row.name)) {
            m.set_has_changed(m.hash() != row.hash);
            m.set_state(row.state());
        } else {
            migrations.push(Migration::missing(row.name.clone(), row.hash.clone(), row.state()));
        }
    }
}

fn resolve_dependencies(migrations: &mut [Migration]) -> Result<(), MigrationError> {
    for i in 0..migrations.len() {
        let depends = migrations[i].depends().to_vec();
        let mut resolved = Vec::with_capacity(depends.len());
        for dep_name in &depends {
            if migrations[i].name().eq_ignore_ascii_case(dep_name) {
                return Err(MigrationError::SelfDependency { migration: migrations[i].name().to_string() });
            }
            let idx = migrations.iter().position(|m| m.name().eq_ignore_ascii_case(dep_name));
            let idx = match idx {
                Some(idx) => idx,
                None => {
                    return Err(MigrationError::UnresolvedDependency {
                        migration: migrations[i].name().to_string(),
                        dependency: dep_name.clone(),
                    })
                }
            };
            // Migrations are sorted by MigrationComparer at this point: an index
            // greater than `i` means the dependency sorts after the dependent.
            if idx > i {
                return Err(MigrationError::ForwardDependency {
                    migration: migrations[i].name().to_string(),
                    dependency: dep_name.clone(),
                });
            }
            resolved.push(idx);
        }
        migrations[i].set_resolved_depends(resolved);
    }
    Ok(())
}

fn rank(phase: Phase) -> u8 {
    match phase {
        Phase::Pre => 0,
        Phase::Core => 1,
        Phase::Post => 2,
    }
}

/// Iterates to a fixpoint promoting each migration's per-phase content so it runs no
/// earlier than any not-yet-applied dependency content at or after its own phase
/// (§4.3 step 3). Promotion is monotone: a phase only ever moves later.
fn compute_planned_phases(migrations: &mut [Migration]) -> Result<(), MigrationError> {
    for m in migrations.iter_mut() {
        for p in Phase::ALL {
            if !m.content(p).is_empty() && !m.is_applied_through(p) {
                m.content_mut(p).planned_phase = Some(p);
            }
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..migrations.len() {
            let deps = migrations[i].resolved_depends().to_vec();
            for p in Phase::ALL {
                if migrations[i].content(p).is_empty() {
                    continue;
                }
                let current = match migrations[i].content(p).planned_phase {
                    Some(c) => c,
                    None => continue, // already applied through this phase; nothing to promote
                };
                let mut target = current;
                for &d in &deps {
                    let dep = &migrations[d];
                    for p2 in Phase::ALL {
                        if dep.content(p2).is_empty() || dep.is_applied_through(p2) {
                            continue;
                        }
                        if rank(p2) >= rank(p) && rank(p2) > rank(target) {
                            target = p2;
                        }
                    }
                }
                if target != current {
                    if migrations[i].is_applied_through(target) {
                        return Err(MigrationError::Incomplete {
                            migration: migrations[i].name().to_string(),
                            phase: target,
                        });
                    }
                    migrations[i].content_mut(p).planned_phase = Some(target);
                    changed = true;
                }
            }
        }
    }
    Ok(())
}

fn compose_plan(migrations: &[Migration]) -> MigrationPlan {
    let mut pre = Vec::new();
    let mut core = Vec::new();
    let mut post = Vec::new();

    for (i, m) in migrations.iter().enumerate() {
        if m.is_missing() {
            continue;
        }
        let mut in_pre = false;
        let mut in_post = false;
        for p in Phase::ALL {
            let content = m.content(p);
            if content.is_empty() {
                continue;
            }
            match content.planned_phase {
                Some(Phase::Pre) => in_pre = true,
                Some(Phase::Core) => core.push((i, p)),
                Some(Phase::Post) => in_post = true,
                None => {}
            }
        }
        if in_pre {
            pre.push(i);
        }
        if in_post {
            post.push(i);
        }
    }

    MigrationPlan { pre, core, post }
}
