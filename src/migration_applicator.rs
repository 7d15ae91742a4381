//! Applies a [`MigrationPlan`] to one target, one phase at a time (§4.4).
//!
//! Each phase pass is a plain sequential loop over the plan's per-phase list: unlike
//! the seed applicator there is no dependency queue to schedule here, since the
//! planner already resolved ordering and promoted content to the phase it can safely
//! run in. Grounded on `refinery_core`'s own migration runner, which likewise walks a
//! pre-sorted list and calls `AsyncExecutor::execute` per migration.

use tokio_util::sync::CancellationToken;

use crate::connection::TargetConnection;
use crate::error::MigrationError;
use crate::migration::{Migration, Phase};
use crate::plan::MigrationPlan;

/// Runs every plan item scheduled for `phase` against `conn`, in order.
///
/// `migrations` is the same slice the plan's indices refer to; executed content
/// advances each migration's local `State` so a later phase call in the same process
/// observes up-to-date applied state without re-querying the target.
pub async fn apply_migration_phase(
    conn: &mut dyn TargetConnection,
    migrations: &mut [Migration],
    plan: &MigrationPlan,
    phase: Phase,
    cancel: &CancellationToken,
) -> Result<(), MigrationError> {
    let items = plan_items_for_phase(migrations, plan, phase);

    for (i, authored_phase) in items {
        check_phase_order(&migrations[i], authored_phase, phase)?;

        conn.execute_migration_content(&migrations[i], authored_phase, cancel)
            .await
            .map_err(|source| MigrationError::Execution { migration: migrations[i].name().to_string(), phase: authored_phase, source })?;
        migrations[i].advance_state(authored_phase);
    }

    Ok(())
}

/// `(migration index, authored phase whose content actually runs)` pairs for `phase`.
/// `Pre`/`Post` lists carry bare indices since their content's authored phase always
/// equals the list's own phase (`Pre` content never promotes backward); `Core`
/// already carries the authored phase, since both native `Core` content and promoted
/// `Pre` content can land there.
fn plan_items_for_phase(migrations: &[Migration], plan: &MigrationPlan, phase: Phase) -> Vec<(usize, Phase)> {
    match phase {
        Phase::Pre => plan.pre.iter().map(|&i| (i, Phase::Pre)).collect(),
        Phase::Core => plan.core.clone(),
        Phase::Post => plan
            .post
            .iter()
            .flat_map(|&i| {
                Phase::ALL
                    .into_iter()
                    .filter(move |&p| migrations[i].content(p).planned_phase == Some(Phase::Post))
                    .map(move |p| (i, p))
            })
            .collect(),
    }
}

/// Guards against running `authored_phase`'s content out of order: every required,
/// still-unapplied phase earlier than `current_phase` must already be satisfied
/// (§4.4: "If PlannedPhase < currentPhase and IsRequired ... stop and report").
fn check_phase_order(migration: &Migration, authored_phase: Phase, current_phase: Phase) -> Result<(), MigrationError> {
    for p in Phase::ALL {
        if p == authored_phase || rank(p) >= rank(current_phase) {
            continue;
        }
        if migration.content(p).is_required && !migration.is_applied_through(p) {
            return Err(MigrationError::PhaseOutOfOrder {
                migration: migration.name().to_string(),
                phase: p,
                current_phase,
            });
        }
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
