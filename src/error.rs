//! Error types for the deployment engine.
//!
//! Each layer of the engine gets its own small `thiserror` enum rather than a single
//! monolithic kind, since callers generally want to match on "this was a migration
//! planning problem" vs. "this was a seed dependency problem" vs. "this was a
//! connection failure" separately.

use crate::migration::Phase;

/// A problem with a caller-supplied argument. Never counted toward a session's
/// tolerated error budget; these indicate a programming mistake by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ArgumentError {
    #[error("target group must not contain a null target")]
    NullTarget,
    #[error("parallelism limit must be positive or zero (zero means \"use logical CPU count\")")]
    InvalidParallelism,
    #[error("unknown value {0:?} for enum argument")]
    UnknownEnumValue(String),
}

/// Failure to connect to, or execute a batch against, a target database.
#[derive(Debug, thiserror::Error)]
#[error("{context}: {source}")]
pub struct ConnectionError {
    pub context: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl ConnectionError {
    pub fn new(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectionError {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// A validation or execution failure while planning or applying schema migrations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("the migration dependency graph does not permit cycles")]
    Cycle,
    #[error("migration {migration} depends on {dependency}, which is not a known migration")]
    UnresolvedDependency { migration: String, dependency: String },
    #[error("migration {migration} depends on itself")]
    SelfDependency { migration: String },
    #[error(
        "migration {migration} depends on {dependency}, which is ordered after it; \
         forward dependencies are not allowed"
    )]
    ForwardDependency { migration: String, dependency: String },
    #[error(
        "migration {migration} cannot satisfy its dependencies without reapplying phase {phase:?}, \
         which has already been applied"
    )]
    Incomplete { migration: String, phase: Phase },
    #[error(
        "migration {migration} blocks application in phase {current_phase:?}: its required {phase:?} \
         content has not been applied yet"
    )]
    PhaseOutOfOrder { migration: String, phase: Phase, current_phase: Phase },
    #[error("migration {migration} content has changed since it was applied")]
    HashChanged { migration: String },
    #[error("error executing migration {migration} in phase {phase:?}")]
    Execution {
        migration: String,
        phase: Phase,
        #[source]
        source: ConnectionError,
    },
}

/// A validation or execution failure while applying a content seed.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("the topic '{0}' is required but not provided by any module")]
    UnprovidedTopic(String),
    #[error("the dependency graph does not permit cycles")]
    Cycle,
    #[error("error executing seed module {module}")]
    Execution {
        module: String,
        #[source]
        source: ConnectionError,
    },
}

/// The union of failures a single target apply can produce.
#[derive(Debug, thiserror::Error)]
pub enum SessionFailure {
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Seed(#[from] SeedError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// A per-target failure annotated with the target's canonical display name.
///
/// This is the Rust replacement for the source design's "stash the target name in an
/// auxiliary exception data map": the annotation is a struct field instead of a
/// best-effort side channel, so it can never be silently dropped.
#[derive(Debug, thiserror::Error)]
#[error("{target}: {error}")]
pub struct TaggedError {
    pub target: String,
    #[source]
    pub error: SessionFailure,
}

impl TaggedError {
    pub fn new(target: impl Into<String>, error: impl Into<SessionFailure>) -> Self {
        TaggedError {
            target: target.into(),
            error: error.into(),
        }
    }
}

/// The outcome of [`crate::session::Session::complete_applying`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was cancelled, either externally or by crossing `MaxErrorCount`.
    /// No additional errors are reported: cancellation short-circuits aggregation.
    #[error("deployment session was cancelled")]
    Cancelled,
    /// Exactly one target failed.
    #[error("{0}")]
    Single(TaggedError),
    /// More than one target failed; ordered by arrival.
    #[error("{} targets failed: {}", .0.len(), format_aggregate(.0))]
    Aggregate(Vec<TaggedError>),
}

fn format_aggregate(errors: &[TaggedError]) -> String {
    errors
        .iter()
        .map(|e| e.target.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
