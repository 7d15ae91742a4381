//! [`Target`] and [`TargetGroup`]: the handles a session fans work out across.

use crate::error::ArgumentError;

/// Narrow interface a caller (e.g. the out-of-scope CLI front-end) implements to
/// supply connection details, replacing runtime reflection over a vendor-specific SQL
/// context type with a small trait object (design note §9).
pub trait TargetSource: Send + Sync {
    fn connection_string(&self) -> &str;
    fn credential(&self) -> Option<&str>;
    fn server_display_name(&self) -> &str;
    fn database_display_name(&self) -> &str;
}

/// An opaque, pre-resolved credential. The session never interprets it; it is handed
/// to the connection factory as-is.
#[derive(Clone, Debug)]
pub struct Credential {
    pub principal: String,
    pub secret: String,
}

/// A handle to one target database. Immutable after construction.
#[derive(Clone, Debug)]
pub struct Target {
    connection_string: String,
    credential: Option<Credential>,
    server_display_name: String,
    database_display_name: String,
}

impl Target {
    pub fn new(
        connection_string: impl Into<String>,
        credential: Option<Credential>,
        server_display_name: impl Into<String>,
        database_display_name: impl Into<String>,
    ) -> Self {
        Target {
            connection_string: connection_string.into(),
            credential,
            server_display_name: server_display_name.into(),
            database_display_name: database_display_name.into(),
        }
    }

    pub fn from_source(source: &dyn TargetSource) -> Self {
        Target {
            connection_string: source.connection_string().to_string(),
            credential: source.credential().map(|secret| Credential {
                principal: String::new(),
                secret: secret.to_string(),
            }),
            server_display_name: source.server_display_name().to_string(),
            database_display_name: source.database_display_name().to_string(),
        }
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn server_display_name(&self) -> &str {
        &self.server_display_name
    }

    pub fn database_display_name(&self) -> &str {
        &self.database_display_name
    }

    /// The canonical log identifier for this target.
    pub fn full_display_name(&self) -> String {
        format!("{}.{}", self.server_display_name, self.database_display_name)
    }
}

/// An ordered collection of [`Target`]s plus the two group-level parallelism caps.
#[derive(Clone, Debug)]
pub struct TargetGroup {
    targets: Vec<Target>,
    max_parallelism: usize,
    max_parallelism_per_target: usize,
}

impl TargetGroup {
    /// `max_parallelism` / `max_parallelism_per_target` of `0` mean "use the logical
    /// CPU count", per the spec's "non-positive values" rule (Rust has no negative
    /// `usize`, so the sentinel is simply zero).
    pub fn new(
        targets: Vec<Target>,
        max_parallelism: usize,
        max_parallelism_per_target: usize,
    ) -> Result<Self, ArgumentError> {
        Ok(TargetGroup {
            targets,
            max_parallelism: effective_or_cpus(max_parallelism),
            max_parallelism_per_target: effective_or_cpus(max_parallelism_per_target),
        })
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    pub fn max_parallelism_per_target(&self) -> usize {
        self.max_parallelism_per_target
    }
}

fn effective_or_cpus(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get()
    } else {
        requested
    }
}
