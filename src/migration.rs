//! The [`Migration`] data model: phases, applied state, and per-phase content.
//!
//! Checksums are computed with `SipHasher13` rather than `DefaultHasher`, for the same
//! reason `refinery_core` pins it: `DefaultHasher`'s algorithm is unspecified and not
//! guaranteed stable across Rust releases, but migration identity must be.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use siphasher::sip::SipHasher13;

/// A deployment phase. `Core` is assumed to require downtime; zero-downtime deploys
/// apply only `Pre` and `Post`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Pre,
    Core,
    Post,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Pre, Phase::Core, Phase::Post];

    /// 0-based index used for log file names (§6.3).
    pub fn index(self) -> u8 {
        match self {
            Phase::Pre => 0,
            Phase::Core => 1,
            Phase::Post => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Pre => "Pre",
            Phase::Core => "Core",
            Phase::Post => "Post",
        }
    }

    fn directive_keyword(s: &str) -> Option<Phase> {
        match s.to_ascii_uppercase().as_str() {
            "PRE" => Some(Phase::Pre),
            "CORE" => Some(Phase::Core),
            "POST" => Some(Phase::Post),
            _ => None,
        }
    }

    pub fn parse_directive(s: &str) -> Option<Phase> {
        Self::directive_keyword(s)
    }

    /// The next phase, or `None` if `self` is `Post`.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Pre => Some(Phase::Core),
            Phase::Core => Some(Phase::Post),
            Phase::Post => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `State` value `N` encodes "the next phase to apply is N": 0 = nothing applied yet,
/// 1 = next is Pre, 2 = next is Core, 3 = next is Post, 4 = fully applied. Kept as an
/// explicit enum with two helper predicates (`is_applied_through`, `can_apply_through`)
/// rather than spreading the arithmetic across callers — the "typed magic-value
/// encoding" redesign from the design notes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MigrationState {
    NotApplied,
    AppliedPre,
    AppliedCore,
    AppliedPost,
}

impl MigrationState {
    fn rank(self) -> u8 {
        match self {
            MigrationState::NotApplied => 0,
            MigrationState::AppliedPre => 1,
            MigrationState::AppliedCore => 2,
            MigrationState::AppliedPost => 3,
        }
    }

    fn phase_rank(phase: Phase) -> u8 {
        match phase {
            Phase::Pre => 1,
            Phase::Core => 2,
            Phase::Post => 3,
        }
    }

    /// `IsAppliedThrough(phase) <=> State > phase`, where `State`'s encoded value is
    /// `rank() + 1` (rank 0 = "next to apply is Pre" = encoded 1, ... rank 3 =
    /// "fully applied" = encoded 4) and `phase`'s is `phase_rank` (Pre=1, Core=2,
    /// Post=3). That reduces to the simpler `rank() >= phase_rank(phase)`.
    pub fn is_applied_through(self, phase: Phase) -> bool {
        self.rank() >= Self::phase_rank(phase)
    }

    /// The phase this migration would move to after phase `P` is applied.
    pub fn advance(self, phase: Phase) -> MigrationState {
        match phase {
            Phase::Pre => MigrationState::AppliedPre,
            Phase::Core => MigrationState::AppliedCore,
            Phase::Post => MigrationState::AppliedPost,
        }
    }
}

impl Default for MigrationState {
    fn default() -> Self {
        MigrationState::NotApplied
    }
}

/// The authored SQL and planning metadata for one phase of one migration.
#[derive(Clone, Debug, Default)]
pub struct PhaseContent {
    pub sql: Option<String>,
    pub is_required: bool,
    pub planned_phase: Option<Phase>,
}

impl PhaseContent {
    pub fn is_empty(&self) -> bool {
        match &self.sql {
            None => true,
            // Whitespace-only migration SQL is treated as empty content: see
            // DESIGN.md ("whitespace-only phase SQL").
            Some(s) => s.trim().is_empty(),
        }
    }

    fn from_sql(sql: Option<String>) -> Self {
        let is_required = sql.as_deref().is_some_and(|s| !s.trim().is_empty());
        PhaseContent {
            sql,
            is_required,
            planned_phase: None,
        }
    }
}

/// A named schema unit, authored as `<Path>/Migrations/<Name>/_Main.sql`.
#[derive(Clone, Debug)]
pub struct Migration {
    name: String,
    path: Option<PathBuf>,
    hash: String,
    state: MigrationState,
    pre: PhaseContent,
    core: PhaseContent,
    post: PhaseContent,
    depends: Vec<String>,
    resolved_depends: Vec<usize>,
    has_changed: bool,
    diagnostics: Vec<Diagnostic>,
}

/// Severity of a [`Diagnostic`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    Info,
    Warning,
    Error,
}

/// A validation message attached to a migration or a plan.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: DiagnosticSeverity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: DiagnosticSeverity::Warning,
            message: message.into(),
        }
    }
}

impl Migration {
    /// The two pseudo-migrations: an operational prelude and epilogue that always
    /// apply, regardless of dependency or phase content rules.
    pub const BEGIN: &'static str = "_Begin";
    pub const END: &'static str = "_End";

    pub fn new(
        name: impl Into<String>,
        path: Option<PathBuf>,
        pre_sql: Option<String>,
        core_sql: Option<String>,
        post_sql: Option<String>,
        depends: Vec<String>,
    ) -> Self {
        let name = name.into();
        let hash = Self::compute_hash(&name, pre_sql.as_deref(), core_sql.as_deref(), post_sql.as_deref());
        Migration {
            name,
            path,
            hash,
            state: MigrationState::NotApplied,
            pre: PhaseContent::from_sql(pre_sql),
            core: PhaseContent::from_sql(core_sql),
            post: PhaseContent::from_sql(post_sql),
            depends,
            resolved_depends: Vec::new(),
            has_changed: false,
            diagnostics: Vec::new(),
        }
    }

    /// Hex digest over the authored SQL of all three phases, in the style of
    /// `refinery_core::Migration::unapplied`'s `SipHasher13` checksum, but rendered as
    /// hex since the spec's `Hash` field is a hex digest string rather than a raw u64.
    fn compute_hash(name: &str, pre: Option<&str>, core: Option<&str>, post: Option<&str>) -> String {
        let mut hasher = SipHasher13::new();
        name.hash(&mut hasher);
        pre.unwrap_or_default().hash(&mut hasher);
        core.unwrap_or_default().hash(&mut hasher);
        post.unwrap_or_default().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Constructs a "missing" migration: registered in the database but absent from
    /// the filesystem (`Path` is `None`). Used by the planner when merging applied
    /// state that has no corresponding discovered migration.
    pub fn missing(name: impl Into<String>, hash: impl Into<String>, state: MigrationState) -> Self {
        Migration {
            name: name.into(),
            path: None,
            hash: hash.into(),
            state,
            pre: PhaseContent::default(),
            core: PhaseContent::default(),
            post: PhaseContent::default(),
            depends: Vec::new(),
            resolved_depends: Vec::new(),
            has_changed: false,
            diagnostics: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// `true` iff the migration is missing on disk: registered in the database but
    /// absent from the filesystem.
    pub fn is_missing(&self) -> bool {
        self.path.is_none()
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn set_state(&mut self, state: MigrationState) {
        self.state = state;
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.eq_ignore_ascii_case(Self::BEGIN) || self.name.eq_ignore_ascii_case(Self::END)
    }

    pub fn content(&self, phase: Phase) -> &PhaseContent {
        match phase {
            Phase::Pre => &self.pre,
            Phase::Core => &self.core,
            Phase::Post => &self.post,
        }
    }

    pub fn content_mut(&mut self, phase: Phase) -> &mut PhaseContent {
        match phase {
            Phase::Pre => &mut self.pre,
            Phase::Core => &mut self.core,
            Phase::Post => &mut self.post,
        }
    }

    pub fn depends(&self) -> &[String] {
        &self.depends
    }

    pub fn resolved_depends(&self) -> &[usize] {
        &self.resolved_depends
    }

    pub fn set_resolved_depends(&mut self, indices: Vec<usize>) {
        self.resolved_depends = indices;
    }

    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    pub fn set_has_changed(&mut self, changed: bool) {
        self.has_changed = changed;
    }

    /// Rendered as `"Changed"` per S3, else empty.
    pub fn status_string(&self) -> &'static str {
        if self.has_changed {
            "Changed"
        } else {
            ""
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// `IsAppliedThrough(phase) <=> State > phase`.
    pub fn is_applied_through(&self, phase: Phase) -> bool {
        self.state.is_applied_through(phase)
    }

    /// Pseudo-migrations are always applicable. Otherwise the migration's state must be
    /// no further along than `phase + 1`, and every phase strictly between the current
    /// state and `phase` must have empty SQL (nothing left to skip over).
    pub fn can_apply_through(&self, phase: Phase) -> bool {
        if self.is_pseudo() {
            return true;
        }

        let state_rank = match self.state {
            MigrationState::NotApplied => 0u8,
            MigrationState::AppliedPre => 1,
            MigrationState::AppliedCore => 2,
            MigrationState::AppliedPost => 3,
        };
        let phase_rank = match phase {
            Phase::Pre => 1u8,
            Phase::Core => 2,
            Phase::Post => 3,
        };

        if state_rank > phase_rank {
            return false;
        }

        for p in Phase::ALL {
            let p_rank = match p {
                Phase::Pre => 1u8,
                Phase::Core => 2,
                Phase::Post => 3,
            };
            if p_rank > state_rank && p_rank < phase_rank && !self.content(p).is_empty() {
                return false;
            }
        }

        true
    }

    pub fn advance_state(&mut self, phase: Phase) {
        self.state = self.state.advance(phase);
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for Migration {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for Migration {}

/// `(rank, name)` with `rank(_Begin) = -1`, `rank(_End) = +1`, else `0`; name compared
/// case-insensitively ordinal.
pub fn migration_comparer(a: &Migration, b: &Migration) -> Ordering {
    fn rank(m: &Migration) -> i8 {
        if m.name().eq_ignore_ascii_case(Migration::BEGIN) {
            -1
        } else if m.name().eq_ignore_ascii_case(Migration::END) {
            1
        } else {
            0
        }
    }

    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.name().to_ascii_lowercase().cmp(&b.name().to_ascii_lowercase()))
}

pub fn sort_migrations(migrations: &mut [Migration]) {
    migrations.sort_by(|a, b| migration_comparer(a, b));
}
