//! Reads and tokenizes a migration's `_Main.sql` into per-phase content (§4.3).
//!
//! Shares the inert-region scanning rules with [`crate::seed_parser`] (quoted
//! strings, bracketed identifiers, block comments all tolerant of EOF) but recognizes
//! a different directive vocabulary: `PRE`/`CORE`/`POST` switch the active phase,
//! `REQUIRES` appends to `Depends`. As with seeds, splitting raw phase text into
//! batches is delegated to the caller-supplied [`crate::preprocess::Preprocessor`].

use std::fs;
use std::path::Path;

use crate::discovery::DiscoveredMigration;
use crate::migration::{Migration, Phase};
use crate::preprocess::Preprocessor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationParseError {
    #[error("--# {0} requires at least one argument")]
    DirectiveMissingArguments(&'static str),
    #[error("unknown directive --# {0}")]
    UnknownDirective(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationLoadError {
    #[error("error reading {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("error parsing {0}: {1}")]
    Parse(std::path::PathBuf, MigrationParseError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Str,
    Bracket,
    Comment,
}

/// The parsed, not-yet-preprocessed content of one migration file.
struct TokenizedPhases {
    pre: String,
    core: String,
    post: String,
    depends: Vec<String>,
}

/// Tokenizes `input`, splitting it into raw per-phase text and a `Depends` list.
/// Text authored before the first `PRE`/`CORE`/`POST` directive belongs to `Pre`,
/// the migration's default phase.
fn tokenize(input: &str) -> Result<TokenizedPhases, MigrationParseError> {
    let chars: Vec<char> = input.chars().collect();
    let n = chars.len();

    let mut phases = TokenizedPhases {
        pre: String::new(),
        core: String::new(),
        post: String::new(),
        depends: Vec::new(),
    };
    let mut current = Phase::Pre;

    let mut mode = Mode::Normal;
    let mut i = 0usize;
    let mut at_line_start = true;

    while i < n {
        if mode == Mode::Normal && at_line_start {
            if let Some(line_end) = directive_line_end(&chars, i, n) {
                let line: String = chars[i..line_end].iter().collect();
                apply_directive(&line, &mut current, &mut phases)?;
                i = line_end;
                if i < n && chars[i] == '\n' {
                    i += 1;
                }
                at_line_start = true;
                continue;
            }
        }

        let buf = match current {
            Phase::Pre => &mut phases.pre,
            Phase::Core => &mut phases.core,
            Phase::Post => &mut phases.post,
        };

        let c = chars[i];
        match mode {
            Mode::Normal => {
                if c == '\'' {
                    buf.push(c);
                    mode = Mode::Str;
                    i += 1;
                } else if c == '[' {
                    buf.push(c);
                    mode = Mode::Bracket;
                    i += 1;
                } else if c == '/' && chars.get(i + 1) == Some(&'*') {
                    buf.push_str("/*");
                    mode = Mode::Comment;
                    i += 2;
                } else {
                    buf.push(c);
                    i += 1;
                }
            }
            Mode::Str => {
                if c == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        buf.push_str("''");
                        i += 2;
                    } else {
                        buf.push('\'');
                        mode = Mode::Normal;
                        i += 1;
                    }
                } else {
                    buf.push(c);
                    i += 1;
                }
            }
            Mode::Bracket => {
                if c == ']' {
                    if chars.get(i + 1) == Some(&']') {
                        buf.push_str("]]");
                        i += 2;
                    } else {
                        buf.push(']');
                        mode = Mode::Normal;
                        i += 1;
                    }
                } else {
                    buf.push(c);
                    i += 1;
                }
            }
            Mode::Comment => {
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    buf.push_str("*/");
                    mode = Mode::Normal;
                    i += 2;
                } else {
                    buf.push(c);
                    i += 1;
                }
            }
        }

        at_line_start = c == '\n';
    }

    Ok(phases)
}

fn directive_line_end(chars: &[char], i: usize, n: usize) -> Option<usize> {
    let mut j = i;
    while j < n && (chars[j] == ' ' || chars[j] == '\t') {
        j += 1;
    }
    if j + 3 <= n && chars[j] == '-' && chars[j + 1] == '-' && chars[j + 2] == '#' {
        let mut end = j;
        while end < n && chars[end] != '\n' {
            end += 1;
        }
        Some(end)
    } else {
        None
    }
}

fn apply_directive(line: &str, current: &mut Phase, phases: &mut TokenizedPhases) -> Result<(), MigrationParseError> {
    let body = line.trim_start().trim_start_matches("--#").trim_start();
    let (keyword, rest) = match body.split_once(|c: char| c.is_whitespace() || c == ':') {
        Some((k, r)) => (k, r.trim_start_matches(':').trim()),
        None => (body, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    match keyword.to_ascii_uppercase().as_str() {
        "PRE" => *current = Phase::Pre,
        "CORE" => *current = Phase::Core,
        "POST" => *current = Phase::Post,
        "REQUIRES" => {
            if args.is_empty() {
                return Err(MigrationParseError::DirectiveMissingArguments("REQUIRES"));
            }
            for a in args {
                if !phases.depends.iter().any(|d: &String| d.eq_ignore_ascii_case(a)) {
                    phases.depends.push(a.to_string());
                }
            }
        }
        other => return Err(MigrationParseError::UnknownDirective(other.to_string())),
    }
    Ok(())
}

fn phase_sql(raw: &str, preprocessor: &dyn Preprocessor) -> Option<String> {
    let batches = preprocessor.expand(raw);
    if batches.is_empty() {
        None
    } else {
        Some(batches.join("\n"))
    }
}

/// Reads `discovered.main_file`, tokenizes it, and runs each phase's raw text through
/// `preprocessor` to produce a fully loaded [`Migration`].
pub fn load_migration(discovered: &DiscoveredMigration, preprocessor: &dyn Preprocessor) -> Result<Migration, MigrationLoadError> {
    load_migration_at(&discovered.name, &discovered.main_file, preprocessor)
}

pub fn load_migration_at(name: &str, path: &Path, preprocessor: &dyn Preprocessor) -> Result<Migration, MigrationLoadError> {
    let raw = fs::read_to_string(path).map_err(|e| MigrationLoadError::Io(path.to_path_buf(), e))?;
    let phases = tokenize(&raw).map_err(|e| MigrationLoadError::Parse(path.to_path_buf(), e))?;

    Ok(Migration::new(
        name.to_string(),
        Some(path.to_path_buf()),
        phase_sql(&phases.pre, preprocessor),
        phase_sql(&phases.core, preprocessor),
        phase_sql(&phases.post, preprocessor),
        phases.depends,
    ))
}

/// Loads every discovered migration, in the order given (typically discovery's
/// comparer order; see [`crate::discovery::discover_migrations`]).
pub fn load_all(
    discovered: &[DiscoveredMigration],
    preprocessor: &dyn Preprocessor,
) -> Result<Vec<Migration>, MigrationLoadError> {
    discovered.iter().map(|d| load_migration(d, preprocessor)).collect()
}
