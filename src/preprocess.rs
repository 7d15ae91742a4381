//! The T-SQL preprocessor contract (§1: explicitly out of scope).
//!
//! The engine treats batch expansion, variable substitution, and `:r` include
//! resolution as a pure `&str -> Vec<String>` function supplied by the caller. Both
//! the migration loader (§4.3) and the seed parser (§4.5) depend on this trait rather
//! than doing batch splitting themselves.

/// Expands a single chunk of authored T-SQL into an ordered list of batches.
pub trait Preprocessor: Send + Sync {
    fn expand(&self, sql: &str) -> Vec<String>;
}

/// A minimal stand-in preprocessor used by this crate's own tests: splits on a line
/// containing only `GO` (case-insensitive, optionally followed by a repeat count),
/// the conventional `sqlcmd`/SSMS batch separator. This is deliberately not a full
/// implementation of variable substitution or `:r` includes -- those remain the real
/// preprocessor's job.
#[derive(Default)]
pub struct GoBatchPreprocessor;

impl Preprocessor for GoBatchPreprocessor {
    fn expand(&self, sql: &str) -> Vec<String> {
        let mut batches = Vec::new();
        let mut current = String::new();

        for line in sql.lines() {
            if is_go_line(line) {
                push_if_non_blank(&mut batches, &current);
                current.clear();
            } else {
                current.push_str(line);
                current.push('\n');
            }
        }
        push_if_non_blank(&mut batches, &current);
        batches
    }
}

fn is_go_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    let mut parts = trimmed.split_whitespace();
    let Some(first) = parts.next() else { return false };
    if !first.eq_ignore_ascii_case("go") {
        return false;
    }
    match parts.next() {
        None => parts.next().is_none(),
        Some(count) => count.parse::<u32>().is_ok() && parts.next().is_none(),
    }
}

fn push_if_non_blank(batches: &mut Vec<String>, text: &str) {
    if !text.trim().is_empty() {
        batches.push(text.trim().to_string());
    }
}
