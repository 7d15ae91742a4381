//! Tokenizer for seed `_Main.sql` content (§4.5).
//!
//! Recognizes quoted strings (`'...'`, escaped `''`), bracketed identifiers (`[...]`,
//! escaped `]]`), and block comments (`/* ... */`) as inert regions -- a `--#` that
//! appears inside one of these is just text, not a directive. Everything else is
//! scanned line by line looking for a `--# DIRECTIVE` at the start of the line
//! (leading whitespace tolerated). Unterminated strings/brackets/comments run to EOF
//! rather than erroring, matching the teacher's tolerant-scanner style in
//! `refinery_core::util`.
//!
//! Batch splitting itself is not this module's job: raw per-module text is handed to
//! the caller-supplied [`crate::preprocess::Preprocessor`] once a module is closed out
//! (§1, out-of-scope T-SQL preprocessor).

use crate::preprocess::Preprocessor;
use crate::seed::{SeedModule, WORKER_ALL, WORKER_ANY};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeedParseError {
    #[error("--# MODULE requires exactly one argument")]
    ModuleArgumentCount,
    #[error("--# WORKER requires exactly one argument")]
    WorkerArgumentCount,
    #[error("--# WORKER value must be 'all' or 'any', got {0:?}")]
    InvalidWorkerValue(String),
    #[error("--# {0} requires at least one argument")]
    DirectiveMissingArguments(&'static str),
    #[error("unknown directive --# {0}")]
    UnknownDirective(String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Str,
    Bracket,
    Comment,
}

struct ModuleBuilder {
    name: String,
    worker_id: i32,
    provides: std::collections::BTreeSet<String>,
    requires: std::collections::BTreeSet<String>,
    raw: String,
}

impl ModuleBuilder {
    fn new(name: impl Into<String>) -> Self {
        ModuleBuilder {
            name: name.into(),
            worker_id: WORKER_ANY,
            provides: std::collections::BTreeSet::new(),
            requires: std::collections::BTreeSet::new(),
            raw: String::new(),
        }
    }
}

/// Parses seed source text into an ordered list of [`SeedModule`]s. Module order
/// follows first appearance in the source; reopening a `MODULE` later in the file
/// appends to its existing raw text rather than starting a new entry.
pub fn parse_seed(input: &str, preprocessor: &dyn Preprocessor) -> Result<Vec<SeedModule>, SeedParseError> {
    let chars: Vec<char> = input.chars().collect();
    let n = chars.len();

    let mut order: Vec<String> = vec![crate::seed::INIT_MODULE.to_string()];
    let mut builders: Vec<ModuleBuilder> = vec![ModuleBuilder::new(crate::seed::INIT_MODULE)];
    let mut current: usize = 0;

    let mut mode = Mode::Normal;
    let mut i = 0usize;
    let mut at_line_start = true;

    while i < n {
        if mode == Mode::Normal && at_line_start {
            if let Some(line_end) = directive_line_end(&chars, i, n) {
                let line: String = chars[i..line_end].iter().collect();
                apply_directive(&line, &mut order, &mut builders, &mut current)?;
                i = line_end;
                if i < n && chars[i] == '\n' {
                    i += 1;
                }
                at_line_start = true;
                continue;
            }
        }

        let c = chars[i];
        match mode {
            Mode::Normal => {
                if c == '\'' {
                    builders[current].raw.push(c);
                    mode = Mode::Str;
                    i += 1;
                } else if c == '[' {
                    builders[current].raw.push(c);
                    mode = Mode::Bracket;
                    i += 1;
                } else if c == '/' && chars.get(i + 1) == Some(&'*') {
                    builders[current].raw.push('/');
                    builders[current].raw.push('*');
                    mode = Mode::Comment;
                    i += 2;
                } else {
                    builders[current].raw.push(c);
                    i += 1;
                }
            }
            Mode::Str => {
                if c == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        builders[current].raw.push_str("''");
                        i += 2;
                    } else {
                        builders[current].raw.push('\'');
                        mode = Mode::Normal;
                        i += 1;
                    }
                } else {
                    builders[current].raw.push(c);
                    i += 1;
                }
            }
            Mode::Bracket => {
                if c == ']' {
                    if chars.get(i + 1) == Some(&']') {
                        builders[current].raw.push_str("]]");
                        i += 2;
                    } else {
                        builders[current].raw.push(']');
                        mode = Mode::Normal;
                        i += 1;
                    }
                } else {
                    builders[current].raw.push(c);
                    i += 1;
                }
            }
            Mode::Comment => {
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    builders[current].raw.push_str("*/");
                    mode = Mode::Normal;
                    i += 2;
                } else {
                    builders[current].raw.push(c);
                    i += 1;
                }
            }
        }

        at_line_start = c == '\n';
    }

    Ok(order
        .into_iter()
        .map(|name| {
            let idx = builders.iter().position(|b| b.name == name).expect("registered module");
            let b = &builders[idx];
            SeedModule {
                name: b.name.clone(),
                worker_id: b.worker_id,
                batches: preprocessor.expand(&b.raw),
                provides: b.provides.clone(),
                requires: b.requires.clone(),
            }
        })
        .collect())
}

/// If the text starting at `i` (the start of a line) is a `--#` directive once leading
/// whitespace is skipped, returns the index of the end of that line (exclusive of the
/// trailing newline, if any).
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

fn apply_directive(
    line: &str,
    order: &mut Vec<String>,
    builders: &mut Vec<ModuleBuilder>,
    current: &mut usize,
) -> Result<(), SeedParseError> {
    let body = line.trim_start().trim_start_matches("--#").trim_start();
    let (keyword, rest) = match body.split_once(|c: char| c.is_whitespace() || c == ':') {
        Some((k, r)) => (k, r.trim_start_matches(':').trim()),
        None => (body, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    match keyword.to_ascii_uppercase().as_str() {
        "MODULE" => {
            if args.len() != 1 {
                return Err(SeedParseError::ModuleArgumentCount);
            }
            let name = args[0];
            if let Some(idx) = builders.iter().position(|b| b.name.eq_ignore_ascii_case(name)) {
                *current = idx;
            } else {
                builders.push(ModuleBuilder::new(name));
                order.push(name.to_string());
                *current = builders.len() - 1;
            }
        }
        "PROVIDES" => {
            if args.is_empty() {
                return Err(SeedParseError::DirectiveMissingArguments("PROVIDES"));
            }
            for a in args {
                builders[*current].provides.insert(a.to_string());
            }
        }
        "REQUIRES" => {
            if args.is_empty() {
                return Err(SeedParseError::DirectiveMissingArguments("REQUIRES"));
            }
            for a in args {
                builders[*current].requires.insert(a.to_string());
            }
        }
        "WORKER" => {
            if args.len() != 1 {
                return Err(SeedParseError::WorkerArgumentCount);
            }
            builders[*current].worker_id = match args[0].to_ascii_lowercase().as_str() {
                "all" => WORKER_ALL,
                "any" => WORKER_ANY,
                other => return Err(SeedParseError::InvalidWorkerValue(other.to_string())),
            };
        }
        other => return Err(SeedParseError::UnknownDirective(other.to_string())),
    }
    Ok(())
}
