//! Progress reporting and per-target log files (§4.8, §6.3).
//!
//! The out-of-scope PowerShell host adapter is replaced with a plug-in trait object
//! (design note §9): `Console` is the one seam the session and applicators report
//! through. `FileConsole` writes the log files this section describes and forwards
//! to the `log` facade; `NullConsole` is a no-op used by tests.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::migration::{Diagnostic, DiagnosticSeverity, Phase};

/// Outcome of one (target, phase) or (target, seed) apply (Glossary: "Disposition"),
/// rendered as a trailing marker on the summary line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Successful,
    Incomplete,
    Failed,
}

impl Disposition {
    pub fn marker(self) -> &'static str {
        match self {
            Disposition::Successful => "",
            Disposition::Incomplete => " [INCOMPLETE]",
            Disposition::Failed => " [EXCEPTION]",
        }
    }
}

/// What's being applied: names the log file and its header line (§6.3).
#[derive(Clone, Debug)]
pub enum ApplyKind {
    Migration { phase: Phase },
    Seed { name: String },
}

impl ApplyKind {
    fn file_suffix(&self) -> String {
        match self {
            ApplyKind::Migration { phase } => format!("{}_{}", phase.index(), phase.name()),
            ApplyKind::Seed { name } => name.clone(),
        }
    }

    fn label(&self) -> String {
        match self {
            ApplyKind::Migration { phase } => phase.name().to_string(),
            ApplyKind::Seed { name } => format!("seed {name}"),
        }
    }
}

/// A handle to one open per-(target, apply) log file.
pub trait LogHandle: Send {
    fn write_line(&mut self, line: &str);
    fn finish(&mut self, applied_count: usize, disposition: Disposition);
}

/// Plug-in progress-reporting surface (§9 design note), replacing the PowerShell
/// host/console adapter.
pub trait Console: Send + Sync {
    fn create_log(&self, server: &str, database: &str, kind: &ApplyKind) -> Box<dyn LogHandle>;
    fn report_starting(&self, target: &str, kind: &ApplyKind);
    fn report_applying(&self, target: &str, kind: &ApplyKind, item: &str);
    fn report_applied(&self, target: &str, kind: &ApplyKind, item: &str);
    fn report_problem(&self, target: &str, diagnostic: &Diagnostic);
}

struct FileLogHandle {
    file: File,
}

impl LogHandle for FileLogHandle {
    fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
    }

    fn finish(&mut self, applied_count: usize, disposition: Disposition) {
        let _ = writeln!(self.file, "Applied {applied_count}{}", disposition.marker());
    }
}

fn env_or(var: &str, fallback: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| fallback.to_string())
}

fn header_lines(kind: &ApplyKind) -> Vec<String> {
    vec![
        format!("Tool: {} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        format!("Host: {}", env_or("HOSTNAME", &env_or("COMPUTERNAME", "unknown"))),
        format!("CPUs: {}", num_cpus::get()),
        format!("User: {}", env_or("USER", &env_or("USERNAME", "unknown"))),
        format!("OS: {} ({})", std::env::consts::OS, std::env::consts::ARCH),
        "Runtime: tokio async runtime".to_string(),
        format!("Process: {}", std::process::id()),
        format!("Phase: {}", kind.label()),
    ]
}

/// Writes `<server>.<database>.<phaseIndex>_<phaseName>.log` / `<server>.<database>.<seedName>.log`
/// under `log_dir`, and forwards every report to the `log` facade.
pub struct FileConsole {
    log_dir: PathBuf,
}

impl FileConsole {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        FileConsole { log_dir: log_dir.into() }
    }
}

impl Console for FileConsole {
    fn create_log(&self, server: &str, database: &str, kind: &ApplyKind) -> Box<dyn LogHandle> {
        let _ = std::fs::create_dir_all(&self.log_dir);
        let path = self.log_dir.join(format!("{server}.{database}.{}.log", kind.file_suffix()));
        let file = File::create(&path).unwrap_or_else(|e| {
            log::warn!(target: "flotilla::console", "could not create log {}: {e}", path.display());
            // A log file that can't be created still needs a writable sink so the
            // apply can proceed; /dev/null-equivalent via a discarded tempfile.
            File::create(std::env::temp_dir().join(format!("flotilla-fallback-{}", std::process::id()))).expect("tempdir is writable")
        });
        let mut handle = FileLogHandle { file };
        for line in header_lines(kind) {
            handle.write_line(&line);
        }
        Box::new(handle)
    }

    fn report_starting(&self, target: &str, kind: &ApplyKind) {
        log::info!(target: "flotilla::console", "{target}: starting {}", kind.label());
    }

    fn report_applying(&self, target: &str, kind: &ApplyKind, item: &str) {
        log::info!(target: "flotilla::console", "{target}: applying {item} ({})", kind.label());
    }

    fn report_applied(&self, target: &str, kind: &ApplyKind, item: &str) {
        log::info!(target: "flotilla::console", "{target}: applied {item} ({})", kind.label());
    }

    fn report_problem(&self, target: &str, diagnostic: &Diagnostic) {
        match diagnostic.severity {
            DiagnosticSeverity::Error => log::error!(target: "flotilla::console", "{target}: {}", diagnostic.message),
            DiagnosticSeverity::Warning => log::warn!(target: "flotilla::console", "{target}: {}", diagnostic.message),
            DiagnosticSeverity::Info => log::info!(target: "flotilla::console", "{target}: {}", diagnostic.message),
        }
    }
}

/// A no-op `Console`, used by tests and by callers that don't want per-target log
/// files.
pub struct NullConsole;

struct NullLogHandle;

impl LogHandle for NullLogHandle {
    fn write_line(&mut self, _line: &str) {}
    fn finish(&mut self, _applied_count: usize, _disposition: Disposition) {}
}

impl Console for NullConsole {
    fn create_log(&self, _server: &str, _database: &str, _kind: &ApplyKind) -> Box<dyn LogHandle> {
        Box::new(NullLogHandle)
    }
    fn report_starting(&self, _target: &str, _kind: &ApplyKind) {}
    fn report_applying(&self, _target: &str, _kind: &ApplyKind, _item: &str) {}
    fn report_applied(&self, _target: &str, _kind: &ApplyKind, _item: &str) {}
    fn report_problem(&self, _target: &str, _diagnostic: &Diagnostic) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn migration_log_file_name_encodes_phase_index_and_name() {
        let tmp = TempDir::new().unwrap();
        let console = FileConsole::new(tmp.path());
        let kind = ApplyKind::Migration { phase: Phase::Core };
        let mut handle = console.create_log("srv01", "AppDb", &kind);
        handle.write_line("Migrations: A, B");
        handle.finish(2, Disposition::Successful);

        let path = tmp.path().join("srv01.AppDb.1_Core.log");
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("Tool: flotilla-deploy"));
        assert!(content.contains("Migrations: A, B"));
        assert!(content.contains("Applied 2"));
    }

    #[test]
    fn seed_log_file_uses_seed_name() {
        let tmp = TempDir::new().unwrap();
        let console = FileConsole::new(tmp.path());
        let kind = ApplyKind::Seed { name: "Lookups".to_string() };
        let mut handle = console.create_log("srv01", "AppDb", &kind);
        handle.finish(3, Disposition::Incomplete);

        let content = fs::read_to_string(tmp.path().join("srv01.AppDb.Lookups.log")).unwrap();
        assert!(content.contains("Applied 3 [INCOMPLETE]"));
    }

    #[test]
    fn null_console_creates_no_files() {
        let console = NullConsole;
        let mut handle = console.create_log("srv", "db", &ApplyKind::Migration { phase: Phase::Pre });
        handle.write_line("ignored");
        handle.finish(0, Disposition::Failed);
    }

    #[test]
    fn disposition_markers_match_glossary() {
        assert_eq!(Disposition::Successful.marker(), "");
        assert_eq!(Disposition::Incomplete.marker(), " [INCOMPLETE]");
        assert_eq!(Disposition::Failed.marker(), " [EXCEPTION]");
    }
}
