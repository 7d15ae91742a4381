//! Filesystem discovery of migrations and seeds under the directory layout in §6.1:
//!
//! ```text
//! <Path>/
//!   Migrations/<Name>/_Main.sql
//!   Seeds/<Name>/_Main.sql
//! ```
//!
//! Grounded on `refinery_core::util::find_migration_files`: `walkdir::WalkDir` over a
//! single directory level, filtering to the expected shape. Unlike the teacher's
//! lenient "log and skip" policy for misnamed files, a directory that doesn't contain
//! `_Main.sql` is a discovery-time error here, because the deploy tool's directory
//! convention is its only contract with the filesystem (see SPEC_FULL.md §4.3.1).

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::migration::{sort_migrations, Migration};
use crate::seed::Seed;

const MAIN_FILE: &str = "_Main.sql";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid root path {0}: {1}")]
    InvalidRoot(PathBuf, std::io::Error),
    #[error("{0} is missing {MAIN_FILE}")]
    MissingMainFile(PathBuf),
    #[error("error reading {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

/// One discovered migration directory: a name, and the path to its `_Main.sql` (if
/// present on disk -- discovery never encounters a "missing" migration itself, since
/// that state only arises once applied-migration rows are merged in by the planner).
#[derive(Debug, Clone)]
pub struct DiscoveredMigration {
    pub name: String,
    pub main_file: PathBuf,
}

fn scan_named_directories(root: &Path) -> Result<Vec<(String, PathBuf)>, DiscoveryError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let main_file = entry.path().join(MAIN_FILE);
        if !main_file.is_file() {
            return Err(DiscoveryError::MissingMainFile(entry.path().to_path_buf()));
        }
        found.push((name, main_file));
    }
    Ok(found)
}

/// Discover `<root>/Migrations/<Name>/_Main.sql`, returning bare (unloaded) migration
/// handles sorted by [`crate::migration::migration_comparer`].
pub fn discover_migrations(root: impl AsRef<Path>) -> Result<Vec<DiscoveredMigration>, DiscoveryError> {
    let migrations_dir = root.as_ref().join("Migrations");
    let mut found: Vec<DiscoveredMigration> = scan_named_directories(&migrations_dir)?
        .into_iter()
        .map(|(name, main_file)| DiscoveredMigration { name, main_file })
        .collect();

    // Sort using the same comparer the planner uses, so discovery order already
    // matches the canonical apply order before content is loaded.
    found.sort_by(|a, b| {
        let ma = Migration::new(a.name.clone(), None, None, None, None, Vec::new());
        let mb = Migration::new(b.name.clone(), None, None, None, None, Vec::new());
        crate::migration::migration_comparer(&ma, &mb)
    });
    Ok(found)
}

/// Discover `<root>/Seeds/<Name>/_Main.sql`.
pub fn discover_seeds(root: impl AsRef<Path>) -> Result<Vec<Seed>, DiscoveryError> {
    let seeds_dir = root.as_ref().join("Seeds");
    let mut found: Vec<Seed> = scan_named_directories(&seeds_dir)?
        .into_iter()
        .map(|(name, main_file)| Seed::new(name, main_file))
        .collect();
    found.sort_by(|a, b| a.name().to_ascii_lowercase().cmp(&b.name().to_ascii_lowercase()));
    Ok(found)
}

/// Ensure ordering helper exported for callers that load migrations in a different
/// order than discovery produced (e.g. after merging applied state).
pub fn ensure_sorted(migrations: &mut [Migration]) {
    sort_migrations(migrations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_main(dir: &Path, name: &str) {
        let d = dir.join(name);
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join(MAIN_FILE), "--# PRE\nselect 1;").unwrap();
    }

    #[test]
    fn discovers_migrations_in_comparer_order() {
        let tmp = TempDir::new().unwrap();
        let migrations_dir = tmp.path().join("Migrations");
        write_main(&migrations_dir, "Zeta");
        write_main(&migrations_dir, "_End");
        write_main(&migrations_dir, "Alpha");
        write_main(&migrations_dir, "_Begin");

        let found = discover_migrations(tmp.path()).unwrap();
        let names: Vec<_> = found.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["_Begin", "Alpha", "Zeta", "_End"]);
    }

    #[test]
    fn missing_root_yields_empty_list() {
        let tmp = TempDir::new().unwrap();
        let found = discover_migrations(tmp.path()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn directory_without_main_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let migrations_dir = tmp.path().join("Migrations");
        fs::create_dir_all(migrations_dir.join("Broken")).unwrap();

        let result = discover_migrations(tmp.path());
        assert!(matches!(result, Err(DiscoveryError::MissingMainFile(_))));
    }

    #[test]
    fn discovers_seeds_case_insensitively_sorted() {
        let tmp = TempDir::new().unwrap();
        let seeds_dir = tmp.path().join("Seeds");
        write_main(&seeds_dir, "zebra");
        write_main(&seeds_dir, "Apple");

        let found = discover_seeds(tmp.path()).unwrap();
        let names: Vec<_> = found.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["Apple", "zebra"]);
    }
}
