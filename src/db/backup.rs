use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_MAX_BACKUPS: usize = 5;
const BACKUP_EXT: &str = ".bak";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `<db>.<YYYYmmdd-HHMMSS>.bak` next to the database file.
pub fn backup_path(db_path: &Path, at: DateTime<Local>) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(format!(".{}{BACKUP_EXT}", at.format("%Y%m%d-%H%M%S")));
    PathBuf::from(name)
}

/// Copies an existing database aside and prunes older copies. Returns `None`
/// when there is no database to back up.
pub fn backup_database(db_path: &Path, max_backups: usize) -> Result<Option<PathBuf>, BackupError> {
    let Ok(meta) = std::fs::metadata(db_path) else {
        return Ok(None);
    };
    if !meta.is_file() {
        return Err(BackupError::NotAFile(db_path.to_path_buf()));
    }
    info!(path = %db_path.display(), bytes = meta.len(), "backing up existing database");

    let target = backup_path(db_path, Local::now());
    std::fs::copy(db_path, &target).map_err(|source| BackupError::Copy {
        from: db_path.to_path_buf(),
        to: target.clone(),
        source,
    })?;
    info!(backup = %target.display(), "database backed up");

    prune_old_backups(db_path, max_backups);
    Ok(Some(target))
}

/// Keeps the `max_backups` newest backups of `db_path`. Timestamped names sort
/// chronologically, so the oldest are first. Failures are logged.
pub fn prune_old_backups(db_path: &Path, max_backups: usize) -> Vec<PathBuf> {
    let dir = match db_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(base) = db_path.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let prefix = format!("{base}.");

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "failed to read backup directory: {e}");
            return Vec::new();
        }
    };

    let mut backups: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(BACKUP_EXT))
        })
        .map(|entry| entry.path())
        .collect();

    if backups.len() <= max_backups {
        return Vec::new();
    }
    backups.sort();

    let excess = backups.len() - max_backups;
    let mut removed = Vec::with_capacity(excess);
    for file in backups.into_iter().take(excess) {
        match std::fs::remove_file(&file) {
            Ok(()) => {
                info!(backup = %file.display(), "removed old backup");
                removed.push(file);
            }
            Err(e) => warn!(backup = %file.display(), "failed to remove old backup: {e}"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_path_format() {
        let at = Local.with_ymd_and_hms(2025, 3, 7, 9, 5, 1).unwrap();
        let path = backup_path(Path::new("/data/maintainers.db"), at);
        assert_eq!(path, PathBuf::from("/data/maintainers.db.20250307-090501.bak"));
    }

    #[test]
    fn test_backup_missing_database_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let result = backup_database(&dir.path().join("absent.db"), 5).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_backup_copies_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("maintainers.db");
        std::fs::write(&db, b"sqlite bytes").unwrap();

        let backup = backup_database(&db, 5).unwrap().unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), b"sqlite bytes");
        assert!(backup.to_string_lossy().ends_with(".bak"));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("maintainers.db");
        std::fs::write(&db, b"db").unwrap();
        for stamp in ["20240101-000000", "20240102-000000", "20240103-000000", "20240104-000000"] {
            std::fs::write(dir.path().join(format!("maintainers.db.{stamp}.bak")), b"old").unwrap();
        }
        std::fs::write(dir.path().join("other.db.20240101-000000.bak"), b"unrelated").unwrap();

        let removed = prune_old_backups(&db, 2);
        assert_eq!(removed.len(), 2);
        assert!(removed[0].ends_with("maintainers.db.20240101-000000.bak"));
        assert!(removed[1].ends_with("maintainers.db.20240102-000000.bak"));
        assert!(dir.path().join("maintainers.db.20240104-000000.bak").exists());
        assert!(dir.path().join("other.db.20240101-000000.bak").exists());
        assert!(db.exists());
    }
}
