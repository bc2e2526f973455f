/*!
Timestamped archive copies of the primary flow document.

Archive entries live in a directory beside the primary (or in a configured
directory) and are named `<counter>-<primary file name>`. The counter is a
nanosecond wall-clock reading forced to be strictly increasing within the
process. Entries are created with `create_new`, so a name already taken by
another process moves the counter forward instead of overwriting.
*/

use chrono::{DateTime, TimeZone, Utc};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::{FlowStoreError, Result};

/// Directory name used beside the primary when no archive directory is configured
pub const DEFAULT_ARCHIVE_DIR_NAME: &str = "archive";

/// How many names are tried before giving up on a collision streak
const MAX_NAME_ATTEMPTS: usize = 16;

static LAST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Next archive counter: nanoseconds since the epoch, strictly increasing
fn next_counter() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut prev = LAST_COUNTER.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_COUNTER.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// A retained historical copy of the primary document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub counter: u64,
    pub size: u64,
}

impl ArchiveEntry {
    /// Wall-clock time the entry was taken, recovered from its counter
    pub fn archived_at(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.counter.min(i64::MAX as u64) as i64)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Creates, lists and prunes archive entries
#[derive(Debug, Clone, Default)]
pub struct ArchiveManager {
    archive_dir: Option<PathBuf>,
}

impl ArchiveManager {
    /// Create a manager; an empty path counts as unset
    pub fn new(archive_dir: Option<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.filter(|dir| !dir.as_os_str().is_empty()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.effective_archive_dir().map(Path::to_path_buf))
    }

    /// Directory archive entries for `primary` are written to
    pub fn resolve_dir(&self, primary: &Path) -> PathBuf {
        match &self.archive_dir {
            Some(dir) => dir.clone(),
            None => primary
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .join(DEFAULT_ARCHIVE_DIR_NAME),
        }
    }

    /// Copy the current primary document into a new archive entry
    ///
    /// # Errors
    /// `FlowStoreError::Archive` if the archive directory cannot be created,
    /// exists but is not a directory, or the copy fails.
    pub fn archive(&self, primary: &Path) -> Result<PathBuf> {
        let dir = self.prepare_dir(primary)?;
        let base = base_name(primary)?;
        let mut source = File::open(primary).map_err(|e| FlowStoreError::archive(primary, e))?;

        let target = create_entry(&dir, base, &mut source, &mut next_counter)?;
        info!("Archived flow configuration to {}", target.display());
        Ok(target)
    }

    fn prepare_dir(&self, primary: &Path) -> Result<PathBuf> {
        let dir = self.resolve_dir(primary);
        if !dir.exists() {
            debug!("Creating archive directory {}", dir.display());
            fs::create_dir_all(&dir).map_err(|e| FlowStoreError::archive(&dir, e))?;
        }
        if !dir.is_dir() {
            return Err(FlowStoreError::archive(
                &dir,
                io::Error::new(
                    io::ErrorKind::Other,
                    "archive directory doesn't appear to be a directory",
                ),
            ));
        }
        Ok(dir)
    }

    /// Archive entries for `primary`, oldest first
    ///
    /// Files in the archive directory that do not follow the
    /// `<counter>-<primary file name>` pattern are ignored.
    pub fn list(&self, primary: &Path) -> Result<Vec<ArchiveEntry>> {
        let dir = self.resolve_dir(primary);
        let base = base_name(primary)?;

        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FlowStoreError::archive(&dir, e)),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| FlowStoreError::archive(&dir, e))?;
            let Some(counter) = parse_counter(&entry.file_name(), base) else {
                continue;
            };
            let meta = entry.metadata().map_err(|e| FlowStoreError::archive(entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            entries.push(ArchiveEntry {
                path: entry.path(),
                counter,
                size: meta.len(),
            });
        }

        entries.sort_by_key(|entry| entry.counter);
        Ok(entries)
    }

    /// Delete the oldest entries so that at most `max_count` remain
    ///
    /// Returns the removed paths. An entry that cannot be deleted is logged
    /// and skipped.
    pub fn prune(&self, primary: &Path, max_count: usize) -> Result<Vec<PathBuf>> {
        let entries = self.list(primary)?;
        let excess = entries.len().saturating_sub(max_count);

        let mut removed = Vec::with_capacity(excess);
        for entry in entries.into_iter().take(excess) {
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    debug!("Pruned archive entry {}", entry.path.display());
                    removed.push(entry.path);
                }
                Err(e) => warn!(
                    "Unable to prune archive entry {}: {}",
                    entry.path.display(),
                    e
                ),
            }
        }
        Ok(removed)
    }
}

fn base_name(primary: &Path) -> Result<&OsStr> {
    primary.file_name().ok_or_else(|| {
        FlowStoreError::archive(
            primary,
            io::Error::new(io::ErrorKind::InvalidInput, "path does not name a file"),
        )
    })
}

fn entry_name(counter: u64, base: &OsStr) -> OsString {
    let mut name = OsString::from(format!("{counter}-"));
    name.push(base);
    name
}

fn parse_counter(name: &OsStr, base: &OsStr) -> Option<u64> {
    let name = name.to_str()?;
    let base = base.to_str()?;
    let digits = name.strip_suffix(base)?.strip_suffix('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Copy `source` into a freshly created, uniquely named entry in `dir`
fn create_entry(
    dir: &Path,
    base: &OsStr,
    source: &mut dyn Read,
    counters: &mut dyn FnMut() -> u64,
) -> Result<PathBuf> {
    for _ in 0..MAX_NAME_ATTEMPTS {
        let target = dir.join(entry_name(counters(), base));
        match OpenOptions::new().write(true).create_new(true).open(&target) {
            Ok(mut out) => {
                let copied = io::copy(source, &mut out).and_then(|_| out.sync_all());
                if let Err(e) = copied {
                    drop(out);
                    let _ = fs::remove_file(&target);
                    return Err(FlowStoreError::archive(&target, e));
                }
                return Ok(target);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("Archive name {} already taken", target.display());
            }
            Err(e) => return Err(FlowStoreError::archive(&target, e)),
        }
    }

    Err(FlowStoreError::archive(
        dir,
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            "no free archive file name after repeated collisions",
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use tempfile::TempDir;

    fn primary_with(dir: &Path, content: &[u8]) -> PathBuf {
        let primary = dir.join("flow.xml.gz");
        fs::write(&primary, content).unwrap();
        primary
    }

    #[test]
    fn test_default_dir_beside_primary() {
        let temp_dir = TempDir::new().unwrap();
        let primary = primary_with(temp_dir.path(), b"v1");
        let manager = ArchiveManager::new(None);

        let archived = manager.archive(&primary).unwrap();

        assert_eq!(archived.parent().unwrap(), temp_dir.path().join("archive"));
        assert_eq!(fs::read(&archived).unwrap(), b"v1");
        let name = archived.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("-flow.xml.gz"));
        assert!(name.split('-').next().unwrap().parse::<u64>().is_ok());
    }

    #[test]
    fn test_empty_configured_dir_uses_default() {
        let manager = ArchiveManager::new(Some(PathBuf::new()));
        assert_eq!(
            manager.resolve_dir(Path::new("/conf/flow.xml.gz")),
            PathBuf::from("/conf/archive")
        );
    }

    #[test]
    fn test_configured_dir() {
        let temp_dir = TempDir::new().unwrap();
        let primary = primary_with(temp_dir.path(), b"v1");
        let history = temp_dir.path().join("history/flows");
        let manager = ArchiveManager::new(Some(history.clone()));

        let archived = manager.archive(&primary).unwrap();

        assert!(archived.starts_with(&history));
        assert!(!temp_dir.path().join("archive").exists());
    }

    #[test]
    fn test_archive_dir_is_a_file() {
        let temp_dir = TempDir::new().unwrap();
        let primary = primary_with(temp_dir.path(), b"v1");
        fs::write(temp_dir.path().join("archive"), b"in the way").unwrap();

        let err = ArchiveManager::new(None).archive(&primary).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Archive);
    }

    #[test]
    fn test_sequential_archives_have_distinct_names() {
        let temp_dir = TempDir::new().unwrap();
        let primary = primary_with(temp_dir.path(), b"v1");
        let manager = ArchiveManager::new(None);

        let first = manager.archive(&primary).unwrap();
        let second = manager.archive(&primary).unwrap();

        assert_ne!(first, second);
        assert_eq!(manager.list(&primary).unwrap().len(), 2);
    }

    #[test]
    fn test_counter_is_strictly_increasing() {
        let mut last = 0;
        for _ in 0..1000 {
            let next = next_counter();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_collision_moves_to_next_counter() {
        let temp_dir = TempDir::new().unwrap();
        let base = OsStr::new("flow.xml.gz");
        let mut sequence = vec![42u64, 42, 43].into_iter();
        let mut counters = move || sequence.next().unwrap();

        let first = create_entry(temp_dir.path(), base, &mut &b"a"[..], &mut counters).unwrap();
        let second = create_entry(temp_dir.path(), base, &mut &b"b"[..], &mut counters).unwrap();

        assert_eq!(first, temp_dir.path().join("42-flow.xml.gz"));
        assert_eq!(second, temp_dir.path().join("43-flow.xml.gz"));
        assert_eq!(fs::read(&first).unwrap(), b"a");
        assert_eq!(fs::read(&second).unwrap(), b"b");
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let primary = primary_with(temp_dir.path(), b"v1");
        let archive_dir = temp_dir.path().join("archive");
        fs::create_dir(&archive_dir).unwrap();
        fs::write(archive_dir.join("20-flow.xml.gz"), b"b").unwrap();
        fs::write(archive_dir.join("10-flow.xml.gz"), b"a").unwrap();
        fs::write(archive_dir.join("notes.txt"), b"x").unwrap();
        fs::write(archive_dir.join("x1-flow.xml.gz"), b"x").unwrap();
        fs::write(archive_dir.join("30-other.xml.gz"), b"x").unwrap();

        let entries = ArchiveManager::new(None).list(&primary).unwrap();

        let counters: Vec<u64> = entries.iter().map(|e| e.counter).collect();
        assert_eq!(counters, vec![10, 20]);
        assert_eq!(entries[0].size, 1);
        assert_eq!(entries[0].file_name(), "10-flow.xml.gz");
    }

    #[test]
    fn test_list_without_archive_dir() {
        let temp_dir = TempDir::new().unwrap();
        let primary = primary_with(temp_dir.path(), b"v1");

        assert!(ArchiveManager::new(None).list(&primary).unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let temp_dir = TempDir::new().unwrap();
        let primary = primary_with(temp_dir.path(), b"v1");
        let archive_dir = temp_dir.path().join("archive");
        fs::create_dir(&archive_dir).unwrap();
        for counter in [1, 2, 3, 4] {
            fs::write(archive_dir.join(format!("{counter}-flow.xml.gz")), b"x").unwrap();
        }
        let manager = ArchiveManager::new(None);

        let removed = manager.prune(&primary, 2).unwrap();

        assert_eq!(
            removed,
            vec![archive_dir.join("1-flow.xml.gz"), archive_dir.join("2-flow.xml.gz")]
        );
        let left: Vec<u64> = manager.list(&primary).unwrap().iter().map(|e| e.counter).collect();
        assert_eq!(left, vec![3, 4]);
    }

    #[test]
    fn test_archived_at_matches_counter() {
        let entry = ArchiveEntry {
            path: PathBuf::from("/conf/archive/1700000000000000000-flow.xml.gz"),
            counter: 1_700_000_000_000_000_000,
            size: 0,
        };
        assert_eq!(entry.archived_at().timestamp(), 1_700_000_000);
    }
}
