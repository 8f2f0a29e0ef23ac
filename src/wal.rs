use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::fsperm::{chown_postgres, set_mode};

/// Directory mode for archive dirs: owner and group (the postgres container
/// user) may enter and write, others get nothing.
const ARCHIVE_DIR_MODE: u32 = 0o770;
const RECOVERY_FILE_MODE: u32 = 0o600;

/// Owns the per-branch WAL archive directories under
/// `<config root>/wal-archive/<project>-<branch>/`.
#[derive(Debug, Clone)]
pub struct WalArchive {
    root: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveInfo {
    pub file_count: usize,
    pub total_bytes: u64,
    pub oldest_name: Option<String>,
    pub newest_name: Option<String>,
    pub oldest_modified: Option<DateTime<Utc>>,
    pub newest_modified: Option<DateTime<Utc>>,
}

impl WalArchive {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Archive directory for a branch dataset (`<project>-<branch>`).
    pub fn archive_path(&self, dataset: &str) -> PathBuf {
        self.root.join(dataset)
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create WAL root '{}'", self.root.display()))
    }

    /// Create the archive directory (idempotent) and assert mode 0770 plus
    /// postgres-user ownership so the container can archive into it across
    /// the bind mount. Ownership needs privilege; without it we warn and
    /// leave mode-only protection in place.
    pub async fn ensure_archive_dir(&self, dataset: &str) -> Result<PathBuf> {
        let dir = self.archive_path(dataset);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create archive dir '{}'", dir.display()))?;

        set_mode(&dir, ARCHIVE_DIR_MODE)?;
        chown_postgres(&dir);

        let keep = dir.join(".keep");
        if tokio::fs::metadata(&keep).await.is_err() {
            tokio::fs::write(&keep, b"")
                .await
                .with_context(|| format!("failed to create '{}'", keep.display()))?;
            chown_postgres(&keep);
        }

        Ok(dir)
    }

    pub async fn delete_archive_dir(&self, dataset: &str) -> Result<()> {
        let dir = self.archive_path(dataset);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove archive dir '{}'", dir.display())),
        }
    }

    /// Summary of the archive contents. Dotfiles (`.keep`) are not WAL and
    /// are excluded.
    pub async fn archive_info(&self, dataset: &str) -> Result<ArchiveInfo> {
        let mut info = ArchiveInfo::default();

        for (name, meta) in self.wal_entries(dataset).await? {
            info.file_count += 1;
            info.total_bytes += meta.len();

            let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);
            if info.oldest_name.as_deref().map_or(true, |o| name.as_str() < o) {
                info.oldest_name = Some(name.clone());
            }
            if info.newest_name.as_deref().map_or(true, |n| name.as_str() > n) {
                info.newest_name = Some(name.clone());
            }
            if let Some(ts) = modified {
                if info.oldest_modified.map_or(true, |o| ts < o) {
                    info.oldest_modified = Some(ts);
                }
                if info.newest_modified.map_or(true, |n| ts > n) {
                    info.newest_modified = Some(ts);
                }
            }
        }

        Ok(info)
    }

    /// Delete WAL files last modified before `cutoff`; returns how many.
    pub async fn cleanup_wals_before(&self, dataset: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let dir = self.archive_path(dataset);
        let mut deleted = 0;

        for (name, meta) in self.wal_entries(dataset).await? {
            let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);
            if modified.map_or(false, |ts| ts < cutoff) {
                let path = dir.join(&name);
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("failed to delete WAL segment '{}'", path.display()))?;
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    pub async fn cleanup_old_wals(&self, dataset: &str, days: i64) -> Result<usize> {
        self.cleanup_wals_before(dataset, Utc::now() - chrono::Duration::days(days))
            .await
    }

    /// List WAL names that would be deleted by `cleanup_wals_before`.
    pub async fn preview_cleanup(&self, dataset: &str, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for (name, meta) in self.wal_entries(dataset).await? {
            let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);
            if modified.map_or(false, |ts| ts < cutoff) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Check segment continuity: sort names, interpret each 24-hex-digit
    /// name as a segment number, and report every skipped segment.
    pub async fn verify_archive_integrity(&self, dataset: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .wal_entries(dataset)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| is_wal_segment_name(name))
            .collect();
        names.sort();
        Ok(find_segment_gaps(&names))
    }

    /// Write the PITR recovery files into a cloned dataset's `pgdata/`:
    /// `recovery.signal` plus a `postgresql.auto.conf` whose restore_command
    /// pulls from the source branch's archive.
    pub async fn setup_pitr_recovery(
        &self,
        mountpoint: &Path,
        source_archive_path: &Path,
        recovery_target: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let pgdata = mountpoint.join("pgdata");
        if tokio::fs::metadata(&pgdata).await.is_err() {
            anyhow::bail!(
                "no pgdata directory under '{}'; the clone does not look like a postgres dataset",
                mountpoint.display()
            );
        }

        let signal = pgdata.join("recovery.signal");
        tokio::fs::write(&signal, b"")
            .await
            .with_context(|| format!("failed to write '{}'", signal.display()))?;
        set_mode(&signal, RECOVERY_FILE_MODE)?;
        chown_postgres(&signal);

        let conf = pgdata.join("postgresql.auto.conf");
        let content = recovery_conf(source_archive_path, recovery_target);
        tokio::fs::write(&conf, content)
            .await
            .with_context(|| format!("failed to write '{}'", conf.display()))?;
        set_mode(&conf, RECOVERY_FILE_MODE)?;
        chown_postgres(&conf);

        Ok(())
    }

    /// Non-dotfile entries of the archive dir with metadata. A missing dir
    /// reads as empty.
    async fn wal_entries(&self, dataset: &str) -> Result<Vec<(String, std::fs::Metadata)>> {
        let dir = self.archive_path(dataset);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read archive dir '{}'", dir.display()))
            }
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                entries.push((name, meta));
            }
        }
        Ok(entries)
    }
}

fn recovery_conf(source_archive_path: &Path, recovery_target: Option<DateTime<Utc>>) -> String {
    let mut content = format!(
        "restore_command = 'cp {}/%f %p'\n",
        source_archive_path.display()
    );
    if let Some(target) = recovery_target {
        content.push_str(&format!(
            "recovery_target_time = '{}'\n",
            target.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    content.push_str("recovery_target_action = 'promote'\n");
    content
}

/// Standard WAL segment names are 24 hex digits (timeline + log + seg).
fn is_wal_segment_name(name: &str) -> bool {
    name.len() == 24 && name.chars().all(|c| c.is_ascii_hexdigit())
}

/// Upper bound on enumerated names per gap. A timeline switch makes two
/// neighbors numerically distant; listing the whole span would be absurd.
const MAX_GAP_SEGMENTS: u128 = 256;

fn find_segment_gaps(sorted_names: &[String]) -> Vec<String> {
    let mut gaps = Vec::new();
    let mut previous: Option<u128> = None;

    for name in sorted_names {
        let Ok(current) = u128::from_str_radix(name, 16) else {
            continue;
        };
        if let Some(prev) = previous {
            let mut expected = prev + 1;
            while expected < current {
                if expected - prev > MAX_GAP_SEGMENTS {
                    log::warn!(
                        "gap before {name} exceeds {MAX_GAP_SEGMENTS} segments; truncating report"
                    );
                    break;
                }
                gaps.push(format!("{expected:024X}"));
                expected += 1;
            }
        }
        previous = Some(current);
    }

    gaps
}
