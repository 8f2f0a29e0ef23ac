use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use uuid::Uuid;

use super::App;
use crate::config::container_name_for_dataset;
use crate::error::{user_error, user_error_hint};
use crate::snapshot::create_consistent_snapshot;
use crate::state::model::{validate_name, Namespace, SnapshotRecord};
use crate::zfs::{dataset_path, FilesystemDriver};

const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Take a labeled, durable snapshot of a branch and record it in state.
pub async fn create(app: &App, branch_name: &str, label: Option<String>) -> Result<SnapshotRecord> {
    let ns = Namespace::parse(branch_name)?;
    if let Some(label) = label.as_deref() {
        validate_name(label, "label")?;
    }

    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = async {
        store.reload().await?;
        let (project, branch) = store.branch(&ns)?;
        let project = project.clone();
        let branch = branch.clone();

        let state = store.state()?;
        let path = dataset_path(&state.zfs_pool, &state.zfs_dataset_base, &branch.zfs_dataset);

        let outcome = create_consistent_snapshot(
            app.fs.as_ref(),
            app.runtime.as_ref(),
            &path,
            branch.status,
            &container_name_for_dataset(&branch.zfs_dataset),
            &project.credentials.username,
            &project.credentials.database,
            label.as_deref(),
        )
        .await?;

        let size_bytes = app
            .fs
            .get_snapshot_size(&outcome.full_snapshot_name)
            .await
            .unwrap_or(0);

        let record = SnapshotRecord {
            id: Uuid::new_v4(),
            branch_id: branch.id,
            branch_name: branch.name.clone(),
            project_name: project.name.clone(),
            zfs_snapshot: outcome.full_snapshot_name,
            created_at: Utc::now(),
            label,
            size_bytes,
        };
        store.add_snapshot(record.clone())?;
        store.save_locked(&lock)?;
        Ok(record)
    }
    .await;
    lock.release()?;
    result
}

/// List snapshots, optionally scoped to one branch, with sizes refreshed
/// from the filesystem in parallel (records keep the value from creation
/// time otherwise).
pub async fn list(app: &App, scope: Option<&str>) -> Result<Vec<SnapshotRecord>> {
    let store = app.open_store().await?;

    let mut records: Vec<SnapshotRecord> = match scope {
        Some(branch_name) => {
            let ns = Namespace::parse(branch_name)?;
            let (_, branch) = store.branch(&ns)?;
            store
                .snapshots_for_branch(branch.id)?
                .into_iter()
                .cloned()
                .collect()
        }
        None => store.snapshots()?.to_vec(),
    };

    let sizes = join_all(
        records
            .iter()
            .map(|r| app.fs.get_snapshot_size(&r.zfs_snapshot)),
    )
    .await;
    for (record, size) in records.iter_mut().zip(sizes) {
        if let Ok(size) = size {
            record.size_bytes = size;
        }
    }

    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(records)
}

/// Delete one snapshot by id: the filesystem snapshot (tolerating one that
/// is already gone) and the state record.
pub async fn delete(app: &App, id: &str) -> Result<SnapshotRecord> {
    let id: Uuid = id
        .parse()
        .map_err(|_| user_error(format!("'{id}' is not a snapshot id")))?;

    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = async {
        store.reload().await?;
        let record = store.remove_snapshot(id)?;

        if app.fs.snapshot_exists(&record.zfs_snapshot).await? {
            app.fs.destroy_snapshot(&record.zfs_snapshot).await?;
        }

        store.save_locked(&lock)?;
        Ok(record)
    }
    .await;
    lock.release()?;
    result
}

#[derive(Debug)]
pub struct CleanupOutcome {
    pub removed: Vec<SnapshotRecord>,
    pub dry_run: bool,
}

/// Delete snapshots older than `--days` (default 30), optionally scoped to
/// one branch; `--all` drops the age filter entirely.
pub async fn cleanup(
    app: &App,
    scope: Option<&str>,
    days: Option<i64>,
    dry_run: bool,
    all: bool,
) -> Result<CleanupOutcome> {
    let days = days.unwrap_or(DEFAULT_RETENTION_DAYS);
    if days < 0 {
        return Err(user_error_hint(
            format!("--days {days} is negative"),
            "pass a non-negative retention window",
        ));
    }
    let cutoff = if all {
        Utc::now()
    } else {
        Utc::now() - chrono::Duration::days(days)
    };

    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = async {
        store.reload().await?;

        let branch_id = match scope {
            Some(branch_name) => {
                let ns = Namespace::parse(branch_name)?;
                Some(store.branch(&ns)?.1.id)
            }
            None => None,
        };

        if dry_run {
            let removed: Vec<SnapshotRecord> = store
                .snapshots()?
                .iter()
                .filter(|s| {
                    s.created_at < cutoff
                        && branch_id.map(|id| s.branch_id == id).unwrap_or(true)
                })
                .cloned()
                .collect();
            return Ok(CleanupOutcome {
                removed,
                dry_run: true,
            });
        }

        let removed = store.remove_snapshots_older_than(cutoff, branch_id)?;
        for record in &removed {
            if app.fs.snapshot_exists(&record.zfs_snapshot).await? {
                app.fs.destroy_snapshot(&record.zfs_snapshot).await?;
            }
        }
        store.save_locked(&lock)?;

        Ok(CleanupOutcome {
            removed,
            dry_run: false,
        })
    }
    .await;
    lock.release()?;
    result
}
