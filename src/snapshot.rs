use anyhow::{Context, Result};
use chrono::Utc;

use crate::docker::ContainerRuntime;
use crate::state::model::BranchStatus;
use crate::zfs::{snapshot_stamp, FilesystemDriver};

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    /// Short name (the part after `@`).
    pub snapshot_name: String,
    /// Fully-qualified `<pool>/<base>/<dataset>@<stamp>`.
    pub full_snapshot_name: String,
}

/// Take an application-consistent snapshot of a branch dataset.
///
/// When the branch is running, a CHECKPOINT is executed first so every
/// committed transaction is flushed to the data files; the filesystem
/// snapshot follows immediately, with no other await in between. A clone of
/// the result opens without WAL replay.
pub async fn create_consistent_snapshot(
    fs: &dyn FilesystemDriver,
    runtime: &dyn ContainerRuntime,
    dataset_path: &str,
    status: BranchStatus,
    container_name: &str,
    username: &str,
    database: &str,
    label: Option<&str>,
) -> Result<SnapshotOutcome> {
    if status == BranchStatus::Running {
        if !runtime.container_exists(container_name).await? {
            anyhow::bail!(
                "branch is marked running but container '{container_name}' does not exist"
            );
        }
        runtime
            .exec_sql(container_name, "CHECKPOINT;", username, database)
            .await
            .with_context(|| format!("CHECKPOINT failed in '{container_name}'"))?;
    }

    // The snapshot must capture the state the CHECKPOINT just flushed.
    let stamp = snapshot_stamp(Utc::now(), label);
    let full_snapshot_name = fs.create_snapshot(dataset_path, &stamp).await?;

    log::debug!("created snapshot '{full_snapshot_name}'");
    Ok(SnapshotOutcome {
        snapshot_name: stamp,
        full_snapshot_name,
    })
}
