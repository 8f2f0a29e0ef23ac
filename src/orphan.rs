use std::collections::HashSet;

use anyhow::Result;

use crate::config::CONTAINER_PREFIX;
use crate::docker::ContainerRuntime;
use crate::state::model::State;
use crate::zfs::{base_path, DatasetInfo, FilesystemDriver};

/// Resources that exist in ZFS or Docker but are unknown to state.
#[derive(Debug, Default)]
pub struct OrphanReport {
    pub datasets: Vec<DatasetInfo>,
    pub containers: Vec<String>,
    pub total_wasted_bytes: u64,
}

impl OrphanReport {
    pub fn total_orphans(&self) -> usize {
        self.datasets.len() + self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_orphans() == 0
    }
}

/// Compare state against the live subsystems and report everything pgfork
/// would be paying for without tracking.
pub async fn detect(
    state: &State,
    fs: &dyn FilesystemDriver,
    runtime: &dyn ContainerRuntime,
) -> Result<OrphanReport> {
    let datasets = fs
        .list_datasets(&base_path(&state.zfs_pool, &state.zfs_dataset_base))
        .await?;
    let container_names = runtime.list_container_names().await?;
    Ok(compute(state, datasets, container_names))
}

fn compute(state: &State, datasets: Vec<DatasetInfo>, container_names: Vec<String>) -> OrphanReport {
    let expected_datasets: HashSet<&str> = state
        .projects
        .iter()
        .flat_map(|p| p.branches.iter())
        .map(|b| b.zfs_dataset.as_str())
        .collect();
    let expected_containers: HashSet<String> = expected_datasets
        .iter()
        .map(|ds| format!("{CONTAINER_PREFIX}-{ds}"))
        .collect();

    let orphan_datasets: Vec<DatasetInfo> = datasets
        .into_iter()
        .filter(|d| !expected_datasets.contains(d.leaf()))
        .collect();
    let total_wasted_bytes = orphan_datasets.iter().map(|d| d.used_bytes).sum();

    let orphan_containers = container_names
        .into_iter()
        .filter(|name| {
            name.starts_with(&format!("{CONTAINER_PREFIX}-")) && !expected_containers.contains(name)
        })
        .collect();

    OrphanReport {
        datasets: orphan_datasets,
        containers: orphan_containers,
        total_wasted_bytes,
    }
}
