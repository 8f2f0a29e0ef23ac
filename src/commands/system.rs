use anyhow::Result;
use futures_util::future::join_all;

use super::App;
use crate::config::container_name_for_dataset;
use crate::docker::{ContainerRuntime, ContainerStatus};
use crate::orphan::{self, OrphanReport};
use crate::state::model::BranchStatus;
use crate::zfs::{FilesystemDriver, PoolStatus};

#[derive(Debug)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Diagnostics across every subsystem pgfork depends on.
pub async fn doctor(app: &App) -> Result<Vec<DoctorCheck>> {
    let mut checks = Vec::new();

    match app.runtime.ping().await {
        Ok(version) => checks.push(DoctorCheck {
            name: "Docker".to_string(),
            ok: true,
            detail: format!("engine {version} reachable"),
        }),
        Err(err) => checks.push(DoctorCheck {
            name: "Docker".to_string(),
            ok: false,
            detail: format!("{err:#}"),
        }),
    }

    match app.fs.list_pools().await {
        Ok(pools) if pools.is_empty() => checks.push(DoctorCheck {
            name: "ZFS".to_string(),
            ok: false,
            detail: "no pools found".to_string(),
        }),
        Ok(pools) => checks.push(DoctorCheck {
            name: "ZFS".to_string(),
            ok: true,
            detail: format!("pools: {}", pools.join(", ")),
        }),
        Err(err) => checks.push(DoctorCheck {
            name: "ZFS".to_string(),
            ok: false,
            detail: format!("{err:#}"),
        }),
    }

    match app.open_store().await {
        Ok(store) if store.is_initialized() => {
            let state = store.state()?;
            checks.push(DoctorCheck {
                name: "State".to_string(),
                ok: true,
                detail: format!(
                    "{} ({} projects, {} snapshots)",
                    store.path().display(),
                    state.projects.len(),
                    state.snapshots.len()
                ),
            });

            match app.fs.pool_status(&state.zfs_pool).await {
                Ok(status) if status.health == "ONLINE" => checks.push(DoctorCheck {
                    name: "Pool".to_string(),
                    ok: true,
                    detail: format!("'{}' is ONLINE", state.zfs_pool),
                }),
                Ok(status) => checks.push(DoctorCheck {
                    name: "Pool".to_string(),
                    ok: false,
                    detail: format!("'{}' is {}", state.zfs_pool, status.health),
                }),
                Err(err) => checks.push(DoctorCheck {
                    name: "Pool".to_string(),
                    ok: false,
                    detail: format!("{err:#}"),
                }),
            }
        }
        Ok(_) => checks.push(DoctorCheck {
            name: "State".to_string(),
            ok: true,
            detail: "not initialized yet".to_string(),
        }),
        Err(err) => checks.push(DoctorCheck {
            name: "State".to_string(),
            ok: false,
            detail: format!("{err:#}"),
        }),
    }

    let wal_root = app.config.wal_root();
    checks.push(DoctorCheck {
        name: "WAL root".to_string(),
        ok: crate::config::path_exists(&wal_root).await,
        detail: wal_root.display().to_string(),
    });

    Ok(checks)
}

#[derive(Debug)]
pub struct BranchStatusRow {
    pub name: String,
    pub recorded: BranchStatus,
    pub container: String,
    pub port: u16,
    pub size_bytes: u64,
}

#[derive(Debug, Default)]
pub struct StatusReport {
    pub pool: Option<PoolStatus>,
    pub branches: Vec<BranchStatusRow>,
    pub snapshot_count: usize,
}

/// Pool health plus the live container state of every branch.
pub async fn status(app: &App) -> Result<StatusReport> {
    let store = app.open_store().await?;
    if !store.is_initialized() {
        return Ok(StatusReport::default());
    }
    let state = store.state()?;

    let pool = app.fs.pool_status(&state.zfs_pool).await.ok();

    let branches: Vec<_> = state
        .projects
        .iter()
        .flat_map(|p| p.branches.iter())
        .collect();
    let probes = join_all(branches.iter().map(|b| {
        let container = container_name_for_dataset(&b.zfs_dataset);
        let runtime = app.runtime.clone();
        async move { runtime.container_status(&container).await }
    }))
    .await;

    let rows = branches
        .iter()
        .zip(probes)
        .map(|(b, probe)| {
            let container = match probe {
                Ok(ContainerStatus::Running) => "running".to_string(),
                Ok(ContainerStatus::Exited) => "exited".to_string(),
                Ok(ContainerStatus::NotFound) => "missing".to_string(),
                Ok(ContainerStatus::Other(s)) => s,
                Err(_) => "unknown".to_string(),
            };
            BranchStatusRow {
                name: b.name.clone(),
                recorded: b.status,
                container,
                port: b.port,
                size_bytes: b.size_bytes,
            }
        })
        .collect();

    Ok(StatusReport {
        pool,
        branches: rows,
        snapshot_count: state.snapshots.len(),
    })
}

/// First phase of orphan cleanup: detection only. The CLI confirms, then
/// calls `execute_cleanup`.
pub async fn detect_orphans(app: &App) -> Result<OrphanReport> {
    let store = app.open_store().await?;
    let state = store.state()?;
    orphan::detect(state, app.fs.as_ref(), app.runtime.as_ref()).await
}

#[derive(Debug, Default)]
pub struct CleanupSummary {
    pub removed_containers: Vec<String>,
    pub destroyed_datasets: Vec<String>,
    pub reclaimed_bytes: u64,
    pub failures: Vec<String>,
}

/// Remove everything in the report. Containers go first since they may pin
/// dataset mounts. Per-resource failures are collected, not fatal.
pub async fn execute_cleanup(app: &App, report: &OrphanReport) -> Result<CleanupSummary> {
    let mut summary = CleanupSummary::default();

    for container in &report.containers {
        let stop = app.runtime.stop_container(container, 10).await;
        let remove = match stop {
            Ok(()) => app.runtime.remove_container(container).await,
            Err(err) => Err(err),
        };
        match remove {
            Ok(()) => summary.removed_containers.push(container.clone()),
            Err(err) => summary
                .failures
                .push(format!("container '{container}': {err:#}")),
        }
    }

    for dataset in &report.datasets {
        match app.fs.destroy_dataset(&dataset.name, true).await {
            Ok(()) => {
                summary.reclaimed_bytes += dataset.used_bytes;
                summary.destroyed_datasets.push(dataset.name.clone());
            }
            Err(err) => summary
                .failures
                .push(format!("dataset '{}': {err:#}", dataset.name)),
        }
    }

    Ok(summary)
}

/// Replace the state file with its `.backup` sibling. A corrupt primary is
/// exactly when this runs, so the primary is never loaded first.
pub async fn restore_state(app: &App) -> Result<()> {
    let mut store = crate::state::store::StateStore::unloaded(app.config.state_path());
    store.restore_backup().await
}
