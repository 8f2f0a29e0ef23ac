use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use uuid::Uuid;

use super::App;
use crate::config::{container_name, container_name_for_dataset, dataset_name};
use crate::docker::{ContainerRuntime, ContainerSpec, ContainerStatus, DEFAULT_HEALTHY_TIMEOUT};
use crate::error::user_error_hint;
use crate::pitr;
use crate::rollback::{RollbackAction, RollbackRegistry};
use crate::snapshot;
use crate::state::lock::StateLock;
use crate::state::model::{Branch, BranchStatus, Namespace, Project};
use crate::state::store::StateStore;
use crate::zfs::{dataset_path, FilesystemDriver};

const STOP_TIMEOUT_SECONDS: u32 = 20;

#[derive(Debug, Default)]
pub struct CreateBranchOptions {
    pub parent: Option<String>,
    pub pitr: Option<String>,
}

#[derive(Debug)]
pub struct BranchSummary {
    pub name: String,
    pub port: u16,
    pub status: BranchStatus,
    pub parent: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl ConnectionInfo {
    pub fn uri(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

/// Create a branch by cloning a snapshot of its parent. Normal mode takes a
/// fresh application-consistent snapshot; PITR mode clones the newest
/// snapshot before the target time and lets postgres replay archived WAL up
/// to it. Any failure after resource acquisition begins unwinds through the
/// rollback registry and leaves state untouched.
pub async fn create(app: &App, target: &str, opts: CreateBranchOptions) -> Result<BranchSummary> {
    let target_ns = Namespace::parse(target)?;
    let parent_ref = opts
        .parent
        .clone()
        .unwrap_or_else(|| format!("{}/main", target_ns.project));
    let source_ns = Namespace::parse(&parent_ref)?;
    if source_ns.project != target_ns.project {
        return Err(user_error_hint(
            format!(
                "parent '{}' is not in project '{}'",
                source_ns.full(),
                target_ns.project
            ),
            "branches can only be created from a branch of the same project",
        ));
    }

    let pitr_target = opts
        .pitr
        .as_deref()
        .map(|raw| pitr::parse_target_time(raw, Utc::now()))
        .transpose()?;

    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = create_locked(app, &mut store, &lock, &source_ns, &target_ns, pitr_target).await;
    lock.release()?;
    result
}

async fn create_locked(
    app: &App,
    store: &mut StateStore,
    lock: &StateLock,
    source_ns: &Namespace,
    target_ns: &Namespace,
    pitr_target: Option<DateTime<Utc>>,
) -> Result<BranchSummary> {
    store.reload().await?;

    let (project, source) = store.branch(source_ns)?;
    let project = project.clone();
    let source = source.clone();

    if store
        .all_branches()?
        .iter()
        .any(|b| b.name == target_ns.full())
    {
        return Err(user_error_hint(
            format!("branch '{}' already exists", target_ns.full()),
            "pick another name or delete the existing branch first",
        ));
    }

    let state = store.state()?;
    let pool = state.zfs_pool.clone();
    let base = state.zfs_dataset_base.clone();

    let mut registry = RollbackRegistry::new();
    let result = provision(
        app,
        store,
        lock,
        &mut registry,
        &project,
        &source,
        target_ns,
        &pool,
        &base,
        pitr_target,
    )
    .await;

    match result {
        Ok(summary) => {
            registry.clear();
            Ok(summary)
        }
        Err(err) => {
            registry.execute(app.fs.as_ref(), app.runtime.as_ref()).await;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn provision(
    app: &App,
    store: &mut StateStore,
    lock: &StateLock,
    registry: &mut RollbackRegistry,
    project: &Project,
    source: &Branch,
    target_ns: &Namespace,
    pool: &str,
    base: &str,
    pitr_target: Option<DateTime<Utc>>,
) -> Result<BranchSummary> {
    let source_path = dataset_path(pool, base, &source.zfs_dataset);
    let source_container = container_name_for_dataset(&source.zfs_dataset);

    // PITR reuses an existing snapshot (and must not destroy it on
    // failure); normal mode captures the parent as of right now.
    let full_snapshot = match pitr_target {
        Some(target) => {
            pitr::select_snapshot_before(store, source.id, &source.name, target)?.full_snapshot_name
        }
        None => {
            let outcome = snapshot::create_consistent_snapshot(
                app.fs.as_ref(),
                app.runtime.as_ref(),
                &source_path,
                source.status,
                &source_container,
                &project.credentials.username,
                &project.credentials.database,
                None,
            )
            .await?;
            registry.add(RollbackAction::DestroySnapshot(
                outcome.full_snapshot_name.clone(),
            ));
            outcome.full_snapshot_name
        }
    };

    let target_dataset = dataset_name(&target_ns.project, &target_ns.branch);
    let target_path = dataset_path(pool, base, &target_dataset);

    app.fs.clone_snapshot(&full_snapshot, &target_path).await?;
    registry.add(RollbackAction::DestroyDataset(target_path.clone()));
    app.fs.mount_dataset(&target_path).await?;
    let mountpoint = app.fs.get_mountpoint(&target_path).await?;

    // A stale archive from an earlier branch of the same name would confuse
    // recovery; start fresh.
    app.wal.delete_archive_dir(&target_dataset).await?;
    let target_archive = app.wal.ensure_archive_dir(&target_dataset).await?;

    // During PITR the container reads historical segments from the source
    // branch's archive, so that is what gets bind-mounted.
    let wal_mount = if let Some(target) = pitr_target {
        let source_archive = app.wal.archive_path(&source.zfs_dataset);
        app.wal
            .setup_pitr_recovery(&mountpoint, &source_archive, Some(target))
            .await?;
        source_archive
    } else {
        target_archive
    };

    if !app.runtime.image_exists(&project.docker_image).await? {
        log::info!("pulling image '{}'", project.docker_image);
        app.runtime.pull_image(&project.docker_image).await?;
    }

    let container = container_name(&target_ns.project, &target_ns.branch);
    app.runtime
        .create_container(&ContainerSpec {
            name: container.clone(),
            image: project.docker_image.clone(),
            data_dir: mountpoint,
            wal_archive_dir: wal_mount,
            cert_dir: PathBuf::from(&project.ssl_cert_dir),
            port: None,
            username: project.credentials.username.clone(),
            password: project.credentials.password.clone(),
            database: project.credentials.database.clone(),
        })
        .await?;
    registry.add(RollbackAction::RemoveContainer(container.clone()));

    app.runtime.start_container(&container).await?;
    // In PITR mode this wait also covers WAL replay up to the target.
    app.runtime
        .wait_for_healthy(
            &container,
            &project.credentials.username,
            DEFAULT_HEALTHY_TIMEOUT,
        )
        .await?;

    let port = app.runtime.container_port(&container).await?;
    let size_bytes = app.fs.get_used_space(&target_path).await?;

    store.add_branch(
        &target_ns.project,
        Branch {
            id: Uuid::new_v4(),
            name: target_ns.full(),
            project_name: target_ns.project.clone(),
            parent_branch_id: Some(source.id),
            is_primary: false,
            snapshot_name: Some(full_snapshot),
            zfs_dataset: target_dataset,
            port,
            created_at: Utc::now(),
            size_bytes,
            status: BranchStatus::Running,
        },
    )?;
    store.save_locked(lock)?;

    Ok(BranchSummary {
        name: target_ns.full(),
        port,
        status: BranchStatus::Running,
        parent: Some(source.name.clone()),
        size_bytes,
    })
}

/// Reset a branch to its parent's current state, preserving its port so
/// existing connection strings keep working.
pub async fn reset(app: &App, name: &str, force: bool) -> Result<BranchSummary> {
    let ns = Namespace::parse(name)?;
    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = reset_locked(app, &mut store, &lock, &ns, force).await;
    lock.release()?;
    result
}

async fn reset_locked(
    app: &App,
    store: &mut StateStore,
    lock: &StateLock,
    ns: &Namespace,
    force: bool,
) -> Result<BranchSummary> {
    store.reload().await?;

    let (project, branch) = store.branch(ns)?;
    let project = project.clone();
    let branch = branch.clone();

    if branch.is_primary {
        return Err(user_error_hint(
            format!("'{}' is the primary branch and has no parent to reset to", ns.full()),
            "primary branches can only be recreated via 'pgfork project delete' + 'project create'",
        ));
    }
    let parent_id = branch
        .parent_branch_id
        .context("non-primary branch is missing its parent reference")?;
    let parent = project
        .branch_by_id(parent_id)
        .context("parent branch not found in project")?
        .clone();

    let dependents: Vec<Branch> = project
        .subtree_post_order(branch.id)
        .into_iter()
        .filter(|b| b.id != branch.id)
        .cloned()
        .collect();
    if !dependents.is_empty() && !force {
        let names: Vec<&str> = dependents.iter().map(|b| b.name.as_str()).collect();
        return Err(user_error_hint(
            format!(
                "branch '{}' has dependent branches: {}",
                ns.full(),
                names.join(", ")
            ),
            "re-run with --force to delete them as part of the reset",
        ));
    }

    let state = store.state()?;
    let pool = state.zfs_pool.clone();
    let base = state.zfs_dataset_base.clone();

    // Dependents go away: containers and records now, datasets via the
    // recursive destroy of the old target dataset below.
    for dependent in &dependents {
        stop_and_remove(app, &container_name_for_dataset(&dependent.zfs_dataset)).await?;
        app.wal.delete_archive_dir(&dependent.zfs_dataset).await?;
        store.remove_snapshots_for_branch(dependent.id)?;
        store.remove_branch(&Namespace::parse(&dependent.name)?)?;
    }

    stop_and_remove(app, &container_name(&ns.project, &ns.branch)).await?;

    // Fresh application-consistent capture of the parent.
    let parent_path = dataset_path(&pool, &base, &parent.zfs_dataset);
    let outcome = snapshot::create_consistent_snapshot(
        app.fs.as_ref(),
        app.runtime.as_ref(),
        &parent_path,
        parent.status,
        &container_name_for_dataset(&parent.zfs_dataset),
        &project.credentials.username,
        &project.credentials.database,
        None,
    )
    .await?;

    let target_path = dataset_path(&pool, &base, &branch.zfs_dataset);
    clone_then_swap(app, &outcome.full_snapshot_name, &target_path).await?;

    let archive_dir = app.wal.ensure_archive_dir(&branch.zfs_dataset).await?;

    // Recreate at the recorded port.
    let mountpoint = app.fs.get_mountpoint(&target_path).await?;
    let container = container_name(&ns.project, &ns.branch);
    app.runtime
        .create_container(&ContainerSpec {
            name: container.clone(),
            image: project.docker_image.clone(),
            data_dir: mountpoint,
            wal_archive_dir: archive_dir,
            cert_dir: PathBuf::from(&project.ssl_cert_dir),
            port: Some(branch.port),
            username: project.credentials.username.clone(),
            password: project.credentials.password.clone(),
            database: project.credentials.database.clone(),
        })
        .await?;
    app.runtime.start_container(&container).await?;
    app.runtime
        .wait_for_healthy(
            &container,
            &project.credentials.username,
            DEFAULT_HEALTHY_TIMEOUT,
        )
        .await?;

    // The branch's old filesystem snapshots went down with its dataset.
    store.remove_snapshots_for_branch(branch.id)?;

    let size_bytes = app.fs.get_used_space(&target_path).await?;
    {
        let record = store.branch_mut(ns)?;
        record.snapshot_name = Some(outcome.full_snapshot_name.clone());
        record.size_bytes = size_bytes;
        record.status = BranchStatus::Running;
    }
    store.save_locked(lock)?;

    Ok(BranchSummary {
        name: ns.full(),
        port: branch.port,
        status: BranchStatus::Running,
        parent: Some(parent.name),
        size_bytes,
    })
}

/// Replace `target_path` with a clone of `full_snapshot` without ever being
/// one failure away from losing the branch: the clone is proven mountable
/// before the original is touched, and the original survives as a backup
/// until the swapped-in dataset is mounted.
async fn clone_then_swap(app: &App, full_snapshot: &str, target_path: &str) -> Result<()> {
    let temp_path = format!("{target_path}-temp");
    let backup_path = format!("{target_path}-old");

    app.fs.clone_snapshot(full_snapshot, &temp_path).await?;
    app.fs.mount_dataset(&temp_path).await?;

    app.fs.unmount_dataset(target_path).await?;
    app.fs.rename_dataset(target_path, &backup_path).await?;

    // Rename requires the dataset unmounted.
    app.fs.unmount_dataset(&temp_path).await?;
    app.fs.rename_dataset(&temp_path, target_path).await?;
    app.fs.mount_dataset(target_path).await?;

    if let Err(err) = app.fs.destroy_dataset(&backup_path, true).await {
        log::warn!("could not destroy backup dataset '{backup_path}': {err:#}");
    }

    Ok(())
}

/// Delete a branch and (with --force) its whole subtree. Datasets are
/// destroyed children-first; a dataset missing from a crash-interrupted
/// earlier delete is tolerated.
pub async fn delete(app: &App, name: &str, force: bool) -> Result<Vec<String>> {
    let ns = Namespace::parse(name)?;
    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = delete_locked(app, &mut store, &lock, &ns, force).await;
    lock.release()?;
    result
}

async fn delete_locked(
    app: &App,
    store: &mut StateStore,
    lock: &StateLock,
    ns: &Namespace,
    force: bool,
) -> Result<Vec<String>> {
    store.reload().await?;

    let (project, branch) = store.branch(ns)?;
    if branch.is_primary {
        return Err(user_error_hint(
            format!("'{}' is the primary branch", ns.full()),
            "delete the whole project instead: 'pgfork project delete'",
        ));
    }

    let doomed: Vec<Branch> = project
        .subtree_post_order(branch.id)
        .into_iter()
        .cloned()
        .collect();
    if doomed.len() > 1 && !force {
        let dependents: Vec<&str> = doomed
            .iter()
            .filter(|b| b.id != branch.id)
            .map(|b| b.name.as_str())
            .collect();
        return Err(user_error_hint(
            format!(
                "branch '{}' has dependent branches: {}",
                ns.full(),
                dependents.join(", ")
            ),
            "re-run with --force to delete the whole subtree",
        ));
    }

    let state = store.state()?;
    let pool = state.zfs_pool.clone();
    let base = state.zfs_dataset_base.clone();

    // Containers and archives in parallel; nothing below depends on order.
    let teardowns = doomed.iter().map(|b| {
        let runtime = app.runtime.clone();
        let wal = app.wal.clone();
        let dataset = b.zfs_dataset.clone();
        let container = container_name_for_dataset(&b.zfs_dataset);
        async move {
            runtime
                .stop_container(&container, STOP_TIMEOUT_SECONDS)
                .await?;
            runtime.remove_container(&container).await?;
            wal.delete_archive_dir(&dataset).await
        }
    });
    for result in join_all(teardowns).await {
        result?;
    }

    // Children before parents: a clone must die before its origin dataset.
    for b in &doomed {
        let path = dataset_path(&pool, &base, &b.zfs_dataset);
        if app.fs.dataset_exists(&path).await? {
            app.fs.destroy_dataset(&path, true).await?;
        }
    }

    let mut deleted = Vec::new();
    for b in &doomed {
        store.remove_snapshots_for_branch(b.id)?;
        store.remove_branch(&Namespace::parse(&b.name)?)?;
        deleted.push(b.name.clone());
    }
    store.save_locked(lock)?;

    Ok(deleted)
}

/// Start a stopped branch. The container is recreated at the recorded port
/// if it disappeared.
pub async fn start(app: &App, name: &str) -> Result<()> {
    let ns = Namespace::parse(name)?;
    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = start_locked(app, &mut store, &lock, &ns).await;
    lock.release()?;
    result
}

async fn start_locked(
    app: &App,
    store: &mut StateStore,
    lock: &StateLock,
    ns: &Namespace,
) -> Result<()> {
    store.reload().await?;
    let (project, branch) = store.branch(ns)?;
    let project = project.clone();
    let branch = branch.clone();

    let state = store.state()?;
    let path = dataset_path(&state.zfs_pool, &state.zfs_dataset_base, &branch.zfs_dataset);
    app.fs.mount_dataset(&path).await?;

    let container = container_name(&ns.project, &ns.branch);
    match app.runtime.container_status(&container).await? {
        ContainerStatus::Running => {}
        ContainerStatus::NotFound => {
            let mountpoint = app.fs.get_mountpoint(&path).await?;
            let archive_dir = app.wal.ensure_archive_dir(&branch.zfs_dataset).await?;
            app.runtime
                .create_container(&ContainerSpec {
                    name: container.clone(),
                    image: project.docker_image.clone(),
                    data_dir: mountpoint,
                    wal_archive_dir: archive_dir,
                    cert_dir: PathBuf::from(&project.ssl_cert_dir),
                    port: Some(branch.port),
                    username: project.credentials.username.clone(),
                    password: project.credentials.password.clone(),
                    database: project.credentials.database.clone(),
                })
                .await?;
            app.runtime.start_container(&container).await?;
        }
        ContainerStatus::Exited | ContainerStatus::Other(_) => {
            app.runtime.start_container(&container).await?;
        }
    }

    app.runtime
        .wait_for_healthy(
            &container,
            &project.credentials.username,
            DEFAULT_HEALTHY_TIMEOUT,
        )
        .await?;

    store.branch_mut(ns)?.status = BranchStatus::Running;
    store.save_locked(lock)
}

pub async fn stop(app: &App, name: &str) -> Result<()> {
    let ns = Namespace::parse(name)?;
    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = stop_locked(app, &mut store, &lock, &ns).await;
    lock.release()?;
    result
}

async fn stop_locked(
    app: &App,
    store: &mut StateStore,
    lock: &StateLock,
    ns: &Namespace,
) -> Result<()> {
    store.reload().await?;
    store.branch(ns)?;

    app.runtime
        .stop_container(&container_name(&ns.project, &ns.branch), STOP_TIMEOUT_SECONDS)
        .await?;

    store.branch_mut(ns)?.status = BranchStatus::Stopped;
    store.save_locked(lock)
}

pub async fn restart(app: &App, name: &str) -> Result<()> {
    let ns = Namespace::parse(name)?;
    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = restart_locked(app, &mut store, &lock, &ns).await;
    lock.release()?;
    result
}

async fn restart_locked(
    app: &App,
    store: &mut StateStore,
    lock: &StateLock,
    ns: &Namespace,
) -> Result<()> {
    store.reload().await?;
    let (project, _) = store.branch(ns)?;
    let username = project.credentials.username.clone();

    let container = container_name(&ns.project, &ns.branch);
    app.runtime.restart_container(&container).await?;
    app.runtime
        .wait_for_healthy(&container, &username, DEFAULT_HEALTHY_TIMEOUT)
        .await?;

    store.branch_mut(ns)?.status = BranchStatus::Running;
    store.save_locked(lock)
}

/// Connection credentials for a branch (passwords persist in cleartext in
/// the local state store; this just surfaces them).
pub async fn connection_info(app: &App, name: &str) -> Result<ConnectionInfo> {
    let ns = Namespace::parse(name)?;
    let store = app.open_store().await?;
    let (project, branch) = store.branch(&ns)?;

    Ok(ConnectionInfo {
        host: "127.0.0.1".to_string(),
        port: branch.port,
        username: project.credentials.username.clone(),
        password: project.credentials.password.clone(),
        database: project.credentials.database.clone(),
    })
}

async fn stop_and_remove(app: &App, container: &str) -> Result<()> {
    app.runtime
        .stop_container(container, STOP_TIMEOUT_SECONDS)
        .await?;
    app.runtime.remove_container(container).await
}

/// Read-only lookup for `branch get`.
pub async fn get(app: &App, name: &str) -> Result<(Project, Branch)> {
    let ns = Namespace::parse(name)?;
    let store = app.open_store().await?;
    let (project, branch) = store.branch(&ns)?;
    Ok((project.clone(), branch.clone()))
}
