use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use uuid::Uuid;

use super::App;
use crate::config::{
    container_name, container_name_for_dataset, dataset_name, image_for_pg_version, DEFAULT_IMAGE,
};
use crate::docker::{ContainerRuntime, ContainerSpec, DEFAULT_HEALTHY_TIMEOUT};
use crate::error::{user_error, user_error_hint};
use crate::rollback::{RollbackAction, RollbackRegistry};
use crate::setup;
use crate::state::model::{validate_name, Branch, BranchStatus, Credentials, Project};
use crate::state::store::StateStore;
use crate::zfs::{dataset_path, FilesystemDriver};

#[derive(Debug, Default)]
pub struct CreateProjectOptions {
    pub pool: Option<String>,
    pub pg_version: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug)]
pub struct ProjectSummary {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

/// Create a project: its dataset, certs, WAL archive, and the primary
/// "main" branch container. State is written only after the container is
/// healthy; failures unwind every acquired resource.
pub async fn create(app: &App, name: &str, opts: CreateProjectOptions) -> Result<ProjectSummary> {
    validate_name(name, "project")?;

    let image = match (&opts.image, &opts.pg_version) {
        (Some(_), Some(_)) => {
            return Err(user_error_hint(
                "--image and --pg-version are mutually exclusive",
                "pass one or the other",
            ))
        }
        (Some(image), None) => image.clone(),
        (None, Some(version)) => image_for_pg_version(version),
        (None, None) => DEFAULT_IMAGE.to_string(),
    };

    app.config.ensure_root().await?;
    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = create_locked(app, &mut store, &lock, name, opts.pool.as_deref(), &image).await;
    lock.release()?;
    result
}

async fn create_locked(
    app: &App,
    store: &mut StateStore,
    lock: &crate::state::lock::StateLock,
    name: &str,
    pool: Option<&str>,
    image: &str,
) -> Result<ProjectSummary> {
    store.reload().await?;

    let pool = resolve_pool(app, store, pool).await?;
    let base = if store.is_initialized() {
        store.state()?.zfs_dataset_base.clone()
    } else {
        app.config.dataset_base.clone()
    };

    setup::verify(app.fs.as_ref(), &pool, &base).await?;

    if !store.is_initialized() {
        store.initialize(&pool, &base);
        app.wal.ensure_root().await?;
    }

    if store.find_project(name).is_some() {
        return Err(user_error_hint(
            format!("project '{name}' already exists"),
            "pick another name or delete the existing project first",
        ));
    }

    let mut registry = RollbackRegistry::new();
    let result = provision(app, store, lock, name, &pool, &base, image, &mut registry).await;
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
    lock: &crate::state::lock::StateLock,
    name: &str,
    pool: &str,
    base: &str,
    image: &str,
    registry: &mut RollbackRegistry,
) -> Result<ProjectSummary> {
    let dataset = dataset_name(name, "main");
    let path = dataset_path(pool, base, &dataset);

    app.fs.create_dataset(&path, &app.dataset_options()).await?;
    registry.add(RollbackAction::DestroyDataset(path.clone()));
    app.fs.mount_dataset(&path).await?;
    let mountpoint = app.fs.get_mountpoint(&path).await?;

    let cert_dir = app.config.cert_dir(name);
    app.certs.generate(&cert_dir).await?;

    let credentials = Credentials {
        username: "postgres".to_string(),
        password: super::generate_password(),
        database: "postgres".to_string(),
    };

    if !app.runtime.image_exists(image).await? {
        log::info!("pulling image '{image}'");
        app.runtime.pull_image(image).await?;
    }

    let archive_dir = app.wal.ensure_archive_dir(&dataset).await?;

    let container = container_name(name, "main");
    app.runtime
        .create_container(&ContainerSpec {
            name: container.clone(),
            image: image.to_string(),
            data_dir: mountpoint,
            wal_archive_dir: archive_dir,
            cert_dir: cert_dir.clone(),
            port: None,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            database: credentials.database.clone(),
        })
        .await?;
    registry.add(RollbackAction::RemoveContainer(container.clone()));

    app.runtime.start_container(&container).await?;
    app.runtime
        .wait_for_healthy(&container, &credentials.username, DEFAULT_HEALTHY_TIMEOUT)
        .await?;

    let port = app.runtime.container_port(&container).await?;
    let size_bytes = app.fs.get_used_space(&path).await?;

    let main = Branch {
        id: Uuid::new_v4(),
        name: format!("{name}/main"),
        project_name: name.to_string(),
        parent_branch_id: None,
        is_primary: true,
        snapshot_name: None,
        zfs_dataset: dataset,
        port,
        created_at: Utc::now(),
        size_bytes,
        status: BranchStatus::Running,
    };

    let summary = ProjectSummary {
        name: name.to_string(),
        image: image.to_string(),
        port,
        username: credentials.username.clone(),
        password: credentials.password.clone(),
        database: credentials.database.clone(),
    };

    store.add_project(Project {
        id: Uuid::new_v4(),
        name: name.to_string(),
        docker_image: image.to_string(),
        ssl_cert_dir: cert_dir.to_string_lossy().to_string(),
        created_at: Utc::now(),
        credentials,
        branches: vec![main],
    })?;
    store.save_locked(lock)?;

    Ok(summary)
}

async fn resolve_pool(app: &App, store: &StateStore, requested: Option<&str>) -> Result<String> {
    if store.is_initialized() {
        let state_pool = store.state()?.zfs_pool.clone();
        if let Some(requested) = requested {
            if requested != state_pool {
                return Err(user_error_hint(
                    format!("pgfork is already initialized on pool '{state_pool}'"),
                    "omit --pool or pass the initialized one",
                ));
            }
        }
        return Ok(state_pool);
    }

    if let Some(requested) = requested {
        if !app.fs.pool_exists(requested).await? {
            return Err(user_error(format!("ZFS pool '{requested}' does not exist")));
        }
        return Ok(requested.to_string());
    }

    let pools = app.fs.list_pools().await?;
    match pools.as_slice() {
        [] => Err(user_error_hint(
            "no ZFS pool found",
            "create one first (e.g. 'sudo zpool create tank /dev/sdX')",
        )),
        [only] => Ok(only.clone()),
        many => Err(user_error_hint(
            "multiple ZFS pools found",
            format!("pass --pool with one of: {}", many.join(", ")),
        )),
    }
}

/// Delete a project and every branch in it.
pub async fn delete(app: &App, name: &str, force: bool) -> Result<Vec<String>> {
    let mut store = app.open_store().await?;
    let lock = store.lock().await?;
    let result = delete_locked(app, &mut store, &lock, name, force).await;
    lock.release()?;
    result
}

async fn delete_locked(
    app: &App,
    store: &mut StateStore,
    lock: &crate::state::lock::StateLock,
    name: &str,
    force: bool,
) -> Result<Vec<String>> {
    store.reload().await?;
    let project = store.project(name)?.clone();

    let extra_branches: Vec<&Branch> =
        project.branches.iter().filter(|b| !b.is_primary).collect();
    if !extra_branches.is_empty() && !force {
        let names: Vec<&str> = extra_branches.iter().map(|b| b.name.as_str()).collect();
        return Err(user_error_hint(
            format!(
                "project '{name}' still has branches: {}",
                names.join(", ")
            ),
            "re-run with --force to delete them all",
        ));
    }

    let state = store.state()?;
    let pool = state.zfs_pool.clone();
    let base = state.zfs_dataset_base.clone();

    // Containers first, in parallel; they hold the dataset mounts.
    let stops = project.branches.iter().map(|b| {
        let container = container_name_for_dataset(&b.zfs_dataset);
        let runtime = app.runtime.clone();
        async move {
            runtime.stop_container(&container, 20).await?;
            runtime.remove_container(&container).await
        }
    });
    for result in join_all(stops).await {
        result?;
    }

    // Datasets children-first so clone dependencies unwind cleanly. A
    // missing dataset means a previous delete was interrupted; skip it.
    let primary = project
        .primary_branch()
        .context("project has no primary branch")?;
    for branch in project.subtree_post_order(primary.id) {
        let path = dataset_path(&pool, &base, &branch.zfs_dataset);
        if app.fs.dataset_exists(&path).await? {
            app.fs.destroy_dataset(&path, true).await?;
        }
    }

    let archives = project
        .branches
        .iter()
        .map(|b| app.wal.delete_archive_dir(&b.zfs_dataset));
    for result in join_all(archives).await {
        result?;
    }

    crate::certs::delete_certs(&app.config.cert_dir(name)).await?;

    let branch_ids: Vec<Uuid> = project.branches.iter().map(|b| b.id).collect();
    for id in branch_ids {
        store.remove_snapshots_for_branch(id)?;
    }
    store.remove_project(name)?;
    store.save_locked(lock)?;

    Ok(project.branches.iter().map(|b| b.name.clone()).collect())
}
