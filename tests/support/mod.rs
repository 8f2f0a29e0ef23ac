//! In-memory doubles for the ZFS and Docker drivers, plus a fixture that
//! wires them into an `App` rooted in a temp directory. Both doubles append
//! to one shared event log so tests can assert cross-subsystem ordering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use pgfork::certs::CertificateGenerator;
use pgfork::commands::App;
use pgfork::config::Config;
use pgfork::docker::{ContainerRuntime, ContainerSpec, ContainerStatus};
use pgfork::zfs::{DatasetInfo, DatasetOptions, FilesystemDriver, PoolStatus};

pub const PARENT_DATASET_BYTES: u64 = 9_700_000;
pub const CLONE_DATASET_BYTES: u64 = 130_048;
const SNAPSHOT_BYTES: u64 = 8_192;

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.all().iter().position(|e| e.contains(needle))
    }

    pub fn assert_order(&self, earlier: &str, later: &str) {
        let a = self
            .position(earlier)
            .unwrap_or_else(|| panic!("event '{earlier}' not found in {:?}", self.all()));
        let b = self
            .position(later)
            .unwrap_or_else(|| panic!("event '{later}' not found in {:?}", self.all()));
        assert!(a < b, "expected '{earlier}' before '{later}' in {:?}", self.all());
    }
}

#[derive(Debug, Clone)]
struct FakeDataset {
    mounted: bool,
    used: u64,
    /// Full snapshot name this dataset was cloned from.
    origin: Option<String>,
}

#[derive(Default)]
struct FsState {
    datasets: BTreeMap<String, FakeDataset>,
    snapshots: BTreeMap<String, u64>,
}

pub struct FakeFs {
    events: EventLog,
    mount_root: PathBuf,
    state: Mutex<FsState>,
    fail_on: Mutex<HashSet<&'static str>>,
}

impl FakeFs {
    pub fn new(events: EventLog, mount_root: PathBuf) -> Self {
        std::fs::create_dir_all(&mount_root).unwrap();
        Self {
            events,
            mount_root,
            state: Mutex::new(FsState::default()),
            fail_on: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_on(&self, op: &'static str) {
        self.fail_on.lock().unwrap().insert(op);
    }

    fn check_fail(&self, op: &'static str) -> Result<()> {
        if self.fail_on.lock().unwrap().contains(op) {
            return Err(anyhow!("injected {op} failure"));
        }
        Ok(())
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.state.lock().unwrap().datasets.keys().cloned().collect()
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.state.lock().unwrap().snapshots.keys().cloned().collect()
    }

    /// Register a dataset directly, bypassing the driver API (for seeding
    /// orphans).
    pub fn seed_dataset(&self, name: &str, used: u64) {
        self.state.lock().unwrap().datasets.insert(
            name.to_string(),
            FakeDataset {
                mounted: false,
                used,
                origin: None,
            },
        );
    }

    fn mountpoint_of(&self, dataset: &str) -> PathBuf {
        let leaf = dataset.rsplit('/').next().unwrap_or(dataset);
        self.mount_root.join(leaf)
    }

    fn info(&self, name: &str, ds: &FakeDataset) -> DatasetInfo {
        DatasetInfo {
            name: name.to_string(),
            used_bytes: ds.used,
            available_bytes: 10_000_000_000,
            referenced_bytes: ds.used,
            mountpoint: ds.mounted.then(|| self.mountpoint_of(name)),
            created: Some(Utc::now()),
        }
    }
}

#[async_trait]
impl FilesystemDriver for FakeFs {
    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(vec!["tank".to_string()])
    }

    async fn pool_exists(&self, pool: &str) -> Result<bool> {
        Ok(pool == "tank")
    }

    async fn pool_status(&self, pool: &str) -> Result<PoolStatus> {
        Ok(PoolStatus {
            name: pool.to_string(),
            health: "ONLINE".to_string(),
            size_bytes: 10_737_418_240,
            allocated_bytes: 1_073_741_824,
            free_bytes: 9_663_676_416,
        })
    }

    async fn create_dataset(&self, dataset: &str, _options: &DatasetOptions) -> Result<()> {
        self.check_fail("create_dataset")?;
        self.events.push(format!("zfs:create {dataset}"));
        let mut state = self.state.lock().unwrap();
        if state.datasets.contains_key(dataset) {
            return Err(anyhow!("dataset '{dataset}' already exists"));
        }
        state.datasets.insert(
            dataset.to_string(),
            FakeDataset {
                mounted: false,
                used: PARENT_DATASET_BYTES,
                origin: None,
            },
        );
        std::fs::create_dir_all(self.mountpoint_of(dataset))?;
        Ok(())
    }

    async fn destroy_dataset(&self, dataset: &str, recursive: bool) -> Result<()> {
        self.check_fail("destroy_dataset")?;
        self.events
            .push(format!("zfs:destroy {dataset} recursive={recursive}"));
        let mut state = self.state.lock().unwrap();
        if !state.datasets.contains_key(dataset) {
            return Err(anyhow!("dataset '{dataset}' does not exist"));
        }

        let snapshot_prefix = format!("{dataset}@");
        if recursive {
            // Dependent clones go with the dataset.
            let clones: Vec<String> = state
                .datasets
                .iter()
                .filter(|(_, d)| {
                    d.origin
                        .as_deref()
                        .map(|o| o.starts_with(&snapshot_prefix))
                        .unwrap_or(false)
                })
                .map(|(name, _)| name.clone())
                .collect();
            for clone in clones {
                state.datasets.remove(&clone);
                let _ = std::fs::remove_dir_all(self.mountpoint_of(&clone));
            }
        } else {
            let has_clone_dependents = state.datasets.values().any(|d| {
                d.origin
                    .as_deref()
                    .map(|o| o.starts_with(&snapshot_prefix))
                    .unwrap_or(false)
            });
            if has_clone_dependents {
                return Err(anyhow!("dataset '{dataset}' has dependent clones"));
            }
        }

        state.snapshots.retain(|name, _| !name.starts_with(&snapshot_prefix));
        state.datasets.remove(dataset);
        let _ = std::fs::remove_dir_all(self.mountpoint_of(dataset));
        Ok(())
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().datasets.contains_key(dataset))
    }

    async fn get_dataset(&self, dataset: &str) -> Result<DatasetInfo> {
        let state = self.state.lock().unwrap();
        let ds = state
            .datasets
            .get(dataset)
            .ok_or_else(|| anyhow!("dataset '{dataset}' does not exist"))?;
        Ok(self.info(dataset, ds))
    }

    async fn list_datasets(&self, base: &str) -> Result<Vec<DatasetInfo>> {
        let prefix = format!("{base}/");
        let state = self.state.lock().unwrap();
        Ok(state
            .datasets
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, ds)| self.info(name, ds))
            .collect())
    }

    async fn set_property(&self, _dataset: &str, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    async fn get_property(&self, _dataset: &str, _key: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn mount_dataset(&self, dataset: &str) -> Result<()> {
        self.check_fail("mount_dataset")?;
        self.events.push(format!("zfs:mount {dataset}"));
        let mut state = self.state.lock().unwrap();
        let ds = state
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| anyhow!("dataset '{dataset}' does not exist"))?;
        // Idempotent by contract.
        ds.mounted = true;
        Ok(())
    }

    async fn unmount_dataset(&self, dataset: &str) -> Result<()> {
        self.events.push(format!("zfs:unmount {dataset}"));
        let mut state = self.state.lock().unwrap();
        let ds = state
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| anyhow!("dataset '{dataset}' does not exist"))?;
        ds.mounted = false;
        Ok(())
    }

    async fn rename_dataset(&self, from: &str, to: &str) -> Result<()> {
        self.events.push(format!("zfs:rename {from} {to}"));
        let mut state = self.state.lock().unwrap();
        if state.datasets.get(from).map(|d| d.mounted).unwrap_or(false) {
            return Err(anyhow!("dataset '{from}' is mounted"));
        }
        let ds = state
            .datasets
            .remove(from)
            .ok_or_else(|| anyhow!("dataset '{from}' does not exist"))?;
        state.datasets.insert(to.to_string(), ds);

        // Snapshots travel with the dataset.
        let prefix = format!("{from}@");
        let moved: Vec<(String, u64)> = state
            .snapshots
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, size)| (name.clone(), *size))
            .collect();
        for (name, size) in moved {
            state.snapshots.remove(&name);
            let renamed = name.replacen(from, to, 1);
            state.snapshots.insert(renamed.clone(), size);
            // Clone backlinks follow their origin.
            for ds in state.datasets.values_mut() {
                if ds.origin.as_deref() == Some(name.as_str()) {
                    ds.origin = Some(renamed.clone());
                }
            }
        }

        let from_dir = self.mountpoint_of(from);
        if from_dir.exists() {
            std::fs::rename(from_dir, self.mountpoint_of(to))?;
        }
        Ok(())
    }

    async fn get_mountpoint(&self, dataset: &str) -> Result<PathBuf> {
        let state = self.state.lock().unwrap();
        state
            .datasets
            .get(dataset)
            .ok_or_else(|| anyhow!("dataset '{dataset}' does not exist"))?;
        Ok(self.mountpoint_of(dataset))
    }

    async fn get_used_space(&self, dataset: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        let ds = state
            .datasets
            .get(dataset)
            .ok_or_else(|| anyhow!("dataset '{dataset}' does not exist"))?;
        Ok(ds.used)
    }

    async fn create_snapshot(&self, dataset: &str, stamp: &str) -> Result<String> {
        self.check_fail("create_snapshot")?;
        let full = format!("{dataset}@{stamp}");
        self.events.push(format!("zfs:snapshot {full}"));
        let mut state = self.state.lock().unwrap();
        if !state.datasets.contains_key(dataset) {
            return Err(anyhow!("dataset '{dataset}' does not exist"));
        }
        if state.snapshots.contains_key(&full) {
            return Err(anyhow!("snapshot '{full}' already exists"));
        }
        state.snapshots.insert(full.clone(), SNAPSHOT_BYTES);
        Ok(full)
    }

    async fn destroy_snapshot(&self, full_name: &str) -> Result<()> {
        self.events.push(format!("zfs:destroy-snapshot {full_name}"));
        let mut state = self.state.lock().unwrap();
        state
            .snapshots
            .remove(full_name)
            .ok_or_else(|| anyhow!("snapshot '{full_name}' does not exist"))?;
        Ok(())
    }

    async fn snapshot_exists(&self, full_name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().snapshots.contains_key(full_name))
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let prefix = format!("{dataset}@");
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshots
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn get_snapshot_size(&self, full_name: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        state
            .snapshots
            .get(full_name)
            .copied()
            .ok_or_else(|| anyhow!("snapshot '{full_name}' does not exist"))
    }

    async fn clone_snapshot(&self, full_snapshot: &str, target_dataset: &str) -> Result<()> {
        self.check_fail("clone_snapshot")?;
        self.events
            .push(format!("zfs:clone {full_snapshot} {target_dataset}"));
        let mut state = self.state.lock().unwrap();
        if !state.snapshots.contains_key(full_snapshot) {
            return Err(anyhow!("snapshot '{full_snapshot}' does not exist"));
        }
        if state.datasets.contains_key(target_dataset) {
            return Err(anyhow!("dataset '{target_dataset}' already exists"));
        }
        state.datasets.insert(
            target_dataset.to_string(),
            FakeDataset {
                mounted: false,
                used: CLONE_DATASET_BYTES,
                origin: Some(full_snapshot.to_string()),
            },
        );
        // A clone of a postgres dataset carries the pgdata tree.
        std::fs::create_dir_all(self.mountpoint_of(target_dataset).join("pgdata"))?;
        Ok(())
    }

    async fn promote_clone(&self, dataset: &str) -> Result<()> {
        self.events.push(format!("zfs:promote {dataset}"));
        Ok(())
    }

    async fn delegation_ok(&self, _base: &str) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    running: bool,
    port: u16,
}

#[derive(Default)]
struct DockerState {
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    next_port: u16,
}

pub struct FakeDocker {
    events: EventLog,
    state: Mutex<DockerState>,
    fail_on: Mutex<HashSet<&'static str>>,
}

impl FakeDocker {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            state: Mutex::new(DockerState {
                next_port: 54000,
                ..Default::default()
            }),
            fail_on: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_on(&self, op: &'static str) {
        self.fail_on.lock().unwrap().insert(op);
    }

    fn check_fail(&self, op: &'static str) -> Result<()> {
        if self.fail_on.lock().unwrap().contains(op) {
            return Err(anyhow!("injected {op} failure"));
        }
        Ok(())
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn seed_container(&self, name: &str) {
        self.state.lock().unwrap().containers.insert(
            name.to_string(),
            FakeContainer {
                running: true,
                port: 59999,
            },
        );
    }
}

#[async_trait]
impl ContainerRuntime for FakeDocker {
    async fn ping(&self) -> Result<String> {
        Ok("27.0-fake".to_string())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.check_fail("create_container")?;
        self.events.push(format!(
            "docker:create {} wal={}",
            spec.name,
            spec.wal_archive_dir.display()
        ));
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&spec.name) {
            return Err(anyhow!("container '{}' already exists", spec.name));
        }
        let port = match spec.port {
            Some(port) => port,
            None => {
                state.next_port += 1;
                state.next_port
            }
        };
        state
            .containers
            .insert(spec.name.clone(), FakeContainer { running: false, port });
        Ok(format!("id-{}", spec.name))
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.events.push(format!("docker:start {name}"));
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| anyhow!("container '{name}' does not exist"))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, name: &str, _timeout_seconds: u32) -> Result<()> {
        self.events.push(format!("docker:stop {name}"));
        if let Some(container) = self.state.lock().unwrap().containers.get_mut(name) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.events.push(format!("docker:remove {name}"));
        self.state.lock().unwrap().containers.remove(name);
        Ok(())
    }

    async fn restart_container(&self, name: &str) -> Result<()> {
        self.events.push(format!("docker:restart {name}"));
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| anyhow!("container '{name}' does not exist"))?;
        container.running = true;
        Ok(())
    }

    async fn container_status(&self, name: &str) -> Result<ContainerStatus> {
        let state = self.state.lock().unwrap();
        Ok(match state.containers.get(name) {
            Some(c) if c.running => ContainerStatus::Running,
            Some(_) => ContainerStatus::Exited,
            None => ContainerStatus::NotFound,
        })
    }

    async fn container_port(&self, name: &str) -> Result<u16> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(name)
            .map(|c| c.port)
            .ok_or_else(|| anyhow!("container '{name}' does not exist"))
    }

    async fn list_container_names(&self) -> Result<Vec<String>> {
        Ok(self.container_names())
    }

    async fn wait_for_healthy(&self, name: &str, _user: &str, _timeout: Duration) -> Result<()> {
        self.check_fail("wait_for_healthy")?;
        self.events.push(format!("docker:healthy {name}"));
        let state = self.state.lock().unwrap();
        match state.containers.get(name) {
            Some(c) if c.running => Ok(()),
            Some(_) => Err(anyhow!("container '{name}' is not running")),
            None => Err(anyhow!("container '{name}' does not exist")),
        }
    }

    async fn exec_sql(&self, name: &str, sql: &str, _user: &str, _db: &str) -> Result<String> {
        self.check_fail("exec_sql")?;
        self.events.push(format!("sql:{sql} @{name}"));
        let state = self.state.lock().unwrap();
        match state.containers.get(name) {
            Some(c) if c.running => Ok(String::new()),
            Some(_) => Err(anyhow!("container '{name}' is not running")),
            None => Err(anyhow!("container '{name}' does not exist")),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.events.push(format!("docker:pull {image}"));
        self.state.lock().unwrap().images.insert(image.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().images.contains(image))
    }
}

pub struct FakeCerts;

#[async_trait]
impl CertificateGenerator for FakeCerts {
    async fn generate(&self, cert_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(cert_dir).await?;
        tokio::fs::write(cert_dir.join("server.crt"), b"fake cert").await?;
        tokio::fs::write(cert_dir.join("server.key"), b"fake key").await?;
        Ok(())
    }
}

pub struct TestEnv {
    #[allow(dead_code)]
    pub dir: TempDir,
    pub app: App,
    pub fs: Arc<FakeFs>,
    pub docker: Arc<FakeDocker>,
    pub events: EventLog,
}

pub fn test_env() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let events = EventLog::default();
    let fs = Arc::new(FakeFs::new(events.clone(), dir.path().join("mounts")));
    let docker = Arc::new(FakeDocker::new(events.clone()));
    let config = Config::at_root(dir.path().join("pgfork"));
    let app = App::with_drivers(config, fs.clone(), docker.clone(), Arc::new(FakeCerts));
    TestEnv {
        dir,
        app,
        fs,
        docker,
        events,
    }
}

pub async fn create_project(env: &TestEnv, name: &str) -> pgfork::commands::project::ProjectSummary {
    pgfork::commands::project::create(
        &env.app,
        name,
        pgfork::commands::project::CreateProjectOptions::default(),
    )
    .await
    .unwrap()
}

pub async fn create_branch(env: &TestEnv, name: &str) -> pgfork::commands::branch::BranchSummary {
    pgfork::commands::branch::create(
        &env.app,
        name,
        pgfork::commands::branch::CreateBranchOptions::default(),
    )
    .await
    .unwrap()
}
