use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::lock::StateLock;
use super::model::{Branch, Namespace, Project, SnapshotRecord, State};
use crate::error::{user_error, user_error_hint};

/// Durable holder of the state document. All reads come from the in-memory
/// copy; all writes funnel through the atomic save protocol. A missing file
/// is not an error: the store is uninitialized until the first save.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Option<State>,
}

impl StateStore {
    /// Load (idempotent). Corruption or an invariant violation is fatal and
    /// points the user at `pgfork state restore`.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(parse_and_validate(&bytes, &path)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read state file '{}'", path.display()))
            }
        };

        Ok(Self { path, state })
    }

    /// A store handle that has not read the primary file. Used by restore,
    /// which must work when the primary is corrupt.
    pub fn unloaded(path: PathBuf) -> Self {
        Self { path, state: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, ".backup")
    }

    fn tmp_path(&self) -> PathBuf {
        sibling(&self.path, ".tmp")
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Create the in-memory document with the given pool/base. The caller
    /// saves when the surrounding operation commits.
    pub fn initialize(&mut self, zfs_pool: &str, zfs_dataset_base: &str) {
        self.state = Some(State::new(zfs_pool, zfs_dataset_base));
    }

    pub fn state(&self) -> Result<&State> {
        self.state.as_ref().ok_or_else(|| {
            user_error_hint(
                "pgfork is not initialized",
                "run 'pgfork project create <name>' to create your first project",
            )
        })
    }

    fn state_mut(&mut self) -> Result<&mut State> {
        self.state.as_mut().ok_or_else(|| {
            user_error_hint(
                "pgfork is not initialized",
                "run 'pgfork project create <name>' to create your first project",
            )
        })
    }

    /// Acquire the inter-process lock for a read-modify-write window.
    pub async fn lock(&self) -> Result<StateLock> {
        StateLock::acquire(&self.path).await
    }

    /// Re-read the document from disk. Used after acquiring the lock so the
    /// modify step starts from the latest committed state.
    pub async fn reload(&mut self) -> Result<()> {
        let fresh = Self::open(self.path.clone()).await?;
        self.state = fresh.state;
        Ok(())
    }

    /// One-shot save: acquire the lock, write, release.
    pub async fn save(&self) -> Result<()> {
        let lock = self.lock().await?;
        let result = self.save_locked(&lock);
        lock.release()?;
        result
    }

    /// Atomic, crash-safe write of the current document. The caller already
    /// holds the lock. Steps: serialize to a sibling temp file, fsync it,
    /// copy the previous document to `.backup`, rename temp over primary,
    /// fsync the directory.
    pub fn save_locked(&self, _lock: &StateLock) -> Result<()> {
        let state = self
            .state
            .as_ref()
            .context("refusing to save: state was never initialized")?;
        state.validate().context("refusing to save invalid state")?;

        let bytes = serde_json::to_vec_pretty(state).context("failed to serialize state")?;
        let tmp = self.tmp_path();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("failed to create temp file '{}'", tmp.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("failed to write temp file '{}'", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync temp file '{}'", tmp.display()))?;
        drop(file);

        if self.path.exists() {
            std::fs::copy(&self.path, self.backup_path()).with_context(|| {
                format!("failed to back up '{}' before save", self.path.display())
            })?;
        }

        std::fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "failed to move '{}' over '{}'",
                tmp.display(),
                self.path.display()
            )
        })?;

        if let Some(dir) = self.path.parent() {
            File::open(dir)
                .and_then(|d| d.sync_all())
                .with_context(|| format!("failed to fsync state directory '{}'", dir.display()))?;
        }

        log::debug!("saved state to '{}'", self.path.display());
        Ok(())
    }

    /// Replace the primary document with the `.backup` sibling, after
    /// validating the backup parses cleanly.
    pub async fn restore_backup(&mut self) -> Result<()> {
        let backup = self.backup_path();
        let bytes = tokio::fs::read(&backup).await.with_context(|| {
            format!(
                "no backup available at '{}'; nothing to restore",
                backup.display()
            )
        })?;
        let state = parse_and_validate(&bytes, &backup)?;

        let lock = self.lock().await?;
        std::fs::copy(&backup, &self.path).with_context(|| {
            format!(
                "failed to restore '{}' from '{}'",
                self.path.display(),
                backup.display()
            )
        })?;
        lock.release()?;

        self.state = Some(state);
        Ok(())
    }

    // --- projects ---

    pub fn projects(&self) -> Result<&[Project]> {
        Ok(&self.state()?.projects)
    }

    pub fn find_project(&self, name: &str) -> Option<&Project> {
        self.state
            .as_ref()?
            .projects
            .iter()
            .find(|p| p.name == name)
    }

    pub fn project(&self, name: &str) -> Result<&Project> {
        self.find_project(name).ok_or_else(|| {
            user_error_hint(
                format!("project '{name}' not found"),
                "run 'pgfork project list' to see existing projects",
            )
        })
    }

    pub fn project_mut(&mut self, name: &str) -> Result<&mut Project> {
        self.state_mut()?
            .projects
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| user_error(format!("project '{name}' not found")))
    }

    pub fn add_project(&mut self, project: Project) -> Result<()> {
        let state = self.state_mut()?;
        if state.projects.iter().any(|p| p.name == project.name) {
            return Err(user_error_hint(
                format!("project '{}' already exists", project.name),
                "pick another name or delete the existing project first",
            ));
        }
        state.projects.push(project);
        Ok(())
    }

    pub fn remove_project(&mut self, name: &str) -> Result<Project> {
        let state = self.state_mut()?;
        let idx = state
            .projects
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| user_error(format!("project '{name}' not found")))?;
        Ok(state.projects.remove(idx))
    }

    // --- branches ---

    pub fn all_branches(&self) -> Result<Vec<&Branch>> {
        Ok(self
            .state()?
            .projects
            .iter()
            .flat_map(|p| p.branches.iter())
            .collect())
    }

    pub fn find_branch(&self, ns: &Namespace) -> Option<(&Project, &Branch)> {
        let project = self.find_project(&ns.project)?;
        let branch = project.branches.iter().find(|b| b.name == ns.full())?;
        Some((project, branch))
    }

    pub fn branch(&self, ns: &Namespace) -> Result<(&Project, &Branch)> {
        self.find_branch(ns).ok_or_else(|| {
            user_error_hint(
                format!("branch '{}' not found", ns.full()),
                "run 'pgfork branch list' to see existing branches",
            )
        })
    }

    pub fn branch_mut(&mut self, ns: &Namespace) -> Result<&mut Branch> {
        let full = ns.full();
        self.project_mut(&ns.project)?
            .branches
            .iter_mut()
            .find(|b| b.name == full)
            .ok_or_else(|| user_error(format!("branch '{full}' not found")))
    }

    pub fn add_branch(&mut self, project_name: &str, branch: Branch) -> Result<()> {
        let exists = self
            .state()?
            .projects
            .iter()
            .flat_map(|p| p.branches.iter())
            .any(|b| b.name == branch.name);
        if exists {
            return Err(user_error_hint(
                format!("branch '{}' already exists", branch.name),
                "pick another name or delete the existing branch first",
            ));
        }
        self.project_mut(project_name)?.branches.push(branch);
        Ok(())
    }

    pub fn remove_branch(&mut self, ns: &Namespace) -> Result<Branch> {
        let full = ns.full();
        let project = self.project_mut(&ns.project)?;
        let idx = project
            .branches
            .iter()
            .position(|b| b.name == full)
            .ok_or_else(|| user_error(format!("branch '{full}' not found")))?;
        Ok(project.branches.remove(idx))
    }

    /// The primary ("main") branch of a project.
    pub fn main_branch(&self, project_name: &str) -> Result<&Branch> {
        self.project(project_name)?
            .primary_branch()
            .ok_or_else(|| anyhow::anyhow!("project '{project_name}' has no primary branch"))
    }

    // --- snapshots ---

    pub fn snapshots(&self) -> Result<&[SnapshotRecord]> {
        Ok(&self.state()?.snapshots)
    }

    pub fn add_snapshot(&mut self, record: SnapshotRecord) -> Result<()> {
        self.state_mut()?.snapshots.push(record);
        Ok(())
    }

    pub fn snapshot_by_id(&self, id: Uuid) -> Result<&SnapshotRecord> {
        self.state()?
            .snapshots
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| {
                user_error_hint(
                    format!("snapshot '{id}' not found"),
                    "run 'pgfork snapshot list' to see snapshot ids",
                )
            })
    }

    pub fn snapshots_for_branch(&self, branch_id: Uuid) -> Result<Vec<&SnapshotRecord>> {
        Ok(self
            .state()?
            .snapshots
            .iter()
            .filter(|s| s.branch_id == branch_id)
            .collect())
    }

    pub fn snapshots_for_project(&self, project_name: &str) -> Result<Vec<&SnapshotRecord>> {
        Ok(self
            .state()?
            .snapshots
            .iter()
            .filter(|s| s.project_name == project_name)
            .collect())
    }

    pub fn remove_snapshot(&mut self, id: Uuid) -> Result<SnapshotRecord> {
        let state = self.state_mut()?;
        let idx = state
            .snapshots
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| user_error(format!("snapshot '{id}' not found")))?;
        Ok(state.snapshots.remove(idx))
    }

    pub fn remove_snapshots_for_branch(&mut self, branch_id: Uuid) -> Result<Vec<SnapshotRecord>> {
        let state = self.state_mut()?;
        let (removed, kept) = state
            .snapshots
            .drain(..)
            .partition(|s| s.branch_id == branch_id);
        state.snapshots = kept;
        Ok(removed)
    }

    /// Delete snapshot records older than `cutoff`, optionally scoped to one
    /// branch. Returns the removed records so callers can destroy the
    /// filesystem snapshots behind them.
    pub fn remove_snapshots_older_than(
        &mut self,
        cutoff: DateTime<Utc>,
        branch_id: Option<Uuid>,
    ) -> Result<Vec<SnapshotRecord>> {
        let state = self.state_mut()?;
        let (removed, kept) = state.snapshots.drain(..).partition(|s| {
            s.created_at < cutoff && branch_id.map(|id| s.branch_id == id).unwrap_or(true)
        });
        state.snapshots = kept;
        Ok(removed)
    }
}

fn parse_and_validate(bytes: &[u8], path: &Path) -> Result<State> {
    let state: State = serde_json::from_slice(bytes).with_context(|| {
        format!(
            "state file '{}' is corrupt; run 'pgfork state restore' to recover from backup",
            path.display()
        )
    })?;
    state.validate().with_context(|| {
        format!(
            "state file '{}' violates invariants; run 'pgfork state restore' to recover from backup",
            path.display()
        )
    })?;
    Ok(state)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{BranchStatus, Credentials};
    use tempfile::TempDir;

    fn sample_project(name: &str) -> Project {
        let main = Branch {
            id: Uuid::new_v4(),
            name: format!("{name}/main"),
            project_name: name.to_string(),
            parent_branch_id: None,
            is_primary: true,
            snapshot_name: None,
            zfs_dataset: format!("{name}-main"),
            port: 55432,
            created_at: Utc::now(),
            size_bytes: 9_700_000,
            status: BranchStatus::Running,
        };
        Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            docker_image: "postgres:17-alpine".to_string(),
            ssl_cert_dir: format!("/tmp/certs/{name}"),
            created_at: Utc::now(),
            credentials: Credentials {
                username: "postgres".to_string(),
                password: "hunter2hunter".to_string(),
                database: "postgres".to_string(),
            },
            branches: vec![main],
        }
    }

    async fn store_in(dir: &TempDir) -> StateStore {
        StateStore::open(dir.path().join("state.json")).await.unwrap()
    }

    #[tokio::test]
    async fn missing_file_is_uninitialized_not_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).await;
        assert!(!store.is_initialized());
        assert!(store.state().is_err());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir).await;
        store.initialize("tank", "pgfork");
        store.add_project(sample_project("demo")).unwrap();
        store.save().await.unwrap();

        let reloaded = store_in(&dir).await;
        let state = reloaded.state().unwrap();
        assert_eq!(state.zfs_pool, "tank");
        assert_eq!(state.zfs_dataset_base, "pgfork");
        assert_eq!(state.projects.len(), 1);
        assert_eq!(state.projects[0].name, "demo");
        assert!(state.projects[0].branches[0].is_primary);
    }

    #[tokio::test]
    async fn save_produces_backup_of_previous_document() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir).await;
        store.initialize("tank", "pgfork");
        store.save().await.unwrap();

        let first = std::fs::read(store.path()).unwrap();
        store.add_project(sample_project("demo")).unwrap();
        store.save().await.unwrap();

        let backup = std::fs::read(store.backup_path()).unwrap();
        assert_eq!(first, backup);
        // No stray temp file left behind.
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn restore_backup_reverts_last_save() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir).await;
        store.initialize("tank", "pgfork");
        store.save().await.unwrap();
        store.add_project(sample_project("demo")).unwrap();
        store.save().await.unwrap();

        store.restore_backup().await.unwrap();
        assert!(store.state().unwrap().projects.is_empty());

        let reloaded = store_in(&dir).await;
        assert!(reloaded.state().unwrap().projects.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_fails_load_with_restore_hint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = StateStore::open(path).await.unwrap_err();
        assert!(format!("{err:#}").contains("state restore"));
    }

    #[tokio::test]
    async fn invariant_violation_fails_load() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir).await;
        store.initialize("tank", "pgfork");
        store.add_project(sample_project("demo")).unwrap();
        store.save().await.unwrap();

        // Corrupt the document: drop the primary flag.
        let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        let broken = raw.replace("\"isPrimary\": true", "\"isPrimary\": false");
        std::fs::write(dir.path().join("state.json"), broken).unwrap();

        assert!(StateStore::open(dir.path().join("state.json")).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_project_rejected_in_memory() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir).await;
        store.initialize("tank", "pgfork");
        store.add_project(sample_project("demo")).unwrap();
        let err = store.add_project(sample_project("demo")).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn branch_accessors() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir).await;
        store.initialize("tank", "pgfork");
        store.add_project(sample_project("demo")).unwrap();

        let main_id = store.main_branch("demo").unwrap().id;
        let dev = Branch {
            id: Uuid::new_v4(),
            name: "demo/dev".to_string(),
            project_name: "demo".to_string(),
            parent_branch_id: Some(main_id),
            is_primary: false,
            snapshot_name: Some("tank/pgfork/demo-main@2025-10-07T14-30-00-000".to_string()),
            zfs_dataset: "demo-dev".to_string(),
            port: 55433,
            created_at: Utc::now(),
            size_bytes: 130_048,
            status: BranchStatus::Running,
        };
        store.add_branch("demo", dev).unwrap();

        let ns = Namespace::parse("demo/dev").unwrap();
        let (project, branch) = store.branch(&ns).unwrap();
        assert_eq!(project.name, "demo");
        assert_eq!(branch.parent_branch_id, Some(main_id));
        assert_eq!(store.all_branches().unwrap().len(), 2);

        store.remove_branch(&ns).unwrap();
        assert!(store.find_branch(&ns).is_none());
        // Second delete is a clean not-found.
        assert!(store.remove_branch(&ns).is_err());
    }

    #[tokio::test]
    async fn snapshot_retention_filters() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir).await;
        store.initialize("tank", "pgfork");
        store.add_project(sample_project("demo")).unwrap();
        let main_id = store.main_branch("demo").unwrap().id;

        let old = SnapshotRecord {
            id: Uuid::new_v4(),
            branch_id: main_id,
            branch_name: "demo/main".to_string(),
            project_name: "demo".to_string(),
            zfs_snapshot: "tank/pgfork/demo-main@2025-01-01T00-00-00-000".to_string(),
            created_at: Utc::now() - chrono::Duration::days(40),
            label: None,
            size_bytes: 1024,
        };
        let recent = SnapshotRecord {
            created_at: Utc::now(),
            id: Uuid::new_v4(),
            zfs_snapshot: "tank/pgfork/demo-main@2025-10-07T14-30-00-000".to_string(),
            ..old.clone()
        };
        store.add_snapshot(old.clone()).unwrap();
        store.add_snapshot(recent.clone()).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let removed = store
            .remove_snapshots_older_than(cutoff, Some(main_id))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, old.id);
        assert_eq!(store.snapshots().unwrap().len(), 1);
        assert_eq!(store.snapshots().unwrap()[0].id, recent.id);
    }
}
