use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Fixed prefix for every container pgfork manages. Orphan detection keys
/// off this prefix, so it must never vary per install.
pub const CONTAINER_PREFIX: &str = "pgfork";

/// Default image when neither --image nor --pg-version is given.
pub const DEFAULT_IMAGE: &str = "postgres:17-alpine";

/// UID:GID of the postgres user inside the Alpine postgres images. WAL
/// archive directories and the SSL key must be owned by this user so the
/// container can read and write them across the bind mounts.
pub const POSTGRES_UID: u32 = 70;
pub const POSTGRES_GID: u32 = 70;

/// Resolved filesystem layout and tunables for one pgfork installation.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_root: PathBuf,
    /// Base dataset under the pool that every branch dataset lives in.
    pub dataset_base: String,
    /// ZFS dataset properties applied to every project dataset.
    pub compression: String,
    pub recordsize: String,
    pub atime_enabled: bool,
}

impl Config {
    /// Resolve the config root: $PGFORK_HOME if set, otherwise
    /// `<user config dir>/pgfork`. The directory is created on demand.
    pub fn load() -> Result<Self> {
        let config_root = match std::env::var_os("PGFORK_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::config_dir()
                .context("failed to resolve user config directory")?
                .join("pgfork"),
        };

        Ok(Self::at_root(config_root))
    }

    pub fn at_root(config_root: PathBuf) -> Self {
        Self {
            config_root,
            dataset_base: "pgfork".to_string(),
            compression: "lz4".to_string(),
            recordsize: "8k".to_string(),
            atime_enabled: false,
        }
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config_root)
            .await
            .with_context(|| {
                format!(
                    "failed to create config root '{}'",
                    self.config_root.display()
                )
            })
    }

    pub fn state_path(&self) -> PathBuf {
        self.config_root.join("state.json")
    }

    pub fn wal_root(&self) -> PathBuf {
        self.config_root.join("wal-archive")
    }

    pub fn certs_root(&self) -> PathBuf {
        self.config_root.join("certs")
    }

    pub fn cert_dir(&self, project: &str) -> PathBuf {
        self.certs_root().join(project)
    }
}

/// Container name for a branch: `pgfork-<project>-<branch>`.
pub fn container_name(project: &str, branch: &str) -> String {
    format!("{CONTAINER_PREFIX}-{project}-{branch}")
}

/// Dataset leaf name for a branch: `<project>-<branch>`.
pub fn dataset_name(project: &str, branch: &str) -> String {
    format!("{project}-{branch}")
}

/// Container name derived from a branch's dataset leaf name.
pub fn container_name_for_dataset(dataset: &str) -> String {
    format!("{CONTAINER_PREFIX}-{dataset}")
}

/// Resolve `postgres:<version>-alpine` from a bare version number.
pub fn image_for_pg_version(version: &str) -> String {
    format!("postgres:{version}-alpine")
}

/// True if the path exists (helper for doctor checks).
pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
