pub mod branch;
pub mod project;
pub mod snapshot;
pub mod system;
pub mod wal;

use std::sync::Arc;

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::certs::{CertificateGenerator, OpensslCertGenerator};
use crate::config::Config;
use crate::docker::{ContainerRuntime, DockerRuntime};
use crate::state::store::StateStore;
use crate::wal::WalArchive;
use crate::zfs::{DatasetOptions, FilesystemDriver, ZfsDriver};

const PASSWORD_LENGTH: usize = 12;

/// Shared context for every controller operation: resolved config plus the
/// external subsystem drivers. Tests construct it with in-memory fakes.
pub struct App {
    pub config: Config,
    pub fs: Arc<dyn FilesystemDriver>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub certs: Arc<dyn CertificateGenerator>,
    pub wal: WalArchive,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let runtime = DockerRuntime::new()?;
        let wal = WalArchive::new(config.wal_root());
        Ok(Self {
            config,
            fs: Arc::new(ZfsDriver::new()),
            runtime: Arc::new(runtime),
            certs: Arc::new(OpensslCertGenerator),
            wal,
        })
    }

    pub fn with_drivers(
        config: Config,
        fs: Arc<dyn FilesystemDriver>,
        runtime: Arc<dyn ContainerRuntime>,
        certs: Arc<dyn CertificateGenerator>,
    ) -> Self {
        let wal = WalArchive::new(config.wal_root());
        Self {
            config,
            fs,
            runtime,
            certs,
            wal,
        }
    }

    pub async fn open_store(&self) -> Result<StateStore> {
        StateStore::open(self.config.state_path()).await
    }

    pub fn dataset_options(&self) -> DatasetOptions {
        DatasetOptions {
            compression: self.config.compression.clone(),
            recordsize: self.config.recordsize.clone(),
            atime_enabled: self.config.atime_enabled,
        }
    }
}

/// Alphanumeric credential of fixed length.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}
