use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::exec::StartExecOptions;
use bollard::models::{
    ContainerCreateBody, ContainerStateStatusEnum, ExecConfig, HostConfig, PortBinding, PortMap,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, ListContainersOptions, RemoveContainerOptions,
    RestartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::TryStreamExt;
use tokio::time::{sleep, Instant};

const PGDATA_CONTAINER_PATH: &str = "/var/lib/postgresql/data";
const WAL_ARCHIVE_CONTAINER_PATH: &str = "/wal-archive";
const CERTS_CONTAINER_PATH: &str = "/etc/ssl/certs/postgresql";

pub const DEFAULT_HEALTHY_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTHY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    NotFound,
    Running,
    Exited,
    Other(String),
}

/// Everything needed to create one PostgreSQL branch container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Mounted dataset root; postgres data lives in `pgdata/` below it.
    pub data_dir: PathBuf,
    pub wal_archive_dir: PathBuf,
    pub cert_dir: PathBuf,
    /// None delegates host-port selection to the runtime; used for fresh
    /// branches. Reset passes the branch's recorded port so connection
    /// strings survive.
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub database: String,
}

/// Contract over the container runtime. The production impl talks to the
/// Docker Engine API; tests substitute an in-memory fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<String>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, name: &str) -> Result<()>;
    async fn stop_container(&self, name: &str, timeout_seconds: u32) -> Result<()>;
    async fn remove_container(&self, name: &str) -> Result<()>;
    async fn restart_container(&self, name: &str) -> Result<()>;

    async fn container_status(&self, name: &str) -> Result<ContainerStatus>;
    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.container_status(name).await? != ContainerStatus::NotFound)
    }
    /// Host port bound to the container's 5432.
    async fn container_port(&self, name: &str) -> Result<u16>;
    /// Names of all containers, running or not.
    async fn list_container_names(&self) -> Result<Vec<String>>;

    /// Poll until the container is running and `pg_isready` succeeds. The
    /// wait covers PITR WAL replay, which can take minutes on a cold branch;
    /// exceeding the timeout is a system error.
    async fn wait_for_healthy(&self, name: &str, user: &str, timeout: Duration) -> Result<()>;

    /// Run a statement through psql and return trimmed stdout. Non-zero exit
    /// or any stderr output is an error carrying the stderr text.
    async fn exec_sql(&self, name: &str, sql: &str, user: &str, database: &str) -> Result<String>;

    async fn pull_image(&self, image: &str) -> Result<()>;
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn start_backup_mode(&self, name: &str, user: &str, database: &str) -> Result<()> {
        self.exec_sql(name, "SELECT pg_backup_start('pgfork');", user, database)
            .await
            .map(|_| ())
    }

    async fn stop_backup_mode(&self, name: &str, user: &str, database: &str) -> Result<()> {
        self.exec_sql(name, "SELECT pg_backup_stop();", user, database)
            .await
            .map(|_| ())
    }
}

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new() -> Result<Self> {
        let client =
            Docker::connect_with_local_defaults().context("failed to connect to Docker daemon")?;
        Ok(Self { client })
    }

    async fn inspect_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let info = self
            .client
            .inspect_exec(exec_id)
            .await
            .context("failed to inspect exec")?;
        Ok(info.exit_code)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<String> {
        let info = self
            .client
            .version()
            .await
            .context("Docker engine unreachable")?;
        Ok(info.version.unwrap_or_default())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut port_bindings: PortMap = HashMap::new();
        port_bindings.insert(
            "5432/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                // "0" delegates selection to the runtime.
                host_port: Some(spec.port.map_or_else(|| "0".to_string(), |p| p.to_string())),
            }]),
        );

        let binds = vec![
            format!("{}:{PGDATA_CONTAINER_PATH}", spec.data_dir.display()),
            format!(
                "{}:{WAL_ARCHIVE_CONTAINER_PATH}",
                spec.wal_archive_dir.display()
            ),
            format!("{}:{CERTS_CONTAINER_PATH}:ro", spec.cert_dir.display()),
        ];

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(vec![
                format!("POSTGRES_PASSWORD={}", spec.password),
                format!("POSTGRES_USER={}", spec.username),
                format!("POSTGRES_DB={}", spec.database),
                format!("PGDATA={PGDATA_CONTAINER_PATH}/pgdata"),
            ]),
            cmd: Some(postgres_command()),
            host_config: Some(HostConfig {
                binds: Some(binds),
                port_bindings: Some(port_bindings),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("failed to create container '{}'", spec.name))?;
        Ok(created.id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.client
            .start_container(name, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .with_context(|| format!("failed to start container '{name}'"))
    }

    async fn stop_container(&self, name: &str, timeout_seconds: u32) -> Result<()> {
        match self.container_status(name).await? {
            ContainerStatus::NotFound | ContainerStatus::Exited => return Ok(()),
            ContainerStatus::Running | ContainerStatus::Other(_) => {}
        }

        let options = StopContainerOptions {
            t: Some(timeout_seconds as i32),
            ..Default::default()
        };
        self.client
            .stop_container(name, Some(options))
            .await
            .with_context(|| format!("failed to stop container '{name}'"))
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        if self.container_status(name).await? == ContainerStatus::NotFound {
            return Ok(());
        }
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.client
            .remove_container(name, Some(options))
            .await
            .with_context(|| format!("failed to remove container '{name}'"))
    }

    async fn restart_container(&self, name: &str) -> Result<()> {
        self.client
            .restart_container(name, None::<RestartContainerOptions>)
            .await
            .with_context(|| format!("failed to restart container '{name}'"))
    }

    async fn container_status(&self, name: &str) -> Result<ContainerStatus> {
        match self
            .client
            .inspect_container(
                name,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
        {
            Ok(info) => {
                let status = info.state.and_then(|s| s.status);
                match status {
                    Some(ContainerStateStatusEnum::RUNNING) => Ok(ContainerStatus::Running),
                    Some(ContainerStateStatusEnum::EXITED)
                    | Some(ContainerStateStatusEnum::CREATED) => Ok(ContainerStatus::Exited),
                    Some(other) => Ok(ContainerStatus::Other(other.to_string())),
                    None => Ok(ContainerStatus::Other("unknown".to_string())),
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerStatus::NotFound),
            Err(err) => Err(anyhow!("failed to inspect container '{name}': {err}")),
        }
    }

    async fn container_port(&self, name: &str) -> Result<u16> {
        let info = self
            .client
            .inspect_container(
                name,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
            .with_context(|| format!("failed to inspect container '{name}'"))?;

        let ports = info
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default();
        let bindings = ports
            .get("5432/tcp")
            .cloned()
            .flatten()
            .unwrap_or_default();
        bindings
            .iter()
            .filter_map(|b| b.host_port.as_deref())
            .find_map(|p| p.parse::<u16>().ok())
            .ok_or_else(|| anyhow!("container '{name}' has no host port bound to 5432"))
    }

    async fn list_container_names(&self) -> Result<Vec<String>> {
        let options = ListContainersOptions {
            all: true,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .context("failed to list containers")?;

        Ok(containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    async fn wait_for_healthy(&self, name: &str, user: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "timed out after {timeout:?} waiting for postgres readiness in '{name}'"
                ));
            }

            if self.container_status(name).await? == ContainerStatus::Running {
                match self.exec_probe(name, &["pg_isready", "-U", user]).await {
                    Ok(true) => return Ok(()),
                    Ok(false) | Err(_) => {}
                }
            }

            sleep(HEALTHY_POLL_INTERVAL).await;
        }
    }

    async fn exec_sql(&self, name: &str, sql: &str, user: &str, database: &str) -> Result<String> {
        let config = ExecConfig {
            cmd: Some(
                ["psql", "-U", user, "-d", database, "-t", "-A", "-c", sql]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(name, config)
            .await
            .with_context(|| format!("failed to create exec in container '{name}'"))?;

        let start_opts = Some(StartExecOptions {
            detach: false,
            ..Default::default()
        });

        let mut stdout = String::new();
        let mut stderr = String::new();

        // The stream must be drained before inspect_exec reports a correct
        // exit code.
        match self.client.start_exec(&exec.id, start_opts).await {
            Ok(bollard::exec::StartExecResults::Attached { mut output, .. }) => {
                while let Some(chunk) = output.try_next().await.context("exec stream failed")? {
                    match chunk {
                        bollard::container::LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            Ok(bollard::exec::StartExecResults::Detached) => {}
            Err(err) => return Err(anyhow!("failed to start exec in '{name}': {err}")),
        }

        let exit_code = self.inspect_exit_code(&exec.id).await?;
        let stderr = stderr.trim().to_string();
        if exit_code != Some(0) || !stderr.is_empty() {
            return Err(anyhow!("{stderr}"))
                .with_context(|| format!("psql failed in container '{name}'"));
        }

        Ok(stdout.trim().to_string())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (from_image, tag) = if let Some((name, tag)) = image.rsplit_once(':') {
            (name.to_string(), Some(tag.to_string()))
        } else {
            (image.to_string(), None)
        };

        let options = CreateImageOptions {
            from_image: Some(from_image),
            tag,
            ..Default::default()
        };

        self.client
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .with_context(|| format!("failed to pull docker image '{image}'"))?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.client.inspect_image(image).await.is_ok())
    }
}

impl DockerRuntime {
    /// Run a probe command; true on exit code 0. Failures to create or
    /// start the exec read as "not ready yet".
    async fn exec_probe(&self, name: &str, cmd: &[&str]) -> Result<bool> {
        let config = ExecConfig {
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = match self.client.create_exec(name, config).await {
            Ok(e) => e,
            Err(_) => return Ok(false),
        };

        let start_opts = Some(StartExecOptions {
            detach: false,
            ..Default::default()
        });

        match self.client.start_exec(&exec.id, start_opts).await {
            Ok(bollard::exec::StartExecResults::Attached { mut output, .. }) => {
                while output.try_next().await.ok().flatten().is_some() {}
            }
            Ok(bollard::exec::StartExecResults::Detached) => {}
            Err(_) => return Ok(false),
        }

        Ok(self.inspect_exit_code(&exec.id).await? == Some(0))
    }
}

/// The postgres server command line: WAL archiving on (the archive command
/// refuses to overwrite an existing segment), replica-grade WAL, and SSL
/// pointed at the mounted cert directory.
fn postgres_command() -> Vec<String> {
    [
        "postgres",
        "-c",
        "wal_level=replica",
        "-c",
        "archive_mode=on",
        "-c",
        "archive_command=test ! -f /wal-archive/%f && cp %p /wal-archive/%f",
        "-c",
        "restore_command=cp /wal-archive/%f %p",
        "-c",
        "max_wal_senders=3",
        "-c",
        "wal_keep_size=1GB",
        "-c",
        "ssl=on",
        "-c",
        "ssl_cert_file=/etc/ssl/certs/postgresql/server.crt",
        "-c",
        "ssl_key_file=/etc/ssl/certs/postgresql/server.key",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
