use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

/// Full dataset path: `<pool>/<base>/<leaf>`.
pub fn dataset_path(pool: &str, base: &str, leaf: &str) -> String {
    format!("{pool}/{base}/{leaf}")
}

/// The base dataset every project dataset lives under: `<pool>/<base>`.
pub fn base_path(pool: &str, base: &str) -> String {
    format!("{pool}/{base}")
}

/// Snapshot stamp: ISO-8601 with punctuation flattened to `-`, millisecond
/// precision, e.g. `2025-10-07T14-30-00-123`. An optional label is appended
/// as `-<label>`.
pub fn snapshot_stamp(at: DateTime<Utc>, label: Option<&str>) -> String {
    let stamp = at.format("%Y-%m-%dT%H-%M-%S-%3f").to_string();
    match label {
        Some(label) => format!("{stamp}-{label}"),
        None => stamp,
    }
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub name: String,
    pub health: String,
    pub size_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DatasetInfo {
    /// Full path, e.g. `tank/pgfork/demo-main`.
    pub name: String,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub referenced_bytes: u64,
    pub mountpoint: Option<PathBuf>,
    pub created: Option<DateTime<Utc>>,
}

impl DatasetInfo {
    /// Leaf name after the last `/`.
    pub fn leaf(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub compression: String,
    pub recordsize: String,
    pub atime_enabled: bool,
}

/// Contract over the copy-on-write filesystem. The production impl shells
/// out to `zfs`/`zpool`; tests substitute an in-memory fake.
#[async_trait]
pub trait FilesystemDriver: Send + Sync {
    async fn list_pools(&self) -> Result<Vec<String>>;
    async fn pool_exists(&self, pool: &str) -> Result<bool>;
    async fn pool_status(&self, pool: &str) -> Result<PoolStatus>;

    /// Create a dataset (parents auto-created) with the given properties and
    /// mount it. The kernel refusing the unprivileged mount after a
    /// successful create is reported as success.
    async fn create_dataset(&self, dataset: &str, options: &DatasetOptions) -> Result<()>;
    /// Destroy a dataset. With `recursive`, descendants and dependent clones
    /// go with it.
    async fn destroy_dataset(&self, dataset: &str, recursive: bool) -> Result<()>;
    async fn dataset_exists(&self, dataset: &str) -> Result<bool>;
    async fn get_dataset(&self, dataset: &str) -> Result<DatasetInfo>;
    /// Every filesystem dataset strictly below `base`, recursively.
    async fn list_datasets(&self, base: &str) -> Result<Vec<DatasetInfo>>;
    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()>;
    async fn get_property(&self, dataset: &str, key: &str) -> Result<String>;
    /// Idempotent: "already mounted" is success.
    async fn mount_dataset(&self, dataset: &str) -> Result<()>;
    /// Idempotent: "not mounted" is success.
    async fn unmount_dataset(&self, dataset: &str) -> Result<()>;
    async fn rename_dataset(&self, from: &str, to: &str) -> Result<()>;
    async fn get_mountpoint(&self, dataset: &str) -> Result<PathBuf>;
    async fn get_used_space(&self, dataset: &str) -> Result<u64>;

    /// `zfs snapshot <dataset>@<stamp>`; returns the full snapshot name.
    async fn create_snapshot(&self, dataset: &str, stamp: &str) -> Result<String>;
    async fn destroy_snapshot(&self, full_name: &str) -> Result<()>;
    async fn snapshot_exists(&self, full_name: &str) -> Result<bool>;
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>>;
    async fn get_snapshot_size(&self, full_name: &str) -> Result<u64>;

    async fn clone_snapshot(&self, full_snapshot: &str, target_dataset: &str) -> Result<()>;
    async fn promote_clone(&self, dataset: &str) -> Result<()>;

    /// True when the current user holds delegated permissions (at least
    /// `create`) on the base dataset. `pgfork setup` grants them.
    async fn delegation_ok(&self, base: &str) -> Result<bool>;
}

/// Production driver shelling out to the ZFS userland tools. Mount and
/// unmount go through sudo: the Linux kernel restricts those two operations
/// to root even when everything else is delegated with `zfs allow`.
#[derive(Debug, Default, Clone)]
pub struct ZfsDriver;

impl ZfsDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FilesystemDriver for ZfsDriver {
    async fn list_pools(&self) -> Result<Vec<String>> {
        let output = zpool_output(&["list", "-H", "-o", "name"]).await?;
        let stdout = output.success_stdout()?;
        Ok(stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn pool_exists(&self, pool: &str) -> Result<bool> {
        let output = zpool_output(&["list", "-H", "-o", "name", pool]).await?;
        Ok(output.status.success())
    }

    async fn pool_status(&self, pool: &str) -> Result<PoolStatus> {
        let output = zpool_output(&["list", "-Hp", "-o", "name,health,size,alloc,free", pool]).await?;
        let stdout = output.success_stdout()?;
        parse_pool_status(stdout.trim())
    }

    async fn create_dataset(&self, dataset: &str, options: &DatasetOptions) -> Result<()> {
        let compression = format!("compression={}", options.compression);
        let recordsize = format!("recordsize={}", options.recordsize);
        let atime = format!(
            "atime={}",
            if options.atime_enabled { "on" } else { "off" }
        );
        let output = zfs_output(&[
            "create",
            "-p",
            "-o",
            &compression,
            "-o",
            &recordsize,
            "-o",
            &atime,
            dataset,
        ])
        .await?;

        if output.status.success() {
            return Ok(());
        }
        // Unprivileged create succeeds but the kernel refuses the implicit
        // mount; the dataset exists and we mount it via sudo afterwards.
        let stderr = output.stderr_trimmed();
        if stderr.contains("successfully created") || stderr.contains("mounted by root") {
            log::debug!("dataset '{dataset}' created without mount: {stderr}");
            return Ok(());
        }
        Err(anyhow!("zfs create '{dataset}' failed: {stderr}"))
    }

    async fn destroy_dataset(&self, dataset: &str, recursive: bool) -> Result<()> {
        // -R also takes out clones hanging off our snapshots.
        let args: Vec<&str> = if recursive {
            vec!["destroy", "-R", dataset]
        } else {
            vec!["destroy", dataset]
        };
        zfs_output(&args).await?.success_or_stderr()
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let output = zfs_output(&["list", "-H", "-o", "name", dataset]).await?;
        Ok(output.status.success())
    }

    async fn get_dataset(&self, dataset: &str) -> Result<DatasetInfo> {
        let output = zfs_output(&[
            "list",
            "-Hp",
            "-o",
            "name,used,avail,refer,mountpoint,creation",
            dataset,
        ])
        .await?;
        let stdout = output.success_stdout()?;
        parse_dataset_line(stdout.trim())
            .ok_or_else(|| anyhow!("unexpected zfs list output for '{dataset}': {stdout}"))
    }

    async fn list_datasets(&self, base: &str) -> Result<Vec<DatasetInfo>> {
        let output = zfs_output(&[
            "list",
            "-Hp",
            "-r",
            "-t",
            "filesystem",
            "-o",
            "name,used,avail,refer,mountpoint,creation",
            base,
        ])
        .await?;
        let stdout = output.success_stdout()?;
        Ok(stdout
            .lines()
            .filter_map(parse_dataset_line)
            .filter(|d| d.name != base)
            .collect())
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let assignment = format!("{key}={value}");
        zfs_output(&["set", &assignment, dataset])
            .await?
            .success_or_stderr()
    }

    async fn get_property(&self, dataset: &str, key: &str) -> Result<String> {
        let output = zfs_output(&["get", "-H", "-o", "value", key, dataset]).await?;
        Ok(output.success_stdout()?.trim().to_string())
    }

    async fn mount_dataset(&self, dataset: &str) -> Result<()> {
        let output = sudo_zfs_output(&["mount", dataset]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = output.stderr_trimmed();
        if stderr.contains("already mounted") {
            return Ok(());
        }
        Err(anyhow!("zfs mount '{dataset}' failed: {stderr}"))
    }

    async fn unmount_dataset(&self, dataset: &str) -> Result<()> {
        let output = sudo_zfs_output(&["unmount", dataset]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = output.stderr_trimmed();
        if stderr.contains("not currently mounted") || stderr.contains("not mounted") {
            return Ok(());
        }
        Err(anyhow!("zfs unmount '{dataset}' failed: {stderr}"))
    }

    async fn rename_dataset(&self, from: &str, to: &str) -> Result<()> {
        zfs_output(&["rename", from, to]).await?.success_or_stderr()
    }

    async fn get_mountpoint(&self, dataset: &str) -> Result<PathBuf> {
        let value = self.get_property(dataset, "mountpoint").await?;
        if value == "-" || value == "none" || value == "legacy" {
            anyhow::bail!("dataset '{dataset}' has no usable mountpoint ({value})");
        }
        Ok(PathBuf::from(value))
    }

    async fn get_used_space(&self, dataset: &str) -> Result<u64> {
        let value = self.get_property(dataset, "used").await?;
        value
            .parse()
            .with_context(|| format!("unparseable used space '{value}' for '{dataset}'"))
    }

    async fn create_snapshot(&self, dataset: &str, stamp: &str) -> Result<String> {
        let full = format!("{dataset}@{stamp}");
        zfs_output(&["snapshot", &full])
            .await?
            .success_or_stderr()
            .with_context(|| format!("failed to create snapshot '{full}'"))?;
        Ok(full)
    }

    async fn destroy_snapshot(&self, full_name: &str) -> Result<()> {
        zfs_output(&["destroy", full_name])
            .await?
            .success_or_stderr()
    }

    async fn snapshot_exists(&self, full_name: &str) -> Result<bool> {
        let output = zfs_output(&["list", "-H", "-t", "snapshot", "-o", "name", full_name]).await?;
        Ok(output.status.success())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let output = zfs_output(&[
            "list", "-H", "-t", "snapshot", "-o", "name", "-r", dataset,
        ])
        .await?;
        let stdout = output.success_stdout()?;
        Ok(stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn get_snapshot_size(&self, full_name: &str) -> Result<u64> {
        let output = zfs_output(&["get", "-Hp", "-o", "value", "used", full_name]).await?;
        let value = output.success_stdout()?.trim().to_string();
        value
            .parse()
            .with_context(|| format!("unparseable snapshot size '{value}' for '{full_name}'"))
    }

    async fn clone_snapshot(&self, full_snapshot: &str, target_dataset: &str) -> Result<()> {
        zfs_output(&["clone", full_snapshot, target_dataset])
            .await?
            .success_or_stderr()
            .with_context(|| format!("failed to clone '{full_snapshot}' to '{target_dataset}'"))
    }

    async fn promote_clone(&self, dataset: &str) -> Result<()> {
        zfs_output(&["promote", dataset]).await?.success_or_stderr()
    }

    async fn delegation_ok(&self, base: &str) -> Result<bool> {
        let output = zfs_output(&["allow", base]).await?;
        if !output.status.success() {
            return Ok(false);
        }
        let user = std::env::var("USER").context("USER environment variable is not set")?;
        Ok(parse_delegation(
            &String::from_utf8_lossy(&output.stdout),
            &user,
        ))
    }
}

/// `zfs allow` lists delegated users as `user <name> <perm,perm,...>`.
fn parse_delegation(zfs_allow_output: &str, user: &str) -> bool {
    let needle = format!("user {user} ");
    zfs_allow_output
        .lines()
        .map(str::trim)
        .any(|line| line.starts_with(&needle) && line.contains("create"))
}

fn parse_pool_status(line: &str) -> Result<PoolStatus> {
    let mut parts = line.split('\t');
    let (name, health, size, alloc, free) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    );
    match (name, health, size, alloc, free) {
        (Some(name), Some(health), Some(size), Some(alloc), Some(free)) => Ok(PoolStatus {
            name: name.to_string(),
            health: health.to_string(),
            size_bytes: size.parse().unwrap_or(0),
            allocated_bytes: alloc.parse().unwrap_or(0),
            free_bytes: free.parse().unwrap_or(0),
        }),
        _ => Err(anyhow!("unexpected zpool list output: {line}")),
    }
}

fn parse_dataset_line(line: &str) -> Option<DatasetInfo> {
    let mut parts = line.split('\t');
    let name = parts.next()?;
    let used = parts.next()?;
    let avail = parts.next()?;
    let refer = parts.next()?;
    let mountpoint = parts.next()?;
    let creation = parts.next()?;

    let mountpoint = match mountpoint {
        "-" | "none" | "legacy" => None,
        path => Some(PathBuf::from(path)),
    };
    let created = creation
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    Some(DatasetInfo {
        name: name.to_string(),
        used_bytes: used.parse().unwrap_or(0),
        available_bytes: avail.parse().unwrap_or(0),
        referenced_bytes: refer.parse().unwrap_or(0),
        mountpoint,
        created,
    })
}

async fn zfs_output(args: &[&str]) -> Result<std::process::Output> {
    Command::new("zfs")
        .args(args)
        .output()
        .await
        .context("failed to execute zfs command")
}

async fn sudo_zfs_output(args: &[&str]) -> Result<std::process::Output> {
    Command::new("sudo")
        .args(["-n", "zfs"])
        .args(args)
        .output()
        .await
        .context("failed to execute sudo zfs command")
}

async fn zpool_output(args: &[&str]) -> Result<std::process::Output> {
    Command::new("zpool")
        .args(args)
        .output()
        .await
        .context("failed to execute zpool command")
}

pub(crate) trait OutputExt {
    fn success_or_stderr(self) -> Result<()>;
    fn success_stdout(self) -> Result<String>;
    fn stderr_trimmed(&self) -> String;
}

impl OutputExt for std::process::Output {
    fn success_or_stderr(self) -> Result<()> {
        if self.status.success() {
            return Ok(());
        }
        Err(anyhow!(self.stderr_trimmed()))
    }

    fn success_stdout(self) -> Result<String> {
        if self.status.success() {
            return Ok(String::from_utf8_lossy(&self.stdout).to_string());
        }
        Err(anyhow!(self.stderr_trimmed()))
    }

    fn stderr_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamp_flattens_punctuation_to_millis() {
        let at = Utc.with_ymd_and_hms(2025, 10, 7, 14, 30, 0).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(snapshot_stamp(at, None), "2025-10-07T14-30-00-123");
        assert_eq!(
            snapshot_stamp(at, Some("baseline")),
            "2025-10-07T14-30-00-123-baseline"
        );
    }

    #[test]
    fn naming() {
        assert_eq!(dataset_path("tank", "pgfork", "demo-dev"), "tank/pgfork/demo-dev");
        assert_eq!(base_path("tank", "pgfork"), "tank/pgfork");
    }

    #[test]
    fn parses_dataset_line() {
        let line = "tank/pgfork/demo-main\t9700000\t104857600\t9500000\t/tank/pgfork/demo-main\t1728300000";
        let info = parse_dataset_line(line).unwrap();
        assert_eq!(info.name, "tank/pgfork/demo-main");
        assert_eq!(info.leaf(), "demo-main");
        assert_eq!(info.used_bytes, 9_700_000);
        assert_eq!(
            info.mountpoint.as_deref(),
            Some(std::path::Path::new("/tank/pgfork/demo-main"))
        );
        assert!(info.created.is_some());
    }

    #[test]
    fn unmounted_dataset_has_no_mountpoint() {
        let line = "tank/pgfork/demo-dev\t1024\t104857600\t1024\t-\t1728300000";
        let info = parse_dataset_line(line).unwrap();
        assert!(info.mountpoint.is_none());
    }

    #[test]
    fn delegation_parser_matches_user_lines() {
        let output = "\
---- Permissions on tank/pgfork ----------------------------------
Local+Descendent permissions:
        user alice create,destroy,snapshot,clone,mount,promote,rename
";
        assert!(parse_delegation(output, "alice"));
        assert!(!parse_delegation(output, "bob"));
        assert!(!parse_delegation("", "alice"));
        assert!(!parse_delegation("        user alice snapshot,clone\n", "alice"));
    }

    #[test]
    fn parses_pool_status() {
        let status = parse_pool_status("tank\tONLINE\t10737418240\t1073741824\t9663676416").unwrap();
        assert_eq!(status.name, "tank");
        assert_eq!(status.health, "ONLINE");
        assert_eq!(status.size_bytes, 10_737_418_240);
        assert_eq!(status.free_bytes, 9_663_676_416);
    }
}
