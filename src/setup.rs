use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::config::Config;
use crate::error::user_error_hint;
use crate::zfs::{base_path, FilesystemDriver, OutputExt};

/// ZFS operations delegated to the pgfork user so day-to-day commands run
/// without sudo. Mount/unmount stay privileged (kernel constraint) and go
/// through sudo in the driver.
const DELEGATED_PERMISSIONS: &str =
    "create,destroy,snapshot,clone,mount,mountpoint,promote,rename,rollback";

/// Check that the one-time host setup has been run for this pool/base.
/// Called before project create; failing it aborts with remediation.
pub async fn verify(fs: &dyn FilesystemDriver, pool: &str, base: &str) -> Result<()> {
    let delegated = fs
        .delegation_ok(&base_path(pool, base))
        .await
        .context("could not check ZFS delegation (is ZFS installed?)")?;
    if !delegated {
        return Err(user_error_hint(
            format!(
                "ZFS permissions are not delegated on '{}'",
                base_path(pool, base)
            ),
            "run 'pgfork setup' once to delegate dataset permissions to your user",
        ));
    }
    Ok(())
}

/// Perform the one-time host setup. Idempotent; every step checks before it
/// acts. Requires sudo for the privileged pieces.
pub async fn run(config: &Config, pool: &str, base: &str) -> Result<()> {
    if which("zfs").await.is_err() {
        return Err(user_error_hint(
            "the 'zfs' command is not installed",
            "install ZFS first (e.g. 'sudo apt install zfsutils-linux')",
        ));
    }

    let user = current_user()?;
    let base = base_path(pool, base);

    // Base dataset (unmounted container for per-branch datasets).
    let exists = Command::new("zfs")
        .args(["list", "-H", "-o", "name", &base])
        .output()
        .await
        .context("failed to run zfs list")?;
    if !exists.status.success() {
        sudo_command("zfs", &["create", "-p", &base]).await?;
    }

    sudo_command("zfs", &["allow", &user, DELEGATED_PERMISSIONS, &base]).await?;

    // WAL archive root, owned by the postgres container user.
    let wal_root = config.wal_root();
    let wal_root_str = wal_root.to_string_lossy();
    sudo_command("mkdir", &["-p", &wal_root_str]).await?;
    sudo_command(
        "chown",
        &[
            &format!(
                "{}:{}",
                crate::config::POSTGRES_UID,
                crate::config::POSTGRES_GID
            ),
            &wal_root_str,
        ],
    )
    .await?;
    sudo_command("chmod", &["0770", &wal_root_str]).await?;

    println!("Host setup complete for '{base}' (user '{user}')");
    Ok(())
}

fn current_user() -> Result<String> {
    std::env::var("USER").context("USER environment variable is not set")
}

async fn which(program: &str) -> Result<()> {
    let output = Command::new("which")
        .arg(program)
        .output()
        .await
        .context("failed to run which")?;
    if output.status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("'{program}' not found in PATH"))
    }
}

/// Run a command via sudo, echoing it and inheriting stdin for the password
/// prompt.
async fn sudo_command(program: &str, args: &[&str]) -> Result<()> {
    println!("  Running: sudo {} {}", program, args.join(" "));

    let output = Command::new("sudo")
        .arg(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn sudo {program}"))?
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for sudo {program}"))?;

    output
        .success_or_stderr()
        .with_context(|| format!("sudo {} {} failed", program, args.join(" ")))
}

