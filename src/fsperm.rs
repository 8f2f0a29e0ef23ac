use std::path::Path;

use anyhow::{Context, Result};

use crate::config::{POSTGRES_GID, POSTGRES_UID};

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set mode {mode:o} on '{}'", path.display()))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Hand a path to the postgres container user. Needs CAP_CHOWN; unprivileged
/// runs keep going with a warning since `pgfork setup` establishes ownership
/// once.
#[cfg(unix)]
pub(crate) fn chown_postgres(path: &Path) {
    if let Err(err) = std::os::unix::fs::chown(path, Some(POSTGRES_UID), Some(POSTGRES_GID)) {
        log::warn!(
            "could not chown '{}' to {POSTGRES_UID}:{POSTGRES_GID}: {err}",
            path.display()
        );
    }
}

#[cfg(not(unix))]
pub(crate) fn chown_postgres(_path: &Path) {}
