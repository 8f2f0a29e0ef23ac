use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Advisory inter-process lock guarding the state file's read-modify-write
/// window. The lock file holds the owner's PID; a lock whose owner is dead
/// is reclaimed. Released on `release()` or drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    released: bool,
}

impl StateLock {
    /// Acquire the lock at `<state>.lock`. Polls every 100 ms and gives up
    /// after 5 s with a locking error.
    pub async fn acquire(state_path: &Path) -> Result<Self> {
        let path = lock_path(state_path);
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;

        loop {
            if try_create(&path)? {
                return Ok(Self {
                    path,
                    released: false,
                });
            }

            // Someone holds it. If the holder is dead, reclaim and retry
            // immediately; otherwise wait out the poll interval.
            if let Some(pid) = read_holder(&path) {
                if !process_alive(pid) {
                    log::warn!("reclaiming stale state lock held by dead pid {pid}");
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
            }

            if Instant::now() >= deadline {
                anyhow::bail!(
                    "timed out acquiring state lock '{}' after {:?}; \
                     another pgfork process is holding it",
                    path.display(),
                    ACQUIRE_TIMEOUT
                );
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        std::fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove lock file '{}'", self.path.display()))
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub fn lock_path(state_path: &Path) -> PathBuf {
    let mut os = state_path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Exclusive-create the lock file with our PID. Ok(false) = already held.
fn try_create(path: &Path) -> Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            write!(file, "{}", std::process::id())
                .with_context(|| format!("failed to write pid to '{}'", path.display()))?;
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => {
            Err(err).with_context(|| format!("failed to create lock file '{}'", path.display()))
        }
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Cannot probe; assume alive so we never steal a live lock.
    true
}
