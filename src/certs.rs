use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::fsperm::{chown_postgres, set_mode};
use crate::zfs::OutputExt;

/// Narrow contract for producing a project's server certificate pair.
/// Production shells out to openssl; tests drop in placeholder files.
#[async_trait]
pub trait CertificateGenerator: Send + Sync {
    async fn generate(&self, cert_dir: &Path) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct OpensslCertGenerator;

#[async_trait]
impl CertificateGenerator for OpensslCertGenerator {
    /// Generate a self-signed pair into `cert_dir` (idempotent). Postgres
    /// insists the key is private (0600) and readable by its own user, so
    /// the key is chowned to the container user after generation.
    async fn generate(&self, cert_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(cert_dir)
            .await
            .with_context(|| format!("failed to create cert dir '{}'", cert_dir.display()))?;

        let crt = cert_dir.join("server.crt");
        let key = cert_dir.join("server.key");

        if tokio::fs::metadata(&crt).await.is_ok() && tokio::fs::metadata(&key).await.is_ok() {
            log::debug!("certs already present in '{}'", cert_dir.display());
            return Ok(());
        }

        let output = Command::new("openssl")
            .args([
                "req", "-x509", "-newkey", "rsa:2048", "-nodes", "-days", "3650", "-subj",
                "/CN=pgfork",
            ])
            .arg("-keyout")
            .arg(&key)
            .arg("-out")
            .arg(&crt)
            .output()
            .await
            .context("failed to execute openssl")?;
        output
            .success_or_stderr()
            .context("openssl certificate generation failed")?;

        set_mode(&key, 0o600)?;
        chown_postgres(&key);
        set_mode(&crt, 0o644)?;

        Ok(())
    }
}

pub async fn delete_certs(cert_dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(cert_dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove cert dir '{}'", cert_dir.display()))
        }
    }
}
