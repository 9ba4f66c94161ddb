//! Serialized add/remove of SSH host keys under a process-wide lock.
//!
//! External tools (`ssh`, another `ssh-keygen` invocation) are not assumed
//! to run concurrently, so the only thing this module protects against is
//! concurrent mutation *within this process*.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::dns::guess_fqdn;
use crate::error::VmBuilderError;
use crate::subprocess;

fn default_path() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root")).join(".ssh/known_hosts")
}

/// Process-wide lock guarding every mutation of `known_hosts`.
fn lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

async fn check_locked(name_or_ip: &str, known_hosts_file: &Path) -> Result<bool, VmBuilderError> {
    let path = known_hosts_file.to_string_lossy();
    match subprocess::run("ssh-keygen", &["-F", name_or_ip, "-f", &path]).await {
        Ok(_) => Ok(true),
        Err(VmBuilderError::SubprocessFailed { exit_code: 1, .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

async fn remove_locked(name_or_ip: &str, known_hosts_file: &Path) -> Result<(), VmBuilderError> {
    let path = known_hosts_file.to_string_lossy().into_owned();
    while check_locked(name_or_ip, known_hosts_file).await? {
        // Mirror the Python implementation: a failed ssh-keygen -R is
        // swallowed, since the entry may already be gone by the time we act.
        let _ = subprocess::run("ssh-keygen", &["-f", &path, "-R", name_or_ip]).await;
    }
    Ok(())
}

/// Check whether `known_hosts` already has an entry for `name_or_ip`.
pub async fn check(name_or_ip: &str) -> Result<bool, VmBuilderError> {
    let _guard = lock().lock().await;
    check_locked(name_or_ip, &default_path()).await
}

/// Remove every entry for `name_or_ip` from `known_hosts`.
pub async fn remove(name_or_ip: &str) -> Result<(), VmBuilderError> {
    let _guard = lock().lock().await;
    remove_locked(name_or_ip, &default_path()).await
}

/// Replace the host-key entries for each `(ip, hostname)` pair: wipe any
/// stale entry for the hostname, its guessed FQDN, and the IP itself, then
/// (if `ssh_key` is given) append one fresh `<fqdn>,<ip> <ssh_key>` line per
/// pair.
pub async fn update(ips: &[(Option<String>, String)], ssh_key: Option<&str>) -> Result<(), VmBuilderError> {
    let path = default_path();
    let _guard = lock().lock().await;

    let mut fqdns = Vec::with_capacity(ips.len());
    for (ip, hostname) in ips {
        remove_locked(hostname, &path).await?;
        let fqdn = guess_fqdn(ip.as_deref(), hostname).await;
        remove_locked(&fqdn, &path).await?;
        if let Some(ip) = ip {
            remove_locked(ip, &path).await?;
        }
        fqdns.push(fqdn);
    }

    if let Some(key) = ssh_key {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| VmBuilderError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| VmBuilderError::Io {
                context: format!("opening {}", path.display()),
                source: e,
            })?;
        for ((ip, _), fqdn) in ips.iter().zip(fqdns.iter()) {
            let ip = ip.as_deref().unwrap_or("");
            let line = format!("{fqdn},{ip} {key}\n");
            file.write_all(line.as_bytes()).await.map_err(|e| VmBuilderError::Io {
                context: format!("appending to {}", path.display()),
                source: e,
            })?;
        }
        file.flush().await.map_err(|e| VmBuilderError::Io {
            context: format!("flushing {}", path.display()),
            source: e,
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_locked_false_on_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        tokio::fs::write(&path, "").await.unwrap();
        assert!(!check_locked("nohost.example", &path).await.unwrap());
    }

    #[tokio::test]
    async fn remove_locked_is_idempotent_on_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        tokio::fs::write(&path, "").await.unwrap();
        remove_locked("nohost.example", &path).await.unwrap();
    }
}
