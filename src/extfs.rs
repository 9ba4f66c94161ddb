//! Read/write individual files inside an offline ext2/3/4 image, via
//! `debugfs`. Every operation here runs against the unmounted block
//! device directly — nothing in this module ever mounts a filesystem.

use std::path::Path;

use crate::error::VmBuilderError;
use crate::subprocess;

const DEBUGFS: &str = "/sbin/debugfs";

/// Check whether `path` exists inside the ext2/3/4 image at `fsimage`.
pub async fn file_exists(path: &str, fsimage: &Path) -> Result<bool, VmBuilderError> {
    let image = fsimage.to_string_lossy().into_owned();
    let request = format!("dirsearch {} {}", dirname(path), basename(path));
    let out = subprocess::run(DEBUGFS, &["-R", &request, &image]).await?;
    let text = String::from_utf8_lossy(&out).to_ascii_lowercase();
    Ok(text.starts_with("entry found"))
}

/// Remove `path` from the ext2/3/4 image, verifying it is actually gone
/// afterward. Hard-fails if `debugfs` reports success but the entry
/// remains.
pub async fn rm(path: &str, fsimage: &Path) -> Result<(), VmBuilderError> {
    if !file_exists(path, fsimage).await? {
        return Ok(());
    }
    let image = fsimage.to_string_lossy().into_owned();
    let script = format!("rm {path}\n");
    subprocess::run_with_stdin(DEBUGFS, &["-w", &image], script.as_bytes()).await?;

    if file_exists(path, fsimage).await? {
        return Err(VmBuilderError::SubprocessFailed {
            cmd: format!("debugfs rm {path}"),
            exit_code: 0,
            stderr: format!("{path} still present in {} after rm", fsimage.display()),
        });
    }
    Ok(())
}

/// Write a zero-length file at `path` inside the image with the given
/// Unix `mode`, overwriting any existing entry.
pub async fn make_empty_file(path: &str, fsimage: &Path, mode: u32) -> Result<(), VmBuilderError> {
    let empty = tempfile::NamedTempFile::new().map_err(|e| VmBuilderError::Io {
        context: "creating scratch empty file".into(),
        source: e,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(empty.path(), std::fs::Permissions::from_mode(mode)).map_err(|e| {
            VmBuilderError::Io {
                context: format!("chmod {mode:o} on scratch file"),
                source: e,
            }
        })?;
    }

    let image = fsimage.to_string_lossy().into_owned();
    let src = empty.path().to_string_lossy().into_owned();
    let dir = dirname(path);
    let fname = basename(path);

    // `rm` first so write never fails on an existing entry, mirroring
    // copy_file_content's force=true semantics for anonymization use.
    let script = format!("rm {path}\ncd {dir}\nwrite {src} {fname}\n");
    subprocess::run_with_stdin(DEBUGFS, &["-f", "/dev/stdin", "-w", &image], script.as_bytes()).await?;
    Ok(())
}

fn dirname(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => ".".to_string(),
    }
}

fn basename(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => path[i + 1..].to_string(),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirname_of_nested_path() {
        assert_eq!(dirname("/etc/machine-id"), "/etc");
    }

    #[test]
    fn dirname_of_root_level_path() {
        assert_eq!(dirname("/machine-id"), "/");
    }

    #[test]
    fn basename_strips_directory() {
        assert_eq!(basename("/var/lib/dbus/machine-id"), "machine-id");
    }
}
