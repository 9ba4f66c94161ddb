//! Config-drive image builder (C7).
//!
//! Rendering `user-data`/`meta-data`/`Autounattend.xml` content is someone
//! else's job — this module only ever receives already-rendered bytes and
//! turns them into a bootable config-drive image, exactly the way the
//! guest's datasource expects to find it: ISO9660 with a `cidata` volume
//! label for cloud-init, FAT12 for Windows' Autounattend answer file.

use std::path::{Path, PathBuf};

use crate::error::VmBuilderError;
use crate::miscutils::temp_sibling;
use crate::subprocess;

/// One file to place at the root of the config drive.
pub struct DriveFile {
    pub name: String,
    pub contents: Vec<u8>,
}

async fn stage_files(dir: &Path, files: &[DriveFile]) -> Result<(), VmBuilderError> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| VmBuilderError::Io {
        context: format!("creating scratch directory {}", dir.display()),
        source: e,
    })?;
    for f in files {
        let path = dir.join(&f.name);
        tokio::fs::write(&path, &f.contents).await.map_err(|e| VmBuilderError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })?;
    }
    Ok(())
}

/// Build a cloud-init NoCloud config drive: ISO9660, volume label `cidata`,
/// Joliet + Rock Ridge extensions, via `genisoimage`. Written atomically —
/// built under a sibling temp name, then renamed into place.
pub async fn build_nocloud_iso(out_path: &Path, files: &[DriveFile]) -> Result<(), VmBuilderError> {
    let scratch = tempfile::tempdir().map_err(|e| VmBuilderError::Io {
        context: "creating scratch directory for config drive".into(),
        source: e,
    })?;
    stage_files(scratch.path(), files).await?;

    let tmp_out = temp_sibling(out_path);
    subprocess::run(
        "genisoimage",
        &[
            "-quiet",
            "-input-charset",
            "utf-8",
            "-volid",
            "cidata",
            "-joliet",
            "-rock",
            "-output",
            &tmp_out.to_string_lossy(),
            &scratch.path().to_string_lossy(),
        ],
    )
    .await?;

    tokio::fs::rename(&tmp_out, out_path).await.map_err(|e| VmBuilderError::Io {
        context: format!("renaming {} to {}", tmp_out.display(), out_path.display()),
        source: e,
    })?;
    Ok(())
}

/// Size (in KiB) of the blank FAT12 image mtools formats before copying in
/// the Autounattend tree. 1.44 MiB covers every answer-file set we emit.
const AUTOUNATTEND_IMAGE_KIB: &str = "1440";

/// Build a Windows Autounattend config drive: a blank FAT12 floppy image
/// populated via `mtools`, since the guest's setup phase reads it long
/// before any NTFS driver is available. Written atomically, same as
/// [`build_nocloud_iso`].
pub async fn build_autounattend_fat(out_path: &Path, files: &[DriveFile]) -> Result<(), VmBuilderError> {
    let tmp_out = temp_sibling(out_path);

    subprocess::run("mkfs.vfat", &["-C", &tmp_out.to_string_lossy(), AUTOUNATTEND_IMAGE_KIB]).await?;

    for f in files {
        let scratch = tempfile::NamedTempFile::new().map_err(|e| VmBuilderError::Io {
            context: "creating scratch file for mcopy staging".into(),
            source: e,
        })?;
        tokio::fs::write(scratch.path(), &f.contents).await.map_err(|e| VmBuilderError::Io {
            context: format!("staging {}", f.name),
            source: e,
        })?;

        let dest = format!("::/{}", f.name.replace('\\', "/"));
        subprocess::run(
            "mcopy",
            &["-i", &tmp_out.to_string_lossy(), &scratch.path().to_string_lossy(), &dest],
        )
        .await?;
    }

    tokio::fs::rename(&tmp_out, out_path).await.map_err(|e| VmBuilderError::Io {
        context: format!("renaming {} to {}", tmp_out.display(), out_path.display()),
        source: e,
    })?;
    Ok(())
}

/// Convert a Unix text file's line endings to CRLF, as Windows setup scripts
/// and Autounattend.xml expect.
pub fn to_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        out.push_str(line);
        out.push_str("\r\n");
    }
    if !text.ends_with('\n') {
        // split('\n') produces a trailing empty segment only when the
        // input ends in '\n'; otherwise we just added an extra CRLF.
        out.truncate(out.len() - 2);
    }
    out
}

/// Derive the config-drive image path for a VM, under the given cache dir.
pub fn image_path(cache_dir: &Path, vm_name: &str, windows: bool) -> PathBuf {
    let ext = if windows { "img" } else { "iso" };
    cache_dir.join(format!("{vm_name}-config.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_crlf_converts_bare_lf() {
        assert_eq!(to_crlf("a\nb\n"), "a\r\nb\r\n");
    }

    #[test]
    fn to_crlf_handles_missing_trailing_newline() {
        assert_eq!(to_crlf("a\nb"), "a\r\nb\r\n");
    }

    #[test]
    fn to_crlf_is_idempotent_on_already_crlf() {
        assert_eq!(to_crlf("a\r\nb\r\n"), "a\r\nb\r\n");
    }

    #[test]
    fn image_path_picks_extension_by_os() {
        let dir = Path::new("/cache");
        assert_eq!(image_path(dir, "db1", false), dir.join("db1-config.iso"));
        assert_eq!(image_path(dir, "win1", true), dir.join("win1-config.img"));
    }
}
