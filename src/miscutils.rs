//! Crash-safe file writes and exponential-backoff retries shared by
//! every other component that mutates on-disk state or shells out to
//! flaky external tools (`kpartx` in particular).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;

use crate::error::VmBuilderError;

/// Build a temp filename in the same directory as `path`, e.g.
/// `/a/b/foo.txt` -> `/a/b/.aB3dK9xZ_foo.txt`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect();
    let file_name = path.file_name().and_then(|f| f.to_str()).unwrap_or("tmp");
    let tmp_name = format!(".{suffix}_{file_name}");
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(tmp_name),
        _ => PathBuf::from(tmp_name),
    }
}

/// Write `contents` to `path` atomically: write to a random temp sibling,
/// then rename over the destination. Callers never observe a partially
/// written file.
pub async fn atomic_write(path: &Path, contents: &str) -> Result<(), VmBuilderError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| VmBuilderError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
        }
    }

    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, contents).await.map_err(|e| VmBuilderError::Io {
        context: format!("writing temp file {}", tmp.display()),
        source: e,
    })?;

    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        VmBuilderError::Io {
            context: format!("renaming {} to {}", tmp.display(), path.display()),
            source: e,
        }
    })
}

/// Retry `f` up to `attempts` times with exponential backoff (1s, 2s, 4s, ...)
/// between tries. The final attempt's error (if any) is returned as-is.
pub async fn with_retries<F, Fut, T>(attempts: u32, mut f: F) -> Result<T, VmBuilderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VmBuilderError>>,
{
    let mut timeout = Duration::from_secs(1);
    for attempt in 0..attempts.saturating_sub(1) {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "retrying after failure");
                tokio::time::sleep(timeout).await;
                timeout *= 2;
            }
        }
    }
    f().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn atomic_write_creates_file_with_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        atomic_write(&path, "hello world").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        atomic_write(&path, "data").await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn atomic_write_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        atomic_write(&path, "first").await.unwrap();
        atomic_write(&path, "second").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn with_retries_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, VmBuilderError>(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retries_gives_up_after_n_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), VmBuilderError> = with_retries(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(VmBuilderError::Validation { message: "nope".into() })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
