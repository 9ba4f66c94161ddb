//! Uniform exec + capture of the external CLIs this crate drives
//! (`virsh`, `lvs`/`lvcreate`, `kpartx`, `sfdisk`, `dd`, `debugfs`, ...).
//!
//! Every other component runs external commands through `run`/`run_sudo`
//! rather than calling `tokio::process::Command` directly, so stderr
//! surfacing and exit-code handling stay in one place.

use std::process::Output;

use crate::error::VmBuilderError;

async fn exec(program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, VmBuilderError> {
    use tokio::io::AsyncWriteExt;

    let mut command = tokio::process::Command::new(program);
    command.args(args);

    if stdin.is_some() {
        command.stdin(std::process::Stdio::piped());
    }
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    let mut child = command.spawn().map_err(|e| VmBuilderError::Io {
        context: format!("spawning {program}"),
        source: e,
    })?;

    if let Some(data) = stdin {
        let mut pipe = child.stdin.take().expect("stdin was requested as piped");
        pipe.write_all(data).await.map_err(|e| VmBuilderError::Io {
            context: format!("writing to {program} stdin"),
            source: e,
        })?;
        drop(pipe);
    }

    child.wait_with_output().await.map_err(|e| VmBuilderError::Io {
        context: format!("waiting for {program}"),
        source: e,
    })
}

fn checked(program: &str, args: &[&str], output: Output) -> Result<Vec<u8>, VmBuilderError> {
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(VmBuilderError::SubprocessFailed {
            cmd: format!("{program} {}", args.join(" ")),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run `program` with `args`, returning stdout on success.
pub async fn run(program: &str, args: &[&str]) -> Result<Vec<u8>, VmBuilderError> {
    let output = exec(program, args, None).await?;
    checked(program, args, output)
}

/// Run `program` with `args`, feeding `stdin` to it, returning stdout on success.
pub async fn run_with_stdin(program: &str, args: &[&str], stdin: &[u8]) -> Result<Vec<u8>, VmBuilderError> {
    let output = exec(program, args, Some(stdin)).await?;
    checked(program, args, output)
}

/// Like `run`, but prepends `sudo` — for LVM/kpartx/ownership commands that
/// need root on a production hypervisor host.
pub async fn run_sudo(program: &str, args: &[&str]) -> Result<Vec<u8>, VmBuilderError> {
    let mut full = Vec::with_capacity(args.len() + 1);
    full.push(program);
    full.extend_from_slice(args);
    run("sudo", &full).await
}

/// Run `program`, but tolerate a non-zero exit matching one of `ok_codes`
/// in addition to 0. Used for `e2fsck`, whose exit code 1 means
/// "errors fixed", not failure.
pub async fn run_tolerant(program: &str, args: &[&str], ok_codes: &[i32]) -> Result<Vec<u8>, VmBuilderError> {
    let output = exec(program, args, None).await?;
    let code = output.status.code().unwrap_or(-1);
    if output.status.success() || ok_codes.contains(&code) {
        Ok(output.stdout)
    } else {
        Err(VmBuilderError::SubprocessFailed {
            cmd: format!("{program} {}", args.join(" ")),
            exit_code: code,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let out = run("echo", &["hello"]).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn run_surfaces_stderr_on_failure() {
        let err = run("sh", &["-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        match err {
            VmBuilderError::SubprocessFailed { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_tolerant_accepts_listed_code() {
        let out = run_tolerant("sh", &["-c", "exit 1"], &[1]).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn run_tolerant_rejects_unlisted_code() {
        let err = run_tolerant("sh", &["-c", "exit 2"], &[1]).await.unwrap_err();
        assert!(matches!(err, VmBuilderError::SubprocessFailed { exit_code: 2, .. }));
    }

    #[tokio::test]
    async fn run_with_stdin_feeds_child() {
        let out = run_with_stdin("cat", &[], b"piped data").await.unwrap();
        assert_eq!(out, b"piped data");
    }
}
