//! Nomad CLI passthrough for `raw` and `rawl`.

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use tiergate_bridge::{DISCONNECTED, SessionIo, SessionOutput};
use tiergate_config::TierConfig;

/// How long the child's pipes may stay open after it exits.
const PIPE_DRAIN: Duration = Duration::from_secs(2);

/// Find a bare program name on `search_path`, the way a shell would.
///
/// The child runs with an empty environment, so it cannot do this itself.
/// Paths with a directory part, and names not found, come back unchanged.
fn resolve_binary(binary: &Path, search_path: Option<&OsStr>) -> PathBuf {
    if binary.components().count() != 1 || binary.has_root() {
        return binary.to_path_buf();
    }
    let Some(search_path) = search_path else {
        return binary.to_path_buf();
    };
    std::env::split_paths(search_path)
        .map(|dir| dir.join(binary))
        .find(|candidate| {
            candidate
                .metadata()
                .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        })
        .unwrap_or_else(|| binary.to_path_buf())
}

/// Copy one child pipe to the session.
async fn pump<R>(mut pipe: R, output: mpsc::Sender<SessionOutput>, wrap: fn(Bytes) -> SessionOutput)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if output.send(wrap(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "child pipe closed");
                break;
            }
        }
    }
}

/// Run `binary args…` against `tier`, streaming its output to the session.
///
/// A bare `binary` is looked up on the daemon's `PATH`. The child sees only
/// `NOMAD_ADDR` and `NOMAD_TOKEN`. Returns the child's
/// exit code, 1 if it could not be started, or [`DISCONNECTED`] if the
/// client went away first (the child is killed).
pub async fn run_passthrough(binary: &Path, tier: &TierConfig, args: &[String], io: &SessionIo) -> u32 {
    passthrough(binary, std::env::var_os("PATH").as_deref(), tier, args, io).await
}

async fn passthrough(
    binary: &Path,
    search_path: Option<&OsStr>,
    tier: &TierConfig,
    args: &[String],
    io: &SessionIo,
) -> u32 {
    let program = resolve_binary(binary, search_path);
    debug!(program = %program.display(), "starting nomad cli");
    let mut command = Command::new(&program);
    command
        .args(args)
        .env_clear()
        .env("NOMAD_ADDR", &tier.url)
        .env("NOMAD_TOKEN", tier.token.as_deref().unwrap_or_default())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(binary = %binary.display(), error = %e, "failed to start nomad cli");
            io.say(format!("An error occurred starting {}", binary.display())).await;
            return 1;
        }
    };

    let mut pipes = JoinSet::new();
    if let Some(stdout) = child.stdout.take() {
        pipes.spawn(pump(stdout, io.output.clone(), SessionOutput::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        pipes.spawn(pump(stderr, io.output.clone(), SessionOutput::Stderr));
    }

    let mut disconnect = io.disconnect.clone();
    tokio::select! {
        status = child.wait() => {
            // Drain what the child wrote before exiting. A background process
            // it left behind may hold the pipes open, so the drain is bounded.
            let drain = async { while pipes.join_next().await.is_some() {} };
            tokio::select! {
                drained = tokio::time::timeout(PIPE_DRAIN, drain) => {
                    if drained.is_err() {
                        debug!(binary = %binary.display(), "nomad cli pipes still open after exit");
                    }
                }
                _ = SessionIo::disconnected(&mut disconnect) => {
                    debug!("client disconnected while draining nomad cli output");
                }
            }
            pipes.abort_all();
            match status {
                Ok(status) => {
                    let code = status.code().and_then(|c| u32::try_from(c).ok()).unwrap_or(1);
                    debug!(binary = %binary.display(), code, "nomad cli finished");
                    code
                }
                Err(e) => {
                    warn!(error = %e, "failed to wait for nomad cli");
                    1
                }
            }
        }
        _ = SessionIo::disconnected(&mut disconnect) => {
            debug!("client disconnected, killing nomad cli");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill nomad cli");
            }
            pipes.abort_all();
            DISCONNECTED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiergate_bridge::SessionHarness;

    fn tier() -> TierConfig {
        TierConfig {
            url: "http://test:4646".into(),
            token: Some("s3cret".into()),
            prefix: vec![],
            alias: vec![],
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".into(), script.into()]
    }

    #[tokio::test]
    async fn streams_output_and_exit_code() {
        let (io, mut harness) = SessionHarness::new(false);
        let code = run_passthrough(
            Path::new("/bin/sh"),
            &tier(),
            &sh("echo \"$NOMAD_ADDR $NOMAD_TOKEN\"; echo oops >&2; exit 3"),
            &io,
        )
        .await;
        assert_eq!(code, 3);
        let (stdout, stderr) = harness.drain();
        assert_eq!(stdout, "http://test:4646 s3cret\n");
        assert_eq!(stderr, "oops\n");
    }

    #[tokio::test]
    async fn environment_is_not_inherited() {
        let (io, mut harness) = SessionHarness::new(false);
        let code = run_passthrough(Path::new("/bin/sh"), &tier(), &sh("echo \"[$HOME]\""), &io).await;
        assert_eq!(code, 0);
        assert_eq!(harness.stdout(), "[]\n");
    }

    #[tokio::test]
    async fn missing_binary_fails() {
        let (io, mut harness) = SessionHarness::new(false);
        let code = run_passthrough(Path::new("/nonexistent/nomad"), &tier(), &[], &io).await;
        assert_eq!(code, 1);
        assert!(harness.stdout().starts_with("An error occurred"));
    }

    /// A directory holding an executable `fakenomad` that reports its tier.
    fn fake_nomad() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fakenomad");
        std::fs::write(&path, "#!/bin/sh\necho \"ran $NOMAD_ADDR $*\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    #[test]
    fn bare_name_resolves_on_search_path() {
        let dir = fake_nomad();
        let search = std::env::join_paths(["/nonexistent", dir.path().to_str().unwrap()]).unwrap();
        assert_eq!(
            resolve_binary(Path::new("fakenomad"), Some(search.as_os_str())),
            dir.path().join("fakenomad")
        );
        assert_eq!(resolve_binary(Path::new("absent"), Some(search.as_os_str())), PathBuf::from("absent"));
        assert_eq!(resolve_binary(Path::new("fakenomad"), None), PathBuf::from("fakenomad"));
    }

    #[test]
    fn explicit_paths_are_left_alone() {
        let dir = fake_nomad();
        let search = dir.path().as_os_str();
        assert_eq!(
            resolve_binary(Path::new("/opt/nomad"), Some(search)),
            PathBuf::from("/opt/nomad")
        );
        assert_eq!(
            resolve_binary(Path::new("bin/fakenomad"), Some(search)),
            PathBuf::from("bin/fakenomad")
        );
    }

    #[test]
    fn non_executable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nomad"), "not a program").unwrap();
        assert_eq!(
            resolve_binary(Path::new("nomad"), Some(dir.path().as_os_str())),
            PathBuf::from("nomad")
        );
    }

    #[tokio::test]
    async fn bare_binary_runs_from_daemon_path() {
        let dir = fake_nomad();
        let (io, mut harness) = SessionHarness::new(false);
        let code = passthrough(
            Path::new("fakenomad"),
            Some(dir.path().as_os_str()),
            &tier(),
            &["status".to_string()],
            &io,
        )
        .await;
        assert_eq!(code, 0);
        assert_eq!(harness.stdout(), "ran http://test:4646 status\n");
    }

    #[tokio::test]
    async fn lingering_background_process_does_not_hold_session() {
        let (io, mut harness) = SessionHarness::new(false);
        let code = tokio::time::timeout(
            Duration::from_secs(15),
            run_passthrough(Path::new("/bin/sh"), &tier(), &sh("sleep 30 & echo hi"), &io),
        )
        .await
        .expect("session should end once the cli exits");
        assert_eq!(code, 0);
        assert_eq!(harness.stdout(), "hi\n");
    }

    #[tokio::test]
    async fn disconnect_kills_child() {
        let (io, harness) = SessionHarness::new(false);
        harness.disconnect.send(true).unwrap();
        let code = run_passthrough(Path::new("/bin/sh"), &tier(), &sh("sleep 30"), &io).await;
        assert_eq!(code, DISCONNECTED);
    }
}
