//! Shell subprocess spawning and termination.
//!
//! Every accepted connection gets its own shell started in server mode with
//! all three standard streams piped. The subprocess is placed in its own
//! process group on Unix so that killing it also takes down anything it
//! forked.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::ConnectionError;

/// Fixed arguments that put the shell into non-interactive stdio server mode.
pub const SERVER_MODE_ARGS: [&str; 4] = ["-NoLogo", "-NoProfile", "-NonInteractive", "-s"];

/// Executable names tried, in order, when no explicit shell is configured.
pub const DEFAULT_SHELL_CANDIDATES: [&str; 2] = ["pwsh", "powershell"];

// ─────────────────────────────────────────────────────────────────────────────
// Shell location
// ─────────────────────────────────────────────────────────────────────────────

/// Which shell a server should launch for its connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellPreference {
    /// Explicit executable path. `None` searches `PATH`.
    #[serde(default)]
    pub executable: Option<PathBuf>,
}

/// Resolves a [`ShellPreference`] to an executable path.
///
/// Plain functions and closures with the matching signature implement this
/// trait, which keeps tests free of stub types.
pub trait ShellLocator: Send + Sync {
    /// Return the executable to launch, or why none could be found.
    fn locate(&self, preference: &ShellPreference) -> Result<PathBuf, ConnectionError>;
}

impl<F> ShellLocator for F
where
    F: Fn(&ShellPreference) -> Result<PathBuf, ConnectionError> + Send + Sync,
{
    fn locate(&self, preference: &ShellPreference) -> Result<PathBuf, ConnectionError> {
        self(preference)
    }
}

/// Default locator: honours an explicit path, otherwise searches `PATH` for
/// each of [`DEFAULT_SHELL_CANDIDATES`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShellLocator;

impl ShellLocator for SystemShellLocator {
    fn locate(&self, preference: &ShellPreference) -> Result<PathBuf, ConnectionError> {
        if let Some(path) = &preference.executable {
            return Ok(path.clone());
        }
        DEFAULT_SHELL_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| ConnectionError::ShellNotFound {
                reason: format!(
                    "none of {} found on PATH",
                    DEFAULT_SHELL_CANDIDATES.join(", ")
                ),
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subprocess
// ─────────────────────────────────────────────────────────────────────────────

/// How a subprocess ended, as observed by [`Subprocess::kill`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exited on its own (or after the kill) with this code.
    Exited { code: i32 },
    /// Terminated by a signal.
    Signalled { signal: i32 },
    /// Still alive after the kill wait elapsed.
    StillRunning,
    /// Reaping the process failed.
    WaitFailed { reason: String },
}

impl ProcessOutcome {
    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signalled { signal };
            }
        }
        Self::Exited { code: -1 }
    }

    /// Returns true if the process is known to be gone.
    #[must_use]
    pub fn is_reaped(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Signalled { .. })
    }
}

/// Handle on a running shell subprocess.
///
/// Shared between the connection supervisor and the server's connection
/// table so that whichever side tears the connection down first can kill it.
#[derive(Debug)]
pub struct Subprocess {
    pid: u32,
    path: PathBuf,
    child: tokio::sync::Mutex<Child>,
}

impl Subprocess {
    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Executable the subprocess was started from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Kill the subprocess (and its process group on Unix) unless it has
    /// already exited, then wait up to `wait` for it to be reaped.
    ///
    /// Safe to call more than once.
    pub async fn kill(&self, wait: Duration) -> ProcessOutcome {
        let mut child = self.child.lock().await;

        if let Ok(Some(status)) = child.try_wait() {
            return ProcessOutcome::from_status(status);
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
                debug!(pid = self.pid, error = ?e, "killpg SIGKILL failed");
            }
        }

        if let Err(e) = child.start_kill() {
            debug!(pid = self.pid, error = %e, "kill failed, process likely already gone");
        }

        match tokio::time::timeout(wait, child.wait()).await {
            Ok(Ok(status)) => ProcessOutcome::from_status(status),
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "failed to reap subprocess");
                ProcessOutcome::WaitFailed {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                warn!(pid = self.pid, wait_ms = wait.as_millis() as u64, "subprocess did not exit after kill");
                ProcessOutcome::StillRunning
            }
        }
    }
}

/// A freshly spawned shell with its standard streams detached.
pub struct SpawnedShell {
    pub subprocess: Arc<Subprocess>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Locates and starts shell subprocesses for one server.
pub struct SubprocessSpawner {
    locator: Arc<dyn ShellLocator>,
    preference: ShellPreference,
}

impl SubprocessSpawner {
    /// Create a spawner that resolves `preference` through `locator`.
    pub fn new(locator: Arc<dyn ShellLocator>, preference: ShellPreference) -> Self {
        Self {
            locator,
            preference,
        }
    }

    /// Resolve the executable and check that it exists.
    pub fn resolve(&self) -> Result<PathBuf, ConnectionError> {
        let path = self.locator.locate(&self.preference)?;
        if !path.is_file() {
            return Err(ConnectionError::ShellMissing { path });
        }
        Ok(path)
    }

    /// Start `path` with [`SERVER_MODE_ARGS`] and piped standard streams.
    pub fn spawn(&self, path: &Path) -> Result<SpawnedShell, ConnectionError> {
        let mut cmd = Command::new(path);
        cmd.args(SERVER_MODE_ARGS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ConnectionError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(ConnectionError::StreamNotCaptured { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ConnectionError::StreamNotCaptured { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ConnectionError::StreamNotCaptured { stream: "stderr" })?;
        // `id()` is only `None` after the child has been reaped.
        let pid = child.id().ok_or(ConnectionError::StreamNotCaptured { stream: "pid" })?;

        debug!(pid, path = %path.display(), "spawned shell subprocess");

        Ok(SpawnedShell {
            subprocess: Arc::new(Subprocess {
                pid,
                path: path.to_path_buf(),
                child: tokio::sync::Mutex::new(child),
            }),
            stdin,
            stdout,
            stderr,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn script(body: &str) -> tempfile::TempPath {
        let mut file = tempfile::Builder::new()
            .prefix("fake-shell-")
            .suffix(".sh")
            .tempfile()
            .unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))
            .unwrap();
        file.into_temp_path()
    }

    fn spawner_for(path: PathBuf) -> SubprocessSpawner {
        SubprocessSpawner::new(
            Arc::new(SystemShellLocator),
            ShellPreference {
                executable: Some(path),
            },
        )
    }

    #[test]
    fn test_explicit_preference_wins() {
        let pref = ShellPreference {
            executable: Some(PathBuf::from("/opt/shell/bin/pwsh")),
        };
        assert_eq!(
            SystemShellLocator.locate(&pref).unwrap(),
            PathBuf::from("/opt/shell/bin/pwsh")
        );
    }

    #[test]
    fn test_closure_locator() {
        let locator = |_: &ShellPreference| -> Result<PathBuf, ConnectionError> {
            Err(ConnectionError::ShellNotFound {
                reason: "none".to_string(),
            })
        };
        let spawner = SubprocessSpawner::new(Arc::new(locator), ShellPreference::default());
        assert!(matches!(
            spawner.resolve(),
            Err(ConnectionError::ShellNotFound { .. })
        ));
    }

    #[test]
    fn test_missing_executable_is_rejected() {
        let spawner = spawner_for(PathBuf::from("/nonexistent/shellgate/pwsh"));
        assert!(matches!(
            spawner.resolve(),
            Err(ConnectionError::ShellMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_mode_args_are_passed() {
        let path = script(r#"echo "$@""#);
        let spawner = spawner_for(path.to_path_buf());
        let resolved = spawner.resolve().unwrap();
        let mut shell = spawner.spawn(&resolved).unwrap();

        let mut out = String::new();
        shell.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "-NoLogo -NoProfile -NonInteractive -s");

        let outcome = shell.subprocess.kill(Duration::from_secs(2)).await;
        assert!(outcome.is_reaped());
    }

    #[tokio::test]
    async fn test_kill_running_subprocess() {
        let path = script("exec cat");
        let spawner = spawner_for(path.to_path_buf());
        let mut shell = spawner.spawn(&spawner.resolve().unwrap()).unwrap();

        shell.stdin.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        shell.stdout.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");

        let outcome = shell.subprocess.kill(Duration::from_secs(2)).await;
        assert_eq!(outcome, ProcessOutcome::Signalled { signal: 9 });

        // Second kill observes the already-reaped process.
        let again = shell.subprocess.kill(Duration::from_secs(2)).await;
        assert!(again.is_reaped());
    }
}
