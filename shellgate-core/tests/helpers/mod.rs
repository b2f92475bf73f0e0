//! Shared fixtures for the proxy integration tests.
//!
//! The stand-in shell is a `/bin/sh` script that ignores the server-mode
//! arguments and `exec`s `cat`, so every byte a client sends comes straight
//! back and the subprocess pid is the `cat` process.

#![allow(dead_code)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shellgate_core::{ConnectionError, ProxyDefaults, ShellLocator, ShellPreference};

/// Echo shell: everything on stdin comes back on stdout.
pub const ECHO_SHELL: &str = "exec cat";

/// Echo shell that writes diagnostics to stderr before echoing.
pub const NOISY_ECHO_SHELL: &str = "echo 'diagnostic noise' >&2\nexec cat";

/// A throwaway executable script. Deleted on drop.
pub struct FakeShell {
    path: tempfile::TempPath,
}

impl FakeShell {
    pub fn new(body: &str) -> Self {
        let mut file = tempfile::Builder::new()
            .prefix("shellgate-fake-shell-")
            .suffix(".sh")
            .tempfile()
            .unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))
            .unwrap();
        Self {
            path: file.into_temp_path(),
        }
    }

    pub fn echo() -> Self {
        Self::new(ECHO_SHELL)
    }

    pub fn path(&self) -> PathBuf {
        self.path.to_path_buf()
    }

    /// Locator that always resolves to this script.
    pub fn locator(&self) -> Arc<dyn ShellLocator> {
        let path = self.path();
        Arc::new(move |_: &ShellPreference| -> Result<PathBuf, ConnectionError> { Ok(path.clone()) })
    }
}

/// Locator that never finds a shell.
pub fn missing_shell_locator() -> Arc<dyn ShellLocator> {
    Arc::new(|_: &ShellPreference| -> Result<PathBuf, ConnectionError> {
        Err(ConnectionError::ShellNotFound {
            reason: "no shell in test environment".to_string(),
        })
    })
}

/// Defaults with short timings so tests finish quickly.
pub fn fast_defaults() -> ProxyDefaults {
    ProxyDefaults {
        drain_poll_interval: Duration::from_millis(10),
        accept_join_timeout: Duration::from_secs(2),
        kill_wait: Duration::from_secs(2),
        ..ProxyDefaults::default()
    }
}

/// Returns true if a process with `pid` exists (zombies excluded once reaped).
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Find a port that is free right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
