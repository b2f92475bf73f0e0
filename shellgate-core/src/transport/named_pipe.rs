//! Local named-channel transport.
//!
//! On Unix a pipe name maps to a Unix domain socket in the temp directory
//! (or to the given path if the name contains a `/`). On Windows it maps to
//! `\\.\pipe\<name>`. Automatically generated names look like
//! `shellgate-<uuid>`.

use std::io;

use async_trait::async_trait;
use futures_util::FutureExt;

use super::{Accepted, BoundAddress, DuplexChannel, Listener};

/// Generate a pipe name for servers that did not request one.
#[must_use]
pub fn generate_pipe_name() -> String {
    format!("shellgate-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(unix)]
pub use unix_impl::{NamedPipeTransport, socket_path};

#[cfg(windows)]
pub use windows_impl::NamedPipeTransport;

#[cfg(unix)]
mod unix_impl {
    use std::os::unix::fs::FileTypeExt;
    use std::path::{Path, PathBuf};

    use tokio::net::UnixListener;
    use tracing::{debug, warn};

    use super::*;

    /// Filesystem path of the socket backing pipe `name`.
    #[must_use]
    pub fn socket_path(name: &str) -> PathBuf {
        if name.contains('/') {
            PathBuf::from(name)
        } else {
            std::env::temp_dir().join(format!("{name}.sock"))
        }
    }

    /// Unix domain socket listener. The socket file is removed on drop.
    pub struct NamedPipeTransport {
        listener: UnixListener,
        name: String,
        path: PathBuf,
    }

    impl NamedPipeTransport {
        pub fn bind(name: Option<String>) -> io::Result<Self> {
            let name = name.unwrap_or_else(generate_pipe_name);
            let path = socket_path(&name);
            remove_stale_socket(&path)?;
            let listener = UnixListener::bind(&path)?;
            debug!(pipe = %name, path = %path.display(), "bound named pipe");
            Ok(Self {
                listener,
                name,
                path,
            })
        }
    }

    fn is_socket(path: &Path) -> io::Result<bool> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => Ok(meta.file_type().is_socket()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove a socket file left behind by a process that no longer listens.
    /// A live listener is left alone so the bind reports the conflict, and
    /// anything that is not a socket is never touched.
    fn remove_stale_socket(path: &Path) -> io::Result<()> {
        if !is_socket(path)? {
            if std::fs::symlink_metadata(path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
            return Ok(());
        }
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is in use", path.display()),
            )),
            Err(_) => {
                warn!(path = %path.display(), "removing stale pipe socket");
                std::fs::remove_file(path)
            }
        }
    }

    #[async_trait]
    impl Listener for NamedPipeTransport {
        fn local_address(&self) -> BoundAddress {
            BoundAddress::Pipe(self.name.clone())
        }

        async fn accept(&mut self) -> io::Result<Accepted> {
            let (stream, _) = self.listener.accept().await?;
            let peer = match stream.peer_cred() {
                Ok(cred) => match cred.pid() {
                    Some(pid) => format!("{} (uid {}, pid {pid})", self.name, cred.uid()),
                    None => format!("{} (uid {})", self.name, cred.uid()),
                },
                Err(_) => self.name.clone(),
            };
            let channel: DuplexChannel = Box::new(stream);
            Ok(Accepted {
                peer,
                channel: futures_util::future::ready(Ok(channel)).boxed(),
            })
        }
    }

    impl Drop for NamedPipeTransport {
        fn drop(&mut self) {
            if !is_socket(&self.path).unwrap_or(false) {
                return;
            }
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "failed to remove pipe socket");
            }
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    use super::*;

    /// Windows named pipe listener.
    ///
    /// One server instance is always kept waiting; after a client connects a
    /// fresh instance replaces it before the connected one is handed out.
    pub struct NamedPipeTransport {
        name: String,
        full_name: String,
        next: NamedPipeServer,
    }

    impl NamedPipeTransport {
        pub fn bind(name: Option<String>) -> io::Result<Self> {
            let name = name.unwrap_or_else(generate_pipe_name);
            let full_name = format!(r"\\.\pipe\{name}");
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&full_name)?;
            Ok(Self {
                name,
                full_name,
                next,
            })
        }
    }

    #[async_trait]
    impl Listener for NamedPipeTransport {
        fn local_address(&self) -> BoundAddress {
            BoundAddress::Pipe(self.name.clone())
        }

        async fn accept(&mut self) -> io::Result<Accepted> {
            self.next.connect().await?;
            let fresh = ServerOptions::new().create(&self.full_name)?;
            let connected = std::mem::replace(&mut self.next, fresh);
            let channel: DuplexChannel = Box::new(connected);
            Ok(Accepted {
                peer: self.name.clone(),
                channel: futures_util::future::ready(Ok(channel)).boxed(),
            })
        }
    }
}
