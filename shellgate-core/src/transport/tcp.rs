//! Plain stream-socket transport.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use super::{Accepted, BoundAddress, DuplexChannel, Listener, SocketEndpoint};

/// Bind a TCP listener with an explicit accept backlog.
///
/// Clients beyond the admission cap queue in this backlog until a slot frees.
pub(crate) fn bind_socket(endpoint: &SocketEndpoint) -> io::Result<TcpListener> {
    let addr = endpoint.socket_addr();
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(endpoint.backlog)
}

/// Accept one stream and tune it for interactive traffic.
pub(crate) async fn accept_stream(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    let (stream, peer) = listener.accept().await?;
    // Shell protocol frames are small and latency-sensitive.
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }
    Ok((stream, peer))
}

/// Listener handing out raw TCP streams.
pub struct TcpTransport {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpTransport {
    pub fn bind(endpoint: &SocketEndpoint) -> io::Result<Self> {
        let listener = bind_socket(endpoint)?;
        let local = listener.local_addr()?;
        Ok(Self { listener, local })
    }
}

#[async_trait]
impl Listener for TcpTransport {
    fn local_address(&self) -> BoundAddress {
        BoundAddress::Socket(self.local)
    }

    async fn accept(&mut self) -> io::Result<Accepted> {
        let (stream, peer) = accept_stream(&self.listener).await?;
        let channel: DuplexChannel = Box::new(stream);
        Ok(Accepted {
            peer: peer.to_string(),
            channel: futures_util::future::ready(Ok(channel)).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn endpoint(port: u16) -> SocketEndpoint {
        SocketEndpoint {
            interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            backlog: 8,
        }
    }

    #[tokio::test]
    async fn test_bind_port_zero_resolves() {
        let transport = TcpTransport::bind(&endpoint(0)).unwrap();
        let port = transport.local_address().port().unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let first = TcpTransport::bind(&endpoint(0)).unwrap();
        let port = first.local_address().port().unwrap();
        // SO_REUSEADDR does not allow two listeners on one port.
        assert!(TcpTransport::bind(&endpoint(port)).is_err());
    }

    #[tokio::test]
    async fn test_accepted_channel_is_duplex() {
        let mut transport = TcpTransport::bind(&endpoint(0)).unwrap();
        let addr = match transport.local_address() {
            BoundAddress::Socket(addr) => addr,
            BoundAddress::Pipe(_) => unreachable!(),
        };

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let accepted = transport.accept().await.unwrap();
        assert!(accepted.peer.starts_with("127.0.0.1:"));
        let mut channel = accepted.channel.await.unwrap();
        let mut buf = [0u8; 5];
        channel.read_exact(&mut buf).await.unwrap();
        channel.write_all(&buf).await.unwrap();

        assert_eq!(&client.await.unwrap(), b"hello");
    }
}
