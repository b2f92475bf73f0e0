//! WebSocket transport.
//!
//! Connections are accepted on a TCP socket, optionally wrapped in TLS, and
//! upgraded on a single request path. The resulting message stream is
//! exposed as a plain byte stream through [`WsByteStream`]: binary and text
//! payloads are read in order and every write goes out as one binary frame.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use futures_util::{FutureExt, Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::tcp::{accept_stream, bind_socket};
use super::{Accepted, BoundAddress, DuplexChannel, Listener, SocketEndpoint};

/// Listener performing the WebSocket upgrade per connection.
pub struct WebSocketTransport {
    listener: TcpListener,
    local: SocketAddr,
    path: String,
    tls: Option<TlsAcceptor>,
}

impl WebSocketTransport {
    pub fn bind(endpoint: &SocketEndpoint, path: String, tls: Option<TlsAcceptor>) -> io::Result<Self> {
        let listener = bind_socket(endpoint)?;
        let local = listener.local_addr()?;
        Ok(Self {
            listener,
            local,
            path,
            tls,
        })
    }
}

#[async_trait]
impl Listener for WebSocketTransport {
    fn local_address(&self) -> BoundAddress {
        BoundAddress::Socket(self.local)
    }

    async fn accept(&mut self) -> io::Result<Accepted> {
        let (stream, peer) = accept_stream(&self.listener).await?;
        let path = self.path.clone();
        let tls = self.tls.clone();

        let channel = async move {
            match tls {
                Some(acceptor) => {
                    let stream = acceptor.accept(stream).await?;
                    upgrade(stream, path).await
                }
                None => upgrade(stream, path).await,
            }
        }
        .boxed();

        Ok(Accepted {
            peer: peer.to_string(),
            channel,
        })
    }
}

/// Run the server side of the WebSocket handshake, refusing other paths.
async fn upgrade<S>(stream: S, expected_path: String) -> io::Result<DuplexChannel>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == expected_path {
            Ok(response)
        } else {
            let mut refusal = ErrorResponse::new(Some(format!(
                "no shell endpoint at {}",
                request.uri().path()
            )));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .map_err(into_io)?;
    Ok(Box::new(WsByteStream::new(ws)))
}

fn into_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, err)
        }
        other => io::Error::other(other),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Byte stream adapter
// ─────────────────────────────────────────────────────────────────────────────

/// Byte-stream view over a WebSocket connection.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Vec<u8>,
    offset: usize,
    eof: bool,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            offset: 0,
            eof: false,
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.pending.len() {
                let available = &this.pending[this.offset..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    this.pending = data;
                    this.offset = 0;
                }
                Some(Ok(Message::Text(text))) => {
                    this.pending = text.into_bytes();
                    this.offset = 0;
                }
                Some(Ok(Message::Close(_))) | None => this.eof = true,
                // Control frames are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(into_io(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(into_io)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(into_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(into_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(into_io)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn bound(path: &str) -> (WebSocketTransport, SocketAddr) {
        let transport = WebSocketTransport::bind(
            &SocketEndpoint {
                interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                backlog: 8,
            },
            path.to_string(),
            None,
        )
        .unwrap();
        let addr = transport.local;
        (transport, addr)
    }

    #[tokio::test]
    async fn test_frames_become_byte_stream() {
        let (mut transport, addr) = bound("/shell").await;

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/shell"))
                .await
                .unwrap();
            ws.send(Message::Binary(b"abc".to_vec())).await.unwrap();
            ws.send(Message::Text("def".to_string())).await.unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.close(None).await.ok();
            reply
        });

        let accepted = transport.accept().await.unwrap();
        let mut channel = accepted.channel.await.unwrap();
        let mut buf = [0u8; 6];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdef");

        channel.write_all(b"out").await.unwrap();
        channel.flush().await.unwrap();

        assert_eq!(client.await.unwrap(), Message::Binary(b"out".to_vec()));

        let mut rest = Vec::new();
        channel.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_path_is_refused() {
        let (mut transport, addr) = bound("/shell").await;

        let client = tokio::spawn(async move {
            tokio_tungstenite::connect_async(format!("ws://{addr}/other")).await
        });

        let accepted = transport.accept().await.unwrap();
        assert!(accepted.channel.await.is_err());
        assert!(client.await.unwrap().is_err());
    }
}
