use std::io;
use std::net::Shutdown;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_native_tls::{TlsConnector, TlsStream};
use smol::{
    Timer, future,
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection setup failure. Resolution errors are split out so the worker
/// can answer 404 for unknown hosts.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("host resolution failed: {0}")]
    Resolve(#[source] io::Error),
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(#[source] async_native_tls::Error),
}

/// One upstream socket, plain TCP or TLS. Port 443 gets the platform
/// default TLS context with SNI set from the host name.
pub enum Upstream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Upstream {
    pub async fn connect(host: &str, port: u16) -> Result<Self, ConnectError> {
        let addr = smol::net::resolve((host, port))
            .await
            .map_err(ConnectError::Resolve)?
            .into_iter()
            .next()
            .ok_or_else(|| ConnectError::Resolve(io::ErrorKind::NotFound.into()))?;

        let tcp = future::or(async { TcpStream::connect(addr).await }, async {
            Timer::after(CONNECT_TIMEOUT).await;
            Err(io::ErrorKind::TimedOut.into())
        })
        .await
        .map_err(ConnectError::Connect)?;

        if port == 443 {
            let tls = TlsConnector::new()
                .connect(host, tcp)
                .await
                .map_err(ConnectError::Tls)?;
            return Ok(Self::Tls(tls));
        }
        Ok(Self::Plain(tcp))
    }

    /// Best-effort shutdown of both directions; errors are irrelevant since
    /// the socket is being discarded.
    pub fn shutdown(&self) {
        let stream = match self {
            Self::Plain(stream) => stream,
            Self::Tls(stream) => stream.get_ref(),
        };
        let _ = stream.shutdown(Shutdown::Both);
    }
}

impl AsyncRead for Upstream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Upstream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Upstream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Upstream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Upstream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Upstream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Upstream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Upstream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Upstream::Plain(stream) => Pin::new(stream).poll_close(cx),
            Upstream::Tls(stream) => Pin::new(stream).poll_close(cx),
        }
    }
}
