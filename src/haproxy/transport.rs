//! Control socket transport.
//!
//! The runtime API is line oriented: the client writes one command
//! (optionally followed by a `<<` payload terminated by an empty line)
//! and HAProxy answers, then closes the connection. [`SocketTransport`]
//! opens a fresh unix or TCP connection for every exchange so no state
//! survives a failed attempt.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// async_trait is required here because Transport is used as Arc<dyn Transport>.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `command` and return the raw response text.
    async fn round_trip(&self, command: &str) -> std::io::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for SocketAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("control socket address cannot be empty".into());
        }
        if let Some(path) = s.strip_prefix("unix://") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return Ok(Self::Tcp(addr.to_string()));
        }
        if s.contains('/') || !s.contains(':') {
            Ok(Self::Unix(PathBuf::from(s)))
        } else {
            Ok(Self::Tcp(s.to_string()))
        }
    }
}

impl std::fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocketTransport {
    address: SocketAddress,
    timeout: Duration,
}

impl SocketTransport {
    #[must_use]
    pub const fn new(address: SocketAddress, timeout: Duration) -> Self {
        Self { address, timeout }
    }

    #[must_use]
    pub const fn address(&self) -> &SocketAddress {
        &self.address
    }

    async fn exchange<S>(&self, mut stream: S, command: &str) -> std::io::Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut buf = Vec::new();
        tokio::time::timeout(self.timeout, stream.read_to_end(&mut buf))
            .await
            .map_err(|_| timed_out("reading response"))??;

        String::from_utf8(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

fn timed_out(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, format!("timed out {what}"))
}

#[async_trait]
impl Transport for SocketTransport {
    async fn round_trip(&self, command: &str) -> std::io::Result<String> {
        match &self.address {
            #[cfg(unix)]
            SocketAddress::Unix(path) => {
                let stream = tokio::time::timeout(self.timeout, tokio::net::UnixStream::connect(path))
                    .await
                    .map_err(|_| timed_out("connecting"))??;
                self.exchange(stream, command).await
            }
            #[cfg(not(unix))]
            SocketAddress::Unix(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
            SocketAddress::Tcp(addr) => {
                let stream = tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(addr))
                    .await
                    .map_err(|_| timed_out("connecting"))??;
                self.exchange(stream, command).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_socket_addresses() {
        assert_eq!(
            "/var/lib/haproxy/run/haproxy.sock".parse::<SocketAddress>().unwrap(),
            SocketAddress::Unix("/var/lib/haproxy/run/haproxy.sock".into())
        );
        assert_eq!(
            "127.0.0.1:9999".parse::<SocketAddress>().unwrap(),
            SocketAddress::Tcp("127.0.0.1:9999".into())
        );
        assert_eq!(
            "unix://haproxy.sock".parse::<SocketAddress>().unwrap(),
            SocketAddress::Unix("haproxy.sock".into())
        );
        assert!("".parse::<SocketAddress>().is_err());
    }

    #[tokio::test]
    async fn tcp_exchange_reads_until_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut line = Vec::new();
            let mut byte = [0u8; 1];
            while socket.read(&mut byte).await.unwrap() == 1 && byte[0] != b'\n' {
                line.push(byte[0]);
            }
            assert_eq!(line, b"show backend");
            socket.write_all(b"# name\nbe_http:a:b\n\n").await.unwrap();
        });

        let transport = SocketTransport::new(
            SocketAddress::Tcp(addr.to_string()),
            Duration::from_secs(2),
        );
        let response = transport.round_trip("show backend").await.unwrap();
        assert_eq!(response, "# name\nbe_http:a:b\n\n");
    }

    #[tokio::test]
    async fn refused_connection_surfaces_io_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = SocketTransport::new(
            SocketAddress::Tcp(addr.to_string()),
            Duration::from_secs(2),
        );
        let err = transport.round_trip("show map").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
    }
}
