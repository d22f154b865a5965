// src/interception/tunnel.rs
//! Passthrough tunnel
//!
//! Copies bytes between the client and its original destination without
//! looking at them. Client to origin runs in a spawned task, origin to
//! client on the caller's task:
//!
//! ```text
//! client ──read──► [spawned] ──write──► origin     client EOF: half-close origin
//! client ◄─write── [caller]  ◄──read─── origin     origin EOF: tunnel ends
//! ```
//!
//! An error in either direction cancels the other one.

use crate::observability;
use crate::runtime::connection::ConnectionContext;
use crate::utils::errors::{ProxyError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Connect to `addr`, giving up after `timeout`
pub async fn dial_origin(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(ProxyError::Dial(format!("{}: {}", addr, e))),
        Err(_) => Err(ProxyError::Dial(format!(
            "{}: timed out after {:?}",
            addr, timeout
        ))),
    }
}

/// Relays opaque bytes to the original destination
#[derive(Debug, Clone)]
pub struct PassthroughTunnel {
    dial_timeout: Duration,
}

impl PassthroughTunnel {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }

    /// Relay `client` to its original destination until one side is done
    ///
    /// Returns the client transport for the caller to close, or `None` if
    /// the spawned direction was lost.
    pub async fn relay<S>(&self, ctx: &ConnectionContext, client: S) -> Option<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let origin = match dial_origin(ctx.destination.socket_addr(), self.dial_timeout).await {
            Ok(origin) => origin,
            Err(e) => {
                ctx.report(&e);
                return Some(client);
            }
        };
        observability::record_connection("passthrough");
        debug!(connection = ctx.id, destination = %ctx.destination, "Tunnel open");

        let (client_read, mut client_write) = tokio::io::split(client);
        let (mut origin_read, origin_write) = origin.into_split();
        let cancel = CancellationToken::new();

        let upstream = tokio::spawn(client_to_origin(client_read, origin_write, cancel.clone()));

        let downstream = tokio::select! {
            copied = tokio::io::copy(&mut origin_read, &mut client_write) => copied,
            _ = cancel.cancelled() => Ok(0),
        };
        cancel.cancel();

        let (client_read, upstream) = match upstream.await {
            Ok(joined) => joined,
            Err(e) => {
                error!(connection = ctx.id, "Tunnel task failed: {}", e);
                return None;
            }
        };

        match upstream.and_then(|sent| downstream.map(|received| (sent, received))) {
            Ok((sent, received)) => {
                debug!(connection = ctx.id, sent, received, "Tunnel closed");
            }
            Err(e) => ctx.report(&ProxyError::Io(e)),
        }

        Some(client_read.unsplit(client_write))
    }
}

async fn client_to_origin<R, W>(
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> (R, std::io::Result<u64>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        copied = tokio::io::copy(&mut reader, &mut writer) => Some(copied),
        _ = cancel.cancelled() => None,
    };

    let result = match copied {
        // Client finished sending; let the origin finish its reply
        Some(Ok(n)) => writer.shutdown().await.map(|()| n),
        Some(Err(e)) => Err(e),
        None => Ok(0),
    };

    if result.is_err() {
        cancel.cancel();
    }

    (reader, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::destination::OriginalDestination;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn context(port: u16) -> ConnectionContext {
        ConnectionContext::new(
            1,
            "127.0.0.1:40000".parse().unwrap(),
            OriginalDestination::new(Ipv4Addr::LOCALHOST, port),
        )
    }

    /// Origin that reads until EOF and answers with the bytes reversed
    async fn reversing_origin() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received.reverse();
            socket.write_all(&received).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_round_trip_with_half_close() {
        let port = reversing_origin().await;
        let (mut client, proxied) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move {
            PassthroughTunnel::new(Duration::from_secs(5))
                .relay(&context(port), proxied)
                .await
        });

        client.write_all(b"hello tunnel").await.unwrap();
        client.shutdown().await.unwrap();

        let returned = relay.await.unwrap();
        assert!(returned.is_some());
        drop(returned);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"lennut olleh");
    }

    #[tokio::test]
    async fn test_origin_close_ends_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"SSH-2.0-banner\r\n").await.unwrap();
        });

        // The client never closes its side
        let (mut client, proxied) = tokio::io::duplex(1024);
        let returned = PassthroughTunnel::new(Duration::from_secs(5))
            .relay(&context(port), proxied)
            .await;
        assert!(returned.is_some());
        drop(returned);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"SSH-2.0-banner\r\n");
    }

    #[tokio::test]
    async fn test_dial_failure_returns_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial_origin(
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::Dial(_)));

        let (_client, proxied) = tokio::io::duplex(64);
        let returned = PassthroughTunnel::new(Duration::from_secs(1))
            .relay(&context(port), proxied)
            .await;
        assert!(returned.is_some());
    }
}
