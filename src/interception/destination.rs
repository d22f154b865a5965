// src/interception/destination.rs
//! Original destination recovery
//!
//! A connection redirected to the proxy keeps the address the client meant
//! to reach in a kernel record, queried with `getsockopt(SO_ORIGINAL_DST)`.
//! The record has the layout of a `sockaddr_in`:
//!
//! ```text
//! 0      2      4              8                16
//! ┌──────┬──────┬──────────────┬────────────────┐
//! │family│ port │  IPv4 addr   │    padding     │
//! │ (ne) │ (be) │  (4 bytes)   │                │
//! └──────┴──────┴──────────────┴────────────────┘
//! ```
//!
//! [`OriginalDestination::decode`] is the only place that knows this layout.

use crate::utils::errors::{ProxyError, Result};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::TcpStream;

/// `SO_ORIGINAL_DST` option number (`SOL_IP` level)
pub const SO_ORIGINAL_DST: i32 = 80;

/// Size of the kernel record (`sizeof(struct sockaddr_in)`)
pub const ORIGINAL_DST_LEN: usize = 16;

/// Destination the client intended to reach before redirection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginalDestination {
    /// Address family as reported by the kernel
    pub family: u16,

    pub ip: Ipv4Addr,

    pub port: u16,
}

impl OriginalDestination {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            family: AF_INET,
            ip,
            port,
        }
    }

    /// Decode the fixed-layout kernel record
    pub fn decode(raw: &[u8; ORIGINAL_DST_LEN]) -> Self {
        Self {
            family: u16::from_ne_bytes([raw[0], raw[1]]),
            port: (u16::from(raw[2]) << 8) | u16::from(raw[3]),
            ip: Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for OriginalDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[cfg(target_os = "linux")]
const AF_INET: u16 = libc::AF_INET as u16;

#[cfg(not(target_os = "linux"))]
const AF_INET: u16 = 2;

/// Recovers the original destination of an accepted connection
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, stream: &TcpStream) -> Result<OriginalDestination>;
}

/// Queries the kernel with `getsockopt(SO_ORIGINAL_DST)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SockOptResolver;

impl SockOptResolver {
    pub fn new() -> Self {
        Self
    }
}

impl DestinationResolver for SockOptResolver {
    #[cfg(target_os = "linux")]
    fn resolve(&self, stream: &TcpStream) -> Result<OriginalDestination> {
        use std::os::unix::io::AsRawFd;

        let raw = query_original_dst(stream.as_raw_fd())?;
        let destination = OriginalDestination::decode(&raw);

        if destination.family != AF_INET {
            return Err(ProxyError::DestinationResolution(format!(
                "unexpected address family {}",
                destination.family
            )));
        }

        Ok(destination)
    }

    #[cfg(not(target_os = "linux"))]
    fn resolve(&self, _stream: &TcpStream) -> Result<OriginalDestination> {
        Err(ProxyError::DestinationResolution(
            "SO_ORIGINAL_DST is only available on Linux".to_string(),
        ))
    }
}

#[cfg(target_os = "linux")]
fn query_original_dst(fd: std::os::unix::io::RawFd) -> Result<[u8; ORIGINAL_DST_LEN]> {
    let mut raw = [0u8; ORIGINAL_DST_LEN];
    let mut len = ORIGINAL_DST_LEN as libc::socklen_t;

    // SAFETY: `raw` is a writable buffer of `len` bytes that outlives the call
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            raw.as_mut_ptr().cast::<libc::c_void>(),
            &mut len,
        )
    };

    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(ProxyError::DestinationResolution(format!(
            "getsockopt SO_ORIGINAL_DST failed: {}",
            err
        )));
    }

    if (len as usize) < 8 {
        return Err(ProxyError::DestinationResolution(format!(
            "short SO_ORIGINAL_DST record ({} bytes)",
            len
        )));
    }

    Ok(raw)
}

/// Resolves every connection to one fixed address
///
/// For embedders that send every connection to a single known origin and
/// for the loopback tests. The binary always uses [`SockOptResolver`].
#[derive(Debug, Clone, Copy)]
pub struct StaticResolver {
    destination: OriginalDestination,
}

impl StaticResolver {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            destination: OriginalDestination::new(*addr.ip(), addr.port()),
        }
    }
}

impl DestinationResolver for StaticResolver {
    fn resolve(&self, _stream: &TcpStream) -> Result<OriginalDestination> {
        Ok(self.destination)
    }
}
