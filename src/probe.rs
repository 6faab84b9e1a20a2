use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

use crate::error::ProbeError;
use crate::types::{ProbeOutcome, Target};

/// One bounded connect attempt against one (target, port).
///
/// Implementations must not retry; retry policy belongs to the scheduler.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self, target: &Target, port: u16, timeout: Duration) -> ProbeOutcome;
}

#[async_trait]
impl<P: Probe + ?Sized> Probe for Arc<P> {
    async fn probe(&self, target: &Target, port: u16, timeout: Duration) -> ProbeOutcome {
        (**self).probe(target, port, timeout).await
    }
}

/// Full TCP connect probe: resolve to IPv4, connect with a timeout, close.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    resolve_timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(resolve_timeout: Duration) -> Self {
        Self { resolve_timeout }
    }

    /// Resolve `target` to its first IPv4 address. Literals skip DNS.
    pub async fn resolve(&self, target: &Target, port: u16) -> Result<Ipv4Addr, ProbeError> {
        if let Ok(ip) = target.as_str().parse::<Ipv4Addr>() {
            return Ok(ip);
        }
        let failed = |reason: String| ProbeError::Resolution {
            target: target.to_string(),
            reason,
        };
        let lookup = tokio::net::lookup_host((target.as_str(), port));
        let addrs = time::timeout(self.resolve_timeout, lookup)
            .await
            .map_err(|_| failed("lookup timed out".into()))?
            .map_err(|e| failed(e.to_string()))?;
        addrs
            .filter_map(|a| match a {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| failed("no IPv4 address".into()))
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl Probe for TcpConnectProbe {
    async fn probe(&self, target: &Target, port: u16, timeout: Duration) -> ProbeOutcome {
        let ip = match self.resolve(target, port).await {
            Ok(ip) => ip,
            Err(e) => return ProbeOutcome::Error(e),
        };
        let addr = SocketAddrV4::new(ip, port);
        match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                // Handshake completed; close right away.
                drop(stream);
                ProbeOutcome::Open
            }
            Ok(Err(e)) => {
                trace!(%addr, error = %e, "connect failed");
                classify_connect_error(&e)
            }
            // Dropping the connect future closes the half-open socket.
            Err(_) => ProbeOutcome::Closed,
        }
    }
}

/// Map a failed connect onto an outcome.
///
/// Anything that means "nobody answered" is `Closed`. Local descriptor, buffer or
/// ephemeral port exhaustion is `Error(Resource)`, other local problems `Error(Socket)`.
pub fn classify_connect_error(e: &io::Error) -> ProbeOutcome {
    if is_resource_exhaustion(e) {
        return ProbeOutcome::Error(ProbeError::Resource(e.to_string()));
    }
    match e.kind() {
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::Unsupported => ProbeOutcome::Error(ProbeError::Socket(e.to_string())),
        _ => ProbeOutcome::Closed,
    }
}

#[cfg(target_os = "linux")]
const RESOURCE_ERRNOS: &[i32] = &[12, 23, 24, 99, 105]; // ENOMEM ENFILE EMFILE EADDRNOTAVAIL ENOBUFS
#[cfg(all(unix, not(target_os = "linux")))]
const RESOURCE_ERRNOS: &[i32] = &[12, 23, 24, 49, 55]; // ENOMEM ENFILE EMFILE EADDRNOTAVAIL ENOBUFS (BSD)
#[cfg(windows)]
const RESOURCE_ERRNOS: &[i32] = &[10024, 10055]; // WSAEMFILE WSAENOBUFS
#[cfg(not(any(unix, windows)))]
const RESOURCE_ERRNOS: &[i32] = &[];

fn is_resource_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory
        || e.raw_os_error()
            .is_some_and(|code| RESOURCE_ERRNOS.contains(&code))
}
