mod registry;
mod ssl2;
mod tls;

pub use tls::OpenSslProber;
pub use registry::PlatformProber;
pub use ssl2::Ssl2Prober;

use crate::model::{ProbeTarget, ProtocolVersion, VersionScanOutcome};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// One handshake attempt against one host, restricted to one protocol
/// version. Implementations never fail: every connect, timeout or protocol
/// problem is reported inside the returned outcome.
#[async_trait]
pub trait HandshakeProber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn probe(&self, target: &ProbeTarget, version: ProtocolVersion) -> VersionScanOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Opens the TCP connection for a probe, or produces the failed outcome that
/// describes why it could not.
pub(crate) async fn connect(
    target: &ProbeTarget,
    version: ProtocolVersion,
    settings: &ProbeSettings,
    started: Instant,
) -> Result<TcpStream, VersionScanOutcome> {
    match timeout(settings.connect_timeout, TcpStream::connect(target.addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(VersionScanOutcome::failed(
            target,
            version,
            false,
            format!("connect failed: {err}"),
            started.elapsed(),
        )),
        Err(_) => Err(VersionScanOutcome::failed(
            target,
            version,
            false,
            "connect timeout",
            started.elapsed(),
        )),
    }
}
