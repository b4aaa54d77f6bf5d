use crate::cache::CacheConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// SSL/TLS protocol generations, ordered oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "SSLv2")]
    Ssl2,
    #[serde(rename = "SSLv3")]
    Ssl3,
    #[serde(rename = "TLSv1")]
    Tls1_0,
    #[serde(rename = "TLSv1.1")]
    Tls1_1,
    #[serde(rename = "TLSv1.2")]
    Tls1_2,
    #[serde(rename = "TLSv1.3")]
    Tls1_3,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 6] = [
        ProtocolVersion::Ssl2,
        ProtocolVersion::Ssl3,
        ProtocolVersion::Tls1_0,
        ProtocolVersion::Tls1_1,
        ProtocolVersion::Tls1_2,
        ProtocolVersion::Tls1_3,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProtocolVersion::Ssl2 => "SSLv2",
            ProtocolVersion::Ssl3 => "SSLv3",
            ProtocolVersion::Tls1_0 => "TLSv1",
            ProtocolVersion::Tls1_1 => "TLSv1.1",
            ProtocolVersion::Tls1_2 => "TLSv1.2",
            ProtocolVersion::Tls1_3 => "TLSv1.3",
        }
    }

    /// Scan order used by the full scan: hosts that disabled legacy protocols
    /// fail fast on the old versions once the modern ones are known.
    pub fn newest_first() -> impl Iterator<Item = ProtocolVersion> {
        Self::ALL.into_iter().rev()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where a single handshake attempt is aimed: the resolved socket address
/// plus the name sent as SNI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub addr: SocketAddr,
    pub server_name: String,
}

/// Leaf certificate as presented by the scanned host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub sha256_fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

/// What one successful handshake learned about the peer's certificate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerCheck {
    pub certificate: Option<Certificate>,
    pub host_name_matches_certificate: bool,
    pub chain_trusted_by_platform: bool,
}

/// Result of probing one host for one protocol version.
///
/// `error_message` is set exactly when the handshake did not complete.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionScanOutcome {
    version: ProtocolVersion,
    ip: Option<IpAddr>,
    server_name: String,
    connect_ok: bool,
    handshake_ok: bool,
    selected_cipher: Option<String>,
    error_message: Option<String>,
    scan_duration: Duration,
    peer: PeerCheck,
}

impl VersionScanOutcome {
    pub fn succeeded(
        target: &ProbeTarget,
        version: ProtocolVersion,
        selected_cipher: Option<String>,
        peer: PeerCheck,
        scan_duration: Duration,
    ) -> Self {
        Self {
            version,
            ip: Some(target.addr.ip()),
            server_name: target.server_name.clone(),
            connect_ok: true,
            handshake_ok: true,
            selected_cipher,
            error_message: None,
            scan_duration,
            peer,
        }
    }

    pub fn failed(
        target: &ProbeTarget,
        version: ProtocolVersion,
        connect_ok: bool,
        error: impl Into<String>,
        scan_duration: Duration,
    ) -> Self {
        Self {
            version,
            ip: Some(target.addr.ip()),
            server_name: target.server_name.clone(),
            connect_ok,
            handshake_ok: false,
            selected_cipher: None,
            error_message: Some(error.into()),
            scan_duration,
            peer: PeerCheck::default(),
        }
    }

    /// Outcome for a host name that never resolved to an address.
    pub fn unresolved(server_name: &str, version: ProtocolVersion, error: impl Into<String>) -> Self {
        Self {
            version,
            ip: None,
            server_name: server_name.to_string(),
            connect_ok: false,
            handshake_ok: false,
            selected_cipher: None,
            error_message: Some(error.into()),
            scan_duration: Duration::ZERO,
            peer: PeerCheck::default(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn connect_ok(&self) -> bool {
        self.connect_ok
    }

    pub fn handshake_ok(&self) -> bool {
        self.handshake_ok
    }

    pub fn selected_cipher(&self) -> Option<&str> {
        self.selected_cipher.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn scan_duration(&self) -> Duration {
        self.scan_duration
    }

    pub fn peer(&self) -> &PeerCheck {
        &self.peer
    }
}

/// All six per-version outcomes for one host at one point in time, plus
/// what was derived from them. Built by [`crate::scan::FullScanner`].
#[derive(Debug, Clone, PartialEq)]
pub struct FullScan {
    pub(crate) server_name: String,
    pub(crate) ip: Option<IpAddr>,
    pub(crate) outcomes: BTreeMap<ProtocolVersion, VersionScanOutcome>,
    pub(crate) lowest_version_supported: Option<ProtocolVersion>,
    pub(crate) highest_version_supported: Option<ProtocolVersion>,
    pub(crate) peer: PeerCheck,
    pub(crate) crawl_timestamp: DateTime<Utc>,
}

impl FullScan {
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// Every version has an outcome, so this never misses.
    pub fn get(&self, version: ProtocolVersion) -> Option<&VersionScanOutcome> {
        self.outcomes.get(&version)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &VersionScanOutcome> {
        self.outcomes.values()
    }

    pub fn lowest_version_supported(&self) -> Option<ProtocolVersion> {
        self.lowest_version_supported
    }

    pub fn highest_version_supported(&self) -> Option<ProtocolVersion> {
        self.highest_version_supported
    }

    pub fn host_name_matches_certificate(&self) -> bool {
        self.peer.host_name_matches_certificate
    }

    pub fn chain_trusted_by_platform(&self) -> bool {
        self.peer.chain_trusted_by_platform
    }

    pub fn peer_certificate(&self) -> Option<&Certificate> {
        self.peer.certificate.as_ref()
    }

    pub fn crawl_timestamp(&self) -> DateTime<Utc> {
        self.crawl_timestamp
    }
}

/// Flat, serialisable per-version detail of a [`FullScan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullScanRecord {
    pub ip: Option<IpAddr>,
    pub server_name: String,
    pub connect_ok: bool,
    pub lowest_version_supported: Option<ProtocolVersion>,
    pub highest_version_supported: Option<ProtocolVersion>,
    pub versions: BTreeMap<ProtocolVersion, VersionRecord>,
    pub full_scan_crawl_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub supported: bool,
    pub selected_cipher: Option<String>,
    pub error: Option<String>,
    pub millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRequest {
    pub visit_id: String,
    pub domain_name: String,
}

/// Certificate verdict. "Nothing observed" is its own state and must not be
/// read as "certificate present and valid".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CertificateStatus {
    NotObserved,
    Observed {
        sha256_fingerprint: String,
        expired: bool,
        too_soon: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Scan,
    Cache,
}

/// Externally visible verdict for one visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsCrawlResult {
    pub visit: VisitRequest,
    pub host_name: String,
    pub source: ResultSource,
    pub host_name_matches_certificate: bool,
    pub chain_trusted_by_platform: bool,
    pub certificate: CertificateStatus,
    pub full_scan: Option<FullScanRecord>,
    pub crawl_timestamp: DateTime<Utc>,
}

impl TlsCrawlResult {
    pub fn certificate_expired(&self) -> bool {
        matches!(self.certificate, CertificateStatus::Observed { expired: true, .. })
    }

    pub fn certificate_too_soon(&self) -> bool {
        matches!(self.certificate, CertificateStatus::Observed { too_soon: true, .. })
    }

    pub fn leaf_certificate(&self) -> Option<&str> {
        match &self.certificate {
            CertificateStatus::Observed {
                sha256_fingerprint, ..
            } => Some(sha256_fingerprint),
            CertificateStatus::NotObserved => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub target: Option<VisitRequest>,
    pub input: Option<String>,
    pub port: u16,
    pub concurrency: usize,
    pub rate: u32,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub overall_timeout: Duration,
    pub cache: CacheConfig,
    pub cache_retention: Duration,
    pub cache_evict_interval: Duration,
    pub verify_on_cache_hit: bool,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum OutputFormat {
    Jsonl,
    Pretty,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Jsonl => write!(f, "jsonl"),
            OutputFormat::Pretty => write!(f, "pretty"),
        }
    }
}
