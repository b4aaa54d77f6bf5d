use crate::model::{Certificate, FullScan, FullScanRecord, ProtocolVersion};
use std::fmt::Write as _;
use std::net::IpAddr;

/// Normalised TLS posture of one IP, the unit the consensus cache counts.
///
/// Two results compare equal for caching purposes when their `summary()`
/// strings are equal. Timings, error wording and timestamps never enter the
/// summary.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    ip: IpAddr,
    record: FullScanRecord,
    host_name_matches_certificate: bool,
    chain_trusted_by_platform: bool,
    peer_certificate: Option<Certificate>,
    summary: String,
}

impl ScanResult {
    /// `None` when the scan never reached an address.
    pub fn from_full_scan(scan: &FullScan) -> Option<ScanResult> {
        let ip = scan.ip()?;
        Some(Self::new(
            ip,
            FullScanRecord::from_full_scan(scan),
            scan.host_name_matches_certificate(),
            scan.chain_trusted_by_platform(),
            scan.peer_certificate().cloned(),
        ))
    }

    pub fn new(
        ip: IpAddr,
        record: FullScanRecord,
        host_name_matches_certificate: bool,
        chain_trusted_by_platform: bool,
        peer_certificate: Option<Certificate>,
    ) -> ScanResult {
        let summary = summarize(
            &record,
            host_name_matches_certificate,
            chain_trusted_by_platform,
        );
        ScanResult {
            ip,
            record,
            host_name_matches_certificate,
            chain_trusted_by_platform,
            peer_certificate,
            summary,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn record(&self) -> &FullScanRecord {
        &self.record
    }

    pub fn highest_version_supported(&self) -> Option<ProtocolVersion> {
        self.record.highest_version_supported
    }

    pub fn host_name_matches_certificate(&self) -> bool {
        self.host_name_matches_certificate
    }

    pub fn chain_trusted_by_platform(&self) -> bool {
        self.chain_trusted_by_platform
    }

    pub fn peer_certificate(&self) -> Option<&Certificate> {
        self.peer_certificate.as_ref()
    }
}

fn summarize(record: &FullScanRecord, host_match: bool, trusted: bool) -> String {
    let mut out = String::new();
    for version in ProtocolVersion::ALL {
        let (supported, cipher) = record
            .versions
            .get(&version)
            .map(|v| (v.supported, v.selected_cipher.as_deref()))
            .unwrap_or((false, None));
        let _ = write!(
            out,
            "{}={}/{};",
            version.name(),
            if supported { "yes" } else { "no" },
            cipher.unwrap_or("-")
        );
    }
    let _ = write!(
        out,
        "lowest={};highest={};trusted={};host_match={}",
        record.lowest_version_supported.map(|v| v.name()).unwrap_or("-"),
        record.highest_version_supported.map(|v| v.name()).unwrap_or("-"),
        trusted,
        host_match
    );
    out
}
