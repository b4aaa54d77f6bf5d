use crate::model::{
    FullScan, FullScanRecord, PeerCheck, ProbeTarget, ProtocolVersion, VersionRecord,
    VersionScanOutcome,
};
use crate::probe::HandshakeProber;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Drives one prober across all six protocol versions of a host.
#[derive(Clone)]
pub struct FullScanner {
    prober: Arc<dyn HandshakeProber>,
}

impl FullScanner {
    pub fn new(prober: Arc<dyn HandshakeProber>) -> Self {
        Self { prober }
    }

    #[instrument(skip(self), fields(addr = %target.addr, server_name = %target.server_name))]
    pub async fn scan(&self, target: &ProbeTarget) -> FullScan {
        let mut outcomes = Vec::with_capacity(ProtocolVersion::ALL.len());
        for version in ProtocolVersion::newest_first() {
            let outcome = self.prober.probe(target, version).await;
            debug!(
                %version,
                handshake_ok = outcome.handshake_ok(),
                ms = outcome.scan_duration().as_millis() as u64,
                "version probed"
            );
            outcomes.push(outcome);
        }
        let scan = FullScan::derive(
            &target.server_name,
            Some(target.addr.ip()),
            outcomes,
            Utc::now(),
        );
        debug!(
            lowest = ?scan.lowest_version_supported(),
            highest = ?scan.highest_version_supported(),
            "full scan done"
        );
        scan
    }

    /// Full scan for a host name that did not resolve: every version failed
    /// before a connection could be attempted.
    pub fn unresolved(server_name: &str, error: &str) -> FullScan {
        let outcomes = ProtocolVersion::ALL
            .into_iter()
            .map(|version| VersionScanOutcome::unresolved(server_name, version, error))
            .collect();
        FullScan::derive(server_name, None, outcomes, Utc::now())
    }
}

impl FullScan {
    /// Assembles a full scan. Versions missing from `outcomes` are recorded
    /// as not scanned; when a version appears twice the last outcome wins.
    pub fn derive(
        server_name: &str,
        ip: Option<IpAddr>,
        outcomes: Vec<VersionScanOutcome>,
        crawl_timestamp: DateTime<Utc>,
    ) -> FullScan {
        let mut by_version: BTreeMap<ProtocolVersion, VersionScanOutcome> = outcomes
            .into_iter()
            .map(|outcome| (outcome.version(), outcome))
            .collect();
        for version in ProtocolVersion::ALL {
            by_version
                .entry(version)
                .or_insert_with(|| VersionScanOutcome::unresolved(server_name, version, "not scanned"));
        }

        let supported = || {
            by_version
                .values()
                .filter(|outcome| outcome.handshake_ok())
                .map(|outcome| outcome.version())
        };
        let lowest_version_supported = supported().min();
        let highest_version_supported = supported().max();

        // Certificate facts come from the newest version that negotiated.
        let peer = highest_version_supported
            .and_then(|version| by_version.get(&version))
            .map(|outcome| outcome.peer().clone())
            .unwrap_or_else(PeerCheck::default);

        FullScan {
            server_name: server_name.to_string(),
            ip,
            outcomes: by_version,
            lowest_version_supported,
            highest_version_supported,
            peer,
            crawl_timestamp,
        }
    }
}

impl FullScanRecord {
    pub fn from_full_scan(scan: &FullScan) -> FullScanRecord {
        let versions = scan
            .outcomes()
            .map(|outcome| {
                (
                    outcome.version(),
                    VersionRecord {
                        supported: outcome.handshake_ok(),
                        selected_cipher: outcome.selected_cipher().map(str::to_string),
                        error: outcome.error_message().map(str::to_string),
                        millis: outcome.scan_duration().as_millis() as u64,
                    },
                )
            })
            .collect();
        let newest = scan.get(ProtocolVersion::Tls1_3);

        FullScanRecord {
            ip: scan.ip(),
            server_name: newest
                .map(|o| o.server_name().to_string())
                .unwrap_or_else(|| scan.server_name().to_string()),
            connect_ok: newest.map(|o| o.connect_ok()).unwrap_or(false),
            lowest_version_supported: scan.lowest_version_supported(),
            highest_version_supported: scan.highest_version_supported(),
            versions,
            full_scan_crawl_timestamp: scan.crawl_timestamp(),
        }
    }
}
