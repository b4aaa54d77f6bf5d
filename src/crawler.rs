use crate::cache::ScanResultCache;
use crate::model::{
    CertificateStatus, FullScan, FullScanRecord, ProbeTarget, ResultSource, TlsCrawlResult,
    VersionScanOutcome, VisitRequest,
};
use crate::probe::HandshakeProber;
use crate::scan::FullScanner;
use crate::scan_result::ScanResult;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::lookup_host;
use tracing::{debug, info, instrument};

impl TlsCrawlResult {
    /// Verdict built from a fresh full scan. Certificate validity is judged
    /// at `now`, not at scan time.
    pub fn from_scan(
        host_name: &str,
        visit: &VisitRequest,
        scan: &FullScan,
        now: DateTime<Utc>,
    ) -> TlsCrawlResult {
        TlsCrawlResult {
            visit: visit.clone(),
            host_name: host_name.to_string(),
            source: ResultSource::Scan,
            host_name_matches_certificate: scan.host_name_matches_certificate(),
            chain_trusted_by_platform: scan.chain_trusted_by_platform(),
            certificate: CertificateStatus::evaluate(scan.peer_certificate(), now),
            full_scan: Some(FullScanRecord::from_full_scan(scan)),
            crawl_timestamp: now,
        }
    }

    /// Verdict built from a cached majority. When a host-specific
    /// verification handshake succeeded, its certificate and flags replace
    /// the ones stored with the cached result.
    pub fn from_cache(
        host_name: &str,
        visit: &VisitRequest,
        cached: &ScanResult,
        verification: Option<&VersionScanOutcome>,
        now: DateTime<Utc>,
    ) -> TlsCrawlResult {
        let (host_name_matches_certificate, chain_trusted_by_platform, certificate) =
            match verification.filter(|outcome| outcome.handshake_ok()) {
                Some(outcome) => (
                    outcome.peer().host_name_matches_certificate,
                    outcome.peer().chain_trusted_by_platform,
                    outcome.peer().certificate.as_ref(),
                ),
                None => (
                    cached.host_name_matches_certificate(),
                    cached.chain_trusted_by_platform(),
                    cached.peer_certificate(),
                ),
            };

        TlsCrawlResult {
            visit: visit.clone(),
            host_name: host_name.to_string(),
            source: ResultSource::Cache,
            host_name_matches_certificate,
            chain_trusted_by_platform,
            certificate: CertificateStatus::evaluate(certificate, now),
            full_scan: Some(cached.record().clone()),
            crawl_timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlerOptions {
    pub port: u16,
    pub verify_on_cache_hit: bool,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            port: 443,
            verify_on_cache_hit: true,
        }
    }
}

/// Entry point: one visit in, one verdict out. Chooses between the cache
/// and a fresh full scan.
#[derive(Clone)]
pub struct TlsCrawler {
    prober: Arc<dyn HandshakeProber>,
    scanner: FullScanner,
    cache: Arc<ScanResultCache>,
    options: CrawlerOptions,
}

impl TlsCrawler {
    pub fn new(
        prober: Arc<dyn HandshakeProber>,
        cache: Arc<ScanResultCache>,
        options: CrawlerOptions,
    ) -> Self {
        Self {
            scanner: FullScanner::new(prober.clone()),
            prober,
            cache,
            options,
        }
    }

    pub fn cache(&self) -> &Arc<ScanResultCache> {
        &self.cache
    }

    #[instrument(skip(self), fields(visit_id = %visit.visit_id, host = %visit.domain_name))]
    pub async fn crawl(&self, visit: &VisitRequest) -> TlsCrawlResult {
        let host = visit.domain_name.as_str();
        match resolve(host, self.options.port).await {
            Ok(addr) => self.crawl_address(visit, addr).await,
            Err(err) => {
                info!(error = %format!("{err:#}"), "host did not resolve");
                let scan = FullScanner::unresolved(host, &format!("{err:#}"));
                TlsCrawlResult::from_scan(host, visit, &scan, Utc::now())
            }
        }
    }

    /// Crawl against an already resolved address.
    pub async fn crawl_address(&self, visit: &VisitRequest, addr: SocketAddr) -> TlsCrawlResult {
        let host = visit.domain_name.as_str();
        let target = ProbeTarget {
            addr,
            server_name: host.to_string(),
        };

        if let Some(cached) = self.cache.find(addr.ip()) {
            debug!(ip = %addr.ip(), "cache hit");
            let verification = match cached.highest_version_supported() {
                Some(version) if self.options.verify_on_cache_hit => {
                    Some(self.prober.probe(&target, version).await)
                }
                _ => None,
            };
            return TlsCrawlResult::from_cache(
                host,
                visit,
                &cached,
                verification.as_ref(),
                Utc::now(),
            );
        }

        let scan = self.scanner.scan(&target).await;
        if let Some(scan_result) = ScanResult::from_full_scan(&scan) {
            self.cache.add(scan.crawl_timestamp(), scan_result);
        }
        TlsCrawlResult::from_scan(host, visit, &scan, Utc::now())
    }
}

async fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let mut addrs = lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}"))?;
    addrs
        .next()
        .ok_or_else(|| anyhow!("no address found for {host}"))
}
