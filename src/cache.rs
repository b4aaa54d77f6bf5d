//! Per-IP consensus cache of scan results.
//!
//! Many host names share one IP, so a full six-version scan of every name is
//! mostly repeated work. The cache folds every observed [`ScanResult`] into a
//! per-IP entry that tracks the majority summary, and only answers lookups
//! once enough consistent observations have been seen.
//!
//! One reader/writer lock guards the whole map: `add` and eviction take the
//! write lock, `find` and `size` the read lock. Network work never happens
//! while the lock is held.

use crate::scan_result::ScanResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_MINIMUM_ENTRIES_PER_IP: u64 = 10;
pub const DEFAULT_REQUIRED_RATIO: f64 = 0.9;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("minimum entries per IP must be at least 1")]
    MinimumEntries,
    #[error("required ratio must be in (0, 1], got {0}")]
    RequiredRatio(f64),
    #[error("retention of {0:?} is too large")]
    Retention(Duration),
}

/// Confidence thresholds a cached majority must meet before it is served.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    minimum_entries_per_ip: u64,
    required_ratio: f64,
}

impl CacheConfig {
    pub fn new(minimum_entries_per_ip: u64, required_ratio: f64) -> Result<Self, ConfigError> {
        if minimum_entries_per_ip == 0 {
            return Err(ConfigError::MinimumEntries);
        }
        if !(required_ratio > 0.0 && required_ratio <= 1.0) {
            return Err(ConfigError::RequiredRatio(required_ratio));
        }
        Ok(Self {
            minimum_entries_per_ip,
            required_ratio,
        })
    }

    pub fn minimum_entries_per_ip(&self) -> u64 {
        self.minimum_entries_per_ip
    }

    pub fn required_ratio(&self) -> f64 {
        self.required_ratio
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            minimum_entries_per_ip: DEFAULT_MINIMUM_ENTRIES_PER_IP,
            required_ratio: DEFAULT_REQUIRED_RATIO,
        }
    }
}

/// Read-only view of the counters of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    pub ip: IpAddr,
    pub majority_summary: String,
    pub total_scan_results: u64,
    pub results_in_majority: u64,
    pub deviant_summaries: Vec<String>,
    pub added: DateTime<Utc>,
}

#[derive(Debug)]
struct CacheEntry {
    majority: Arc<ScanResult>,
    deviant_scan_results: Vec<Arc<ScanResult>>,
    total_scan_results: u64,
    results_in_majority: u64,
    ip: IpAddr,
    added: DateTime<Utc>,
}

impl CacheEntry {
    fn first(added: DateTime<Utc>, scan_result: Arc<ScanResult>) -> Self {
        Self {
            ip: scan_result.ip(),
            majority: scan_result,
            deviant_scan_results: Vec::new(),
            total_scan_results: 1,
            results_in_majority: 1,
            added,
        }
    }

    /// The majority is dominant when it still holds more than half plus one
    /// of all observations, counting the one being folded in. The `+ 1`
    /// makes flips near a 50/50 split slightly harder.
    fn is_dominant_with_one_more(&self) -> bool {
        self.results_in_majority > (self.total_scan_results + 1) / 2 + 1
    }

    fn matching_deviants(&self, summary: &str) -> u64 {
        self.deviant_scan_results
            .iter()
            .filter(|result| result.summary() == summary)
            .count() as u64
    }

    /// Builds the replacement entry once `scan_result` outnumbers the
    /// current majority.
    fn with_new_majority(
        &self,
        added: DateTime<Utc>,
        scan_result: Arc<ScanResult>,
        matching_entries: u64,
    ) -> Self {
        let summary = scan_result.summary().to_string();
        let mut deviant_scan_results: Vec<Arc<ScanResult>> = self
            .deviant_scan_results
            .iter()
            .filter(|result| result.summary() != summary)
            .cloned()
            .collect();
        deviant_scan_results.push(self.majority.clone());

        Self {
            ip: self.ip,
            majority: scan_result,
            deviant_scan_results,
            total_scan_results: self.total_scan_results + 1,
            results_in_majority: matching_entries + 1,
            added,
        }
    }

    fn stats(&self) -> EntryStats {
        EntryStats {
            ip: self.ip,
            majority_summary: self.majority.summary().to_string(),
            total_scan_results: self.total_scan_results,
            results_in_majority: self.results_in_majority,
            deviant_summaries: self
                .deviant_scan_results
                .iter()
                .map(|result| result.summary().to_string())
                .collect(),
            added: self.added,
        }
    }
}

pub struct ScanResultCache {
    config: CacheConfig,
    entries: RwLock<HashMap<IpAddr, CacheEntry>>,
}

impl ScanResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_default_settings() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<IpAddr, CacheEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<IpAddr, CacheEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_now(&self, scan_result: ScanResult) {
        self.add(Utc::now(), scan_result)
    }

    /// Folds one observation into the entry of its IP.
    pub fn add(&self, observed_at: DateTime<Utc>, scan_result: ScanResult) {
        let ip = scan_result.ip();
        let scan_result = Arc::new(scan_result);
        debug!(%ip, summary = scan_result.summary(), "adding scan result to cache");

        let mut entries = self.write();
        let Some(entry) = entries.get_mut(&ip) else {
            debug!(%ip, "first scan result for this IP");
            entries.insert(ip, CacheEntry::first(observed_at, scan_result));
            return;
        };

        let summary = scan_result.summary();
        if summary == entry.majority.summary() {
            entry.results_in_majority += 1;
            entry.total_scan_results += 1;
            debug!(
                %ip,
                total = entry.total_scan_results,
                in_majority = entry.results_in_majority,
                "scan result matches the majority"
            );
            return;
        }

        if entry.is_dominant_with_one_more() {
            entry.total_scan_results += 1;
            debug!(
                %ip,
                total = entry.total_scan_results,
                in_majority = entry.results_in_majority,
                "deviant scan result, majority is dominant"
            );
            return;
        }

        let matching_entries = entry.matching_deviants(summary);
        if matching_entries + 1 > entry.results_in_majority {
            let replacement = entry.with_new_majority(observed_at, scan_result, matching_entries);
            info!(
                %ip,
                total = replacement.total_scan_results,
                in_majority = replacement.results_in_majority,
                summary = replacement.majority.summary(),
                "new majority for IP"
            );
            entries.insert(ip, replacement);
        } else {
            entry.total_scan_results += 1;
            entry.deviant_scan_results.push(scan_result);
            debug!(
                %ip,
                total = entry.total_scan_results,
                in_majority = entry.results_in_majority,
                deviants = entry.deviant_scan_results.len(),
                "deviant scan result, majority unchanged"
            );
        }
    }

    /// Returns the majority for `ip` once it is backed by at least the
    /// configured number of observations and holds the required ratio.
    pub fn find(&self, ip: IpAddr) -> Option<Arc<ScanResult>> {
        let entries = self.read();
        let entry = entries.get(&ip)?;
        if entry.total_scan_results < self.config.minimum_entries_per_ip {
            debug!(
                %ip,
                required = self.config.minimum_entries_per_ip,
                in_cache = entry.total_scan_results,
                "not enough scan results for this IP"
            );
            return None;
        }

        let ratio = entry.results_in_majority as f64 / entry.total_scan_results as f64;
        if ratio < self.config.required_ratio {
            debug!(
                %ip,
                required = self.config.required_ratio,
                actual = ratio,
                "majority not strong enough"
            );
            return None;
        }
        Some(entry.majority.clone())
    }

    /// Drops every entry whose majority was last set before `now - duration`.
    pub fn evict_entries_older_than(&self, duration: Duration) -> Result<usize, ConfigError> {
        let age = chrono::Duration::from_std(duration).map_err(|_| ConfigError::Retention(duration))?;
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .ok_or(ConfigError::Retention(duration))?;
        Ok(self.evict_entries_added_before(cutoff))
    }

    /// Drops entries added strictly before `cutoff`; returns how many went.
    pub fn evict_entries_added_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.added >= cutoff);
        let after = entries.len();
        info!(%cutoff, before, after, "evicted cache entries");
        before - after
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn entry_stats(&self, ip: IpAddr) -> Option<EntryStats> {
        self.read().get(&ip).map(CacheEntry::stats)
    }
}

impl Default for ScanResultCache {
    fn default() -> Self {
        Self::with_default_settings()
    }
}
