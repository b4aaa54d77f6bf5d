use anyhow::Context;
use clap::{ArgAction, Parser};
use std::time::Duration;
use tls_consensus_crawler::cache::CacheConfig;
use tls_consensus_crawler::model::{Config, OutputConfig, OutputFormat, VisitRequest};
use tls_consensus_crawler::util::random_visit_id;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Crawls TLS protocol support and certificate facts per host, sharing verdicts across hosts on the same IP",
    long_about = None
)]
pub struct Cli {
    /// Single host name to crawl
    #[arg(short = 'H', long = "host", value_name = "HOST")]
    pub host: Option<String>,

    /// Visit id reported for --host (random when omitted)
    #[arg(long = "visit-id", value_name = "ID", requires = "host")]
    pub visit_id: Option<String>,

    /// File with one `visit_id,domain` or bare domain per line
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    pub input: Option<String>,

    /// TLS port to probe
    #[arg(short = 'p', long = "port", default_value_t = 443)]
    pub port: u16,

    /// Visits crawled at the same time
    #[arg(long = "concurrency", default_value_t = 64)]
    pub concurrency: usize,

    /// New visits started per second
    #[arg(long = "rate", default_value_t = 64)]
    pub rate: u32,

    /// TCP connect timeout per handshake in milliseconds
    #[arg(long = "connect-timeout", default_value_t = 3000)]
    pub connect_timeout_ms: u64,

    /// TLS handshake timeout in milliseconds
    #[arg(long = "handshake-timeout", default_value_t = 5000)]
    pub handshake_timeout_ms: u64,

    /// Budget for a whole visit in milliseconds
    #[arg(long = "overall-timeout", default_value_t = 60000)]
    pub overall_timeout_ms: u64,

    /// Observations an IP needs before its majority is served from cache
    #[arg(long = "cache-min-entries", default_value_t = 10)]
    pub cache_min_entries: u64,

    /// Share of observations the majority must hold to be served
    #[arg(long = "cache-ratio", default_value_t = 0.9)]
    pub cache_ratio: f64,

    /// Drop cache entries whose majority is older than this, in seconds
    #[arg(long = "cache-retention", default_value_t = 3600)]
    pub cache_retention_secs: u64,

    /// Seconds between two eviction passes
    #[arg(long = "cache-evict-interval", default_value_t = 300)]
    pub cache_evict_interval_secs: u64,

    /// Serve cache hits without a host-specific verification handshake
    #[arg(long = "no-cache-verify", action = ArgAction::SetTrue)]
    pub no_cache_verify: bool,

    /// Output format
    #[arg(long = "output", default_value_t = OutputFormat::Jsonl)]
    pub output: OutputFormat,

    /// Shorthand for --output pretty
    #[arg(long = "pretty", action = ArgAction::SetTrue)]
    pub pretty: bool,
}

impl Cli {
    pub fn into_config(self) -> anyhow::Result<Config> {
        if self.host.is_none() && self.input.is_none() {
            anyhow::bail!("either --host or --input is required");
        }

        if self.host.is_some() && self.input.is_some() {
            anyhow::bail!("--host and --input are mutually exclusive");
        }

        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than zero");
        }

        if self.rate == 0 {
            anyhow::bail!("rate must be greater than zero");
        }

        if self.connect_timeout_ms == 0
            || self.handshake_timeout_ms == 0
            || self.overall_timeout_ms == 0
        {
            anyhow::bail!("timeouts must be greater than zero");
        }

        if self.cache_evict_interval_secs == 0 {
            anyhow::bail!("cache eviction interval must be greater than zero");
        }

        let cache = CacheConfig::new(self.cache_min_entries, self.cache_ratio)
            .context("invalid cache settings")?;

        let target = self.host.map(|host| VisitRequest {
            visit_id: self.visit_id.unwrap_or_else(random_visit_id),
            domain_name: host.trim_end_matches('.').to_ascii_lowercase(),
        });

        Ok(Config {
            target,
            input: self.input,
            port: self.port,
            concurrency: self.concurrency,
            rate: self.rate,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            overall_timeout: Duration::from_millis(self.overall_timeout_ms),
            cache,
            cache_retention: Duration::from_secs(self.cache_retention_secs),
            cache_evict_interval: Duration::from_secs(self.cache_evict_interval_secs),
            verify_on_cache_hit: !self.no_cache_verify,
            output: OutputConfig {
                format: if self.pretty {
                    OutputFormat::Pretty
                } else {
                    self.output
                },
            },
        })
    }
}
