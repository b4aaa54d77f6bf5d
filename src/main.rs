mod cli;

use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use tls_consensus_crawler::cache::ScanResultCache;
use tls_consensus_crawler::crawler::{CrawlerOptions, TlsCrawler};
use tls_consensus_crawler::engine::Engine;
use tls_consensus_crawler::output::OutputChannel;
use tls_consensus_crawler::probe::{PlatformProber, ProbeSettings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = cli.into_config()?;

    let prober = PlatformProber::with_platform_trust(ProbeSettings {
        connect_timeout: cfg.connect_timeout,
        handshake_timeout: cfg.handshake_timeout,
    })?;
    let cache = Arc::new(ScanResultCache::new(cfg.cache));
    let crawler = TlsCrawler::new(
        Arc::new(prober),
        cache,
        CrawlerOptions {
            port: cfg.port,
            verify_on_cache_hit: cfg.verify_on_cache_hit,
        },
    );

    let sink = OutputChannel::new(cfg.output.clone())?;
    let mut engine = Engine::new(cfg, sink.clone(), crawler)?;
    engine.run().await?;
    sink.shutdown().await?;

    Ok(())
}
