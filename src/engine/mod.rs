pub mod rate;

use crate::crawler::TlsCrawler;
use crate::model::Config;
use crate::output::OutputChannel;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rate::RateLimiter;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Feeds visits into the crawler under a rate limit and a concurrency cap,
/// while a background task keeps the consensus cache trimmed.
pub struct Engine {
    cfg: Config,
    sink: OutputChannel,
    crawler: TlsCrawler,
    limiter: RateLimiter,
    sem: Arc<Semaphore>,
}

impl Engine {
    pub fn new(cfg: Config, sink: OutputChannel, crawler: TlsCrawler) -> anyhow::Result<Self> {
        Ok(Self {
            limiter: RateLimiter::new(cfg.rate),
            sem: Arc::new(Semaphore::new(cfg.concurrency)),
            cfg,
            sink,
            crawler,
        })
    }

    #[instrument(skip(self))]
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let evictor = self.spawn_evictor();
        let mut stream = crate::input::stream_visits(&self.cfg)?;
        let mut tasks = FuturesUnordered::new();

        while let Some(visit) = stream.next().await {
            self.limiter.acquire().await;
            let permit = self.sem.clone().acquire_owned().await?;
            let overall = self.cfg.overall_timeout;
            let crawler = self.crawler.clone();
            let sink = self.sink.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let res = match timeout(overall, crawler.crawl(&visit)).await {
                    Ok(result) => sink.emit(result).await,
                    Err(_) => {
                        warn!(visit_id = %visit.visit_id, host = %visit.domain_name, "overall timeout");
                        sink.emit_abandoned(visit, "overall timeout".to_string()).await
                    }
                };
                if let Err(err) = res {
                    warn!(error = %err, "dropped crawl result");
                }
            }));

            self.limiter.sleep_jitter().await;
        }

        while tasks.next().await.is_some() {}
        evictor.abort();
        info!(cached_ips = self.crawler.cache().size(), "all visits done");
        Ok(())
    }

    fn spawn_evictor(&self) -> JoinHandle<()> {
        let cache = self.crawler.cache().clone();
        let retention = self.cfg.cache_retention;
        let every = self.cfg.cache_evict_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.evict_entries_older_than(retention) {
                    Ok(evicted) => debug!(evicted, remaining = cache.size(), "cache eviction"),
                    Err(err) => warn!(error = %err, "cache eviction skipped"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ScanResultCache;
    use crate::crawler::CrawlerOptions;
    use crate::model::{OutputConfig, OutputFormat, ProtocolVersion, VisitRequest};
    use crate::output::OutputSink;
    use crate::scan::tests::ScriptedProber;
    use crate::scan_result::tests::scan_result;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn config(target: VisitRequest) -> Config {
        Config {
            target: Some(target),
            input: None,
            port: 443,
            concurrency: 2,
            rate: 10,
            connect_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_millis(100),
            overall_timeout: Duration::from_secs(5),
            cache: Default::default(),
            cache_retention: Duration::from_secs(3600),
            cache_evict_interval: Duration::from_secs(300),
            verify_on_cache_hit: false,
            output: OutputConfig {
                format: OutputFormat::Jsonl,
            },
        }
    }

    #[tokio::test]
    async fn unresolvable_visit_is_written_once() {
        let buf = SharedBuf::default();
        let cfg = config(VisitRequest {
            visit_id: "v-1".into(),
            domain_name: "does-not-exist.invalid".into(),
        });
        let sink = OutputChannel::with_sink(OutputSink::new(cfg.output.clone(), Box::new(buf.clone())))
            .unwrap();
        let crawler = TlsCrawler::new(
            Arc::new(ScriptedProber::new(&[])),
            Arc::new(ScanResultCache::with_default_settings()),
            CrawlerOptions::default(),
        );
        let mut engine = Engine::new(cfg, sink.clone(), crawler).unwrap();
        engine.run().await.unwrap();
        sink.shutdown().await.unwrap();

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["visit"]["visit_id"], "v-1");
        assert_eq!(value["source"], "scan");
        assert!(value["full_scan"]["ip"].is_null());
    }

    #[tokio::test]
    async fn evictor_trims_stale_entries() {
        let cache = Arc::new(ScanResultCache::with_default_settings());
        let stale = chrono::Utc::now() - chrono::Duration::hours(2);
        cache.add(
            stale,
            scan_result("192.0.2.1", ProtocolVersion::Tls1_2, "A"),
        );
        let crawler = TlsCrawler::new(
            Arc::new(ScriptedProber::new(&[])),
            cache.clone(),
            CrawlerOptions::default(),
        );
        let mut cfg = config(VisitRequest {
            visit_id: "v".into(),
            domain_name: "example.be".into(),
        });
        cfg.cache_evict_interval = Duration::from_secs(1);
        let sink = OutputChannel::with_sink(OutputSink::new(cfg.output.clone(), Box::new(std::io::sink())))
            .unwrap();
        let engine = Engine::new(cfg, sink, crawler).unwrap();

        let evictor = engine.spawn_evictor();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        evictor.abort();
        assert_eq!(cache.size(), 0);
    }
}
