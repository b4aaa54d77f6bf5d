use crate::model::{OutputConfig, TlsCrawlResult, VisitRequest};
use tokio::sync::mpsc;

use super::sink::OutputSink;

/// Hands crawl results to a blocking writer task so slow output never
/// stalls the crawl workers.
#[derive(Clone)]
pub struct OutputChannel {
    inner: std::sync::Arc<OutputInner>,
}

struct OutputInner {
    tx: tokio::sync::Mutex<Option<mpsc::Sender<OutputCommand>>>,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

pub(super) enum OutputCommand {
    Emit(Box<TlsCrawlResult>),
    Abandoned { visit: VisitRequest, reason: String },
}

impl OutputChannel {
    pub fn new(cfg: OutputConfig) -> anyhow::Result<Self> {
        Self::with_sink(OutputSink::stdout(cfg))
    }

    pub fn with_sink(mut sink: OutputSink) -> anyhow::Result<Self> {
        let (tx, mut rx) = mpsc::channel(1024);
        let handle = tokio::task::spawn_blocking(move || {
            while let Some(cmd) = rx.blocking_recv() {
                if let Err(err) = sink.write(cmd) {
                    tracing::error!(error = %err, "failed to write crawl result");
                }
            }
            sink.flush();
        });

        Ok(Self {
            inner: std::sync::Arc::new(OutputInner {
                tx: tokio::sync::Mutex::new(Some(tx)),
                handle: tokio::sync::Mutex::new(Some(handle)),
            }),
        })
    }

    async fn send(&self, cmd: OutputCommand) -> anyhow::Result<()> {
        let guard = self.inner.tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            tx.send(cmd)
                .await
                .map_err(|err| anyhow::anyhow!("output worker not available: {err}"))?
        } else {
            anyhow::bail!("output worker not available; dropping crawl result");
        }
        Ok(())
    }

    pub async fn emit(&self, result: TlsCrawlResult) -> anyhow::Result<()> {
        self.send(OutputCommand::Emit(Box::new(result))).await
    }

    /// Records a visit that produced no verdict, e.g. because the overall
    /// budget ran out mid-scan.
    pub async fn emit_abandoned(&self, visit: VisitRequest, reason: String) -> anyhow::Result<()> {
        self.send(OutputCommand::Abandoned { visit, reason }).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.inner.tx.lock().await.take();

        if let Some(handle) = self.inner.handle.lock().await.take() {
            handle
                .await
                .map_err(|err| anyhow::anyhow!("failed to join output worker: {err}"))?;
        }

        Ok(())
    }
}
