use crate::model::VisitRequest;
use crate::util::random_visit_id;
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Streams the visits to crawl: the single `--host` target and/or every
/// line of the input file.
pub fn stream_visits(cfg: &crate::model::Config) -> anyhow::Result<ReceiverStream<VisitRequest>> {
    let (tx, rx) = mpsc::channel(256);

    if let Some(visit) = cfg.target.clone() {
        let tx = tx.clone();
        tokio::spawn(async move {
            tx.send(visit).await.ok();
        });
    }

    if let Some(path) = cfg.input.clone() {
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(err) = read_file(path, tx).await {
                tracing::error!(error = %err, "failed to read input file");
            }
        });
    }

    drop(tx);
    Ok(ReceiverStream::new(rx))
}

async fn read_file(path: String, tx: mpsc::Sender<VisitRequest>) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("cannot open input {}", path))?;
    let mut reader = BufReader::new(file).lines();
    while let Some(line) = reader.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_visit(trimmed) {
            Some(visit) => {
                if tx.send(visit).await.is_err() {
                    break;
                }
            }
            None => tracing::warn!(line = %trimmed, "skipping invalid visit"),
        }
    }
    Ok(())
}

/// Accepts `visit_id,domain_name` or a bare `domain_name`.
pub(crate) fn parse_visit(line: &str) -> Option<VisitRequest> {
    let (visit_id, domain) = match line.split_once(',') {
        Some((id, domain)) => (id.trim().to_string(), domain.trim()),
        None => (random_visit_id(), line.trim()),
    };
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    if visit_id.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
        return None;
    }
    Some(VisitRequest {
        visit_id,
        domain_name: domain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Config, OutputConfig, OutputFormat};
    use std::io::Write;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    #[test]
    fn parses_lines() {
        let visit = parse_visit("abc-123, WWW.Example.BE.").unwrap();
        assert_eq!(visit.visit_id, "abc-123");
        assert_eq!(visit.domain_name, "www.example.be");

        let bare = parse_visit("dnsbelgium.be").unwrap();
        assert_eq!(bare.domain_name, "dnsbelgium.be");
        assert_eq!(bare.visit_id.len(), 32);

        assert!(parse_visit("id,").is_none());
        assert!(parse_visit(",example.be").is_none());
        assert!(parse_visit("two words").is_none());
    }

    #[tokio::test]
    async fn streams_visits_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "v1,example.be").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "v2,example.org").unwrap();

        let cfg = Config {
            target: None,
            input: Some(file.path().to_string_lossy().into_owned()),
            port: 443,
            concurrency: 1,
            rate: 1,
            connect_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_millis(100),
            overall_timeout: Duration::from_secs(1),
            cache: Default::default(),
            cache_retention: Duration::from_secs(60),
            cache_evict_interval: Duration::from_secs(60),
            verify_on_cache_hit: true,
            output: OutputConfig {
                format: OutputFormat::Jsonl,
            },
        };
        let visits: Vec<_> = stream_visits(&cfg).unwrap().collect().await;
        let ids: Vec<_> = visits.iter().map(|v| v.visit_id.as_str()).collect();
        assert_eq!(ids, vec!["v1", "v2"]);
    }
}
