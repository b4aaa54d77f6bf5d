use super::channel::OutputCommand;
use crate::model::{CertificateStatus, OutputConfig, OutputFormat, ResultSource, TlsCrawlResult};
use serde::Serialize;
use std::io::{BufWriter, Write};

pub struct OutputSink {
    cfg: OutputConfig,
    writer: BufWriter<Box<dyn Write + Send>>,
}

#[derive(Serialize)]
struct AbandonedVisit<'a> {
    visit_id: &'a str,
    host_name: &'a str,
    error: &'a str,
}

impl OutputSink {
    pub fn new(cfg: OutputConfig, writer: Box<dyn Write + Send>) -> Self {
        Self {
            cfg,
            writer: BufWriter::new(writer),
        }
    }

    pub fn stdout(cfg: OutputConfig) -> Self {
        Self::new(cfg, Box::new(std::io::stdout()))
    }

    pub(super) fn write(&mut self, cmd: OutputCommand) -> anyhow::Result<()> {
        match cmd {
            OutputCommand::Emit(result) => self.write_result(&result),
            OutputCommand::Abandoned { visit, reason } => {
                match self.cfg.format {
                    OutputFormat::Jsonl => {
                        let line = serde_json::to_string(&AbandonedVisit {
                            visit_id: &visit.visit_id,
                            host_name: &visit.domain_name,
                            error: &reason,
                        })?;
                        writeln!(self.writer, "{line}")?;
                    }
                    OutputFormat::Pretty => {
                        writeln!(self.writer, "{} -> abandoned: {}", visit.domain_name, reason)?;
                    }
                }
                Ok(())
            }
        }
    }

    pub fn write_result(&mut self, result: &TlsCrawlResult) -> anyhow::Result<()> {
        match self.cfg.format {
            OutputFormat::Jsonl => {
                let line = serde_json::to_string(result)?;
                writeln!(self.writer, "{line}")?;
            }
            OutputFormat::Pretty => {
                writeln!(self.writer, "{}", pretty_headline(result))?;
                writeln!(self.writer, "  certificate: {}", pretty_certificate(&result.certificate))?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

fn pretty_headline(result: &TlsCrawlResult) -> String {
    let (ip, range) = match &result.full_scan {
        Some(record) => (
            record
                .ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unresolved".into()),
            match (record.lowest_version_supported, record.highest_version_supported) {
                (Some(lowest), Some(highest)) => format!("{lowest}..{highest}"),
                _ => "no TLS".into(),
            },
        ),
        None => ("-".into(), "-".into()),
    };
    let source = match result.source {
        ResultSource::Scan => "scan",
        ResultSource::Cache => "cache",
    };
    format!(
        "{} [{}] -> {} ({}) trusted={} host_match={}",
        result.host_name,
        ip,
        range,
        source,
        result.chain_trusted_by_platform,
        result.host_name_matches_certificate
    )
}

fn pretty_certificate(status: &CertificateStatus) -> String {
    match status {
        CertificateStatus::NotObserved => "none observed".into(),
        CertificateStatus::Observed {
            sha256_fingerprint,
            expired,
            too_soon,
        } => format!("{sha256_fingerprint} expired={expired} too_soon={too_soon}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FullScanRecord, ProtocolVersion, VisitRequest};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn result() -> TlsCrawlResult {
        TlsCrawlResult {
            visit: VisitRequest {
                visit_id: "v1".into(),
                domain_name: "example.be".into(),
            },
            host_name: "example.be".into(),
            source: ResultSource::Cache,
            host_name_matches_certificate: true,
            chain_trusted_by_platform: false,
            certificate: CertificateStatus::NotObserved,
            full_scan: Some(FullScanRecord {
                ip: Some("192.0.2.5".parse().unwrap()),
                server_name: "example.be".into(),
                connect_ok: true,
                lowest_version_supported: Some(ProtocolVersion::Tls1_2),
                highest_version_supported: Some(ProtocolVersion::Tls1_3),
                versions: BTreeMap::new(),
                full_scan_crawl_timestamp: Utc::now(),
            }),
            crawl_timestamp: Utc::now(),
        }
    }

    #[test]
    fn pretty_headline_summarises_versions() {
        assert_eq!(
            pretty_headline(&result()),
            "example.be [192.0.2.5] -> TLSv1.2..TLSv1.3 (cache) trusted=false host_match=true"
        );
    }

    #[test]
    fn jsonl_uses_snake_case_fields() {
        let line = serde_json::to_string(&result()).unwrap();
        assert!(line.contains("\"host_name_matches_certificate\":true"));
        assert!(line.contains("\"source\":\"cache\""));
        assert!(line.contains("\"certificate\":{\"state\":\"not_observed\"}"));
    }
}
