use super::{connect, HandshakeProber, ProbeSettings};
use crate::certificate::TrustValidator;
use crate::model::{Certificate, PeerCheck, ProbeTarget, ProtocolVersion, VersionScanOutcome};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use openssl::ssl::{
    Ssl, SslConnector, SslConnectorBuilder, SslMethod, SslOptions, SslRef, SslVerifyMode, SslVersion,
};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::debug;

/// Handshakes through OpenSSL with the protocol range pinned to a single
/// version. Covers SSLv3 through TLS 1.3. The connector defaults that
/// disable legacy versions are cleared; a local OpenSSL built without SSLv3
/// still fails with "no protocols available", which is recorded like any
/// other failure.
pub struct OpenSslProber {
    settings: ProbeSettings,
    validator: Arc<dyn TrustValidator>,
    connectors: HashMap<ProtocolVersion, Result<SslConnector, String>>,
}

impl OpenSslProber {
    pub fn new(settings: ProbeSettings, validator: Arc<dyn TrustValidator>) -> Self {
        let connectors = ProtocolVersion::ALL
            .into_iter()
            .filter_map(|version| {
                ssl_version(version)
                    .map(|pinned| (version, pinned_connector(pinned).map_err(|e| e.to_string())))
            })
            .collect();
        Self {
            settings,
            validator,
            connectors,
        }
    }

    fn configure(&self, version: ProtocolVersion, server_name: &str) -> anyhow::Result<Ssl> {
        let connector = self
            .connectors
            .get(&version)
            .ok_or_else(|| anyhow!("{version} is not supported by OpenSSL"))?
            .as_ref()
            .map_err(|err| anyhow!("failed to create TLS connector: {err}"))?;

        // The probe only observes: hostname and chain are judged separately.
        connector
            .configure()
            .context("failed to configure TLS connector")?
            .verify_hostname(false)
            .use_server_name_indication(true)
            .into_ssl(server_name)
            .context("failed to configure TLS SNI")
    }

    fn inspect_peer(&self, ssl: &SslRef, server_name: &str) -> PeerCheck {
        let Some(leaf) = ssl.peer_certificate() else {
            return PeerCheck::default();
        };
        let chain_trusted_by_platform = self.validator.is_trusted(&leaf, ssl.peer_cert_chain());
        let certificate = Certificate::from_x509(&leaf);
        let host_name_matches_certificate = certificate
            .as_ref()
            .map(|cert| cert.matches_host(server_name))
            .unwrap_or(false);
        PeerCheck {
            certificate,
            host_name_matches_certificate,
            chain_trusted_by_platform,
        }
    }
}

#[async_trait]
impl HandshakeProber for OpenSslProber {
    fn name(&self) -> &'static str {
        "openssl"
    }

    async fn probe(&self, target: &ProbeTarget, version: ProtocolVersion) -> VersionScanOutcome {
        let started = Instant::now();
        let stream = match connect(target, version, &self.settings, started).await {
            Ok(stream) => stream,
            Err(outcome) => return outcome,
        };

        let ssl = match self.configure(version, &target.server_name) {
            Ok(ssl) => ssl,
            Err(err) => {
                return VersionScanOutcome::failed(
                    target,
                    version,
                    true,
                    format!("{err:#}"),
                    started.elapsed(),
                )
            }
        };
        let mut tls_stream = match SslStream::new(ssl, stream) {
            Ok(stream) => stream,
            Err(err) => {
                return VersionScanOutcome::failed(
                    target,
                    version,
                    true,
                    format!("failed to initialize TLS stream: {err}"),
                    started.elapsed(),
                )
            }
        };

        let handshake = timeout(
            self.settings.handshake_timeout,
            Pin::new(&mut tls_stream).connect(),
        )
        .await;
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(target = %target.addr, %version, error = %err, "handshake failed");
                return VersionScanOutcome::failed(
                    target,
                    version,
                    true,
                    format!("handshake failed: {err}"),
                    started.elapsed(),
                );
            }
            Err(_) => {
                return VersionScanOutcome::failed(
                    target,
                    version,
                    true,
                    "handshake timeout",
                    started.elapsed(),
                )
            }
        }

        let (cipher, peer) = {
            let ssl = tls_stream.ssl();
            let cipher = ssl
                .current_cipher()
                .map(|cipher| cipher.name().to_string());
            (cipher, self.inspect_peer(ssl, &target.server_name))
        };
        let elapsed = started.elapsed();

        let _ = tls_stream.shutdown().await;
        debug!(
            target = %target.addr,
            %version,
            ms = elapsed.as_millis() as u64,
            cipher = cipher.as_deref().unwrap_or("-"),
            "handshake completed"
        );
        VersionScanOutcome::succeeded(target, version, cipher, peer, elapsed)
    }
}

fn ssl_version(version: ProtocolVersion) -> Option<SslVersion> {
    match version {
        ProtocolVersion::Ssl2 => None,
        ProtocolVersion::Ssl3 => Some(SslVersion::SSL3),
        ProtocolVersion::Tls1_0 => Some(SslVersion::TLS1),
        ProtocolVersion::Tls1_1 => Some(SslVersion::TLS1_1),
        ProtocolVersion::Tls1_2 => Some(SslVersion::TLS1_2),
        ProtocolVersion::Tls1_3 => Some(SslVersion::TLS1_3),
    }
}

fn pinned_connector(version: SslVersion) -> anyhow::Result<SslConnector> {
    Ok(pinned_builder(version)?.build())
}

fn pinned_builder(version: SslVersion) -> anyhow::Result<SslConnectorBuilder> {
    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(|e| anyhow!(e))?;
    builder.set_verify(SslVerifyMode::NONE);
    // SslConnector::builder switches SSLv3 off through the option flags,
    // which would win over the pinned range below.
    builder.clear_options(SslOptions::NO_SSLV3 | SslOptions::NO_TLSV1 | SslOptions::NO_TLSV1_1);
    builder
        .set_min_proto_version(Some(version))
        .map_err(|e| anyhow!(e))?;
    builder
        .set_max_proto_version(Some(version))
        .map_err(|e| anyhow!(e))?;
    // Legacy versions need legacy ciphers; security level 0 re-enables them
    // on OpenSSL 1.1+, older builds reject the keyword.
    if builder
        .set_cipher_list("ALL:COMPLEMENTOFALL:@SECLEVEL=0")
        .is_err()
    {
        builder
            .set_cipher_list("ALL:COMPLEMENTOFALL")
            .map_err(|e| anyhow!(e))?;
    }
    Ok(builder)
}
