use super::{HandshakeProber, OpenSslProber, ProbeSettings, Ssl2Prober};
use crate::certificate::{PlatformTrustStore, TrustValidator};
use crate::model::{ProbeTarget, ProtocolVersion, VersionScanOutcome};
use async_trait::async_trait;
use std::sync::Arc;

/// Routes each version to the prober able to speak it.
pub struct PlatformProber {
    openssl: OpenSslProber,
    ssl2: Ssl2Prober,
}

impl PlatformProber {
    pub fn new(settings: ProbeSettings, validator: Arc<dyn TrustValidator>) -> Self {
        Self {
            openssl: OpenSslProber::new(settings, validator.clone()),
            ssl2: Ssl2Prober::new(settings, validator),
        }
    }

    /// Prober backed by the platform trust store.
    pub fn with_platform_trust(settings: ProbeSettings) -> anyhow::Result<Self> {
        let store: Arc<dyn TrustValidator> = PlatformTrustStore::shared()?;
        Ok(Self::new(settings, store))
    }

    fn prober_for(&self, version: ProtocolVersion) -> &dyn HandshakeProber {
        match version {
            ProtocolVersion::Ssl2 => &self.ssl2,
            _ => &self.openssl,
        }
    }
}

#[async_trait]
impl HandshakeProber for PlatformProber {
    fn name(&self) -> &'static str {
        "platform"
    }

    async fn probe(&self, target: &ProbeTarget, version: ProtocolVersion) -> VersionScanOutcome {
        self.prober_for(version).probe(target, version).await
    }
}
