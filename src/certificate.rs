use crate::model::{Certificate, CertificateStatus};
use crate::util::hex::to_hex;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::stack::{Stack, StackRef};
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509NameRef, X509Ref, X509StoreContext, X509};
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use tracing::debug;

impl Certificate {
    /// Extracts the descriptor from a parsed leaf. Returns `None` when any
    /// mandatory field cannot be read; callers treat that as "no certificate".
    pub fn from_x509(cert: &X509Ref) -> Option<Certificate> {
        let digest = cert.digest(MessageDigest::sha256()).ok()?;
        let not_before = asn1_to_utc(cert.not_before())?;
        let not_after = asn1_to_utc(cert.not_after())?;
        let serial_number = cert
            .serial_number()
            .to_bn()
            .ok()?
            .to_hex_str()
            .ok()?
            .to_string();

        let common_name = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().to_string().ok());

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Some(names) = cert.subject_alt_names() {
            for name in names.iter() {
                if let Some(dns) = name.dnsname() {
                    dns_names.push(dns.to_string());
                } else if let Some(ip) = name.ipaddress().and_then(ip_from_bytes) {
                    ip_addresses.push(ip);
                }
            }
        }

        Some(Certificate {
            sha256_fingerprint: to_hex(&digest),
            not_before,
            not_after,
            subject: format_x509_name(cert.subject_name()),
            issuer: format_x509_name(cert.issuer_name()),
            serial_number,
            common_name,
            dns_names,
            ip_addresses,
        })
    }

    pub fn from_der(der: &[u8]) -> Option<Certificate> {
        match X509::from_der(der) {
            Ok(cert) => Self::from_x509(&cert),
            Err(err) => {
                debug!(error = %err, "unable to parse certificate");
                None
            }
        }
    }

    pub fn is_too_soon(&self, now: DateTime<Utc>) -> bool {
        now < self.not_before
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }

    /// RFC 6125 style matching: DNS SANs take precedence, the subject CN is
    /// only consulted when the certificate has no DNS SAN at all.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = normalize(host);
        if host.is_empty() {
            return false;
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.ip_addresses.contains(&ip);
        }

        if !self.dns_names.is_empty() {
            return self
                .dns_names
                .iter()
                .any(|pattern| matches_pattern(&normalize(pattern), &host));
        }

        self.common_name
            .as_deref()
            .map(|cn| matches_pattern(&normalize(cn), &host))
            .unwrap_or(false)
    }
}

impl CertificateStatus {
    /// Validity is judged against `now`, the moment the verdict is built,
    /// not the moment the certificate was collected.
    pub fn evaluate(certificate: Option<&Certificate>, now: DateTime<Utc>) -> CertificateStatus {
        match certificate {
            Some(cert) => CertificateStatus::Observed {
                sha256_fingerprint: cert.sha256_fingerprint.clone(),
                expired: cert.is_expired(now),
                too_soon: cert.is_too_soon(now),
            },
            None => CertificateStatus::NotObserved,
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

// A wildcard only covers the complete left-most label.
fn matches_pattern(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix && suffix.contains('.'),
            None => false,
        },
        None => pattern == host,
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

fn asn1_to_utc(time: &Asn1TimeRef) -> Option<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0).ok()?;
    let diff = epoch.diff(time).ok()?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0)
}

fn format_x509_name(name: &X509NameRef) -> String {
    let mut parts = Vec::new();
    for entry in name.entries() {
        let key = entry.object().nid().short_name().unwrap_or("UNKNOWN");
        let value = entry
            .data()
            .to_string()
            .unwrap_or_default();
        if !value.is_empty() {
            parts.push(format!("{key}={value}"));
        }
    }
    parts.join(", ")
}

/// Decides whether a presented chain is trusted.
pub trait TrustValidator: Send + Sync {
    fn is_trusted(&self, leaf: &X509Ref, chain: Option<&StackRef<X509>>) -> bool;
}

/// Validates against the platform's default OpenSSL trust store.
pub struct PlatformTrustStore {
    store: X509Store,
}

impl PlatformTrustStore {
    pub fn new() -> anyhow::Result<Self> {
        let mut builder = X509StoreBuilder::new().map_err(|e| anyhow!(e))?;
        builder.set_default_paths().map_err(|e| anyhow!(e))?;
        Ok(Self {
            store: builder.build(),
        })
    }

    /// Process-wide store; loading the default paths touches the filesystem.
    pub fn shared() -> anyhow::Result<Arc<PlatformTrustStore>> {
        static STORE: OnceLock<Result<Arc<PlatformTrustStore>, String>> = OnceLock::new();

        STORE
            .get_or_init(|| PlatformTrustStore::new().map(Arc::new).map_err(|e| e.to_string()))
            .clone()
            .map_err(|err| anyhow!("failed to load platform trust store: {err}"))
    }

    fn verify(&self, leaf: &X509Ref, chain: Option<&StackRef<X509>>) -> anyhow::Result<bool> {
        let mut untrusted = Stack::<X509>::new()?;
        if let Some(chain) = chain {
            for cert in chain.iter() {
                untrusted.push(cert.to_owned())?;
            }
        }
        let mut ctx = X509StoreContext::new()?;
        let trusted = ctx.init(&self.store, leaf, &untrusted, |c| {
            let ok = c.verify_cert()?;
            if !ok {
                debug!(error = %c.error(), "chain verification failed");
            }
            Ok(ok)
        })?;
        Ok(trusted)
    }
}

impl TrustValidator for PlatformTrustStore {
    fn is_trusted(&self, leaf: &X509Ref, chain: Option<&StackRef<X509>>) -> bool {
        match self.verify(leaf, chain) {
            Ok(trusted) => trusted,
            Err(err) => {
                debug!(error = %err, "unable to run chain verification");
                false
            }
        }
    }
}
