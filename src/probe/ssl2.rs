use super::{connect, HandshakeProber, ProbeSettings};
use crate::certificate::TrustValidator;
use crate::model::{Certificate, PeerCheck, ProbeTarget, ProtocolVersion, VersionScanOutcome};
use anyhow::{bail, Context};
use async_trait::async_trait;
use openssl::x509::X509;
use rand::{thread_rng, RngCore};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 4;
const CERT_TYPE_X509: u8 = 1;
const CHALLENGE_LEN: usize = 16;

const CIPHER_SPECS: [([u8; 3], &str); 7] = [
    ([0x01, 0x00, 0x80], "SSL_CK_RC4_128_WITH_MD5"),
    ([0x02, 0x00, 0x80], "SSL_CK_RC4_128_EXPORT40_WITH_MD5"),
    ([0x03, 0x00, 0x80], "SSL_CK_RC2_128_CBC_WITH_MD5"),
    ([0x04, 0x00, 0x80], "SSL_CK_RC2_128_CBC_EXPORT40_WITH_MD5"),
    ([0x05, 0x00, 0x80], "SSL_CK_IDEA_128_CBC_WITH_MD5"),
    ([0x06, 0x00, 0x40], "SSL_CK_DES_64_CBC_WITH_MD5"),
    ([0x07, 0x00, 0xc0], "SSL_CK_DES_192_EDE3_CBC_WITH_MD5"),
];

/// SSLv2 support check. OpenSSL no longer ships SSLv2, so this speaks just
/// enough of the protocol by hand: send a CLIENT-HELLO, and count the
/// version as supported when the server answers with a SERVER-HELLO that
/// shares at least one cipher spec.
pub struct Ssl2Prober {
    settings: ProbeSettings,
    validator: Arc<dyn TrustValidator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerHello {
    pub certificate: Option<Vec<u8>>,
    pub cipher_specs: Vec<[u8; 3]>,
}

impl Ssl2Prober {
    pub fn new(settings: ProbeSettings, validator: Arc<dyn TrustValidator>) -> Self {
        Self {
            settings,
            validator,
        }
    }

    fn inspect_peer(&self, der: Option<&[u8]>, server_name: &str) -> PeerCheck {
        let Some(leaf) = der.and_then(|der| X509::from_der(der).ok()) else {
            return PeerCheck::default();
        };
        let certificate = Certificate::from_x509(&leaf);
        PeerCheck {
            host_name_matches_certificate: certificate
                .as_ref()
                .map(|cert| cert.matches_host(server_name))
                .unwrap_or(false),
            chain_trusted_by_platform: self.validator.is_trusted(&leaf, None),
            certificate,
        }
    }
}

#[async_trait]
impl HandshakeProber for Ssl2Prober {
    fn name(&self) -> &'static str {
        "sslv2"
    }

    async fn probe(&self, target: &ProbeTarget, version: ProtocolVersion) -> VersionScanOutcome {
        let started = Instant::now();
        let mut stream = match connect(target, version, &self.settings, started).await {
            Ok(stream) => stream,
            Err(outcome) => return outcome,
        };

        let exchange = async {
            stream
                .write_all(&client_hello())
                .await
                .context("failed to write SSLv2 CLIENT-HELLO")?;
            let record = read_record(&mut stream).await?;
            parse_server_hello(&record)
        };

        let hello = match timeout(self.settings.handshake_timeout, exchange).await {
            Ok(Ok(hello)) => hello,
            Ok(Err(err)) => {
                debug!(target = %target.addr, error = %err, "SSLv2 handshake failed");
                return VersionScanOutcome::failed(
                    target,
                    version,
                    true,
                    format!("{err:#}"),
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
        };

        let Some(cipher) = hello.cipher_specs.first().map(|spec| cipher_name(*spec)) else {
            return VersionScanOutcome::failed(
                target,
                version,
                true,
                "no shared SSLv2 cipher spec",
                started.elapsed(),
            );
        };
        let peer = self.inspect_peer(hello.certificate.as_deref(), &target.server_name);
        VersionScanOutcome::succeeded(target, version, Some(cipher), peer, started.elapsed())
    }
}

pub(crate) fn client_hello() -> Vec<u8> {
    let mut challenge = [0u8; CHALLENGE_LEN];
    thread_rng().fill_bytes(&mut challenge);

    let specs_len = CIPHER_SPECS.len() * 3;
    let body_len = 9 + specs_len + CHALLENGE_LEN;
    let mut msg = Vec::with_capacity(2 + body_len);
    msg.push(0x80 | ((body_len >> 8) as u8 & 0x7f));
    msg.push(body_len as u8);
    msg.push(MSG_CLIENT_HELLO);
    msg.extend_from_slice(&[0x00, 0x02]);
    msg.extend_from_slice(&(specs_len as u16).to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&(CHALLENGE_LEN as u16).to_be_bytes());
    for (spec, _) in CIPHER_SPECS {
        msg.extend_from_slice(&spec);
    }
    msg.extend_from_slice(&challenge);
    msg
}

async fn read_record<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut header = [0u8; 2];
    stream
        .read_exact(&mut header)
        .await
        .context("connection closed before SERVER-HELLO")?;

    if (0x14..=0x17).contains(&header[0]) && header[1] == 0x03 {
        bail!("server answered with a TLS record, SSLv2 not supported");
    }

    let len = if header[0] & 0x80 != 0 {
        (usize::from(header[0] & 0x7f) << 8) | usize::from(header[1])
    } else {
        let mut padding = [0u8; 1];
        stream.read_exact(&mut padding).await?;
        (usize::from(header[0] & 0x3f) << 8) | usize::from(header[1])
    };
    if len == 0 {
        bail!("empty SSLv2 record");
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .context("truncated SSLv2 record")?;
    Ok(body)
}

pub(crate) fn parse_server_hello(msg: &[u8]) -> anyhow::Result<ServerHello> {
    if msg.first() != Some(&MSG_SERVER_HELLO) {
        bail!("unexpected SSLv2 message type {:?}", msg.first());
    }
    if msg.len() < 11 {
        bail!("SSLv2 SERVER-HELLO too short ({} bytes)", msg.len());
    }
    let cert_type = msg[2];
    let cert_len = usize::from(u16::from_be_bytes([msg[5], msg[6]]));
    let specs_len = usize::from(u16::from_be_bytes([msg[7], msg[8]]));
    let conn_id_len = usize::from(u16::from_be_bytes([msg[9], msg[10]]));

    let expected = 11 + cert_len + specs_len + conn_id_len;
    if msg.len() < expected {
        bail!(
            "SSLv2 SERVER-HELLO truncated: expected {expected} bytes, got {}",
            msg.len()
        );
    }
    if specs_len % 3 != 0 {
        bail!("malformed SSLv2 cipher spec list of {specs_len} bytes");
    }

    let cert_bytes = &msg[11..11 + cert_len];
    let certificate = (cert_type == CERT_TYPE_X509 && !cert_bytes.is_empty())
        .then(|| cert_bytes.to_vec());
    let cipher_specs = msg[11 + cert_len..11 + cert_len + specs_len]
        .chunks_exact(3)
        .map(|c| [c[0], c[1], c[2]])
        .collect();

    Ok(ServerHello {
        certificate,
        cipher_specs,
    })
}

fn cipher_name(spec: [u8; 3]) -> String {
    CIPHER_SPECS
        .iter()
        .find(|(known, _)| *known == spec)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("SSL2_UNKNOWN_{:02x}{:02x}{:02x}", spec[0], spec[1], spec[2]))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn server_hello_record(cert: &[u8], specs: &[[u8; 3]]) -> Vec<u8> {
        let mut body = vec![MSG_SERVER_HELLO, 0x00, CERT_TYPE_X509, 0x00, 0x02];
        body.extend_from_slice(&(cert.len() as u16).to_be_bytes());
        body.extend_from_slice(&((specs.len() * 3) as u16).to_be_bytes());
        body.extend_from_slice(&16u16.to_be_bytes());
        body.extend_from_slice(cert);
        for spec in specs {
            body.extend_from_slice(spec);
        }
        body.extend_from_slice(&[0xaa; 16]);

        let mut record = vec![0x80 | (body.len() >> 8) as u8, body.len() as u8];
        record.extend_from_slice(&body);
        record
    }

    #[test]
    fn client_hello_layout() {
        let hello = client_hello();
        assert_eq!(hello.len(), 2 + 46);
        assert_eq!(&hello[..5], &[0x80, 46, MSG_CLIENT_HELLO, 0x00, 0x02]);
        assert_eq!(&hello[5..7], &[0x00, 21]);
        assert_eq!(&hello[9..11], &[0x00, 16]);
        assert_eq!(&hello[11..14], &[0x01, 0x00, 0x80]);
    }

    #[tokio::test]
    async fn parses_server_hello_record() {
        let record = server_hello_record(b"", &[[0x07, 0x00, 0xc0], [0x01, 0x00, 0x80]]);
        let mut data: &[u8] = &record;
        let body = read_record(&mut data).await.unwrap();
        let hello = parse_server_hello(&body).unwrap();
        assert!(hello.certificate.is_none());
        assert_eq!(hello.cipher_specs.len(), 2);
        assert_eq!(cipher_name(hello.cipher_specs[0]), "SSL_CK_DES_192_EDE3_CBC_WITH_MD5");
    }

    #[tokio::test]
    async fn rejects_tls_alert() {
        let mut data: &[u8] = b"\x15\x03\x01\x00\x02\x02\x28";
        let err = read_record(&mut data).await.unwrap_err();
        assert!(err.to_string().contains("TLS record"));
    }

    #[test]
    fn rejects_truncated_hello() {
        let record = server_hello_record(b"abcdef", &[[0x01, 0x00, 0x80]]);
        let body = &record[2..12];
        assert!(parse_server_hello(body).is_err());
    }

    #[test]
    fn unknown_cipher_spec_is_named_by_bytes() {
        assert_eq!(cipher_name([0xff, 0x00, 0x80]), "SSL2_UNKNOWN_ff0080");
    }
}
