use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslVersion};
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tls_consensus_crawler::cache::ScanResultCache;
use tls_consensus_crawler::certificate::PlatformTrustStore;
use tls_consensus_crawler::crawler::{CrawlerOptions, TlsCrawler};
use tls_consensus_crawler::model::{
    CertificateStatus, ProbeTarget, ProtocolVersion, ResultSource, VisitRequest,
};
use tls_consensus_crawler::probe::{HandshakeProber, OpenSslProber, PlatformProber, ProbeSettings, Ssl2Prober};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_openssl::SslStream;

fn settings() -> ProbeSettings {
    ProbeSettings {
        connect_timeout: Duration::from_millis(500),
        handshake_timeout: Duration::from_millis(1500),
    }
}

fn target(addr: SocketAddr) -> ProbeTarget {
    ProbeTarget {
        addr,
        server_name: "localhost".into(),
    }
}

fn self_signed() -> (X509, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// TLS 1.2-only server answering every connection with a self-signed
/// certificate for `localhost`.
async fn tls12_server() -> SocketAddr {
    let (cert, key) = self_signed();
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
    acceptor.set_private_key(&key).unwrap();
    acceptor.set_certificate(&cert).unwrap();
    acceptor
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .unwrap();
    acceptor
        .set_max_proto_version(Some(SslVersion::TLS1_2))
        .unwrap();
    let acceptor = Arc::new(acceptor.build());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let ssl = Ssl::new(acceptor.context()).unwrap();
                let mut stream = SslStream::new(ssl, socket).unwrap();
                if Pin::new(&mut stream).accept().await.is_ok() {
                    let mut buf = [0u8; 64];
                    let _ = stream.read(&mut buf).await;
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn closed_port_reports_connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let prober = PlatformProber::new(settings(), Arc::new(PlatformTrustStore::new().unwrap()));
    let outcome = prober.probe(&target(addr), ProtocolVersion::Tls1_2).await;
    assert!(!outcome.connect_ok());
    assert!(!outcome.handshake_ok());
    assert!(outcome.error_message().is_some());
}

#[tokio::test]
async fn server_closing_without_handshake_is_not_supported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for _ in 0..2 {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        }
    });

    let validator = Arc::new(PlatformTrustStore::new().unwrap());
    let tls = OpenSslProber::new(settings(), validator.clone());
    let outcome = tls.probe(&target(addr), ProtocolVersion::Tls1_2).await;
    assert!(outcome.connect_ok());
    assert!(!outcome.handshake_ok());

    let ssl2 = Ssl2Prober::new(settings(), validator);
    let outcome = ssl2.probe(&target(addr), ProtocolVersion::Ssl2).await;
    assert!(outcome.connect_ok());
    assert!(!outcome.handshake_ok());
}

#[tokio::test]
async fn ssl2_server_hello_counts_as_supported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (cert, _) = self_signed();
    let der = cert.to_der().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut hello = [0u8; 2];
        socket.read_exact(&mut hello).await.unwrap();
        let len = (((hello[0] & 0x7f) as usize) << 8) | hello[1] as usize;
        let mut body = vec![0u8; len];
        socket.read_exact(&mut body).await.unwrap();

        // SERVER-HELLO: no session hit, X.509 cert, version 2, one cipher spec.
        let cipher = [0x01u8, 0x00, 0x80];
        let connection_id = [0x42u8; 16];
        let mut msg = vec![4, 0, 1, 0x00, 0x02];
        msg.extend_from_slice(&(der.len() as u16).to_be_bytes());
        msg.extend_from_slice(&(cipher.len() as u16).to_be_bytes());
        msg.extend_from_slice(&(connection_id.len() as u16).to_be_bytes());
        msg.extend_from_slice(&der);
        msg.extend_from_slice(&cipher);
        msg.extend_from_slice(&connection_id);
        let mut record = vec![0x80 | (msg.len() >> 8) as u8, msg.len() as u8];
        record.extend_from_slice(&msg);
        socket.write_all(&record).await.unwrap();
    });

    let prober = Ssl2Prober::new(settings(), Arc::new(PlatformTrustStore::new().unwrap()));
    let outcome = prober.probe(&target(addr), ProtocolVersion::Ssl2).await;
    assert!(outcome.handshake_ok(), "{:?}", outcome.error_message());
    assert_eq!(outcome.selected_cipher(), Some("SSL_CK_RC4_128_WITH_MD5"));
    let peer = outcome.peer();
    assert!(peer.certificate.is_some());
    assert!(peer.host_name_matches_certificate);
    assert!(!peer.chain_trusted_by_platform);
}

#[tokio::test]
async fn pinned_versions_against_tls12_only_server() {
    let addr = tls12_server().await;
    let prober = OpenSslProber::new(settings(), Arc::new(PlatformTrustStore::new().unwrap()));

    let ok = prober.probe(&target(addr), ProtocolVersion::Tls1_2).await;
    assert!(ok.handshake_ok(), "{:?}", ok.error_message());
    assert!(ok.selected_cipher().is_some());
    assert!(ok.peer().host_name_matches_certificate);
    assert!(!ok.peer().chain_trusted_by_platform);

    let newer = prober.probe(&target(addr), ProtocolVersion::Tls1_3).await;
    assert!(newer.connect_ok());
    assert!(!newer.handshake_ok());

    let mismatch = prober
        .probe(
            &ProbeTarget {
                addr,
                server_name: "www.example.be".into(),
            },
            ProtocolVersion::Tls1_2,
        )
        .await;
    assert!(mismatch.handshake_ok());
    assert!(!mismatch.peer().host_name_matches_certificate);
}

#[tokio::test]
async fn crawl_scans_then_caches_per_ip() {
    let addr = tls12_server().await;
    let prober = PlatformProber::with_platform_trust(settings()).unwrap();
    let cache = Arc::new(ScanResultCache::with_default_settings());
    let crawler = TlsCrawler::new(Arc::new(prober), cache.clone(), CrawlerOptions::default());

    let visit = VisitRequest {
        visit_id: "v-1".into(),
        domain_name: "localhost".into(),
    };
    let result = crawler.crawl_address(&visit, addr).await;
    assert_eq!(result.source, ResultSource::Scan);
    assert!(result.host_name_matches_certificate);
    assert!(!result.chain_trusted_by_platform);
    assert!(matches!(
        result.certificate,
        CertificateStatus::Observed {
            expired: false,
            too_soon: false,
            ..
        }
    ));
    let record = result.full_scan.unwrap();
    assert_eq!(record.lowest_version_supported, Some(ProtocolVersion::Tls1_2));
    assert_eq!(record.highest_version_supported, Some(ProtocolVersion::Tls1_2));
    assert!(!record.versions[&ProtocolVersion::Ssl2].supported);

    assert_eq!(cache.size(), 1);
    let stats = cache.entry_stats(addr.ip()).unwrap();
    assert_eq!(stats.results_in_majority, 1);
}
