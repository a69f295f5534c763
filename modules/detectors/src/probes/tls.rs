//! TLS handshake inspection on rustls: protocol, cipher, and the leaf
//! certificate as x509-parser reads it.

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::DetectorError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertSummary {
    pub subject_cn: Option<String>,
    pub issuer_cn: Option<String>,
    pub not_before_ms: i64,
    pub not_after_ms: i64,
    pub dns_names: Vec<String>,
    pub self_signed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsReport {
    pub protocol: Option<String>,
    pub cipher: Option<String>,
    pub alpn: Option<String>,
    pub certificate: Option<CertSummary>,
    /// Why the chain failed verification against the web PKI roots.
    pub verify_error: Option<String>,
    /// Set when no handshake completed at all.
    pub handshake_error: Option<String>,
}

#[async_trait]
pub trait TlsInspector: Send + Sync {
    async fn inspect(&self, host: &str, port: u16) -> Result<TlsReport, DetectorError>;
}

/// Accepts any chain so the certificate of a failing site can still be read.
/// Signatures are still checked.
#[derive(Debug)]
struct CaptureVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for CaptureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub struct RustlsInspector {
    verified: Arc<ClientConfig>,
    capture: Arc<ClientConfig>,
    timeout: Duration,
}

impl RustlsInspector {
    pub fn new(timeout: Duration) -> Self {
        let _ = CryptoProvider::install_default(rustls::crypto::ring::default_provider());
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let verified = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        let capture = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CaptureVerifier(provider)))
            .with_no_client_auth();
        RustlsInspector { verified: Arc::new(verified), capture: Arc::new(capture), timeout }
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, DetectorError> {
        let addrs: Vec<std::net::SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| DetectorError::Transient(format!("resolve {host}: {e}")))?
            .collect();
        if let Some(bad) = addrs.iter().find(|a| target_policy::is_blocked_ip(a.ip())) {
            return Err(DetectorError::Fatal(format!("{host} resolves to blocked address {}", bad.ip())));
        }
        let addr = addrs.first().ok_or_else(|| DetectorError::Transient(format!("{host}: no addresses")))?;
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => Ok(s),
            Ok(Err(e)) => Err(DetectorError::Transient(format!("connect {host}:{port}: {e}"))),
            Err(_) => Err(DetectorError::Transient(format!("connect {host}:{port}: timed out"))),
        }
    }

    async fn handshake(&self, config: Arc<ClientConfig>, host: &str, port: u16) -> Result<Result<TlsReport, String>, DetectorError> {
        let stream = self.connect(host, port).await?;
        let server_name = match host.parse::<std::net::IpAddr>() {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(host.to_owned()).map_err(|_| DetectorError::Fatal(format!("invalid server name {host}")))?,
        };
        let connector = TlsConnector::from(config);
        let tls = match timeout(self.timeout, connector.connect(server_name, stream)).await {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => return Ok(Err(e.to_string())),
            Err(_) => return Err(DetectorError::Transient(format!("tls handshake with {host} timed out"))),
        };
        let conn = tls.get_ref().1;
        Ok(Ok(TlsReport {
            protocol: conn.protocol_version().map(|v| format!("{v:?}")),
            cipher: conn.negotiated_cipher_suite().map(|c| format!("{:?}", c.suite())),
            alpn: conn.alpn_protocol().map(|v| String::from_utf8_lossy(v).into_owned()),
            certificate: conn.peer_certificates().and_then(|c| c.first()).and_then(|c| summarize(c.as_ref())),
            verify_error: None,
            handshake_error: None,
        }))
    }
}

pub fn summarize(der: &[u8]) -> Option<CertSummary> {
    use x509_parser::prelude::*;
    let (_, x509) = X509Certificate::from_der(der).ok()?;
    let cn = |name: &X509Name<'_>| name.iter_common_name().next().and_then(|cn| cn.as_str().ok()).map(str::to_string);
    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = x509.subject_alternative_name() {
        for gn in &san.value.general_names {
            if let GeneralName::DNSName(n) = gn {
                dns_names.push(n.to_ascii_lowercase());
            }
        }
    }
    Some(CertSummary {
        subject_cn: cn(x509.subject()),
        issuer_cn: cn(x509.issuer()),
        not_before_ms: x509.validity().not_before.timestamp() * 1000,
        not_after_ms: x509.validity().not_after.timestamp() * 1000,
        dns_names,
        self_signed: x509.subject().to_string() == x509.issuer().to_string(),
    })
}

#[async_trait]
impl TlsInspector for RustlsInspector {
    async fn inspect(&self, host: &str, port: u16) -> Result<TlsReport, DetectorError> {
        match self.handshake(self.verified.clone(), host, port).await? {
            Ok(report) => Ok(report),
            Err(verify_error) => match self.handshake(self.capture.clone(), host, port).await? {
                Ok(mut report) => {
                    report.verify_error = Some(verify_error);
                    Ok(report)
                }
                Err(handshake_error) => Ok(TlsReport { handshake_error: Some(handshake_error), ..TlsReport::default() }),
            },
        }
    }
}

/// Canned report, for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticTls {
    pub report: Option<TlsReport>,
}

impl StaticTls {
    pub fn new(report: TlsReport) -> Self {
        StaticTls { report: Some(report) }
    }
}

#[async_trait]
impl TlsInspector for StaticTls {
    async fn inspect(&self, host: &str, _port: u16) -> Result<TlsReport, DetectorError> {
        self.report.clone().ok_or_else(|| DetectorError::Transient(format!("connect {host}: refused")))
    }
}
