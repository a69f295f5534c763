//! Network seams other than HTTP: DNS records and TLS handshakes.

mod dns;
mod tls;

pub use dns::{DnsLookup, HickoryLookup, RecordKind, StaticDns};
pub use tls::{summarize, CertSummary, RustlsInspector, StaticTls, TlsInspector, TlsReport};
