use async_trait::async_trait;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioResolver;
use std::collections::HashMap;

use crate::DetectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    A,
    Txt,
    Mx,
    Ns,
    Caa,
    Cname,
    Dnskey,
}

impl RecordKind {
    fn record_type(self) -> RecordType {
        match self {
            RecordKind::A => RecordType::A,
            RecordKind::Txt => RecordType::TXT,
            RecordKind::Mx => RecordType::MX,
            RecordKind::Ns => RecordType::NS,
            RecordKind::Caa => RecordType::CAA,
            RecordKind::Cname => RecordType::CNAME,
            RecordKind::Dnskey => RecordType::DNSKEY,
        }
    }
}

/// Record lookups as text. A name with no records of the kind, or no name at
/// all, is an empty list; only resolver trouble is an error.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn records(&self, name: &str, kind: RecordKind) -> Result<Vec<String>, DetectorError>;
}

pub struct HickoryLookup {
    resolver: TokioResolver,
}

impl HickoryLookup {
    pub fn from_system() -> Result<Self, DetectorError> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|e| DetectorError::Fatal(format!("resolver setup: {e}")))?
            .build();
        Ok(HickoryLookup { resolver })
    }
}

fn is_empty_answer(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("no record") || m.contains("nxdomain") || m.contains("no name") || m.contains("no records")
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn records(&self, name: &str, kind: RecordKind) -> Result<Vec<String>, DetectorError> {
        let lookup = match self.resolver.lookup(name, kind.record_type()).await {
            Ok(l) => l,
            Err(e) if is_empty_answer(&e.to_string()) => return Ok(Vec::new()),
            Err(e) => return Err(DetectorError::Transient(format!("{name} {kind:?}: {e}"))),
        };
        let mut out = Vec::new();
        for rdata in lookup.iter() {
            let text = match kind {
                RecordKind::Txt => rdata.as_txt().map(|t| t.iter().map(|d| String::from_utf8_lossy(d).into_owned()).collect::<String>()),
                RecordKind::Cname => rdata.as_cname().map(|c| c.0.to_string()),
                RecordKind::Mx => rdata.as_mx().map(|m| m.exchange().to_string()),
                _ => Some(rdata.to_string()),
            };
            if let Some(t) = text {
                out.push(t.trim_end_matches('.').to_string());
            }
        }
        Ok(out)
    }
}

/// Fixed answers, keyed by lowercased name and kind.
#[derive(Debug, Default, Clone)]
pub struct StaticDns {
    answers: HashMap<(String, RecordKind), Vec<String>>,
    failing: Vec<String>,
}

impl StaticDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, kind: RecordKind, values: &[&str]) -> Self {
        self.answers.insert((name.to_ascii_lowercase(), kind), values.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Every lookup of `name` fails as a resolver timeout would.
    pub fn failing(mut self, name: &str) -> Self {
        self.failing.push(name.to_ascii_lowercase());
        self
    }
}

#[async_trait]
impl DnsLookup for StaticDns {
    async fn records(&self, name: &str, kind: RecordKind) -> Result<Vec<String>, DetectorError> {
        let name = name.to_ascii_lowercase();
        if self.failing.contains(&name) {
            return Err(DetectorError::Transient(format!("{name}: resolver timeout")));
        }
        Ok(self.answers.get(&(name, kind)).cloned().unwrap_or_default())
    }
}
