use audit_core::AuditError;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("url does not parse: {0}")]
    Unparseable(String),

    #[error("scheme {0} not allowed")]
    Scheme(String),

    #[error("url longer than {max} characters")]
    TooLong { max: usize },

    #[error("url has no host")]
    MissingHost,

    #[error("url carries credentials")]
    Credentials,

    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("address {0} is not publicly routable")]
    BlockedAddress(IpAddr),

    #[error("reserved top-level domain: {0}")]
    ReservedTld(String),

    #[error("blocked hostname: {0}")]
    BlockedHostname(String),

    #[error("{host} resolves to blocked address {addr}")]
    ResolvesToBlocked { host: String, addr: IpAddr },

    #[error("{0} does not resolve")]
    Unresolvable(String),
}

impl PolicyError {
    /// Short code recorded on the rejected audit.
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::BlockedAddress(_)
            | PolicyError::ReservedTld(_)
            | PolicyError::BlockedHostname(_)
            | PolicyError::ResolvesToBlocked { .. } => "url_blocked",
            PolicyError::Unresolvable(_) => "url_unresolvable",
            _ => "url_invalid",
        }
    }
}

impl From<PolicyError> for AuditError {
    fn from(e: PolicyError) -> Self {
        AuditError::validation(e.code(), e.to_string())
    }
}
