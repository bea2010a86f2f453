//! ACME protocol adapter and domain-ownership-proof challenge registry
//!
//! Wraps the external ACME client, selects the proof method, and owns the
//! in-memory registries the proof workflows run through: the manual DNS-01
//! challenge registry and the HTTP-01 token store.

pub mod dns;
pub mod error;
pub mod http;
pub mod issuer;
pub mod storage;

pub use dns::{ChallengeRegistry, DnsChallenge, DnsChallengeStatus, TxtLookup};
pub use error::{AcmeError, ChallengeError};
pub use http::Http01Challenges;
pub use issuer::{AcmeIssuer, CertificateIssuer, IssuedCertificate};
pub use storage::ArtifactStore;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Active domain-ownership-proof method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Hosted-file proof served from `/.well-known/acme-challenge/`
    Http01,
    /// Manual DNS TXT record proof
    Dns01,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeKind::Http01 => write!(f, "http-01"),
            ChallengeKind::Dns01 => write!(f, "dns-01"),
        }
    }
}

impl FromStr for ChallengeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-01" => Ok(ChallengeKind::Http01),
            "dns-01" => Ok(ChallengeKind::Dns01),
            other => Err(format!("unknown challenge type: {other}")),
        }
    }
}

/// ACME adapter configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// ACME directory URL
    pub directory_url: String,
    /// Contact email registered with the CA
    pub contact_email: String,
    /// Proof method to request from the CA
    pub challenge_kind: ChallengeKind,
    /// Root directory for certificate artifacts and account credentials
    pub storage_root: PathBuf,
    /// Maximum window to wait for a manual DNS record to appear
    pub dns_wait_timeout: Duration,
    /// Interval between DNS record checks inside the window
    pub dns_poll_interval: Duration,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LETSENCRYPT_PRODUCTION.to_string(),
            contact_email: String::new(),
            challenge_kind: ChallengeKind::Http01,
            storage_root: PathBuf::from("./certs"),
            // DNS propagation is operator-paced and can take a long time
            dns_wait_timeout: Duration::from_secs(30 * 60),
            dns_poll_interval: Duration::from_secs(30),
        }
    }
}
