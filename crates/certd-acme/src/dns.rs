//! Manual DNS-01 challenge registry
//!
//! Tracks the TXT record each in-flight DNS-01 authorization is waiting on.
//! `present` stores the expected record; the operator adds it out-of-band
//! and verification checks live DNS until the value appears.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::ChallengeError;

/// Status of a manual DNS challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsChallengeStatus {
    Pending,
    Verified,
    Failed,
}

/// One in-flight DNS-01 challenge
#[derive(Debug, Clone, Serialize)]
pub struct DnsChallenge {
    pub domain: String,
    pub token: String,
    pub key_authorization: String,
    /// Expected TXT record value
    pub value: String,
    /// Record name the TXT entry must live at
    pub fqdn: String,
    pub created_at: DateTime<Utc>,
    pub status: DnsChallengeStatus,
}

/// Compute the TXT record value for a key authorization:
/// base64url (no padding) of its SHA-256 digest
pub fn txt_record_value(key_authorization: &str) -> String {
    let digest = Sha256::digest(key_authorization.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Record name for a domain's DNS-01 challenge
pub fn challenge_fqdn(domain: &str) -> String {
    format!("_acme-challenge.{domain}")
}

/// Seam for TXT lookups so verification is testable without live DNS.
///
/// Returns every TXT string found at the name; an empty list means the
/// record does not exist yet, which is not an error.
#[async_trait]
pub trait TxtLookup: Send + Sync {
    async fn lookup_txt(&self, fqdn: &str) -> Result<Vec<String>, ChallengeError>;
}

/// Live resolver-backed lookup
pub struct ResolverTxtLookup {
    resolver: TokioAsyncResolver,
}

impl ResolverTxtLookup {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for ResolverTxtLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtLookup for ResolverTxtLookup {
    async fn lookup_txt(&self, fqdn: &str) -> Result<Vec<String>, ChallengeError> {
        match self.resolver.txt_lookup(fqdn).await {
            Ok(lookup) => Ok(lookup.iter().map(|txt| txt.to_string()).collect()),
            Err(err) => {
                // Absence of the record is a normal "not yet" answer
                if let ResolveErrorKind::NoRecordsFound { .. } = err.kind() {
                    Ok(Vec::new())
                } else {
                    Err(ChallengeError::Lookup(format!("{fqdn}: {err}")))
                }
            }
        }
    }
}

/// Registry of in-flight manual DNS challenges, keyed by domain.
///
/// One coarse lock guards the map; entries for distinct domains are
/// independent and may be mutated by concurrent issuance tasks.
pub struct ChallengeRegistry {
    challenges: RwLock<HashMap<String, DnsChallenge>>,
    resolver: Arc<dyn TxtLookup>,
}

impl ChallengeRegistry {
    /// Registry with the live DNS resolver
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(ResolverTxtLookup::new()))
    }

    /// Registry with a custom lookup implementation
    pub fn with_resolver(resolver: Arc<dyn TxtLookup>) -> Self {
        Self {
            challenges: RwLock::new(HashMap::new()),
            resolver,
        }
    }

    /// Store the challenge for a domain, replacing any prior entry.
    ///
    /// Computes the record name and expected TXT value; no network action
    /// is taken, the operator adds the record out-of-band.
    pub fn present(&self, domain: &str, token: &str, key_authorization: &str) {
        let challenge = DnsChallenge {
            domain: domain.to_string(),
            token: token.to_string(),
            key_authorization: key_authorization.to_string(),
            value: txt_record_value(key_authorization),
            fqdn: challenge_fqdn(domain),
            created_at: Utc::now(),
            status: DnsChallengeStatus::Pending,
        };

        info!(
            domain = %domain,
            fqdn = %challenge.fqdn,
            value = %challenge.value,
            "DNS challenge presented"
        );

        self.challenges
            .write()
            .unwrap()
            .insert(domain.to_string(), challenge);
    }

    /// Remove the challenge for a domain, regardless of its outcome
    pub fn clean_up(&self, domain: &str) {
        if self.challenges.write().unwrap().remove(domain).is_some() {
            info!(domain = %domain, "DNS challenge cleaned up");
        }
    }

    pub fn get(&self, domain: &str) -> Result<DnsChallenge, ChallengeError> {
        self.challenges
            .read()
            .unwrap()
            .get(domain)
            .cloned()
            .ok_or_else(|| ChallengeError::NotFound(domain.to_string()))
    }

    pub fn get_all(&self) -> Vec<DnsChallenge> {
        self.challenges.read().unwrap().values().cloned().collect()
    }

    /// Human-readable instructions for configuring the TXT record
    pub fn dns_instructions(&self, domain: &str) -> Result<String, ChallengeError> {
        let challenge = self.get(domain)?;

        Ok(format!(
            "Add the following TXT record in your DNS provider's control panel:\n\
             \n\
             Record type:  TXT\n\
             Record name:  {fqdn}\n\
             Record value: {value}\n\
             TTL:          600 (or your provider's default)\n\
             \n\
             DNS changes can take from a few minutes up to a few hours to\n\
             propagate. Once the record is in place, trigger DNS verification\n\
             for {domain} to continue issuance.",
            fqdn = challenge.fqdn,
            value = challenge.value,
            domain = domain,
        ))
    }

    /// Check live DNS for the expected TXT value.
    ///
    /// Returns `true` and marks the challenge verified when some returned
    /// value, trimmed, equals the expected value exactly. A missing or
    /// mismatched record returns `false` without marking the challenge
    /// failed; only a failed lookup is an error.
    pub async fn verify_dns_record(&self, domain: &str) -> Result<bool, ChallengeError> {
        let challenge = self.get(domain)?;

        let records = match self.resolver.lookup_txt(&challenge.fqdn).await {
            Ok(records) => records,
            Err(err) => {
                warn!(domain = %domain, fqdn = %challenge.fqdn, error = %err, "DNS record verification failed");
                return Err(err);
            }
        };

        let matched = records.iter().any(|record| record.trim() == challenge.value);

        if matched {
            self.mark_verified(domain);
            info!(domain = %domain, fqdn = %challenge.fqdn, "DNS record verified");
        } else {
            debug!(
                domain = %domain,
                fqdn = %challenge.fqdn,
                expected = %challenge.value,
                found = records.len(),
                "DNS record not found or incorrect"
            );
        }

        Ok(matched)
    }

    fn mark_verified(&self, domain: &str) {
        if let Some(challenge) = self.challenges.write().unwrap().get_mut(domain) {
            challenge.status = DnsChallengeStatus::Verified;
        }
    }

    /// Mark a challenge failed (e.g. when the proof window elapses)
    pub fn mark_failed(&self, domain: &str) {
        if let Some(challenge) = self.challenges.write().unwrap().get_mut(domain) {
            challenge.status = DnsChallengeStatus::Failed;
            info!(domain = %domain, "DNS challenge marked as failed");
        }
    }
}

impl Default for ChallengeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
