//! Error taxonomy for the ACME adapter and the challenge registry

use thiserror::Error;

/// Challenge registry errors
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("No DNS challenge found for domain: {0}")]
    NotFound(String),

    #[error("DNS lookup failed: {0}")]
    Lookup(String),
}

/// ACME protocol errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME account not initialized")]
    NoAccount,

    #[error("Account creation failed: {0}")]
    AccountCreation(String),

    #[error("Order creation failed: {0}")]
    OrderCreation(String),

    #[error("Challenge failed for {domain}: {message}")]
    ChallengeFailed { domain: String, message: String },

    #[error("Rate limited by the CA: {0}")]
    RateLimited(String),

    #[error("Domain validation rejected for {domain}: {message}")]
    ValidationRejected { domain: String, message: String },

    #[error("CA policy violation: {0}")]
    PolicyViolation(String),

    #[error("Certificate finalization failed: {0}")]
    Finalization(String),

    #[error("Certificate parse error: {0}")]
    CertificateParse(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Challenge(#[from] ChallengeError),
}

impl AcmeError {
    /// Whether the failure is safe to retry on the next scheduled sweep.
    ///
    /// Transient failures come from the transport or CA load; permanent
    /// ones mean the CA rejected the request itself and retrying without
    /// operator action will fail the same way.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AcmeError::RateLimited(_)
                | AcmeError::Transport(_)
                | AcmeError::Timeout(_)
                | AcmeError::Io(_)
                | AcmeError::Challenge(ChallengeError::Lookup(_))
        )
    }
}

/// Map an `instant_acme` failure into the local taxonomy.
///
/// CA problem documents carry an RFC 7807 urn in `type`; everything that is
/// not an API-level problem is treated as transport.
pub(crate) fn classify_protocol_error(domain: &str, err: instant_acme::Error) -> AcmeError {
    match err {
        instant_acme::Error::Api(problem) => {
            let kind = problem.r#type.clone().unwrap_or_default();
            let detail = problem
                .detail
                .clone()
                .unwrap_or_else(|| problem.to_string());

            if kind.ends_with("rateLimited") {
                AcmeError::RateLimited(detail)
            } else if kind.ends_with("rejectedIdentifier")
                || kind.ends_with("unauthorized")
                || kind.ends_with("caa")
                || kind.ends_with("dns")
            {
                AcmeError::ValidationRejected {
                    domain: domain.to_string(),
                    message: detail,
                }
            } else if kind.ends_with("malformed")
                || kind.ends_with("externalAccountRequired")
                || kind.ends_with("userActionRequired")
            {
                AcmeError::PolicyViolation(detail)
            } else {
                AcmeError::OrderCreation(detail)
            }
        }
        other => AcmeError::Transport(other.to_string()),
    }
}
