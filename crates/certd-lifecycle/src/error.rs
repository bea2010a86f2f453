//! Service-level error taxonomy
//!
//! Validation errors are surfaced synchronously to the caller and never
//! retried; protocol failures are recorded on the certificate record by
//! the asynchronous exchange task instead.

use certd_acme::ChallengeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate for this domain already exists")]
    DuplicateDomain,

    #[error("certificate not found")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("invalid certificate state: {0}")]
    InvalidState(String),

    #[error("a renewal for this certificate is already in flight")]
    RenewalInProgress,

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("DNS challenges are only available for the dns-01 challenge type")]
    DnsChallengesUnavailable,

    #[error("unknown task name: {0}")]
    UnknownTask(String),

    #[error("certificate parse error: {0}")]
    CertificateParse(String),

    #[error(transparent)]
    Db(#[from] sea_orm::DbErr),

    #[error(transparent)]
    Challenge(#[from] ChallengeError),
}
