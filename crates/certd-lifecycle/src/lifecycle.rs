//! Certificate lifecycle manager
//!
//! Exclusive owner of certificate record mutation. Create/renew/delete are
//! synchronous and validate up front; the protocol exchange itself runs as
//! a fire-and-forget background task whose outcome is observable by
//! re-reading the record. Renewals pass through a conditional claim so a
//! manual trigger and the scheduler can never run duplicate exchanges for
//! one domain.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use certd_acme::{CertificateIssuer, ChallengeKind, ChallengeRegistry, DnsChallenge};
use certd_db::certificate::{self, CertStatus};
use certd_db::store::{CertificateStore, IssuedUpdate, NewCertificate};

use crate::error::CertError;
use crate::tasks::TaskTracker;

/// Default days-before-expiry renewal threshold
pub const DEFAULT_RENEW_DAYS: i32 = 30;

/// Parameters of a certificate creation request
#[derive(Debug, Clone)]
pub struct CreateCertificateRequest {
    pub domain: String,
    pub alt_domains: Vec<String>,
    pub auto_renew: bool,
    pub renew_days: i32,
}

/// Certificate lifecycle manager
pub struct LifecycleManager {
    store: CertificateStore,
    issuer: Arc<dyn CertificateIssuer>,
    challenge_kind: ChallengeKind,
    dns_challenges: Arc<ChallengeRegistry>,
    tasks: TaskTracker,
}

impl LifecycleManager {
    pub fn new(
        store: CertificateStore,
        issuer: Arc<dyn CertificateIssuer>,
        challenge_kind: ChallengeKind,
        dns_challenges: Arc<ChallengeRegistry>,
    ) -> Self {
        Self {
            store,
            issuer,
            challenge_kind,
            dns_challenges,
            tasks: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Number of protocol exchanges currently in flight
    pub fn in_flight_tasks(&self) -> usize {
        self.tasks.active_count()
    }

    /// Create a `pending` record and start the issuance exchange.
    ///
    /// Returns immediately; progress is observed by re-reading the record.
    pub async fn create_certificate(
        &self,
        user_id: i64,
        req: CreateCertificateRequest,
    ) -> Result<certificate::Model, CertError> {
        validate_domain(&req.domain)?;
        for alt in &req.alt_domains {
            validate_domain(alt)?;
        }

        if self.store.find_by_domain(&req.domain).await?.is_some() {
            return Err(CertError::DuplicateDomain);
        }

        let renew_days = if req.renew_days > 0 {
            req.renew_days
        } else {
            DEFAULT_RENEW_DAYS
        };

        let alt_domains = if req.alt_domains.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&req.alt_domains).map_err(|e| {
                CertError::InvalidDomain(format!("unserializable alternate domains: {e}"))
            })?)
        };

        info!(
            user_id,
            domain = %req.domain,
            alt_domains = ?req.alt_domains,
            "Creating certificate"
        );

        let created = self
            .store
            .insert(NewCertificate {
                user_id,
                domain: req.domain,
                alt_domains,
                auto_renew: req.auto_renew,
                renew_days,
            })
            .await?;

        self.spawn_exchange(&created, false);

        Ok(created)
    }

    /// Fetch a record, enforcing ownership
    pub async fn get_certificate(
        &self,
        id: i32,
        user_id: i64,
    ) -> Result<certificate::Model, CertError> {
        let cert = self.store.find_by_id(id).await?.ok_or(CertError::NotFound)?;
        if cert.user_id != user_id {
            return Err(CertError::AccessDenied);
        }
        Ok(cert)
    }

    pub async fn list_certificates(
        &self,
        user_id: i64,
    ) -> Result<Vec<certificate::Model>, CertError> {
        Ok(self.store.find_by_user(user_id).await?)
    }

    /// Start a renewal exchange for an issued certificate.
    ///
    /// Claims the record before starting; a concurrent trigger that loses
    /// the claim fails closed with `RenewalInProgress`.
    pub async fn renew_certificate(&self, id: i32, user_id: i64) -> Result<(), CertError> {
        let cert = self.get_certificate(id, user_id).await?;

        if cert.status != CertStatus::Issued {
            return Err(CertError::InvalidState(
                "certificate is not in issued status".to_string(),
            ));
        }

        if !self.store.claim_renewal(cert.id, CertStatus::Issued).await? {
            return Err(CertError::RenewalInProgress);
        }

        info!(cert_id = id, domain = %cert.domain, "Starting certificate renewal");
        self.spawn_exchange(&cert, true);

        Ok(())
    }

    /// Scheduler entry point: claim and renew a due certificate.
    ///
    /// The claim is keyed on the status the sweep observed (`issued` or
    /// `error`); returns `false` when a concurrent actor already holds it.
    pub async fn renew_due_certificate(
        &self,
        cert: &certificate::Model,
    ) -> Result<bool, CertError> {
        if !self
            .store
            .claim_renewal(cert.id, cert.status.clone())
            .await?
        {
            debug!(cert_id = cert.id, domain = %cert.domain, "Skipping renewal, claim already held");
            return Ok(false);
        }

        info!(cert_id = cert.id, domain = %cert.domain, "Auto-renewing certificate");
        self.spawn_exchange(cert, true);
        Ok(true)
    }

    /// Soft-delete a record.
    ///
    /// An in-flight exchange for the domain is not cancelled; its artifacts
    /// are reaped by the cleanup sweep once the record is gone.
    pub async fn delete_certificate(&self, id: i32, user_id: i64) -> Result<(), CertError> {
        let cert = self.get_certificate(id, user_id).await?;
        self.store.soft_delete(cert.id).await?;
        info!(cert_id = id, domain = %cert.domain, "Certificate deleted");
        Ok(())
    }

    /// Active domain-ownership-proof method
    pub fn challenge_type(&self) -> ChallengeKind {
        self.challenge_kind
    }

    fn require_dns_mode(&self) -> Result<&ChallengeRegistry, CertError> {
        if self.challenge_kind != ChallengeKind::Dns01 {
            return Err(CertError::DnsChallengesUnavailable);
        }
        Ok(&self.dns_challenges)
    }

    pub fn dns_challenge(&self, domain: &str) -> Result<DnsChallenge, CertError> {
        Ok(self.require_dns_mode()?.get(domain)?)
    }

    pub fn all_dns_challenges(&self) -> Result<Vec<DnsChallenge>, CertError> {
        Ok(self.require_dns_mode()?.get_all())
    }

    pub fn dns_instructions(&self, domain: &str) -> Result<String, CertError> {
        Ok(self.require_dns_mode()?.dns_instructions(domain)?)
    }

    pub async fn verify_dns_record(&self, domain: &str) -> Result<bool, CertError> {
        Ok(self.require_dns_mode()?.verify_dns_record(domain).await?)
    }

    /// Start the asynchronous exchange task for a record
    fn spawn_exchange(&self, cert: &certificate::Model, renewal: bool) {
        let store = self.store.clone();
        let issuer = self.issuer.clone();
        let cert_id = cert.id;
        let domain = cert.domain.clone();
        let alt_domains = cert.alt_domain_list();
        let renew_days = cert.renew_days;

        let handle = tokio::spawn(async move {
            run_exchange(store, issuer, cert_id, &domain, &alt_domains, renew_days, renewal).await;
        });
        self.tasks.register(cert.domain.clone(), handle);
    }
}

/// One protocol exchange: obtain, parse validity, record the outcome.
///
/// Failures are recorded on the record and retried only by the next
/// scheduled sweep; there is no in-task retry.
async fn run_exchange(
    store: CertificateStore,
    issuer: Arc<dyn CertificateIssuer>,
    cert_id: i32,
    domain: &str,
    alt_domains: &[String],
    renew_days: i32,
    renewal: bool,
) {
    info!(cert_id, domain = %domain, renewal, "Starting certificate exchange");

    let issued = match issuer.obtain(domain, alt_domains).await {
        Ok(issued) => issued,
        Err(err) => {
            error!(
                cert_id,
                domain = %domain,
                transient = err.is_transient(),
                error = %err,
                "Certificate exchange failed"
            );
            record_failure(&store, cert_id, &err.to_string()).await;
            return;
        }
    };

    let (issued_at, expires_at) = match parse_certificate_validity(&issued.cert_pem) {
        Ok(bounds) => bounds,
        Err(err) => {
            error!(cert_id, domain = %domain, error = %err, "Failed to parse issued certificate");
            record_failure(&store, cert_id, &err.to_string()).await;
            return;
        }
    };

    let next_renew_at = expires_at - Duration::days(renew_days as i64);

    let update = IssuedUpdate {
        cert_path: issued.cert_path,
        key_path: issued.key_path,
        chain_path: issued.chain_path,
        issued_at,
        expires_at,
        next_renew_at,
        renewal,
    };

    // A persistence failure here leaves valid artifacts on disk with a
    // stale record; surfaced in logs rather than silently corrected.
    if let Err(err) = store.mark_issued(cert_id, update).await {
        error!(cert_id, domain = %domain, error = %err, "Failed to record issued certificate");
        return;
    }

    info!(
        cert_id,
        domain = %domain,
        expires_at = %expires_at,
        "Certificate issued and recorded"
    );
}

async fn record_failure(store: &CertificateStore, cert_id: i32, message: &str) {
    if let Err(err) = store.mark_failed(cert_id, message).await {
        error!(cert_id, error = %err, "Failed to record exchange failure");
    }
}

/// Extract the validity bounds from a PEM leaf certificate
fn parse_certificate_validity(cert_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), CertError> {
    use x509_parser::prelude::*;

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CertError::CertificateParse(format!("failed to parse PEM: {e}")))?;

    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| CertError::CertificateParse(format!("failed to parse certificate: {e}")))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| CertError::CertificateParse("invalid notBefore timestamp".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| CertError::CertificateParse("invalid notAfter timestamp".to_string()))?;

    Ok((not_before, not_after))
}

/// Basic domain shape validation; full validation belongs to the CA
fn validate_domain(domain: &str) -> Result<(), CertError> {
    if domain.is_empty() {
        return Err(CertError::InvalidDomain("domain cannot be empty".to_string()));
    }
    if domain.contains(' ') {
        return Err(CertError::InvalidDomain(
            "domain cannot contain spaces".to_string(),
        ));
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(CertError::InvalidDomain(
            "domain cannot start or end with a dot".to_string(),
        ));
    }
    Ok(())
}
