//! ACME protocol adapter
//!
//! Drives the external ACME client through order creation, proof of domain
//! control, finalization and artifact persistence. The proof method is
//! selected from configuration: DNS-01 runs through the manual challenge
//! registry (operator-paced), HTTP-01 through the token store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::dns::{ChallengeRegistry, DnsChallengeStatus};
use crate::error::{classify_protocol_error, AcmeError};
use crate::http::Http01Challenges;
use crate::storage::ArtifactStore;
use crate::{AcmeConfig, ChallengeKind};

/// Window for the CA to validate challenges after they are set ready
const ORDER_READY_TIMEOUT: Duration = Duration::from_secs(120);
/// Window for the CA to issue the certificate after finalization
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a successful protocol exchange
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub domain: String,
    /// Leaf certificate, PEM
    pub cert_pem: String,
    /// Private key, PEM
    pub key_pem: String,
    /// Issuer chain, PEM
    pub chain_pem: String,
    pub cert_path: String,
    pub key_path: String,
    pub chain_path: String,
}

/// Issuance seam between the lifecycle manager and the ACME protocol.
///
/// `obtain` must be safe to call repeatedly for the same domain: every call
/// is a fresh order against the CA.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn obtain(
        &self,
        domain: &str,
        alt_domains: &[String],
    ) -> Result<IssuedCertificate, AcmeError>;
}

/// One authorization's pending proof, collected before presenting
struct PendingProof {
    domain: String,
    token: String,
    key_authorization: String,
    url: String,
}

/// ACME issuer wrapping `instant-acme`
pub struct AcmeIssuer {
    config: AcmeConfig,
    account: RwLock<Option<Account>>,
    dns_challenges: Arc<ChallengeRegistry>,
    http_challenges: Arc<Http01Challenges>,
    artifacts: ArtifactStore,
}

impl AcmeIssuer {
    pub fn new(
        config: AcmeConfig,
        dns_challenges: Arc<ChallengeRegistry>,
        http_challenges: Arc<Http01Challenges>,
    ) -> Self {
        let artifacts = ArtifactStore::new(config.storage_root.clone());
        Self {
            config,
            account: RwLock::new(None),
            dns_challenges,
            http_challenges,
            artifacts,
        }
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Load the ACME account from stored credentials or register a new one.
    ///
    /// Called once at startup; the account is then shared by every order.
    pub async fn init_account(&self) -> Result<(), AcmeError> {
        if let Some(creds_json) = self.artifacts.load_credentials_json().await? {
            info!("Loading existing ACME account from storage");

            let credentials: instant_acme::AccountCredentials = serde_json::from_str(&creds_json)
                .map_err(|e| {
                    AcmeError::AccountCreation(format!("Failed to deserialize credentials: {e}"))
                })?;

            let account = Account::builder()
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
                .from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

            *self.account.write().await = Some(account);
            info!("ACME account loaded");
            return Ok(());
        }

        info!(
            email = %self.config.contact_email,
            directory = %self.config.directory_url,
            "Creating new ACME account"
        );

        let (account, credentials) = Account::builder()
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
            .create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", self.config.contact_email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.config.directory_url.clone(),
                None,
            )
            .await
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

        let creds_json = serde_json::to_string_pretty(&credentials).map_err(|e| {
            AcmeError::AccountCreation(format!("Failed to serialize credentials: {e}"))
        })?;
        self.artifacts.save_credentials_json(&creds_json).await?;

        *self.account.write().await = Some(account);
        info!("ACME account created");

        Ok(())
    }

    /// Walk the order's authorizations and collect the proof each pending
    /// one requires for the configured challenge type
    async fn collect_proofs(&self, order: &mut Order) -> Result<Vec<PendingProof>, AcmeError> {
        let wanted = match self.config.challenge_kind {
            ChallengeKind::Http01 => ChallengeType::Http01,
            ChallengeKind::Dns01 => ChallengeType::Dns01,
        };

        let mut proofs = Vec::new();
        let mut authorizations = order.authorizations();

        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| {
                AcmeError::OrderCreation(format!("Failed to get authorization: {e}"))
            })?;

            let domain = match &authz.identifier().identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => continue,
            };

            debug!(domain = %domain, status = ?authz.status, "Processing authorization");

            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz.challenge(wanted.clone()).ok_or_else(|| {
                AcmeError::ChallengeFailed {
                    domain: domain.clone(),
                    message: format!("CA offered no {} challenge", self.config.challenge_kind),
                }
            })?;

            let key_authorization = challenge.key_authorization();

            proofs.push(PendingProof {
                domain,
                token: challenge.token.clone(),
                key_authorization: key_authorization.as_str().to_string(),
                url: challenge.url.clone(),
            });
        }

        Ok(proofs)
    }

    /// Poll the challenge registry until the operator's DNS record appears.
    ///
    /// Lookup failures inside the window are retried; only the window
    /// elapsing fails the proof.
    async fn wait_for_dns_record(&self, domain: &str) -> Result<(), AcmeError> {
        let deadline = tokio::time::Instant::now() + self.config.dns_wait_timeout;

        info!(
            domain = %domain,
            timeout_secs = self.config.dns_wait_timeout.as_secs(),
            "Waiting for manual DNS record"
        );

        loop {
            // An out-of-band verification may already have settled it
            match self.dns_challenges.get(domain) {
                Ok(challenge) if challenge.status == DnsChallengeStatus::Verified => return Ok(()),
                Ok(_) => {}
                Err(err) => {
                    return Err(AcmeError::ChallengeFailed {
                        domain: domain.to_string(),
                        message: err.to_string(),
                    })
                }
            }

            match self.dns_challenges.verify_dns_record(domain).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => {
                    warn!(domain = %domain, error = %err, "DNS lookup failed, retrying");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.dns_challenges.mark_failed(domain);
                return Err(AcmeError::Timeout(format!("DNS record for {domain}")));
            }

            tokio::time::sleep(self.config.dns_poll_interval).await;
        }
    }

    /// Notify the CA that the challenge behind `challenge_url` is ready
    async fn set_challenge_ready(
        &self,
        order: &mut Order,
        challenge_url: &str,
        domain: &str,
    ) -> Result<(), AcmeError> {
        let mut authorizations = order.authorizations();

        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| AcmeError::ChallengeFailed {
                domain: domain.to_string(),
                message: format!("Failed to get authorization: {e}"),
            })?;

            let matching = authz
                .challenges
                .iter()
                .find(|c| c.url == challenge_url)
                .map(|c| c.r#type.clone());

            if let Some(challenge_type) = matching {
                if let Some(mut challenge) = authz.challenge(challenge_type) {
                    challenge
                        .set_ready()
                        .await
                        .map_err(|e| classify_protocol_error(domain, e))?;
                    return Ok(());
                }
            }
        }

        Err(AcmeError::ChallengeFailed {
            domain: domain.to_string(),
            message: format!("Challenge not found for URL: {challenge_url}"),
        })
    }

    /// Poll until every challenge is validated and the order is ready
    async fn wait_for_order_ready(&self, order: &mut Order, domain: &str) -> Result<(), AcmeError> {
        let deadline = tokio::time::Instant::now() + ORDER_READY_TIMEOUT;

        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| classify_protocol_error(domain, e))?;

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(AcmeError::ValidationRejected {
                        domain: domain.to_string(),
                        message: "Order became invalid during validation".to_string(),
                    })
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout("order readiness".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// Submit a CSR and download the issued chain; returns (chain, key) PEM
    async fn finalize(
        &self,
        order: &mut Order,
        domains: &[String],
    ) -> Result<(String, String), AcmeError> {
        let domain = &domains[0];

        let cert_key = rcgen::KeyPair::generate()
            .map_err(|e| AcmeError::Finalization(format!("Failed to generate key: {e}")))?;

        let params = rcgen::CertificateParams::new(domains.to_vec())
            .map_err(|e| AcmeError::Finalization(format!("Failed to create CSR params: {e}")))?;

        let csr_request = params
            .serialize_request(&cert_key)
            .map_err(|e| AcmeError::Finalization(format!("Failed to serialize CSR: {e}")))?;
        let csr = csr_request.der().to_vec();

        order
            .finalize_csr(&csr)
            .await
            .map_err(|e| classify_protocol_error(domain, e))?;

        let deadline = tokio::time::Instant::now() + FINALIZE_TIMEOUT;
        let cert_chain = loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| classify_protocol_error(domain, e))?;

            match state.status {
                OrderStatus::Valid => {
                    let chain = order
                        .certificate()
                        .await
                        .map_err(|e| classify_protocol_error(domain, e))?;
                    break chain.ok_or_else(|| {
                        AcmeError::Finalization("No certificate in response".to_string())
                    })?;
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::Finalization("Order became invalid".to_string()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout("certificate issuance".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        Ok((cert_chain, cert_key.serialize_pem()))
    }

    /// Run one full order: proofs, validation, finalization
    async fn run_order(
        &self,
        domains: &[String],
        presented: &mut Vec<PendingProof>,
    ) -> Result<(String, String), AcmeError> {
        let domain = &domains[0];

        let account_guard = self.account.read().await;
        let account = account_guard.as_ref().ok_or(AcmeError::NoAccount)?;

        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| classify_protocol_error(domain, e))?;

        let proofs = self.collect_proofs(&mut order).await?;

        for proof in proofs {
            match self.config.challenge_kind {
                ChallengeKind::Dns01 => {
                    self.dns_challenges
                        .present(&proof.domain, &proof.token, &proof.key_authorization)
                }
                ChallengeKind::Http01 => {
                    self.http_challenges
                        .insert(&proof.token, &proof.key_authorization)
                }
            }
            presented.push(proof);
        }

        // DNS proofs are operator-paced; wait for each record before
        // signalling readiness to the CA
        if self.config.challenge_kind == ChallengeKind::Dns01 {
            for proof in presented.iter() {
                self.wait_for_dns_record(&proof.domain).await?;
            }
        }

        for proof in presented.iter() {
            self.set_challenge_ready(&mut order, &proof.url, &proof.domain)
                .await?;
        }

        self.wait_for_order_ready(&mut order, domain).await?;

        self.finalize(&mut order, domains).await
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn obtain(
        &self,
        domain: &str,
        alt_domains: &[String],
    ) -> Result<IssuedCertificate, AcmeError> {
        let mut domains = Vec::with_capacity(1 + alt_domains.len());
        domains.push(domain.to_string());
        domains.extend(alt_domains.iter().cloned());

        info!(domain = %domain, alt_domains = ?alt_domains, "Starting certificate order");

        let mut presented = Vec::new();
        let result = self.run_order(&domains, &mut presented).await;

        // Proof records are removed when the exchange concludes, success
        // or failure
        for proof in &presented {
            match self.config.challenge_kind {
                ChallengeKind::Dns01 => self.dns_challenges.clean_up(&proof.domain),
                ChallengeKind::Http01 => self.http_challenges.remove(&proof.token),
            }
        }

        let (chain_pem, key_pem) = result?;
        let (cert_pem, issuer_pem) = split_chain(&chain_pem)?;

        let saved = self
            .artifacts
            .save(domain, &cert_pem, &key_pem, &issuer_pem)
            .await?;

        info!(domain = %domain, "Certificate issued");

        Ok(IssuedCertificate {
            domain: domain.to_string(),
            cert_pem,
            key_pem,
            chain_pem: issuer_pem,
            cert_path: saved.cert_path,
            key_path: saved.key_path,
            chain_path: saved.chain_path,
        })
    }
}

const PEM_CERT_BEGIN: &str = "-----BEGIN CERTIFICATE-----";

/// Split a bundled chain into the leaf certificate and the issuer chain
fn split_chain(bundle: &str) -> Result<(String, String), AcmeError> {
    let first = bundle
        .find(PEM_CERT_BEGIN)
        .ok_or_else(|| AcmeError::CertificateParse("No certificate in bundle".to_string()))?;

    match bundle[first + PEM_CERT_BEGIN.len()..].find(PEM_CERT_BEGIN) {
        Some(offset) => {
            let split_at = first + PEM_CERT_BEGIN.len() + offset;
            Ok((
                bundle[..split_at].trim().to_string(),
                bundle[split_at..].trim().to_string(),
            ))
        }
        None => Ok((bundle.trim().to_string(), String::new())),
    }
}
