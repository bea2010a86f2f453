//! Certificate entity tracking one domain's certificate lifecycle

use chrono::{Duration, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a certificate record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum CertStatus {
    /// Issuance requested, protocol exchange not finished yet
    #[sea_orm(string_value = "pending")]
    Pending,

    /// Certificate issued and valid
    #[sea_orm(string_value = "issued")]
    Issued,

    /// A renewal exchange has been claimed and is in flight
    #[sea_orm(string_value = "renewing")]
    Renewing,

    /// Last issuance or renewal attempt failed
    #[sea_orm(string_value = "error")]
    Error,

    /// Certificate passed its expiry date
    #[sea_orm(string_value = "expired")]
    Expired,

    /// Certificate revoked
    #[sea_orm(string_value = "revoked")]
    Revoked,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "certificates")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Owning user
    #[sea_orm(indexed)]
    pub user_id: i64,

    /// Primary domain; one active record per domain
    #[sea_orm(indexed)]
    pub domain: String,

    /// Alternate domains as a JSON array string
    #[sea_orm(column_type = "Text", nullable)]
    pub alt_domains: Option<String>,

    pub status: CertStatus,

    /// Path to the leaf certificate file
    pub cert_path: Option<String>,

    /// Path to the private key file
    pub key_path: Option<String>,

    /// Path to the issuer chain file
    pub chain_path: Option<String>,

    pub issued_at: Option<ChronoDateTimeUtc>,
    pub expires_at: Option<ChronoDateTimeUtc>,

    /// Whether the scheduler may renew this certificate automatically
    pub auto_renew: bool,

    /// Days before expiry at which renewal becomes eligible
    pub renew_days: i32,

    pub last_renew_at: Option<ChronoDateTimeUtc>,
    pub next_renew_at: Option<ChronoDateTimeUtc>,

    /// Consecutive failed renewal attempts since the last success
    pub renew_attempts: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,

    /// Soft-delete marker
    pub deleted_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Alternate domains decoded from the JSON column
    pub fn alt_domain_list(&self) -> Vec<String> {
        self.alt_domains
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    /// Whether the expiry date has passed
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }

    /// Whether the certificate is within its renewal window
    pub fn is_expiring_soon(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Utc::now() <= Duration::days(self.renew_days as i64),
            None => false,
        }
    }

    /// Days remaining until expiry, if an expiry is recorded
    pub fn days_until_expiry(&self) -> Option<i64> {
        self.expires_at.map(|expires_at| (expires_at - Utc::now()).num_days())
    }

    /// Renewal policy: auto-renew enabled, currently issued, and inside
    /// the renewal window
    pub fn should_renew(&self) -> bool {
        self.auto_renew && self.status == CertStatus::Issued && self.is_expiring_soon()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cert(status: CertStatus, auto_renew: bool, expires_in_days: i64, renew_days: i32) -> Model {
        let now = Utc::now();
        Model {
            id: 1,
            user_id: 1,
            domain: "example.com".to_string(),
            alt_domains: None,
            status,
            cert_path: None,
            key_path: None,
            chain_path: None,
            issued_at: Some(now),
            expires_at: Some(now + Duration::days(expires_in_days)),
            auto_renew,
            renew_days,
            last_renew_at: None,
            next_renew_at: None,
            renew_attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn should_renew_inside_window() {
        assert!(cert(CertStatus::Issued, true, 10, 30).should_renew());
        assert!(cert(CertStatus::Issued, true, 30, 30).should_renew());
    }

    #[test]
    fn should_not_renew_outside_window() {
        assert!(!cert(CertStatus::Issued, true, 60, 30).should_renew());
    }

    #[test]
    fn should_not_renew_when_disabled_or_not_issued() {
        assert!(!cert(CertStatus::Issued, false, 10, 30).should_renew());
        assert!(!cert(CertStatus::Pending, true, 10, 30).should_renew());
        assert!(!cert(CertStatus::Error, true, 10, 30).should_renew());
        assert!(!cert(CertStatus::Expired, true, 10, 30).should_renew());
    }

    #[test]
    fn should_not_renew_without_expiry() {
        let mut c = cert(CertStatus::Issued, true, 10, 30);
        c.expires_at = None;
        assert!(!c.should_renew());
    }

    #[test]
    fn expired_when_past_expiry() {
        assert!(cert(CertStatus::Issued, true, -1, 30).is_expired());
        assert!(!cert(CertStatus::Issued, true, 1, 30).is_expired());
    }

    #[test]
    fn alt_domain_list_parses_json() {
        let mut c = cert(CertStatus::Issued, true, 10, 30);
        c.alt_domains = Some(r#"["www.example.com","api.example.com"]"#.to_string());
        assert_eq!(
            c.alt_domain_list(),
            vec!["www.example.com".to_string(), "api.example.com".to_string()]
        );

        c.alt_domains = None;
        assert!(c.alt_domain_list().is_empty());
    }
}
