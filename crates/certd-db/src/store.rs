//! Repository layer over the certificates table
//!
//! All certificate rows are mutated through this store. Single-row updates
//! rely on the database for atomicity; the renewal claim is a conditional
//! update keyed on the previously observed status.

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, Set,
};
use tracing::debug;

use crate::entities::certificate::{self, CertStatus, Entity as Certificate};

/// New certificate row, persisted as `pending`
pub struct NewCertificate {
    pub user_id: i64,
    pub domain: String,
    pub alt_domains: Option<String>,
    pub auto_renew: bool,
    pub renew_days: i32,
}

/// Fields written when an issuance or renewal exchange succeeds
pub struct IssuedUpdate {
    pub cert_path: String,
    pub key_path: String,
    pub chain_path: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub next_renew_at: DateTime<Utc>,
    /// Set `last_renew_at` as well (renewals only)
    pub renewal: bool,
}

/// Aggregate status counts for the statistics sweep
#[derive(Debug, Clone, Default)]
pub struct CertStats {
    pub total: u64,
    pub issued: u64,
    pub pending: u64,
    pub error: u64,
    pub expired: u64,
    pub expiring_soon: u64,
}

/// Certificate store backed by SeaORM
#[derive(Clone)]
pub struct CertificateStore {
    db: DatabaseConnection,
}

impl CertificateStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Condition excluding soft-deleted rows
    fn active() -> Condition {
        Condition::all().add(certificate::Column::DeletedAt.is_null())
    }

    pub async fn find_by_id(&self, id: i32) -> Result<Option<certificate::Model>, DbErr> {
        Certificate::find_by_id(id)
            .filter(Self::active())
            .one(&self.db)
            .await
    }

    pub async fn find_by_domain(&self, domain: &str) -> Result<Option<certificate::Model>, DbErr> {
        Certificate::find()
            .filter(Self::active())
            .filter(certificate::Column::Domain.eq(domain))
            .one(&self.db)
            .await
    }

    pub async fn find_by_user(&self, user_id: i64) -> Result<Vec<certificate::Model>, DbErr> {
        Certificate::find()
            .filter(Self::active())
            .filter(certificate::Column::UserId.eq(user_id))
            .all(&self.db)
            .await
    }

    pub async fn find_all(&self) -> Result<Vec<certificate::Model>, DbErr> {
        Certificate::find().filter(Self::active()).all(&self.db).await
    }

    /// Domains of all active records, for the artifact cleanup sweep
    pub async fn active_domains(&self) -> Result<Vec<String>, DbErr> {
        Ok(self.find_all().await?.into_iter().map(|c| c.domain).collect())
    }

    /// Records past expiry that are not yet marked terminal
    pub async fn find_expired(&self) -> Result<Vec<certificate::Model>, DbErr> {
        Certificate::find()
            .filter(Self::active())
            .filter(certificate::Column::ExpiresAt.lt(Utc::now()))
            .filter(certificate::Column::Status.ne(CertStatus::Expired))
            .filter(certificate::Column::Status.ne(CertStatus::Revoked))
            .all(&self.db)
            .await
    }

    /// Auto-renew records expiring within `days`, in a renewable status.
    ///
    /// `error` records are included so the sweep retries failed renewals;
    /// `renewing` records are excluded because an exchange is already in
    /// flight for them.
    pub async fn find_renewal_due(&self, days: i64) -> Result<Vec<certificate::Model>, DbErr> {
        let cutoff = Utc::now() + Duration::days(days);
        Certificate::find()
            .filter(Self::active())
            .filter(certificate::Column::AutoRenew.eq(true))
            .filter(certificate::Column::ExpiresAt.lte(cutoff))
            .filter(
                Condition::any()
                    .add(certificate::Column::Status.eq(CertStatus::Issued))
                    .add(certificate::Column::Status.eq(CertStatus::Error)),
            )
            .all(&self.db)
            .await
    }

    pub async fn count_by_status(&self, status: CertStatus) -> Result<u64, DbErr> {
        Certificate::find()
            .filter(Self::active())
            .filter(certificate::Column::Status.eq(status))
            .count(&self.db)
            .await
    }

    /// Aggregate counts for the statistics sweep
    pub async fn stats(&self, expiring_days: i64) -> Result<CertStats, DbErr> {
        let cutoff = Utc::now() + Duration::days(expiring_days);
        let expiring_soon = Certificate::find()
            .filter(Self::active())
            .filter(certificate::Column::Status.eq(CertStatus::Issued))
            .filter(certificate::Column::ExpiresAt.lte(cutoff))
            .count(&self.db)
            .await?;

        Ok(CertStats {
            total: Certificate::find().filter(Self::active()).count(&self.db).await?,
            issued: self.count_by_status(CertStatus::Issued).await?,
            pending: self.count_by_status(CertStatus::Pending).await?,
            error: self.count_by_status(CertStatus::Error).await?,
            expired: self.count_by_status(CertStatus::Expired).await?,
            expiring_soon,
        })
    }

    /// Insert a new `pending` record
    pub async fn insert(&self, new: NewCertificate) -> Result<certificate::Model, DbErr> {
        let now = Utc::now();
        certificate::ActiveModel {
            user_id: Set(new.user_id),
            domain: Set(new.domain),
            alt_domains: Set(new.alt_domains),
            status: Set(CertStatus::Pending),
            auto_renew: Set(new.auto_renew),
            renew_days: Set(new.renew_days),
            renew_attempts: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await
    }

    /// Record a successful exchange: issued status, validity bounds,
    /// artifact paths, reset failure accounting
    pub async fn mark_issued(&self, id: i32, update: IssuedUpdate) -> Result<(), DbErr> {
        let mut row = certificate::ActiveModel {
            id: Set(id),
            status: Set(CertStatus::Issued),
            cert_path: Set(Some(update.cert_path)),
            key_path: Set(Some(update.key_path)),
            chain_path: Set(Some(update.chain_path)),
            issued_at: Set(Some(update.issued_at)),
            expires_at: Set(Some(update.expires_at)),
            next_renew_at: Set(Some(update.next_renew_at)),
            renew_attempts: Set(0),
            last_error: Set(None),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        if update.renewal {
            row.last_renew_at = Set(Some(Utc::now()));
        }
        row.update(&self.db).await?;
        Ok(())
    }

    /// Record a failed exchange: error status, message, incremented
    /// attempt counter.
    ///
    /// The claim protocol guarantees a single exchange per record, so the
    /// read-modify-write increment cannot race with itself.
    pub async fn mark_failed(&self, id: i32, error: &str) -> Result<(), DbErr> {
        let Some(cert) = Certificate::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };

        certificate::ActiveModel {
            id: Set(id),
            status: Set(CertStatus::Error),
            last_error: Set(Some(error.to_string())),
            renew_attempts: Set(cert.renew_attempts + 1),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(&self.db)
        .await?;
        Ok(())
    }

    pub async fn mark_expired(&self, id: i32) -> Result<(), DbErr> {
        certificate::ActiveModel {
            id: Set(id),
            status: Set(CertStatus::Expired),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(&self.db)
        .await?;
        Ok(())
    }

    /// Claim a record for renewal with a conditional update.
    ///
    /// Transitions `expected -> renewing` only if the row still carries the
    /// status the caller observed. Returns `false` when the row changed in
    /// the meantime, meaning a concurrent actor holds the claim.
    pub async fn claim_renewal(&self, id: i32, expected: CertStatus) -> Result<bool, DbErr> {
        let result = Certificate::update_many()
            .col_expr(certificate::Column::Status, Expr::value(CertStatus::Renewing))
            .col_expr(certificate::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(certificate::Column::Id.eq(id))
            .filter(certificate::Column::Status.eq(expected))
            .filter(certificate::Column::DeletedAt.is_null())
            .exec(&self.db)
            .await?;

        let claimed = result.rows_affected == 1;
        if !claimed {
            debug!(cert_id = id, "Renewal claim lost to a concurrent actor");
        }
        Ok(claimed)
    }

    /// Soft-delete a record
    pub async fn soft_delete(&self, id: i32) -> Result<(), DbErr> {
        certificate::ActiveModel {
            id: Set(id),
            deleted_at: Set(Some(Utc::now())),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(&self.db)
        .await?;
        Ok(())
    }
}
