//! Renewal scheduler
//!
//! Four independent periodic sweeps: expiry marking, auto-renewal,
//! artifact cleanup and status statistics. Each runs on its own interval
//! loop and can also be triggered on demand by name. Sweeps are safe to
//! run concurrently with themselves and with user operations: renewal
//! duplication is prevented by the lifecycle manager's claim protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use certd_acme::ArtifactStore;
use certd_db::store::CertificateStore;
use certd_db::CertStatus;

use crate::error::CertError;
use crate::lifecycle::LifecycleManager;

/// Sweep names accepted by `run_task`
pub const TASK_CHECK_CERTIFICATES: &str = "check_certificates";
pub const TASK_AUTO_RENEW: &str = "auto_renew";
pub const TASK_CLEANUP_FILES: &str = "cleanup_files";
pub const TASK_UPDATE_STATS: &str = "update_stats";

/// Sweep cadences and the renewal window
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub expiry_interval: Duration,
    pub renew_interval: Duration,
    pub cleanup_interval: Duration,
    pub stats_interval: Duration,
    /// Days-before-expiry window used by the due and statistics sweeps
    pub expiring_window_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(24 * 3600),
            renew_interval: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            stats_interval: Duration::from_secs(24 * 3600),
            expiring_window_days: 30,
        }
    }
}

/// Periodic driver over the certificate store
pub struct Scheduler {
    lifecycle: Arc<LifecycleManager>,
    store: CertificateStore,
    artifacts: ArtifactStore,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        artifacts: ArtifactStore,
        config: SchedulerConfig,
    ) -> Self {
        let store = lifecycle.store().clone();
        Self {
            lifecycle,
            store,
            artifacts,
            config,
        }
    }

    /// Spawn the four sweep loops; each fires once immediately and then on
    /// its own cadence
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            expiry_secs = self.config.expiry_interval.as_secs(),
            renew_secs = self.config.renew_interval.as_secs(),
            cleanup_secs = self.config.cleanup_interval.as_secs(),
            stats_secs = self.config.stats_interval.as_secs(),
            "Starting renewal scheduler"
        );

        let sweeps: [(&str, Duration); 4] = [
            (TASK_CHECK_CERTIFICATES, self.config.expiry_interval),
            (TASK_AUTO_RENEW, self.config.renew_interval),
            (TASK_CLEANUP_FILES, self.config.cleanup_interval),
            (TASK_UPDATE_STATS, self.config.stats_interval),
        ];

        sweeps
            .into_iter()
            .map(|(name, period)| {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    loop {
                        interval.tick().await;
                        if let Err(err) = scheduler.run_task(name).await {
                            error!(task = name, error = %err, "Scheduled sweep failed");
                        }
                    }
                })
            })
            .collect()
    }

    /// Run one sweep by its symbolic name
    pub async fn run_task(&self, name: &str) -> Result<(), CertError> {
        match name {
            TASK_CHECK_CERTIFICATES => self.check_certificates().await,
            TASK_AUTO_RENEW => self.auto_renew().await,
            TASK_CLEANUP_FILES => self.cleanup_files().await,
            TASK_UPDATE_STATS => self.update_stats().await,
            other => Err(CertError::UnknownTask(other.to_string())),
        }
    }

    /// Expiry sweep: transition past-expiry records to `expired`
    async fn check_certificates(&self) -> Result<(), CertError> {
        let expired = self.store.find_expired().await?;

        for cert in &expired {
            match self.store.mark_expired(cert.id).await {
                Ok(()) => {
                    info!(cert_id = cert.id, domain = %cert.domain, "Certificate marked expired")
                }
                Err(err) => {
                    error!(cert_id = cert.id, domain = %cert.domain, error = %err, "Failed to mark certificate expired")
                }
            }
        }

        info!(expired_count = expired.len(), "Certificate expiry check completed");
        Ok(())
    }

    /// Due sweep: claim and renew every eligible certificate.
    ///
    /// Issued records renew per the `should_renew` policy; errored records
    /// inside the window are retried. Each renewal runs independently.
    async fn auto_renew(&self) -> Result<(), CertError> {
        let due = self.store.find_renewal_due(self.config.expiring_window_days).await?;

        let mut renewed = 0;
        for cert in &due {
            let eligible = cert.should_renew() || cert.status == CertStatus::Error;
            if !eligible {
                continue;
            }

            match self.lifecycle.renew_due_certificate(cert).await {
                Ok(true) => renewed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(cert_id = cert.id, domain = %cert.domain, error = %err, "Failed to start auto-renewal")
                }
            }
        }

        info!(
            due_count = due.len(),
            renewed_count = renewed,
            "Automatic certificate renewal completed"
        );
        Ok(())
    }

    /// Artifact sweep: drop directories for deleted records and stale
    /// temporary files
    async fn cleanup_files(&self) -> Result<(), CertError> {
        let domains = self.store.active_domains().await?;

        let orphans = match self.artifacts.cleanup_orphans(&domains).await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "Orphan artifact cleanup failed");
                0
            }
        };

        let temps = match self.artifacts.cleanup_temp_files().await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "Temp file cleanup failed");
                0
            }
        };

        info!(
            orphan_dirs = orphans,
            temp_files = temps,
            "Artifact cleanup completed"
        );
        Ok(())
    }

    /// Statistics sweep: log aggregate counts (observability only)
    async fn update_stats(&self) -> Result<(), CertError> {
        let stats = self.store.stats(self.config.expiring_window_days).await?;

        info!(
            total = stats.total,
            issued = stats.issued,
            pending = stats.pending,
            error = stats.error,
            expired = stats.expired,
            expiring_soon = stats.expiring_soon,
            in_flight_exchanges = self.lifecycle.in_flight_tasks(),
            "Certificate statistics updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};

    use certd_acme::{
        AcmeError, CertificateIssuer, ChallengeKind, ChallengeRegistry, IssuedCertificate,
    };
    use certd_db::store::{IssuedUpdate, NewCertificate};

    struct StubIssuer {
        calls: AtomicUsize,
        validity_days: i64,
    }

    #[async_trait]
    impl CertificateIssuer for StubIssuer {
        async fn obtain(
            &self,
            domain: &str,
            _alt_domains: &[String],
        ) -> Result<IssuedCertificate, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            // Keep the exchange observable while concurrent sweeps run
            tokio::time::sleep(Duration::from_millis(50)).await;

            let key = rcgen::KeyPair::generate().expect("key");
            let mut params =
                rcgen::CertificateParams::new(vec![domain.to_string()]).expect("params");
            params.not_before = time::OffsetDateTime::now_utc();
            params.not_after = params.not_before + time::Duration::days(self.validity_days);
            let cert = params.self_signed(&key).expect("cert");

            Ok(IssuedCertificate {
                domain: domain.to_string(),
                cert_pem: cert.pem(),
                key_pem: key.serialize_pem(),
                chain_pem: String::new(),
                cert_path: format!("/tmp/certs/{domain}/cert.pem"),
                key_path: format!("/tmp/certs/{domain}/key.pem"),
                chain_path: format!("/tmp/certs/{domain}/chain.pem"),
            })
        }
    }

    async fn setup() -> (Arc<Scheduler>, CertificateStore, Arc<StubIssuer>, ArtifactStore) {
        let db = certd_db::connect("sqlite::memory:").await.expect("connect");
        certd_db::migrate(&db).await.expect("migrate");
        let store = CertificateStore::new(db);

        let issuer = Arc::new(StubIssuer {
            calls: AtomicUsize::new(0),
            validity_days: 90,
        });

        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            issuer.clone(),
            ChallengeKind::Dns01,
            Arc::new(ChallengeRegistry::new()),
        ));

        static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);
        let artifacts = ArtifactStore::new(std::env::temp_dir().join(format!(
            "certd-scheduler-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        )));

        let scheduler = Arc::new(Scheduler::new(
            lifecycle,
            artifacts.clone(),
            SchedulerConfig::default(),
        ));

        (scheduler, store, issuer, artifacts)
    }

    async fn insert_issued(store: &CertificateStore, domain: &str, expires_in_days: i64) -> i32 {
        let created = store
            .insert(NewCertificate {
                user_id: 1,
                domain: domain.to_string(),
                alt_domains: None,
                auto_renew: true,
                renew_days: 30,
            })
            .await
            .expect("insert");

        let now = Utc::now();
        store
            .mark_issued(
                created.id,
                IssuedUpdate {
                    cert_path: "cert".to_string(),
                    key_path: "key".to_string(),
                    chain_path: "chain".to_string(),
                    issued_at: now,
                    expires_at: now + ChronoDuration::days(expires_in_days),
                    next_renew_at: now + ChronoDuration::days(expires_in_days - 30),
                    renewal: false,
                },
            )
            .await
            .expect("mark issued");

        created.id
    }

    #[tokio::test]
    async fn expiry_sweep_marks_past_expiry() {
        let (scheduler, store, _, _) = setup().await;

        let expired_id = insert_issued(&store, "old.com", -1).await;
        let valid_id = insert_issued(&store, "fresh.com", 60).await;

        scheduler.run_task(TASK_CHECK_CERTIFICATES).await.expect("sweep");

        let expired = store.find_by_id(expired_id).await.expect("query").expect("row");
        assert_eq!(expired.status, CertStatus::Expired);

        let valid = store.find_by_id(valid_id).await.expect("query").expect("row");
        assert_eq!(valid.status, CertStatus::Issued);
    }

    #[tokio::test]
    async fn auto_renew_sweep_claims_due_certificates() {
        let (scheduler, store, issuer, _) = setup().await;

        let due_id = insert_issued(&store, "due.com", 10).await;
        let fresh_id = insert_issued(&store, "fresh.com", 80).await;

        scheduler.run_task(TASK_AUTO_RENEW).await.expect("sweep");

        // The due record is claimed for renewal; the fresh one is untouched
        let due = store.find_by_id(due_id).await.expect("query").expect("row");
        assert!(matches!(due.status, CertStatus::Renewing | CertStatus::Issued));

        let fresh = store.find_by_id(fresh_id).await.expect("query").expect("row");
        assert_eq!(fresh.status, CertStatus::Issued);
        assert_eq!(fresh.last_renew_at, None);

        // Exchange settles with a new expiry
        for _ in 0..500 {
            let cert = store.find_by_id(due_id).await.expect("query").expect("row");
            if cert.status == CertStatus::Issued && cert.last_renew_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let renewed = store.find_by_id(due_id).await.expect("query").expect("row");
        assert_eq!(renewed.status, CertStatus::Issued);
        assert!(renewed.last_renew_at.is_some());
        assert!((renewed.expires_at.expect("expiry") - Utc::now()).num_days() >= 89);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_renew_sweep_is_idempotent_under_repeat() {
        let (scheduler, store, issuer, _) = setup().await;
        insert_issued(&store, "due.com", 10).await;

        // Two immediate sweeps: the second observes the claim and skips
        let (a, b) = tokio::join!(
            scheduler.run_task(TASK_AUTO_RENEW),
            scheduler.run_task(TASK_AUTO_RENEW),
        );
        a.expect("sweep");
        b.expect("sweep");

        for _ in 0..500 {
            if issuer.calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_sweep_removes_orphan_directories() {
        let (scheduler, store, _, artifacts) = setup().await;

        insert_issued(&store, "keep.com", 60).await;
        artifacts.save("keep.com", "c", "k", "ch").await.expect("save");
        artifacts.save("orphan.com", "c", "k", "ch").await.expect("save");

        scheduler.run_task(TASK_CLEANUP_FILES).await.expect("sweep");

        assert!(tokio::fs::try_exists(artifacts.domain_dir("keep.com"))
            .await
            .expect("exists"));
        assert!(!tokio::fs::try_exists(artifacts.domain_dir("orphan.com"))
            .await
            .expect("exists"));

        tokio::fs::remove_dir_all(artifacts.root()).await.expect("cleanup");
    }

    #[tokio::test]
    async fn stats_sweep_runs() {
        let (scheduler, store, _, _) = setup().await;
        insert_issued(&store, "a.com", 10).await;

        scheduler.run_task(TASK_UPDATE_STATS).await.expect("sweep");
    }

    #[tokio::test]
    async fn unknown_task_name_is_an_error() {
        let (scheduler, _, _, _) = setup().await;

        assert!(matches!(
            scheduler.run_task("defragment_disks").await,
            Err(CertError::UnknownTask(_))
        ));
    }
}
