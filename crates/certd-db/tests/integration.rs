//! Integration tests for certd-db
//!
//! Tests store operations against a real SQLite in-memory database

use certd_db::store::{IssuedUpdate, NewCertificate};
use certd_db::{connect, migrate, CertStatus, CertificateStore};
use chrono::{Duration, Utc};

/// Helper to create a migrated test database
async fn setup_store() -> CertificateStore {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    CertificateStore::new(db)
}

fn new_cert(domain: &str) -> NewCertificate {
    NewCertificate {
        user_id: 1,
        domain: domain.to_string(),
        alt_domains: None,
        auto_renew: true,
        renew_days: 30,
    }
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_insert_and_find_by_domain() {
    let store = setup_store().await;

    let created = store.insert(new_cert("example.com")).await.expect("insert");
    assert_eq!(created.domain, "example.com");
    assert_eq!(created.status, CertStatus::Pending);
    assert_eq!(created.renew_attempts, 0);

    let found = store
        .find_by_domain("example.com")
        .await
        .expect("query")
        .expect("row");
    assert_eq!(found.id, created.id);

    assert!(store.find_by_domain("other.com").await.expect("query").is_none());
}

#[tokio::test]
async fn test_mark_issued_sets_validity_and_resets_failures() {
    let store = setup_store().await;
    let created = store.insert(new_cert("example.com")).await.expect("insert");

    store
        .mark_failed(created.id, "connection refused")
        .await
        .expect("mark failed");

    let now = Utc::now();
    store
        .mark_issued(
            created.id,
            IssuedUpdate {
                cert_path: "/certs/example.com/cert.pem".to_string(),
                key_path: "/certs/example.com/key.pem".to_string(),
                chain_path: "/certs/example.com/chain.pem".to_string(),
                issued_at: now,
                expires_at: now + Duration::days(90),
                next_renew_at: now + Duration::days(60),
                renewal: false,
            },
        )
        .await
        .expect("mark issued");

    let found = store.find_by_id(created.id).await.expect("query").expect("row");
    assert_eq!(found.status, CertStatus::Issued);
    assert_eq!(found.renew_attempts, 0);
    assert_eq!(found.last_error, None);
    assert_eq!(found.last_renew_at, None);
    assert!(found.expires_at.is_some());
    assert!(found.next_renew_at.is_some());
}

#[tokio::test]
async fn test_mark_failed_increments_attempts() {
    let store = setup_store().await;
    let created = store.insert(new_cert("example.com")).await.expect("insert");

    store.mark_failed(created.id, "rate limited").await.expect("fail 1");
    store.mark_failed(created.id, "rate limited again").await.expect("fail 2");

    let found = store.find_by_id(created.id).await.expect("query").expect("row");
    assert_eq!(found.status, CertStatus::Error);
    assert_eq!(found.renew_attempts, 2);
    assert_eq!(found.last_error.as_deref(), Some("rate limited again"));
}

#[tokio::test]
async fn test_claim_renewal_is_conditional() {
    let store = setup_store().await;
    let created = store.insert(new_cert("example.com")).await.expect("insert");

    let now = Utc::now();
    store
        .mark_issued(
            created.id,
            IssuedUpdate {
                cert_path: "cert".to_string(),
                key_path: "key".to_string(),
                chain_path: "chain".to_string(),
                issued_at: now,
                expires_at: now + Duration::days(10),
                next_renew_at: now - Duration::days(20),
                renewal: false,
            },
        )
        .await
        .expect("mark issued");

    // First claim wins
    assert!(store
        .claim_renewal(created.id, CertStatus::Issued)
        .await
        .expect("claim"));

    // Second claim against the stale precondition fails closed
    assert!(!store
        .claim_renewal(created.id, CertStatus::Issued)
        .await
        .expect("claim"));

    let found = store.find_by_id(created.id).await.expect("query").expect("row");
    assert_eq!(found.status, CertStatus::Renewing);
}

#[tokio::test]
async fn test_claim_renewal_from_error_status() {
    let store = setup_store().await;
    let created = store.insert(new_cert("example.com")).await.expect("insert");
    store.mark_failed(created.id, "boom").await.expect("mark failed");

    assert!(store
        .claim_renewal(created.id, CertStatus::Error)
        .await
        .expect("claim"));
    assert!(!store
        .claim_renewal(created.id, CertStatus::Error)
        .await
        .expect("claim"));
}

#[tokio::test]
async fn test_soft_delete_hides_record() {
    let store = setup_store().await;
    let created = store.insert(new_cert("example.com")).await.expect("insert");

    store.soft_delete(created.id).await.expect("delete");

    assert!(store.find_by_id(created.id).await.expect("query").is_none());
    assert!(store.find_by_domain("example.com").await.expect("query").is_none());

    // A deleted row cannot be claimed
    assert!(!store
        .claim_renewal(created.id, CertStatus::Pending)
        .await
        .expect("claim"));
}

#[tokio::test]
async fn test_find_expired_skips_terminal_statuses() {
    let store = setup_store().await;

    let past = Utc::now() - Duration::days(1);
    for (domain, expired_already) in [("a.com", false), ("b.com", true)] {
        let created = store.insert(new_cert(domain)).await.expect("insert");
        store
            .mark_issued(
                created.id,
                IssuedUpdate {
                    cert_path: "cert".to_string(),
                    key_path: "key".to_string(),
                    chain_path: "chain".to_string(),
                    issued_at: past - Duration::days(90),
                    expires_at: past,
                    next_renew_at: past - Duration::days(30),
                    renewal: false,
                },
            )
            .await
            .expect("mark issued");
        if expired_already {
            store.mark_expired(created.id).await.expect("mark expired");
        }
    }

    let expired = store.find_expired().await.expect("query");
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].domain, "a.com");
}

#[tokio::test]
async fn test_find_renewal_due_statuses() {
    let store = setup_store().await;
    let now = Utc::now();

    let issue = |store: CertificateStore, domain: &'static str| async move {
        let created = store.insert(new_cert(domain)).await.expect("insert");
        store
            .mark_issued(
                created.id,
                IssuedUpdate {
                    cert_path: "cert".to_string(),
                    key_path: "key".to_string(),
                    chain_path: "chain".to_string(),
                    issued_at: now,
                    expires_at: now + Duration::days(10),
                    next_renew_at: now - Duration::days(20),
                    renewal: false,
                },
            )
            .await
            .expect("mark issued");
        created.id
    };

    // Due: issued inside the window
    issue(store.clone(), "due.com").await;

    // Due: errored inside the window (sweep-driven retry)
    let errored = issue(store.clone(), "errored.com").await;
    store.mark_failed(errored, "boom").await.expect("mark failed");

    // Not due: already claimed by another actor
    let claimed = issue(store.clone(), "claimed.com").await;
    assert!(store.claim_renewal(claimed, CertStatus::Issued).await.expect("claim"));

    // Not due: expires far in the future
    let far = store.insert(new_cert("far.com")).await.expect("insert");
    store
        .mark_issued(
            far.id,
            IssuedUpdate {
                cert_path: "cert".to_string(),
                key_path: "key".to_string(),
                chain_path: "chain".to_string(),
                issued_at: now,
                expires_at: now + Duration::days(90),
                next_renew_at: now + Duration::days(60),
                renewal: false,
            },
        )
        .await
        .expect("mark issued");

    let mut due: Vec<String> = store
        .find_renewal_due(30)
        .await
        .expect("query")
        .into_iter()
        .map(|c| c.domain)
        .collect();
    due.sort();
    assert_eq!(due, vec!["due.com".to_string(), "errored.com".to_string()]);
}

#[tokio::test]
async fn test_stats_counts_per_status() {
    let store = setup_store().await;
    let now = Utc::now();

    store.insert(new_cert("pending.com")).await.expect("insert");

    let issued = store.insert(new_cert("issued.com")).await.expect("insert");
    store
        .mark_issued(
            issued.id,
            IssuedUpdate {
                cert_path: "cert".to_string(),
                key_path: "key".to_string(),
                chain_path: "chain".to_string(),
                issued_at: now,
                expires_at: now + Duration::days(10),
                next_renew_at: now - Duration::days(20),
                renewal: false,
            },
        )
        .await
        .expect("mark issued");

    let errored = store.insert(new_cert("errored.com")).await.expect("insert");
    store.mark_failed(errored.id, "boom").await.expect("mark failed");

    let stats = store.stats(30).await.expect("stats");
    assert_eq!(stats.total, 3);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.issued, 1);
    assert_eq!(stats.error, 1);
    assert_eq!(stats.expired, 0);
    assert_eq!(stats.expiring_soon, 1);
}
