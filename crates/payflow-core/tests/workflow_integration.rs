//! Exercises `WorkflowService` against a real Postgres instance. Skipped
//! (not failed) when neither `PAYFLOW_DATABASE_URL` nor `DATABASE_URL` is
//! set, so the unit test suite still runs clean in environments without a
//! database.

use async_trait::async_trait;
use payflow_core::config::WorkflowEngineConfig;
use payflow_core::error::ErrorKind;
use payflow_core::types::{EntityType, LedgerCounterparty, LedgerSite, LegacyShape, Principal, Role};
use payflow_core::workflow::{NewLedgerRequest, NewRequestShape, WorkflowService};
use payflow_core::{Id, LedgerReader, WorkflowError};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct FakeLedger {
    counterparties: Mutex<HashMap<Id, LedgerCounterparty>>,
    sites: Mutex<HashMap<Id, LedgerSite>>,
}

#[async_trait]
impl LedgerReader for FakeLedger {
    async fn find_counterparty(
        &self,
        _entity_type: EntityType,
        id: Id,
    ) -> Result<Option<LedgerCounterparty>, WorkflowError> {
        Ok(self.counterparties.lock().unwrap().get(&id).cloned())
    }

    async fn find_site(&self, id: Id) -> Result<Option<LedgerSite>, WorkflowError> {
        Ok(self.sites.lock().unwrap().get(&id).cloned())
    }
}

async fn test_pool() -> Option<PgPool> {
    let database_url = std::env::var("PAYFLOW_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()?;
    let config = WorkflowEngineConfig {
        database_url,
        max_connections: 5,
        acquire_timeout: std::time::Duration::from_secs(5),
        log_filter: "payflow=debug".to_string(),
    };
    let pool = payflow_core::db::connect(&config).await.expect("connect");
    payflow_core::db::migrate(&pool).await.expect("migrate");
    Some(pool)
}

async fn seed_user(pool: &PgPool, role: Role) -> Principal {
    let id = Uuid::new_v4();
    let role_str = match role {
        Role::Creator => "CREATOR",
        Role::Approver => "APPROVER",
        Role::Viewer => "VIEWER",
        Role::Admin => "ADMIN",
    };
    sqlx::query(
        "INSERT INTO users (id, username, display_name, role, password_hash, created_at) \
         VALUES ($1, $2, $2, $3, 'x', now())",
    )
    .bind(id)
    .bind(format!("user-{id}"))
    .bind(role_str)
    .execute(pool)
    .await
    .expect("seed user");
    Principal { user_id: id, role }
}

fn legacy_shape(amount: &str) -> NewRequestShape {
    NewRequestShape::Legacy(LegacyShape {
        amount: amount.parse().unwrap(),
        beneficiary_name: "Jane Doe".to_string(),
        beneficiary_account: "ACCT-1".to_string(),
        purpose: "consulting".to_string(),
    })
}

#[tokio::test]
async fn happy_path_create_submit_approve_pay() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: no PAYFLOW_DATABASE_URL/DATABASE_URL set");
        return;
    };
    let ledger: Arc<dyn LedgerReader> = Arc::new(FakeLedger::default());
    let service = WorkflowService::new(pool.clone(), ledger);

    let creator = seed_user(&pool, Role::Creator).await;
    let approver = seed_user(&pool, Role::Approver).await;

    let batch = service
        .create_batch(creator, "July contractors", "key-create-batch-1")
        .await
        .unwrap();

    let request = service
        .add_request(creator, batch.id, "USD", legacy_shape("500.00"), "key-add-request-1")
        .await
        .unwrap();

    let batch = service.submit_batch(creator, batch.id).await.unwrap();
    assert_eq!(
        format!("{:?}", batch.status),
        "Processing",
        "batch must move straight to PROCESSING once its only request is pending approval"
    );

    let approved = service
        .approve_request(approver, request.id, Some("looks good"), "key-approve-1")
        .await
        .unwrap();
    assert_eq!(format!("{:?}", approved.status), "Approved");

    let paid = service.mark_paid(approver, request.id, "key-mark-paid-1").await.unwrap();
    assert_eq!(format!("{:?}", paid.status), "Paid");

    let batch = payflow_core::store::fetch_batch(&pool, batch.id).await.unwrap().unwrap();
    assert_eq!(
        format!("{:?}", batch.status),
        "Completed",
        "batch must auto-complete once its only request reaches a terminal state"
    );
}

#[tokio::test]
async fn approve_is_idempotent_under_the_same_key() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: no PAYFLOW_DATABASE_URL/DATABASE_URL set");
        return;
    };
    let ledger: Arc<dyn LedgerReader> = Arc::new(FakeLedger::default());
    let service = WorkflowService::new(pool.clone(), ledger);

    let creator = seed_user(&pool, Role::Creator).await;
    let approver = seed_user(&pool, Role::Approver).await;

    let batch = service
        .create_batch(creator, "Idempotency batch", "key-create-batch-2")
        .await
        .unwrap();
    let request = service
        .add_request(creator, batch.id, "USD", legacy_shape("100.00"), "key-add-request-2")
        .await
        .unwrap();
    service.submit_batch(creator, batch.id).await.unwrap();

    let first = service
        .approve_request(approver, request.id, None, "key-approve-replay")
        .await
        .unwrap();
    let second = service
        .approve_request(approver, request.id, None, "key-approve-replay")
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.version, second.version, "a replay must not advance the version counter again");
}

#[tokio::test]
async fn submitting_an_empty_batch_is_rejected() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: no PAYFLOW_DATABASE_URL/DATABASE_URL set");
        return;
    };
    let ledger: Arc<dyn LedgerReader> = Arc::new(FakeLedger::default());
    let service = WorkflowService::new(pool.clone(), ledger);
    let creator = seed_user(&pool, Role::Creator).await;

    let batch = service
        .create_batch(creator, "Empty batch", "key-create-batch-3")
        .await
        .unwrap();

    let err = service.submit_batch(creator, batch.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[tokio::test]
async fn editing_a_request_after_it_leaves_draft_is_forbidden() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: no PAYFLOW_DATABASE_URL/DATABASE_URL set");
        return;
    };
    let ledger: Arc<dyn LedgerReader> = Arc::new(FakeLedger::default());
    let service = WorkflowService::new(pool.clone(), ledger);
    let creator = seed_user(&pool, Role::Creator).await;

    let batch = service
        .create_batch(creator, "Edit-after-submit batch", "key-create-batch-4")
        .await
        .unwrap();
    let request = service
        .add_request(creator, batch.id, "USD", legacy_shape("250.00"), "key-add-request-4")
        .await
        .unwrap();
    service.submit_batch(creator, batch.id).await.unwrap();

    let err = service
        .update_request(creator, request.id, "USD", legacy_shape("999.00"), "key-update-4")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn ledger_driven_request_snapshots_counterparty_and_site() {
    let Some(pool) = test_pool().await else {
        eprintln!("skipping: no PAYFLOW_DATABASE_URL/DATABASE_URL set");
        return;
    };
    let ledger = Arc::new(FakeLedger::default());
    let vendor_id = Uuid::new_v4();
    let site_id = Uuid::new_v4();
    ledger.counterparties.lock().unwrap().insert(
        vendor_id,
        LedgerCounterparty {
            id: vendor_id,
            display_name: "Acme Supplies".to_string(),
            is_active: true,
        },
    );
    ledger.sites.lock().unwrap().insert(
        site_id,
        LedgerSite {
            id: site_id,
            code: "SITE-9".to_string(),
            is_active: true,
        },
    );
    let service = WorkflowService::new(pool.clone(), ledger as Arc<dyn LedgerReader>);
    let creator = seed_user(&pool, Role::Creator).await;

    let batch = service
        .create_batch(creator, "Ledger batch", "key-create-batch-5")
        .await
        .unwrap();
    let request = service
        .add_request(
            creator,
            batch.id,
            "USD",
            NewRequestShape::Ledger(NewLedgerRequest {
                entity_type: EntityType::Vendor,
                entity_id: vendor_id,
                site_id,
                base_amount: "1000.00".parse().unwrap(),
                extra_amount: "0".parse().unwrap(),
                extra_reason: None,
            }),
            "key-add-request-5",
        )
        .await
        .unwrap();

    match request.shape {
        payflow_core::types::RequestShape::Ledger(shape) => {
            assert_eq!(shape.entity_name_snapshot, "Acme Supplies");
            assert_eq!(shape.site_code_snapshot, "SITE-9");
        }
        _ => panic!("expected a ledger-driven shape"),
    }
}
