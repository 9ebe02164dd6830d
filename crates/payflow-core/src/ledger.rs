use crate::error::WorkflowError;
use crate::types::{EntityType, Id, LedgerCounterparty, LedgerSite};
use async_trait::async_trait;

/// Read-only reference-data contract (C9). The workflow service depends on
/// this trait, never on a concrete ledger datastore, so tests can swap in an
/// in-memory double without a ledger fixture.
///
/// Implementations must never cascade a ledger-side change into payment
/// requests: foreign keys from the ledger's perspective are PROTECT/RESTRICT,
/// so a vendor referenced by a live request cannot be deleted out from under
/// it. That constraint lives in the collaborator's own schema, outside this
/// crate; this trait only describes what the core is allowed to read.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn find_counterparty(
        &self,
        entity_type: EntityType,
        id: Id,
    ) -> Result<Option<LedgerCounterparty>, WorkflowError>;

    async fn find_site(&self, id: Id) -> Result<Option<LedgerSite>, WorkflowError>;
}

/// Resolves and validates the ledger-driven shape's counterparty and site,
/// requiring both to be active. Returns the pair of display snapshots the
/// workflow service stores on the new `PaymentRequest` row.
pub async fn resolve_and_snapshot(
    reader: &dyn LedgerReader,
    entity_type: EntityType,
    entity_id: Id,
    site_id: Id,
) -> Result<(String, String), WorkflowError> {
    let counterparty = reader
        .find_counterparty(entity_type, entity_id)
        .await?
        .ok_or_else(|| WorkflowError::not_found("ledger counterparty", entity_id))?;
    if !counterparty.is_active {
        return Err(WorkflowError::Validation(format!(
            "{entity_type:?} '{entity_id}' is not active"
        )));
    }

    let site = reader
        .find_site(site_id)
        .await?
        .ok_or_else(|| WorkflowError::not_found("site", site_id))?;
    if !site.is_active {
        return Err(WorkflowError::Validation(format!(
            "site '{site_id}' is not active"
        )));
    }

    Ok((counterparty.display_name, site.code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

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

    #[tokio::test]
    async fn rejects_inactive_vendor() {
        let ledger = FakeLedger::default();
        let vendor_id = Id::new_v4();
        let site_id = Id::new_v4();
        ledger.counterparties.lock().unwrap().insert(
            vendor_id,
            LedgerCounterparty {
                id: vendor_id,
                display_name: "Acme".into(),
                is_active: false,
            },
        );
        ledger.sites.lock().unwrap().insert(
            site_id,
            LedgerSite {
                id: site_id,
                code: "SITE-1".into(),
                is_active: true,
            },
        );

        let err = resolve_and_snapshot(&ledger, EntityType::Vendor, vendor_id, site_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn snapshots_display_fields_on_success() {
        let ledger = FakeLedger::default();
        let vendor_id = Id::new_v4();
        let site_id = Id::new_v4();
        ledger.counterparties.lock().unwrap().insert(
            vendor_id,
            LedgerCounterparty {
                id: vendor_id,
                display_name: "Acme".into(),
                is_active: true,
            },
        );
        ledger.sites.lock().unwrap().insert(
            site_id,
            LedgerSite {
                id: site_id,
                code: "SITE-1".into(),
                is_active: true,
            },
        );

        let (name, code) = resolve_and_snapshot(&ledger, EntityType::Vendor, vendor_id, site_id)
            .await
            .unwrap();
        assert_eq!(name, "Acme");
        assert_eq!(code, "SITE-1");
    }
}
