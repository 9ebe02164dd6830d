//! Pluggable implementations of `payflow_core::LedgerReader` (C9): a
//! Postgres-backed reader over the read-only reference-data tables, and an
//! in-memory double for tests that don't carry a database fixture.

#![deny(unsafe_code)]

use async_trait::async_trait;
use payflow_core::error::WorkflowError;
use payflow_core::types::{EntityType, Id, LedgerCounterparty, LedgerSite};
use payflow_core::LedgerReader;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::RwLock;

/// Reads vendors, subcontractors, and sites straight out of Postgres. These
/// tables are owned by a collaborator system; this crate only ever selects
/// from them, never writes.
pub struct PgLedgerReader {
    pool: PgPool,
}

impl PgLedgerReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerReader for PgLedgerReader {
    async fn find_counterparty(
        &self,
        entity_type: EntityType,
        id: Id,
    ) -> Result<Option<LedgerCounterparty>, WorkflowError> {
        let row = match entity_type {
            EntityType::Vendor => {
                sqlx::query("SELECT id, display_name, is_active FROM vendors WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            EntityType::Subcontractor => sqlx::query(
                "SELECT id, display_name, is_active FROM subcontractors WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?,
        };

        row.map(|row| {
            Ok(LedgerCounterparty {
                id: row.try_get("id")?,
                display_name: row.try_get("display_name")?,
                is_active: row.try_get("is_active")?,
            })
        })
        .transpose()
    }

    async fn find_site(&self, id: Id) -> Result<Option<LedgerSite>, WorkflowError> {
        let row = sqlx::query("SELECT id, code, is_active FROM sites WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(LedgerSite {
                id: row.try_get("id")?,
                code: row.try_get("code")?,
                is_active: row.try_get("is_active")?,
            })
        })
        .transpose()
    }
}

/// In-process test double, keyed the same way the schema is: vendor and
/// subcontractor ids never collide across the two maps, mirroring the real
/// tables' separate primary key spaces.
#[derive(Default)]
pub struct InMemoryLedgerReader {
    vendors: RwLock<HashMap<Id, LedgerCounterparty>>,
    subcontractors: RwLock<HashMap<Id, LedgerCounterparty>>,
    sites: RwLock<HashMap<Id, LedgerSite>>,
}

impl InMemoryLedgerReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_vendor(&self, vendor: LedgerCounterparty) {
        self.vendors.write().unwrap().insert(vendor.id, vendor);
    }

    pub fn insert_subcontractor(&self, subcontractor: LedgerCounterparty) {
        self.subcontractors
            .write()
            .unwrap()
            .insert(subcontractor.id, subcontractor);
    }

    pub fn insert_site(&self, site: LedgerSite) {
        self.sites.write().unwrap().insert(site.id, site);
    }
}

#[async_trait]
impl LedgerReader for InMemoryLedgerReader {
    async fn find_counterparty(
        &self,
        entity_type: EntityType,
        id: Id,
    ) -> Result<Option<LedgerCounterparty>, WorkflowError> {
        let map = match entity_type {
            EntityType::Vendor => &self.vendors,
            EntityType::Subcontractor => &self.subcontractors,
        };
        Ok(map.read().unwrap().get(&id).cloned())
    }

    async fn find_site(&self, id: Id) -> Result<Option<LedgerSite>, WorkflowError> {
        Ok(self.sites.read().unwrap().get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_reader_round_trips_a_vendor() {
        let reader = InMemoryLedgerReader::new();
        let vendor_id = Id::new_v4();
        reader.insert_vendor(LedgerCounterparty {
            id: vendor_id,
            display_name: "Acme Corp".into(),
            is_active: true,
        });

        let found = reader
            .find_counterparty(EntityType::Vendor, vendor_id)
            .await
            .unwrap()
            .expect("vendor present");
        assert_eq!(found.display_name, "Acme Corp");

        let missing = reader
            .find_counterparty(EntityType::Subcontractor, vendor_id)
            .await
            .unwrap();
        assert!(missing.is_none(), "vendor id must not leak into the subcontractor map");
    }

    #[tokio::test]
    async fn in_memory_reader_round_trips_a_site() {
        let reader = InMemoryLedgerReader::new();
        let site_id = Id::new_v4();
        reader.insert_site(LedgerSite {
            id: site_id,
            code: "SITE-42".into(),
            is_active: true,
        });

        let found = reader.find_site(site_id).await.unwrap().expect("site present");
        assert_eq!(found.code, "SITE-42");
    }
}
