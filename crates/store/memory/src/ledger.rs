use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use tether_core::{ArchiveRef, SessionId, SessionRecord};
use tether_store::error::LedgerError;
use tether_store::ledger::SessionLedger;

/// In-memory [`SessionLedger`] keyed by session id.
#[derive(Debug, Default)]
pub struct MemorySessionLedger {
    records: DashMap<SessionId, SessionRecord>,
}

impl MemorySessionLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionLedger for MemorySessionLedger {
    async fn find(&self, id: &SessionId) -> Result<Option<SessionRecord>, LedgerError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn upsert(
        &self,
        id: &SessionId,
        archive_ref: &ArchiveRef,
        size_bytes: u64,
    ) -> Result<SessionRecord, LedgerError> {
        let record = match self.records.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let next = occupied.get().clone().replaced(archive_ref.clone(), size_bytes);
                occupied.insert(next.clone());
                next
            }
            Entry::Vacant(vacant) => {
                let fresh = SessionRecord::new(id.clone(), archive_ref.clone(), size_bytes);
                vacant.insert(fresh.clone());
                fresh
            }
        };
        Ok(record)
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, LedgerError> {
        Ok(self.records.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, LedgerError> {
        let mut records: Vec<SessionRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
