use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::{AddressProvider, ProviderError, ResolvedAddress, Source};
use crate::store::{CepRecord, RecordStore, StoreError};

/// A fixed address attributed to `source`, for asserting chain provenance.
pub fn address_from(source: Source) -> ResolvedAddress {
    ResolvedAddress {
        street: Some("Avenida Paulista".to_owned()),
        city: "São Paulo".to_owned(),
        state: "SP".to_owned(),
        is_single_address: false,
        source,
    }
}

/// An `AddressProvider` that always returns the same canned outcome and
/// counts how often it was consulted.
pub struct MockProvider {
    source: Source,
    outcome: Result<ResolvedAddress, ProviderError>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn answering(source: Source, address: ResolvedAddress) -> Self {
        Self {
            source,
            outcome: Ok(address),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(source: Source, error: ProviderError) -> Self {
        Self {
            source,
            outcome: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressProvider for MockProvider {
    fn source(&self) -> Source {
        self.source
    }

    async fn lookup(&self, _code: &str) -> Result<ResolvedAddress, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// In-memory `RecordStore` with the same insert-or-ignore semantics as the
/// PostgreSQL implementation.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, CepRecord>>,
    fail_writes: AtomicBool,
    inserts: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<CepRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock().unwrap();
            for record in records {
                map.insert(record.code.clone(), record);
            }
        }
        store
    }

    /// Make every subsequent write fail, to exercise persistence-error paths.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Number of writes that actually inserted a row.
    pub fn inserted(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> HashMap<String, CepRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_existing(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, CepRecord>, StoreError> {
        let records = self.records.lock().unwrap();
        Ok(codes
            .iter()
            .filter_map(|code| records.get(code).map(|r| (code.clone(), r.clone())))
            .collect())
    }

    async fn insert_if_absent(&self, record: &CepRecord) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::QueryError {
                command: "INSERT".to_owned(),
                error: sqlx::Error::PoolClosed,
            });
        }

        let mut records = self.records.lock().unwrap();
        if !records.contains_key(&record.code) {
            records.insert(record.code.clone(), record.clone());
            self.inserts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
