use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::chain::ResolutionChain;
use crate::event::ResolutionEvent;
use crate::normalize::normalize_cep;
use crate::store::{CepRecord, RecordStore};
use crate::stream::ProgressBroadcaster;

/// Tunables for one batch run, taken from the environment at startup.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Fixed worker pool size per batch.
    pub concurrency: usize,
    /// Per-worker pause after each item, to stay inside provider quotas.
    /// Effective external request rate is roughly concurrency / delay.
    pub item_delay: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            item_delay: Duration::from_millis(400),
        }
    }
}

/// Shared work queue drained by the batch's workers.
///
/// Popping an item and advancing the sequence cursor happen under one lock,
/// so no two workers can dequeue the same code or the same index. The cursor
/// starts past the cache hits, which consumed the leading indexes.
struct WorkQueue {
    items: VecDeque<String>,
    cursor: usize,
}

impl WorkQueue {
    fn next(queue: &Mutex<WorkQueue>) -> Option<(usize, String)> {
        let mut guard = queue.lock().expect("work queue lock poisoned");
        let code = guard.items.pop_front()?;
        guard.cursor += 1;
        Some((guard.cursor, code))
    }
}

/// Orchestrator for one bulk submission.
///
/// Normalizes and deduplicates the raw rows, answers cache hits without any
/// outbound call, then drains the remainder through a bounded worker pool
/// against the provider chain, persisting successes and emitting exactly one
/// event per item. One item's failure never halts the batch; partial
/// completion is a normal terminal state.
#[derive(Clone)]
pub struct BatchProcessor {
    store: Arc<dyn RecordStore>,
    chain: Arc<ResolutionChain>,
    broadcaster: ProgressBroadcaster,
    settings: BatchSettings,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        chain: Arc<ResolutionChain>,
        broadcaster: ProgressBroadcaster,
        settings: BatchSettings,
    ) -> Self {
        Self {
            store,
            chain,
            broadcaster,
            settings,
        }
    }

    /// Run one batch to completion and tear down its progress sink.
    pub async fn run(&self, batch_id: String, raw_rows: Vec<String>) {
        let codes = dedupe_normalized(raw_rows);
        let total = codes.len();
        info!(batch_id = %batch_id, total, "starting batch");

        // Bulk cache check. If the store is unreachable we log and resolve
        // everything through the providers instead of failing the batch.
        let existing = match self.store.find_existing(&codes).await {
            Ok(found) => found,
            Err(err) => {
                warn!(batch_id = %batch_id, %err, "bulk cache check failed, resolving all codes");
                Default::default()
            }
        };

        let mut cursor = 0;
        let mut pending = VecDeque::new();
        for code in codes {
            match existing.get(&code) {
                Some(record) => {
                    cursor += 1;
                    self.emit(&batch_id, ResolutionEvent::cached(&batch_id, cursor, total, record));
                }
                None => pending.push_back(code),
            }
        }

        let queue = Arc::new(Mutex::new(WorkQueue {
            items: pending,
            cursor,
        }));

        let mut workers = JoinSet::new();
        for _ in 0..self.settings.concurrency.max(1) {
            let processor = self.clone();
            let batch_id = batch_id.clone();
            let queue = queue.clone();
            workers.spawn(async move { processor.drain(&batch_id, total, queue).await });
        }

        // Completion barrier: the sink is only torn down once every worker
        // has finished, even though sequence indexes are handed out earlier.
        while workers.join_next().await.is_some() {}

        info!(batch_id = %batch_id, total, "batch complete");
        self.broadcaster.unregister(&batch_id);
    }

    /// Worker loop: pop one code at a time until the queue is empty.
    async fn drain(&self, batch_id: &str, total: usize, queue: Arc<Mutex<WorkQueue>>) {
        while let Some((index, code)) = WorkQueue::next(&queue) {
            self.process_item(batch_id, index, total, &code).await;
            tokio::time::sleep(self.settings.item_delay).await;
        }
    }

    async fn process_item(&self, batch_id: &str, index: usize, total: usize, code: &str) {
        match self.chain.resolve(code).await {
            Ok(address) => {
                let record = CepRecord::from_resolved(code, &address);
                // The unique index on code makes concurrent inserts from
                // other batches a no-op rather than a conflict.
                match self.store.insert_if_absent(&record).await {
                    Ok(()) => self.emit(
                        batch_id,
                        ResolutionEvent::resolved(batch_id, index, total, code, &address),
                    ),
                    Err(err) => {
                        error!(batch_id, code, %err, "failed to persist resolved address");
                        self.emit(
                            batch_id,
                            ResolutionEvent::failed(
                                batch_id,
                                index,
                                total,
                                code,
                                format!("resolved but could not persist: {err}"),
                            ),
                        );
                    }
                }
            }
            Err(exhausted) => self.emit(
                batch_id,
                ResolutionEvent::failed(batch_id, index, total, code, exhausted.to_string()),
            ),
        }
    }

    fn emit(&self, batch_id: &str, event: ResolutionEvent) {
        counter!(
            "cep_batch_events_total",
            &[("outcome", event.outcome.as_label().to_owned())]
        )
        .increment(1);
        self.broadcaster.emit(batch_id, event);
    }
}

/// Normalize raw rows and deduplicate, keeping first-occurrence order.
fn dedupe_normalized(raw_rows: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut codes = Vec::new();
    for raw in raw_rows {
        if let Some(code) = normalize_cep(&raw) {
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ResolutionChain;
    use crate::event::Outcome;
    use crate::provider::{ProviderError, Source};
    use crate::test_utils::{address_from, MemoryRecordStore, MockProvider};

    fn settings() -> BatchSettings {
        BatchSettings {
            concurrency: 3,
            item_delay: Duration::ZERO,
        }
    }

    fn processor_with(
        store: Arc<MemoryRecordStore>,
        providers: Vec<Arc<MockProvider>>,
        broadcaster: ProgressBroadcaster,
    ) -> BatchProcessor {
        let chain = ResolutionChain::new(
            providers
                .into_iter()
                .map(|p| -> Arc<dyn crate::provider::AddressProvider> { p })
                .collect(),
        );
        BatchProcessor::new(store, Arc::new(chain), broadcaster, settings())
    }

    async fn collect_events(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<ResolutionEvent>,
    ) -> Vec<ResolutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_dedupe_normalized_keeps_first_occurrence_order() {
        let codes = dedupe_normalized(vec![
            "01310-100".to_owned(),
            "garbage".to_owned(),
            "22041011".to_owned(),
            "01310100".to_owned(), // duplicate of the first once normalized
        ]);
        assert_eq!(codes, vec!["01310100".to_owned(), "22041011".to_owned()]);
    }

    #[tokio::test]
    async fn test_batch_emits_one_event_per_deduplicated_item() {
        let store = Arc::new(MemoryRecordStore::new());
        let broadcaster = ProgressBroadcaster::new();
        let (_, rx) = broadcaster.register("batch-1");
        let provider = Arc::new(MockProvider::answering(
            Source::ViaCep,
            address_from(Source::ViaCep),
        ));
        let processor = processor_with(store.clone(), vec![provider], broadcaster);

        processor
            .run(
                "batch-1".to_owned(),
                vec![
                    "01310-100".to_owned(),
                    "01310100".to_owned(), // same code twice
                    "bogus".to_owned(),    // dropped at normalization
                    "22041011".to_owned(),
                ],
            )
            .await;

        let events = collect_events(rx).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.total == 2));
        assert!(events.iter().all(|e| e.outcome == Outcome::Resolved));
        assert_eq!(store.inserted(), 2);
    }

    #[tokio::test]
    async fn test_cached_codes_skip_the_providers() {
        let cached = CepRecord {
            code: "01310100".to_owned(),
            street: Some("Avenida Paulista".to_owned()),
            city: "São Paulo".to_owned(),
            state: "SP".to_owned(),
            is_single_address: false,
            source: Source::Correios,
            updated_at: chrono::Utc::now(),
        };
        let store = Arc::new(MemoryRecordStore::with_records(vec![cached]));
        let broadcaster = ProgressBroadcaster::new();
        let (_, rx) = broadcaster.register("batch-1");
        let provider = Arc::new(MockProvider::answering(
            Source::ViaCep,
            address_from(Source::ViaCep),
        ));
        let processor = processor_with(store.clone(), vec![provider.clone()], broadcaster);

        processor
            .run("batch-1".to_owned(), vec!["01310100".to_owned()])
            .await;

        let events = collect_events(rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Cached);
        assert_eq!(events[0].source, Some(Source::Correios));
        assert_eq!(provider.calls(), 0);
        assert_eq!(store.inserted(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_chain_emits_failed_and_persists_nothing() {
        let store = Arc::new(MemoryRecordStore::new());
        let broadcaster = ProgressBroadcaster::new();
        let (_, rx) = broadcaster.register("batch-1");
        let providers = vec![
            Arc::new(MockProvider::failing(
                Source::Correios,
                ProviderError::Network("timeout".to_owned()),
            )),
            Arc::new(MockProvider::failing(Source::ViaCep, ProviderError::NotFound)),
            Arc::new(MockProvider::failing(
                Source::BrasilApi,
                ProviderError::NotFound,
            )),
        ];
        let processor = processor_with(store.clone(), providers, broadcaster);

        processor
            .run("batch-1".to_owned(), vec!["99999999".to_owned()])
            .await;

        let events = collect_events(rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Failed);
        let reason = events[0].failure_reason.as_deref().unwrap();
        assert!(reason.contains("Correios + ViaCEP + BrasilAPI"), "{reason}");
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_becomes_failed_event() {
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_writes();
        let broadcaster = ProgressBroadcaster::new();
        let (_, rx) = broadcaster.register("batch-1");
        let provider = Arc::new(MockProvider::answering(
            Source::ViaCep,
            address_from(Source::ViaCep),
        ));
        let processor = processor_with(store, vec![provider], broadcaster);

        processor
            .run("batch-1".to_owned(), vec!["01310100".to_owned()])
            .await;

        let events = collect_events(rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Failed);
        assert!(events[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("could not persist"));
    }

    #[tokio::test]
    async fn test_fifty_codes_through_three_workers() {
        let store = Arc::new(MemoryRecordStore::new());
        let broadcaster = ProgressBroadcaster::new();
        let (_, rx) = broadcaster.register("batch-1");
        let provider = Arc::new(MockProvider::answering(
            Source::BrasilApi,
            address_from(Source::BrasilApi),
        ));
        let processor = processor_with(store.clone(), vec![provider], broadcaster);

        let rows: Vec<String> = (0..50).map(|n| format!("{:08}", n)).collect();
        processor.run("batch-1".to_owned(), rows.clone()).await;

        let events = collect_events(rx).await;
        assert_eq!(events.len(), 50);

        // Every code appears exactly once, regardless of interleaving.
        let mut codes: Vec<&str> = events.iter().map(|e| e.code.as_str()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), 50);

        // Sequence indexes hand out 1..=total exactly once.
        let mut indexes: Vec<usize> = events.iter().map(|e| e.sequence_index).collect();
        indexes.sort_unstable();
        assert_eq!(indexes, (1..=50).collect::<Vec<_>>());

        assert_eq!(store.inserted(), 50);
    }

    #[tokio::test]
    async fn test_sink_is_torn_down_after_completion() {
        let store = Arc::new(MemoryRecordStore::new());
        let broadcaster = ProgressBroadcaster::new();
        let (_, rx) = broadcaster.register("batch-1");
        let provider = Arc::new(MockProvider::answering(
            Source::ViaCep,
            address_from(Source::ViaCep),
        ));
        let processor = processor_with(store, vec![provider], broadcaster.clone());

        processor
            .run("batch-1".to_owned(), vec!["01310100".to_owned()])
            .await;

        // Emits after completion are silently dropped.
        broadcaster.emit(
            "batch-1",
            ResolutionEvent::failed("batch-1", 99, 1, "01310100", "late".to_owned()),
        );

        let events = collect_events(rx).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_completes_immediately() {
        let store = Arc::new(MemoryRecordStore::new());
        let broadcaster = ProgressBroadcaster::new();
        let (_, rx) = broadcaster.register("batch-1");
        let provider = Arc::new(MockProvider::failing(Source::ViaCep, ProviderError::NotFound));
        let processor = processor_with(store, vec![provider], broadcaster);

        processor
            .run("batch-1".to_owned(), vec!["not a cep".to_owned()])
            .await;

        let events = collect_events(rx).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_halt_the_batch() {
        // A provider that fails a specific code but answers the rest.
        struct Flaky;
        #[async_trait::async_trait]
        impl crate::provider::AddressProvider for Flaky {
            fn source(&self) -> Source {
                Source::ViaCep
            }
            async fn lookup(
                &self,
                code: &str,
            ) -> Result<crate::provider::ResolvedAddress, ProviderError> {
                if code == "00000003" {
                    Err(ProviderError::Network("boom".to_owned()))
                } else {
                    Ok(address_from(Source::ViaCep))
                }
            }
        }

        let store = Arc::new(MemoryRecordStore::new());
        let broadcaster = ProgressBroadcaster::new();
        let (_, rx) = broadcaster.register("batch-1");
        let chain = ResolutionChain::new(vec![Arc::new(Flaky)]);
        let processor = BatchProcessor::new(
            store.clone(),
            Arc::new(chain),
            broadcaster,
            settings(),
        );

        let rows: Vec<String> = (0..6).map(|n| format!("{:08}", n)).collect();
        processor.run("batch-1".to_owned(), rows).await;

        let events = collect_events(rx).await;
        assert_eq!(events.len(), 6);
        let failed = events
            .iter()
            .filter(|e| e.outcome == Outcome::Failed)
            .count();
        assert_eq!(failed, 1);
        assert_eq!(store.inserted(), 5);
    }
}
