use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::ResolutionEvent;

/// Process-scoped registry mapping a batch id to its live event sink.
///
/// At most one sink per batch: registering again replaces the previous
/// sender, which ends the older stream. Workers emit while the HTTP layer
/// registers and unregisters, so the map sits behind an `RwLock`.
#[derive(Clone, Default)]
pub struct ProgressBroadcaster {
    sinks: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<ResolutionEvent>>>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a sink for `batch_id` and hand back the consuming end plus a
    /// weak handle identifying this registration. The receiver finishes once
    /// the sink is unregistered. The handle is weak so holding it does not
    /// keep the channel alive after teardown.
    pub fn register(
        &self,
        batch_id: &str,
    ) -> (
        mpsc::WeakUnboundedSender<ResolutionEvent>,
        mpsc::UnboundedReceiver<ResolutionEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tx.downgrade();
        self.sinks
            .write()
            .expect("progress sink lock poisoned")
            .insert(batch_id.to_owned(), tx);
        debug!(batch_id, "registered progress sink");
        (handle, rx)
    }

    /// Drop the sink for `batch_id`, if any. Safe to call twice: the batch
    /// processor unregisters on completion and the stream handler on
    /// disconnect, in either order.
    pub fn unregister(&self, batch_id: &str) {
        self.sinks
            .write()
            .expect("progress sink lock poisoned")
            .remove(batch_id);
        debug!(batch_id, "unregistered progress sink");
    }

    /// Drop the sink for `batch_id` only if it is the registration `handle`
    /// came from. A stream torn down after a reconnect replaced its sink must
    /// not take the replacement down with it.
    pub fn unregister_if(
        &self,
        batch_id: &str,
        handle: &mpsc::WeakUnboundedSender<ResolutionEvent>,
    ) {
        // An upgrade failure means every sender is gone, so the registry no
        // longer holds this registration either.
        let Some(tx) = handle.upgrade() else { return };
        let mut sinks = self.sinks.write().expect("progress sink lock poisoned");
        if sinks
            .get(batch_id)
            .is_some_and(|current| current.same_channel(&tx))
        {
            sinks.remove(batch_id);
            debug!(batch_id, "unregistered progress sink");
        }
    }

    /// Push one event to the batch's sink. A missing sink or a hung-up
    /// receiver is a silent no-op so a worker can never fail on emission.
    pub fn emit(&self, batch_id: &str, event: ResolutionEvent) {
        let sinks = self.sinks.read().expect("progress sink lock poisoned");
        if let Some(sink) = sinks.get(batch_id) {
            if sink.send(event).is_err() {
                debug!(batch_id, "progress sink receiver is gone, dropping event");
            }
        }
    }
}
