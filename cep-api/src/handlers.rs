use std::convert::Infallible;

use axum::extract::{Multipart, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info};

use crate::api::{ApiError, UploadResponse};
use crate::event::ResolutionEvent;
use crate::ingest;
use crate::normalize::normalize_cep;
use crate::provider::{AddressProvider, ProviderError, ResolvedAddress};
use crate::router::AppState;
use crate::store::CepRecord;
use crate::stream::ProgressBroadcaster;

/// Accept a spreadsheet and start the batch in the background.
///
/// Returns as soon as the rows are extracted; progress is only observable
/// through the stream endpoint, so callers should open it before (or right
/// after) submitting, as events emitted without a sink are dropped.
pub async fn upload(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut rows = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidUpload(e.to_string()))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::InvalidUpload(e.to_string()))?;
            rows = Some(ingest::candidate_rows(&bytes).map_err(|e| ApiError::InvalidUpload(e.to_string()))?);
            break;
        }
    }

    let rows = rows.ok_or(ApiError::MissingFile)?;
    info!(batch_id = %batch_id, rows = rows.len(), "accepted bulk upload");

    let processor = state.processor.clone();
    let id = batch_id.clone();
    tokio::spawn(async move { processor.run(id, rows).await });

    Ok(Json(UploadResponse::started(batch_id)))
}

/// Unregisters the batch's sink when the SSE stream is dropped, whether by
/// client disconnect or by normal completion. Carries the handle of its own
/// registration so a stale stream cannot tear down a sink a reconnecting
/// client has registered since.
struct SinkGuard {
    broadcaster: ProgressBroadcaster,
    batch_id: String,
    handle: mpsc::WeakUnboundedSender<ResolutionEvent>,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.broadcaster.unregister_if(&self.batch_id, &self.handle);
    }
}

/// Open the progress stream for a batch: one JSON object per event.
///
/// The stream ends when the batch completes (the processor unregisters the
/// sink, closing the channel) or when the client goes away. Workers keep
/// running to completion either way; in-flight batches are not cancellable.
pub async fn stream(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (handle, receiver) = state.broadcaster.register(&batch_id);
    let guard = SinkGuard {
        broadcaster: state.broadcaster.clone(),
        batch_id,
        handle,
    };

    let stream = UnboundedReceiverStream::new(receiver).map(move |event| {
        // Holding the guard inside the closure ties its lifetime to the
        // stream itself.
        let _teardown_on_drop = &guard;
        match Event::default().json_data(&event) {
            Ok(message) => Ok(message),
            Err(err) => {
                error!(batch_id = %event.batch_id, %err, "failed to serialize progress event");
                Ok(Event::default().comment("serialization failure"))
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Single lookup: cache-first, then the full provider chain, persisting any
/// fresh resolution.
pub async fn lookup(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<CepRecord>, ApiError> {
    let code = normalize_cep(&code).ok_or(ApiError::InvalidCode(code))?;

    let mut cached = state
        .store
        .find_existing(std::slice::from_ref(&code))
        .await?;
    if let Some(record) = cached.remove(&code) {
        return Ok(Json(record));
    }

    let address = state
        .chain
        .resolve(&code)
        .await
        .map_err(|e| ApiError::Unresolvable(e.to_string()))?;

    let record = CepRecord::from_resolved(&code, &address);
    state.store.insert_if_absent(&record).await?;

    Ok(Json(record))
}

/// Direct Correios lookup, no fallback and no cache.
pub async fn correios_lookup(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<ResolvedAddress>, ApiError> {
    let correios = state
        .correios
        .as_ref()
        .ok_or(ApiError::CorreiosNotConfigured)?;

    let code = normalize_cep(&code).ok_or(ApiError::InvalidCode(code))?;

    match correios.lookup(&code).await {
        Ok(address) => Ok(Json(address)),
        Err(ProviderError::NotFound) => Err(ApiError::Unresolvable(format!(
            "Correios has no address for {code}"
        ))),
        Err(err) => Err(ApiError::CorreiosFailure(err.to_string())),
    }
}
