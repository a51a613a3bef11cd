use serde::{Deserialize, Serialize};

use crate::provider::{ResolvedAddress, Source};
use crate::store::CepRecord;

/// Terminal outcome of one batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Resolved,
    Failed,
    Cached,
}

impl Outcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            Outcome::Resolved => "resolved",
            Outcome::Failed => "failed",
            Outcome::Cached => "cached",
        }
    }
}

/// One immutable progress record, emitted exactly once per batch item.
///
/// `sequence_index` is assigned from a shared cursor at dequeue time, so
/// under concurrent workers events may arrive out of index order. Consumers
/// get a completion-count guarantee only: exactly `total` events per batch,
/// never a sorted arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionEvent {
    pub batch_id: String,
    pub sequence_index: usize,
    pub total: usize,
    pub code: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_single_address: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}

impl ResolutionEvent {
    pub fn cached(
        batch_id: &str,
        sequence_index: usize,
        total: usize,
        record: &CepRecord,
    ) -> Self {
        Self {
            batch_id: batch_id.to_owned(),
            sequence_index,
            total,
            code: record.code.clone(),
            outcome: Outcome::Cached,
            failure_reason: None,
            street: record.street.clone(),
            city: Some(record.city.clone()),
            state: Some(record.state.clone()),
            is_single_address: Some(record.is_single_address),
            source: Some(record.source),
        }
    }

    pub fn resolved(
        batch_id: &str,
        sequence_index: usize,
        total: usize,
        code: &str,
        address: &ResolvedAddress,
    ) -> Self {
        Self {
            batch_id: batch_id.to_owned(),
            sequence_index,
            total,
            code: code.to_owned(),
            outcome: Outcome::Resolved,
            failure_reason: None,
            street: address.street.clone(),
            city: Some(address.city.clone()),
            state: Some(address.state.clone()),
            is_single_address: Some(address.is_single_address),
            source: Some(address.source),
        }
    }

    pub fn failed(
        batch_id: &str,
        sequence_index: usize,
        total: usize,
        code: &str,
        reason: String,
    ) -> Self {
        Self {
            batch_id: batch_id.to_owned(),
            sequence_index,
            total,
            code: code.to_owned(),
            outcome: Outcome::Failed,
            failure_reason: Some(reason),
            street: None,
            city: None,
            state: None,
            is_single_address: None,
            source: None,
        }
    }
}
