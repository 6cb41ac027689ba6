use super::traits::ConsentRegistry;
use crate::fragment::MemoRecord;
use crate::memory::FragmentProjector;
use crate::message::{InboundMessage, Provenance};

use std::sync::Arc;

/// Outcome of the pre-ingestion check, plus which resources already exist
/// so callers can skip redundant work.
#[derive(Debug, Clone, Copy)]
pub struct GateDecision {
    pub should_ingest: bool,
    pub memo_present: bool,
    pub relational_present: bool,
}

/// Consent and duplicate gate in front of long-term persistence.
///
/// Fail-closed: a consent lookup error or a relational probe error refuses
/// ingestion. Silent ingestion on error is the one outcome this type must
/// never produce.
pub struct IngestionGate {
    consent: Arc<dyn ConsentRegistry>,
    projector: Arc<FragmentProjector>,
    self_user_id: String,
}

impl IngestionGate {
    pub fn new(
        consent: Arc<dyn ConsentRegistry>,
        projector: Arc<FragmentProjector>,
        self_user_id: impl Into<String>,
    ) -> Self {
        Self {
            consent,
            projector,
            self_user_id: self_user_id.into(),
        }
    }

    pub async fn evaluate(
        &self,
        message: &InboundMessage,
        ingest_requested: bool,
        memo_present: bool,
    ) -> GateDecision {
        let refused = GateDecision {
            should_ingest: false,
            memo_present,
            relational_present: false,
        };

        if !ingest_requested {
            return refused;
        }

        // The assistant's own messages are permanently opted in.
        if message.author_id != self.self_user_id {
            match self.consent.is_opted_in(&message.author_id).await {
                Ok(true) => {}
                Ok(false) => return refused,
                Err(e) => {
                    tracing::warn!(
                        author_id = %message.author_id,
                        "consent lookup failed, refusing ingestion: {e:#}"
                    );
                    return refused;
                }
            }
        }

        match self.projector.store().has_message(&message.id) {
            Ok(true) => GateDecision {
                should_ingest: false,
                memo_present,
                relational_present: true,
            },
            Ok(false) => GateDecision {
                should_ingest: true,
                memo_present,
                relational_present: false,
            },
            Err(e) => {
                tracing::warn!(
                    message_id = %message.id,
                    "relational probe failed, refusing ingestion: {e:#}"
                );
                refused
            }
        }
    }

    /// Run the projection. Never raises — the cache write path must not
    /// block on downstream store health.
    pub async fn ingest_message(&self, provenance: &Provenance, memo: &MemoRecord) {
        match self.projector.project(provenance, memo).await {
            Ok(rows) => {
                tracing::debug!(
                    message_id = %provenance.message_id,
                    rows,
                    "message ingested"
                );
            }
            Err(e) => {
                tracing::warn!(
                    message_id = %provenance.message_id,
                    "ingestion failed: {e:#}"
                );
            }
        }
    }
}
