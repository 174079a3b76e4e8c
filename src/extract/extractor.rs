//! Clip extraction pipeline
//!
//! 1. Lease the current buffer contents so nothing we read is released
//! 2. Plan the clip and narrow the lease to the segments it needs
//! 3. Run the primitive into freshly allocated storage
//! 4. Record a ledger entry, or delete the output on failure
//!
//! Extraction never mutates the buffer.

use super::plan::{plan_clip, ClipPlan};
use super::primitive::SegmentExtractor;
use super::types::{ClipOutcome, ClipRequest, ExtractError};
use crate::buffer::RollingBuffer;
use crate::highlights::{Highlight, HighlightLedger};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct ClipExtractor {
    buffer: RollingBuffer,
    primitive: Arc<dyn SegmentExtractor>,
    ledger: Arc<HighlightLedger>,
}

impl ClipExtractor {
    pub fn new(
        buffer: RollingBuffer,
        primitive: Arc<dyn SegmentExtractor>,
        ledger: Arc<HighlightLedger>,
    ) -> Self {
        Self {
            buffer,
            primitive,
            ledger,
        }
    }

    pub fn buffer(&self) -> &RollingBuffer {
        &self.buffer
    }

    pub fn ledger(&self) -> &Arc<HighlightLedger> {
        &self.ledger
    }

    /// Plan without extracting
    pub fn plan(&self, request: &ClipRequest) -> Result<ClipPlan, ExtractError> {
        plan_clip(&self.buffer.snapshot(), request)
    }

    /// Produce the clip for `request` and record it
    pub async fn extract(
        &self,
        request: ClipRequest,
        source_peer: Option<String>,
    ) -> Result<ClipOutcome, ExtractError> {
        let mut lease = self.buffer.lease_snapshot();
        let plan = match plan_clip(&lease.snapshot(), &request) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(
                    trigger_ms = request.trigger_ms,
                    code = e.code(),
                    "Cannot plan clip: {}",
                    e
                );
                return Err(e);
            }
        };
        lease.narrow(&plan.sequences());

        let id = Uuid::new_v4();
        let storage = self.ledger.storage().allocate(id).await?;
        let job = plan.job(storage.clone());

        tracing::debug!(
            %id,
            segments = ?plan.sequences(),
            "Extracting [{}ms, {}ms] (offset {}ms, read bound {}ms)",
            plan.clip_start_ms,
            plan.clip_end_ms,
            plan.start_offset_ms,
            plan.read_end_offset_ms
        );

        let result = self.primitive.extract(&job).await;
        drop(lease);

        if let Err(e) = result {
            tracing::error!(%id, code = e.code(), "Clip extraction failed: {}", e);
            if let Err(cleanup) = self.ledger.storage().delete(&storage).await {
                tracing::warn!(%id, "Failed to remove partial output {}: {}", storage, cleanup);
            }
            return Err(e);
        }

        let highlight = Highlight {
            id,
            created_at: Utc::now(),
            trigger_ms: request.trigger_ms,
            requested_ms: request.duration_ms,
            duration_ms: plan.duration_ms(),
            partial: plan.coverage.is_partial(),
            storage,
            source_peer,
        };
        self.ledger.record(highlight.clone()).await;

        Ok(ClipOutcome {
            highlight,
            coverage: plan.coverage,
        })
    }
}
