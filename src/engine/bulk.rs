use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability::{BULK_CANCELLED_BOOKINGS_TOTAL, BULK_CANCELLED_SLOTS_TOTAL};

use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Cancels every non-cancelled slot of `provider_id` lying inside `window`
    /// together with its active booking, as one commit.
    ///
    /// The affected bookings are captured before anything changes. A non-empty
    /// `reason` replaces each cancelled booking's comment. Client contacts are
    /// left empty here.
    pub async fn bulk_cancel_provider_slots(
        &self,
        provider_id: Ulid,
        window: Span,
        reason: Option<String>,
    ) -> Result<BulkCancelResult, EngineError> {
        if !window.is_valid() {
            return Err(EngineError::InvalidRange);
        }
        let reason = reason.filter(|r| !r.is_empty());
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let Some(ps) = self.provider(&provider_id) else {
            return Ok(BulkCancelResult::default());
        };
        let guard = ps.write_owned().await;

        let mut slot_ids = Vec::new();
        let mut affected = Vec::new();
        for slot in guard
            .within(&window)
            .filter(|s| s.status != SlotStatus::Cancelled)
        {
            slot_ids.push(slot.id);
            if let Some(booking) = guard.active_booking(&slot.id) {
                affected.push(AffectedBooking {
                    booking_id: booking.id,
                    slot_id: slot.id,
                    client_id: booking.client_id,
                    client_contact: None,
                    provider_id,
                    service_id: slot.service_id,
                    span: slot.span,
                });
            }
        }
        if slot_ids.is_empty() {
            return Ok(BulkCancelResult::default());
        }

        let result = BulkCancelResult {
            cancelled_slots: slot_ids.len(),
            cancelled_bookings: affected.len(),
            affected_bookings: affected,
        };
        let event = Event::ProviderSlotsCancelled {
            provider_id,
            slot_ids,
            booking_ids: result.affected_bookings.iter().map(|a| a.booking_id).collect(),
            reason,
            at: now_ms(),
        };
        self.commit(guard, event, ()).await?;

        metrics::counter!(BULK_CANCELLED_SLOTS_TOTAL).increment(result.cancelled_slots as u64);
        metrics::counter!(BULK_CANCELLED_BOOKINGS_TOTAL)
            .increment(result.cancelled_bookings as u64);
        info!(
            parent: &self.span,
            %provider_id,
            slots = result.cancelled_slots,
            bookings = result.cancelled_bookings,
            "provider slots cancelled"
        );
        Ok(result)
    }
}
