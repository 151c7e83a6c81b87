use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Creates one `Planned` slot outside any schedule. A slot with the same
    /// `(service, start, end)` must not already exist for the provider.
    pub async fn create_slot(
        &self,
        provider_id: Ulid,
        service_id: Option<Ulid>,
        span: Span,
    ) -> Result<TimeSlot, EngineError> {
        validate_span(&span)?;
        let guard = self.provider_or_create(provider_id).write_owned().await;
        if guard.slots.len() >= MAX_SLOTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many slots for provider"));
        }
        if let Some(existing) = guard
            .overlapping(&span)
            .find(|s| s.service_id == service_id && s.span == span)
        {
            return Err(EngineError::SlotExists(existing.id));
        }

        let slot = TimeSlot {
            id: Ulid::new(),
            schedule_id: None,
            provider_id,
            service_id,
            span,
            status: SlotStatus::Planned,
        };
        let event = Event::SlotsCreated {
            provider_id,
            slots: vec![slot.clone()],
        };
        self.commit(guard, event, ()).await?;
        info!(parent: &self.span, slot_id = %slot.id, %provider_id, "slot created");
        Ok(slot)
    }

    /// Withdraws a slot: it becomes `Cancelled` and its active booking, if
    /// any, is cancelled with it. Withdrawing a cancelled slot is a no-op.
    pub async fn cancel_slot(&self, slot_id: Ulid) -> Result<TimeSlot, EngineError> {
        let guard = self.resolve_entity_write(slot_id, "slot").await?;
        let mut slot = guard
            .slot(&slot_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("slot", slot_id))?;
        if slot.status == SlotStatus::Cancelled {
            return Ok(slot);
        }

        let booking_id = guard.active_booking(&slot_id).map(|b| b.id);
        let event = Event::SlotWithdrawn {
            provider_id: guard.id,
            slot_id,
            booking_id,
            at: now_ms(),
        };
        self.commit(guard, event, ()).await?;

        slot.status = SlotStatus::Cancelled;
        info!(parent: &self.span, %slot_id, booking_id = ?booking_id, "slot withdrawn");
        Ok(slot)
    }

    /// Removes a slot record. Refused while any booking, cancelled or not,
    /// still references it.
    pub async fn delete_slot(&self, slot_id: Ulid) -> Result<(), EngineError> {
        let guard = self.resolve_entity_write(slot_id, "slot").await?;
        if guard.slot(&slot_id).is_none() {
            return Err(EngineError::not_found("slot", slot_id));
        }
        if guard.has_any_booking(&slot_id) {
            return Err(EngineError::SlotHasBookings(slot_id));
        }
        let event = Event::SlotDeleted {
            provider_id: guard.id,
            slot_id,
        };
        self.commit(guard, event, ()).await?;
        info!(parent: &self.span, %slot_id, "slot deleted");
        Ok(())
    }
}
