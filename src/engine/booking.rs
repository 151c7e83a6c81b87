use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_COMMENT_LEN;
use crate::model::*;
use crate::observability::{conflict_label, BOOKINGS_TOTAL, BOOKING_CONFLICTS_TOTAL};

use super::conflict::{check_booking, now_ms};
use super::{Engine, EngineError};

impl Engine {
    /// Confirms a booking of `slot_id` for `client_id`.
    ///
    /// The client's booking mutex is taken first, then the slot's provider
    /// partition. Both stay held until the booking is journaled, so two
    /// attempts on one slot, or two overlapping attempts by one client, are
    /// strictly ordered and the later one sees the earlier one's result.
    pub async fn create_booking(
        &self,
        client_id: Ulid,
        slot_id: Ulid,
        comment: String,
    ) -> Result<BookingDetail, EngineError> {
        if comment.len() > MAX_COMMENT_LEN {
            return Err(EngineError::LimitExceeded("comment too long"));
        }

        let client_guard = self.lock_client(client_id).await;
        let guard = self.resolve_entity_write(slot_id, "slot").await?;

        let mut slot = match check_booking(&guard, &self.index, &client_id, &slot_id) {
            Ok(slot) => slot,
            Err(e) => {
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => "rejected").increment(1);
                metrics::counter!(BOOKING_CONFLICTS_TOTAL, "reason" => conflict_label(&e))
                    .increment(1);
                debug!(parent: &self.span, %client_id, %slot_id, error = %e, "booking rejected");
                return Err(e);
            }
        };

        let booking = Booking {
            id: Ulid::new(),
            client_id,
            slot_id,
            status: BookingStatus::Confirmed,
            created_at: now_ms(),
            cancelled_at: None,
            comment,
        };
        let event = Event::BookingConfirmed {
            provider_id: guard.id,
            booking: booking.clone(),
        };
        self.commit(guard, event, client_guard).await?;

        slot.status = SlotStatus::Booked;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => "confirmed").increment(1);
        info!(
            parent: &self.span,
            booking_id = %booking.id,
            %client_id,
            %slot_id,
            provider_id = %slot.provider_id,
            "booking confirmed"
        );
        Ok(BookingDetail { booking, slot })
    }

    /// Cancels a booking and frees its slot. Cancelling a cancelled booking
    /// returns it unchanged.
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<BookingDetail, EngineError> {
        let guard = self.resolve_entity_write(booking_id, "booking").await?;
        let mut booking = guard
            .bookings
            .get(&booking_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        let mut slot = guard
            .slot(&booking.slot_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("slot", booking.slot_id))?;

        if booking.status == BookingStatus::Cancelled {
            return Ok(BookingDetail { booking, slot });
        }

        let at = now_ms();
        let event = Event::BookingCancelled {
            provider_id: guard.id,
            booking_id,
            at,
        };
        self.commit(guard, event, ()).await?;

        booking.status = BookingStatus::Cancelled;
        booking.cancelled_at = Some(at);
        if slot.status == SlotStatus::Booked {
            slot.status = SlotStatus::Planned;
        }
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => "cancelled").increment(1);
        info!(parent: &self.span, %booking_id, slot_id = %slot.id, "booking cancelled");
        Ok(BookingDetail { booking, slot })
    }

    /// Read-only dry run of [`Engine::create_booking`]. Missing and unavailable
    /// slots come back as `available: false` with a reason, not as errors.
    pub async fn check_availability(
        &self,
        client_id: Ulid,
        slot_id: Ulid,
    ) -> Result<Availability, EngineError> {
        let Some(ps) = self
            .provider_for_entity(&slot_id)
            .and_then(|pid| self.provider(&pid))
        else {
            return Ok(Availability::unavailable("slot not found"));
        };
        let guard = ps.read().await;
        match check_booking(&guard, &self.index, &client_id, &slot_id) {
            Ok(_) => Ok(Availability::available()),
            Err(EngineError::NotFound { .. }) => Ok(Availability::unavailable("slot not found")),
            Err(
                e @ (EngineError::SlotNotFree(_)
                | EngineError::ClientConflict { .. }
                | EngineError::ProviderConflict { .. }),
            ) => Ok(Availability::unavailable(e.to_string())),
            Err(e) => Err(e),
        }
    }
}
