use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn page<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    items
        .into_iter()
        .skip(offset)
        .take(limit.min(MAX_PAGE_SIZE))
        .collect()
}

impl Engine {
    pub async fn get_slot(&self, slot_id: Ulid) -> Result<TimeSlot, EngineError> {
        let ps = self
            .provider_for_entity(&slot_id)
            .and_then(|pid| self.provider(&pid))
            .ok_or_else(|| EngineError::not_found("slot", slot_id))?;
        let guard = ps.read().await;
        guard
            .slot(&slot_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("slot", slot_id))
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<BookingDetail, EngineError> {
        let ps = self
            .provider_for_entity(&booking_id)
            .and_then(|pid| self.provider(&pid))
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        let guard = ps.read().await;
        let booking = guard
            .bookings
            .get(&booking_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        let slot = guard
            .slot(&booking.slot_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("slot", booking.slot_id))?;
        Ok(BookingDetail { booking, slot })
    }

    /// `Planned` slots lying fully inside `window`, ordered by start. `None`
    /// for `service_id` matches every service.
    pub async fn list_free_slots(
        &self,
        provider_id: Ulid,
        service_id: Option<Ulid>,
        window: Span,
        limit: usize,
        offset: usize,
    ) -> Result<SlotPage, EngineError> {
        if !window.is_valid() {
            return Err(EngineError::InvalidRange);
        }
        let Some(ps) = self.provider(&provider_id) else {
            return Ok(SlotPage::default());
        };
        let guard = ps.read().await;
        let matching: Vec<TimeSlot> = guard
            .within(&window)
            .filter(|s| s.is_free())
            .filter(|s| service_id.is_none() || s.service_id == service_id)
            .cloned()
            .collect();
        drop(guard);

        let total = matching.len();
        Ok(SlotPage {
            slots: page(matching, limit, offset),
            total,
        })
    }

    /// Every slot of the provider inside `window`, whatever its status.
    pub async fn list_provider_slots(
        &self,
        provider_id: Ulid,
        window: Span,
        limit: usize,
        offset: usize,
    ) -> Result<SlotPage, EngineError> {
        if !window.is_valid() {
            return Err(EngineError::InvalidRange);
        }
        let Some(ps) = self.provider(&provider_id) else {
            return Ok(SlotPage::default());
        };
        let guard = ps.read().await;
        let all: Vec<TimeSlot> = guard.within(&window).cloned().collect();
        drop(guard);

        let total = all.len();
        Ok(SlotPage {
            slots: page(all, limit, offset),
            total,
        })
    }

    /// Bookings of a client, cancelled ones included, whose slot starts inside
    /// `window` (every booking when `None`). Ordered by slot start.
    pub async fn list_client_bookings(
        &self,
        client_id: Ulid,
        window: Option<Span>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<BookingDetail>, usize), EngineError> {
        if window.is_some_and(|w| !w.is_valid()) {
            return Err(EngineError::InvalidRange);
        }

        let mut by_provider: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for (booking_id, provider_id) in self.index.client_bookings(&client_id) {
            by_provider.entry(provider_id).or_default().push(booking_id);
        }

        let mut found = Vec::new();
        for (provider_id, booking_ids) in by_provider {
            let Some(ps) = self.provider(&provider_id) else {
                continue;
            };
            let guard = ps.read().await;
            for booking_id in booking_ids {
                let Some(booking) = guard.bookings.get(&booking_id) else {
                    continue;
                };
                let Some(slot) = guard.slot(&booking.slot_id) else {
                    continue;
                };
                if window.is_some_and(|w| slot.span.start < w.start || slot.span.start >= w.end) {
                    continue;
                }
                found.push(BookingDetail {
                    booking: booking.clone(),
                    slot: slot.clone(),
                });
            }
        }
        found.sort_by_key(|d| (d.slot.span.start, d.booking.created_at, d.booking.id));

        let total = found.len();
        Ok((page(found, limit, offset), total))
    }
}
