use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::range::has_overlap;

use super::{EngineError, Index};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if !span.is_valid() {
        return Err(EngineError::InvalidRange);
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    Ok(())
}

fn overlapping(candidate: &Span, existing: Vec<Span>) -> Vec<Span> {
    let ranges: Vec<_> = existing.iter().map(Span::to_range).collect();
    let (_, conflicts) = has_overlap(&candidate.to_range(), &ranges, false);
    conflicts.iter().map(Span::from_range).collect()
}

/// Confirmed bookings of `client_id`, on any provider, overlapping `slot`.
pub(crate) fn client_conflicts(index: &Index, client_id: &Ulid, slot: &TimeSlot) -> Vec<Span> {
    let spans = index
        .client_confirmed(client_id)
        .into_iter()
        .filter(|c| c.slot_id != slot.id)
        .map(|c| c.span)
        .collect();
    overlapping(&slot.span, spans)
}

/// Confirmed bookings on the slot's own provider overlapping it.
pub(crate) fn provider_conflicts(ps: &ProviderState, slot: &TimeSlot) -> Vec<Span> {
    overlapping(&slot.span, ps.confirmed_spans(&slot.id))
}

/// Every check a booking must pass, in order: slot exists, slot is free, no
/// client overlap, no provider overlap. Returns the slot on success.
pub(crate) fn check_booking(
    ps: &ProviderState,
    index: &Index,
    client_id: &Ulid,
    slot_id: &Ulid,
) -> Result<TimeSlot, EngineError> {
    let slot = ps
        .slot(slot_id)
        .ok_or_else(|| EngineError::not_found("slot", *slot_id))?;
    if !slot.is_free() || ps.active_booking(slot_id).is_some() {
        return Err(EngineError::SlotNotFree(*slot_id));
    }
    let conflicts = client_conflicts(index, client_id, slot);
    if !conflicts.is_empty() {
        return Err(EngineError::ClientConflict {
            slot_id: *slot_id,
            conflicts,
        });
    }
    let conflicts = provider_conflicts(ps, slot);
    if !conflicts.is_empty() {
        return Err(EngineError::ProviderConflict {
            slot_id: *slot_id,
            conflicts,
        });
    }
    Ok(slot.clone())
}
