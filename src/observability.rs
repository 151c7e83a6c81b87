use crate::engine::EngineError;

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (confirmed, rejected, cancelled).
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Counter: bookings refused by the conflict guard. Labels: reason.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotbook_booking_conflicts_total";

// ── Slot lifecycle ──────────────────────────────────────────────

/// Counter: slots created by materialization.
pub const SLOTS_MATERIALIZED_TOTAL: &str = "slotbook_slots_materialized_total";

/// Counter: slots withdrawn by bulk cancellation.
pub const BULK_CANCELLED_SLOTS_TOTAL: &str = "slotbook_bulk_cancelled_slots_total";

/// Counter: bookings cancelled by bulk cancellation.
pub const BULK_CANCELLED_BOOKINGS_TOTAL: &str = "slotbook_bulk_cancelled_bookings_total";

/// Histogram: occurrences produced per rule expansion.
pub const EXPANSION_OCCURRENCES: &str = "slotbook_expansion_occurrences";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "slotbook_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "slotbook_journal_flush_batch_size";

/// Map a rejected booking to a short label for metrics.
pub fn conflict_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::SlotNotFree(_) => "slot_not_free",
        EngineError::ClientConflict { .. } => "client_overlap",
        EngineError::ProviderConflict { .. } => "provider_overlap",
        EngineError::NotFound { .. } => "not_found",
        _ => "other",
    }
}
