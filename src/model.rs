use std::collections::HashMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::range::TimeRange;

/// Unix milliseconds, the storage time type.
pub type Ms = i64;

/// Half-open interval `[start, end)` in storage time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_range(range: &TimeRange) -> Self {
        Self::new(range.start.timestamp_millis(), range.end.timestamp_millis())
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn starts_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.start).unwrap_or_default()
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.end).unwrap_or_default()
    }

    /// The same interval as a UTC [`TimeRange`].
    pub fn to_range(&self) -> TimeRange {
        TimeRange {
            start: self.starts_at().with_timezone(&Tz::UTC),
            end: self.ends_at().with_timezone(&Tz::UTC),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Planned,
    Booked,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// A concrete bookable interval of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    /// Schedule the slot was materialized from; `None` for slots created directly.
    pub schedule_id: Option<Ulid>,
    pub provider_id: Ulid,
    pub service_id: Option<Ulid>,
    pub span: Span,
    pub status: SlotStatus,
}

impl TimeSlot {
    pub fn is_free(&self) -> bool {
        self.status == SlotStatus::Planned
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub client_id: Ulid,
    pub slot_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub comment: String,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }
}

/// All slots and bookings of one provider. The partition's lock is the row lock
/// for every slot it holds.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    /// Sorted by `span.start`.
    pub slots: Vec<TimeSlot>,
    /// Every booking ever made on this provider's slots, cancelled ones included.
    pub bookings: HashMap<Ulid, Booking>,
    /// slot id → its non-cancelled booking.
    pub active_by_slot: HashMap<Ulid, Ulid>,
}

impl ProviderState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            slots: Vec::new(),
            bookings: HashMap::new(),
            active_by_slot: HashMap::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: TimeSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<TimeSlot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: &Ulid) -> Option<&TimeSlot> {
        self.slots.iter().find(|s| s.id == *id)
    }

    pub fn slot_mut(&mut self, id: &Ulid) -> Option<&mut TimeSlot> {
        self.slots.iter_mut().find(|s| s.id == *id)
    }

    /// Slots whose span overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &TimeSlot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    /// Slots lying entirely inside the window.
    pub fn within(&self, window: &Span) -> impl Iterator<Item = &TimeSlot> {
        self.overlapping(window)
            .filter(move |s| window.contains_span(&s.span))
    }

    pub fn active_booking(&self, slot_id: &Ulid) -> Option<&Booking> {
        self.active_by_slot
            .get(slot_id)
            .and_then(|id| self.bookings.get(id))
    }

    pub fn has_any_booking(&self, slot_id: &Ulid) -> bool {
        self.bookings.values().any(|b| b.slot_id == *slot_id)
    }

    /// Spans of this provider's slots held by confirmed bookings, `exclude` aside.
    pub fn confirmed_spans(&self, exclude: &Ulid) -> Vec<Span> {
        self.slots
            .iter()
            .filter(|s| s.id != *exclude && s.status == SlotStatus::Booked)
            .filter(|s| {
                self.active_booking(&s.id)
                    .is_some_and(|b| b.status == BookingStatus::Confirmed)
            })
            .map(|s| s.span)
            .collect()
    }
}

/// Journal record. One event is one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotsCreated {
        provider_id: Ulid,
        slots: Vec<TimeSlot>,
    },
    SlotDeleted {
        provider_id: Ulid,
        slot_id: Ulid,
    },
    SlotWithdrawn {
        provider_id: Ulid,
        slot_id: Ulid,
        booking_id: Option<Ulid>,
        at: Ms,
    },
    BookingConfirmed {
        provider_id: Ulid,
        booking: Booking,
    },
    BookingCancelled {
        provider_id: Ulid,
        booking_id: Ulid,
        at: Ms,
    },
    ProviderSlotsCancelled {
        provider_id: Ulid,
        slot_ids: Vec<Ulid>,
        booking_ids: Vec<Ulid>,
        reason: Option<String>,
        at: Ms,
    },
    /// Compaction snapshot of a provider's booking records.
    BookingsRestored {
        provider_id: Ulid,
        bookings: Vec<Booking>,
    },
}

impl Event {
    pub fn provider_id(&self) -> Ulid {
        match self {
            Event::SlotsCreated { provider_id, .. }
            | Event::SlotDeleted { provider_id, .. }
            | Event::SlotWithdrawn { provider_id, .. }
            | Event::BookingConfirmed { provider_id, .. }
            | Event::BookingCancelled { provider_id, .. }
            | Event::ProviderSlotsCancelled { provider_id, .. }
            | Event::BookingsRestored { provider_id, .. } => *provider_id,
        }
    }
}

// ── Operation inputs and results ─────────────────────────────────

/// Occurrences one schedule contributes to a materialization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOccurrences {
    pub schedule_id: Ulid,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDetail {
    pub booking: Booking,
    pub slot: TimeSlot,
}

/// Booking as handed to callers. The display names are best-effort lookups and
/// may be absent even when the provider or service exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub provider_id: Ulid,
    pub service_id: Option<Ulid>,
    pub span: Span,
    pub provider_name: Option<String>,
    pub service_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<String>,
}

impl Availability {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Booking snapshot taken before a bulk cancellation touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffectedBooking {
    pub booking_id: Ulid,
    pub slot_id: Ulid,
    pub client_id: Ulid,
    /// External contact identifier of the client, filled in by the calendar layer.
    pub client_contact: Option<String>,
    pub provider_id: Ulid,
    pub service_id: Option<Ulid>,
    pub span: Span,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkCancelResult {
    pub cancelled_slots: usize,
    pub cancelled_bookings: usize,
    pub affected_bookings: Vec<AffectedBooking>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPage {
    pub slots: Vec<TimeSlot>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPage {
    pub bookings: Vec<BookingView>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCheck {
    pub valid: bool,
    pub reason: Option<String>,
    pub slot: Option<TimeSlot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub providers: usize,
    pub slots: usize,
    pub free_slots: usize,
    pub bookings: usize,
    pub active_bookings: usize,
}
