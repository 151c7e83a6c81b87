//! Request-facing calendar operations.
//!
//! [`Calendar`] sits between a transport layer and the [`Engine`]. It checks
//! that clients exist and that providers really hold the provider role,
//! loads schedules and materializes them before listing, and decorates
//! bookings with display names. The engine itself trusts its inputs.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::directory::{Directory, Role, RoleLookup, ScheduleSource};
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;
use crate::range::TimeRange;
use crate::schedule::expand_schedule;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarConfig {
    /// Longest window a listing or expansion may cover.
    pub max_window: TimeDelta,
    pub default_page_size: usize,
    /// How far ahead [`Calendar::nearest_free_slot`] looks by default.
    pub nearest_horizon: TimeDelta,
}

impl From<&Config> for CalendarConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_window: config.max_window(),
            default_page_size: config.default_page_size,
            nearest_horizon: config.nearest_horizon(),
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

pub struct Calendar {
    engine: Arc<Engine>,
    directory: Arc<dyn Directory>,
    schedules: Arc<dyn ScheduleSource>,
    config: CalendarConfig,
    span: tracing::Span,
}

impl Calendar {
    pub fn new(
        engine: Arc<Engine>,
        directory: Arc<dyn Directory>,
        schedules: Arc<dyn ScheduleSource>,
        config: CalendarConfig,
        span: tracing::Span,
    ) -> Self {
        Self {
            engine,
            directory,
            schedules,
            config,
            span,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    // ── Guards ──────────────────────────────────────────

    async fn ensure_provider_role(&self, provider_id: Ulid) -> Result<(), EngineError> {
        match self.directory.provider_role(provider_id).await? {
            RoleLookup::Role(Role::Provider) => Ok(()),
            RoleLookup::UnknownProvider => Err(EngineError::not_found("provider", provider_id)),
            RoleLookup::Unverified => {
                debug!(parent: &self.span, %provider_id, "provider role unverified");
                Err(EngineError::PermissionDenied(
                    "cannot verify provider role".into(),
                ))
            }
            RoleLookup::Role(role) => {
                debug!(parent: &self.span, %provider_id, ?role, "provider role rejected");
                Err(EngineError::PermissionDenied(
                    "only providers can manage schedules and slots".into(),
                ))
            }
        }
    }

    async fn ensure_client(&self, client_id: Ulid) -> Result<(), EngineError> {
        if self.directory.client_exists(client_id).await? {
            Ok(())
        } else {
            Err(EngineError::not_found("client", client_id))
        }
    }

    fn bounded_window(&self, window: &TimeRange) -> Result<Span, EngineError> {
        if window.end <= window.start {
            return Err(EngineError::InvalidRange);
        }
        if window.duration() > self.config.max_window {
            return Err(EngineError::LimitExceeded("window exceeds horizon"));
        }
        Ok(Span::from_range(window))
    }

    /// `(limit, offset)` for a 1-based page. Non-positive values fall back
    /// to page 1 and the configured page size.
    fn page_bounds(&self, page: i64, page_size: i64) -> (usize, usize) {
        let page = if page <= 0 { 1 } else { page as usize };
        let size = if page_size <= 0 {
            self.config.default_page_size
        } else {
            (page_size as usize).min(MAX_PAGE_SIZE)
        };
        (size, (page - 1).saturating_mul(size))
    }

    // ── Slots ───────────────────────────────────────────

    /// Expands every schedule of the provider inside `window` and persists
    /// the occurrences that are not slots yet. Returns how many were created.
    pub async fn materialize_slots(
        &self,
        provider_id: Ulid,
        service_id: Option<Ulid>,
        window: &TimeRange,
    ) -> Result<usize, EngineError> {
        let span = self.bounded_window(window)?;
        let schedules = self.schedules.provider_schedules(provider_id).await?;

        let mut occurrences = Vec::with_capacity(schedules.len());
        for schedule in &schedules {
            if !schedule.has_valid_timezone() {
                warn!(
                    parent: &self.span,
                    schedule_id = %schedule.id,
                    time_zone = %schedule.time_zone,
                    "unknown schedule timezone, expanding in UTC"
                );
            }
            let ranges = expand_schedule(schedule, window)?;
            if ranges.is_empty() {
                continue;
            }
            occurrences.push(ScheduleOccurrences {
                schedule_id: schedule.id,
                spans: ranges.iter().map(Span::from_range).collect(),
            });
        }

        self.engine
            .materialize_slots(provider_id, service_id, span, occurrences)
            .await
    }

    /// Free slots of a provider fully inside `window`, after materializing
    /// its schedules there. `page` is 1-based.
    pub async fn list_free_slots(
        &self,
        provider_id: Ulid,
        service_id: Option<Ulid>,
        window: &TimeRange,
        page: i64,
        page_size: i64,
    ) -> Result<SlotPage, EngineError> {
        let span = self.bounded_window(window)?;
        let (limit, offset) = self.page_bounds(page, page_size);
        self.materialize_slots(provider_id, service_id, window).await?;
        self.engine
            .list_free_slots(provider_id, service_id, span, limit, offset)
            .await
    }

    /// Earliest free slot between `from` (now) and `until` (`from` plus the
    /// configured horizon).
    pub async fn nearest_free_slot(
        &self,
        provider_id: Ulid,
        service_id: Option<Ulid>,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Option<TimeSlot>, EngineError> {
        let from = from.unwrap_or_else(Utc::now);
        let until = match until {
            Some(until) => until,
            None => from
                .checked_add_signed(self.config.nearest_horizon)
                .ok_or(EngineError::InvalidRange)?,
        };
        let window = TimeRange::utc(from, until)?;
        let page = self
            .list_free_slots(provider_id, service_id, &window, 1, 1)
            .await?;
        Ok(page.slots.into_iter().next())
    }

    /// Occurrences of one stored schedule inside `window`, in UTC.
    pub async fn expand_schedule(
        &self,
        schedule_id: Ulid,
        window: &TimeRange,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let schedule = self
            .schedules
            .schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("schedule", schedule_id))?;
        self.ensure_provider_role(schedule.provider_id).await?;
        self.bounded_window(window)?;
        expand_schedule(&schedule, window)
    }

    /// Soft check that a slot can be offered: it exists, is free, and
    /// belongs to the expected provider and service when those are given.
    pub async fn validate_slot(
        &self,
        slot_id: Ulid,
        expected_provider: Option<Ulid>,
        expected_service: Option<Ulid>,
    ) -> Result<SlotCheck, EngineError> {
        let slot = match self.engine.get_slot(slot_id).await {
            Ok(slot) => slot,
            Err(EngineError::NotFound { .. }) => {
                return Ok(SlotCheck {
                    valid: false,
                    reason: Some("slot not found".into()),
                    slot: None,
                });
            }
            Err(e) => return Err(e),
        };

        let reason = if !slot.span.is_valid() {
            Some("invalid slot time range")
        } else if !slot.is_free() {
            Some("slot is not free")
        } else if expected_provider.is_some_and(|p| p != slot.provider_id) {
            Some("slot provider mismatch")
        } else if expected_service.is_some() && expected_service != slot.service_id {
            Some("slot service mismatch")
        } else {
            None
        };
        Ok(SlotCheck {
            valid: reason.is_none(),
            reason: reason.map(String::from),
            slot: Some(slot),
        })
    }

    pub async fn create_slot(
        &self,
        provider_id: Ulid,
        service_id: Option<Ulid>,
        range: &TimeRange,
    ) -> Result<TimeSlot, EngineError> {
        self.ensure_provider_role(provider_id).await?;
        if range.end <= range.start {
            return Err(EngineError::InvalidRange);
        }
        self.engine
            .create_slot(provider_id, service_id, Span::from_range(range))
            .await
    }

    pub async fn cancel_slot(&self, slot_id: Ulid) -> Result<TimeSlot, EngineError> {
        let slot = self.engine.get_slot(slot_id).await?;
        self.ensure_provider_role(slot.provider_id).await?;
        self.engine.cancel_slot(slot_id).await
    }

    pub async fn delete_slot(&self, slot_id: Ulid) -> Result<(), EngineError> {
        let slot = self.engine.get_slot(slot_id).await?;
        self.ensure_provider_role(slot.provider_id).await?;
        self.engine.delete_slot(slot_id).await
    }

    // ── Bookings ────────────────────────────────────────

    pub async fn create_booking(
        &self,
        client_id: Ulid,
        slot_id: Ulid,
        comment: impl Into<String>,
    ) -> Result<BookingView, EngineError> {
        self.ensure_client(client_id).await?;
        let detail = self
            .engine
            .create_booking(client_id, slot_id, comment.into())
            .await?;
        Ok(self.view(detail).await)
    }

    /// Unknown clients are an error. Unknown or unavailable slots are
    /// reported in the result.
    pub async fn check_availability(
        &self,
        client_id: Ulid,
        slot_id: Ulid,
    ) -> Result<Availability, EngineError> {
        self.ensure_client(client_id).await?;
        self.engine.check_availability(client_id, slot_id).await
    }

    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<BookingView, EngineError> {
        let detail = self.engine.cancel_booking(booking_id).await?;
        Ok(self.view(detail).await)
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<BookingView, EngineError> {
        let detail = self.engine.get_booking(booking_id).await?;
        Ok(self.view(detail).await)
    }

    /// A client's bookings whose slot starts inside `window`, ordered by
    /// slot start. `page` is 1-based.
    pub async fn list_bookings(
        &self,
        client_id: Ulid,
        window: Option<&TimeRange>,
        page: i64,
        page_size: i64,
    ) -> Result<BookingPage, EngineError> {
        if window.is_some_and(|w| w.end <= w.start) {
            return Err(EngineError::InvalidRange);
        }
        let (limit, offset) = self.page_bounds(page, page_size);
        let (details, total) = self
            .engine
            .list_client_bookings(client_id, window.map(Span::from_range), limit, offset)
            .await?;
        let bookings = join_all(details.into_iter().map(|d| self.view(d))).await;
        Ok(BookingPage { bookings, total })
    }

    /// Cancels every slot of the provider inside `window` with its booking
    /// and returns who has to be told. Contacts are looked up after the
    /// commit; a failed lookup leaves that contact empty.
    pub async fn bulk_cancel_provider_slots(
        &self,
        provider_id: Ulid,
        window: &TimeRange,
        reason: Option<String>,
    ) -> Result<BulkCancelResult, EngineError> {
        if window.end <= window.start {
            return Err(EngineError::InvalidRange);
        }
        self.ensure_provider_role(provider_id).await?;

        let mut result = self
            .engine
            .bulk_cancel_provider_slots(provider_id, Span::from_range(window), reason)
            .await?;

        let contacts = join_all(
            result
                .affected_bookings
                .iter()
                .map(|a| self.directory.client_contact(a.client_id)),
        )
        .await;
        for (affected, contact) in result.affected_bookings.iter_mut().zip(contacts) {
            match contact {
                Ok(contact) => affected.client_contact = contact,
                Err(e) => warn!(
                    parent: &self.span,
                    client_id = %affected.client_id,
                    error = %e,
                    "client contact lookup failed"
                ),
            }
        }

        info!(
            parent: &self.span,
            %provider_id,
            cancelled_slots = result.cancelled_slots,
            cancelled_bookings = result.cancelled_bookings,
            "bulk cancellation finished"
        );
        Ok(result)
    }

    /// Attaches provider and service names. Lookup failures leave the name
    /// empty.
    async fn view(&self, detail: BookingDetail) -> BookingView {
        let BookingDetail { booking, slot } = detail;
        let provider_name = self
            .directory
            .provider_name(slot.provider_id)
            .await
            .unwrap_or_else(|e| {
                debug!(parent: &self.span, provider_id = %slot.provider_id, error = %e, "provider name lookup failed");
                None
            });
        let service_name = match slot.service_id {
            Some(service_id) => self
                .directory
                .service_name(service_id)
                .await
                .unwrap_or_else(|e| {
                    debug!(parent: &self.span, %service_id, error = %e, "service name lookup failed");
                    None
                }),
            None => None,
        };
        BookingView {
            booking,
            provider_id: slot.provider_id,
            service_id: slot.service_id,
            span: slot.span,
            provider_name,
            service_name,
        }
    }
}
