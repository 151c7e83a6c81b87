use std::collections::HashSet;

use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_SLOTS_PER_PROVIDER;
use crate::model::*;
use crate::observability::SLOTS_MATERIALIZED_TOTAL;

use super::conflict::validate_span;
use super::{Engine, EngineError};

type SlotKey = (Option<Ulid>, Ms, Ms);

impl Engine {
    /// Persists the occurrences that do not yet exist as slots of
    /// `(provider_id, service_id)` and returns how many were created.
    ///
    /// Existing slots are matched by `(service, start, end)` regardless of
    /// status, under the provider's write lock, so repeated or concurrent
    /// calls never create duplicates. New slots are `Planned` and inserted in
    /// one commit ordered by start, then end.
    pub async fn materialize_slots(
        &self,
        provider_id: Ulid,
        service_id: Option<Ulid>,
        window: Span,
        occurrences: Vec<ScheduleOccurrences>,
    ) -> Result<usize, EngineError> {
        if !window.is_valid() {
            return Err(EngineError::InvalidRange);
        }

        let mut candidates: Vec<(Ulid, Span)> = Vec::new();
        for occ in &occurrences {
            for span in &occ.spans {
                validate_span(span)?;
                candidates.push((occ.schedule_id, *span));
            }
        }
        let Some(hull) = hull(candidates.iter().map(|(_, s)| s)) else {
            return Ok(0);
        };

        let guard = self.provider_or_create(provider_id).write_owned().await;

        let mut seen: HashSet<SlotKey> = guard
            .overlapping(&hull)
            .filter(|s| s.service_id == service_id)
            .map(|s| (s.service_id, s.span.start, s.span.end))
            .collect();

        let mut staged: Vec<(Ulid, Span)> = candidates
            .into_iter()
            .filter(|(_, span)| seen.insert((service_id, span.start, span.end)))
            .collect();
        if staged.is_empty() {
            return Ok(0);
        }
        if guard.slots.len() + staged.len() > MAX_SLOTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many slots for provider"));
        }
        staged.sort_by_key(|(_, span)| (span.start, span.end));

        let slots: Vec<TimeSlot> = staged
            .into_iter()
            .map(|(schedule_id, span)| TimeSlot {
                id: Ulid::new(),
                schedule_id: Some(schedule_id),
                provider_id,
                service_id,
                span,
                status: SlotStatus::Planned,
            })
            .collect();
        let created = slots.len();
        self.commit(guard, Event::SlotsCreated { provider_id, slots }, ())
            .await?;

        metrics::counter!(SLOTS_MATERIALIZED_TOTAL).increment(created as u64);
        info!(
            parent: &self.span,
            %provider_id,
            service_id = ?service_id,
            created,
            "slots materialized"
        );
        Ok(created)
    }
}

fn hull<'a>(spans: impl Iterator<Item = &'a Span>) -> Option<Span> {
    spans.fold(None, |acc, s| match acc {
        None => Some(*s),
        Some(h) => Some(Span::new(h.start.min(s.start), h.end.max(s.end))),
    })
}
