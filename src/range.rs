//! Half-open time intervals in an explicit timezone.

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;

use crate::engine::EngineError;

/// Interval `[start, end)`. Construct through [`TimeRange::new`] or [`normalize`]
/// to get the `end > start` guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl TimeRange {
    pub fn new(start: DateTime<Tz>, end: DateTime<Tz>) -> Result<Self, EngineError> {
        if end <= start {
            return Err(EngineError::InvalidRange);
        }
        Ok(Self { start, end })
    }

    pub fn utc(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, EngineError> {
        Self::new(start.with_timezone(&Tz::UTC), end.with_timezone(&Tz::UTC))
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn with_timezone(&self, tz: &Tz) -> Self {
        Self {
            start: self.start.with_timezone(tz),
            end: self.end.with_timezone(tz),
        }
    }

    pub fn overlaps(&self, other: &TimeRange, inclusive: bool) -> bool {
        overlaps(self, other, inclusive)
    }
}

/// Builds a valid range out of loosely ordered bounds.
///
/// Reversed bounds are swapped, both ends are moved into `tz` when given, and a
/// positive `max_duration` truncates the end to `start + max_duration`.
pub fn normalize(
    start: Option<DateTime<Tz>>,
    end: Option<DateTime<Tz>>,
    tz: Option<Tz>,
    max_duration: Option<TimeDelta>,
) -> Result<TimeRange, EngineError> {
    let (Some(mut start), Some(mut end)) = (start, end) else {
        return Err(EngineError::InvalidRange);
    };
    if end < start {
        std::mem::swap(&mut start, &mut end);
    }
    if let Some(tz) = tz {
        start = start.with_timezone(&tz);
        end = end.with_timezone(&tz);
    }
    if let Some(max) = max_duration.filter(|d| *d > TimeDelta::zero()) {
        if end - start > max {
            end = start + max;
        }
    }
    TimeRange::new(start, end)
}

/// Cuts `range` into consecutive slots of `slot_duration`.
///
/// With `align_minutes > 0` the first boundary moves forward to the next minute
/// mark divisible by `align_minutes`. A trailing piece shorter than
/// `slot_duration` is dropped.
pub fn split(
    range: &TimeRange,
    slot_duration: TimeDelta,
    align_minutes: u32,
) -> Result<Vec<TimeRange>, EngineError> {
    if slot_duration <= TimeDelta::zero() {
        return Err(EngineError::InvalidDuration);
    }
    if range.end <= range.start {
        return Ok(Vec::new());
    }

    let mut cursor = range.start;
    if align_minutes > 0 {
        let rem = cursor.minute() % align_minutes;
        if rem != 0 {
            let minute_floor = cursor
                - TimeDelta::seconds(i64::from(cursor.second()))
                - TimeDelta::nanoseconds(i64::from(cursor.nanosecond()));
            match minute_floor.checked_add_signed(TimeDelta::minutes(i64::from(align_minutes - rem))) {
                Some(aligned) if aligned < range.end => cursor = aligned,
                _ => return Ok(Vec::new()),
            }
        }
    }

    let mut slots = Vec::new();
    while let Some(next) = cursor.checked_add_signed(slot_duration)
        && next <= range.end
    {
        slots.push(TimeRange {
            start: cursor,
            end: next,
        });
        cursor = next;
    }
    Ok(slots)
}

/// Half-open overlap test. With `inclusive`, touching endpoints count too.
pub fn overlaps(a: &TimeRange, b: &TimeRange, inclusive: bool) -> bool {
    if inclusive {
        a.start <= b.end && b.start <= a.end
    } else {
        a.start < b.end && b.start < a.end
    }
}

/// Linear scan returning every range in `existing` that overlaps `candidate`.
pub fn has_overlap(
    candidate: &TimeRange,
    existing: &[TimeRange],
    inclusive: bool,
) -> (bool, Vec<TimeRange>) {
    let conflicts: Vec<TimeRange> = existing
        .iter()
        .filter(|r| overlaps(candidate, r, inclusive))
        .copied()
        .collect();
    (!conflicts.is_empty(), conflicts)
}
