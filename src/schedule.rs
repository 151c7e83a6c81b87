//! Provider schedules and the versioned rule record stored inside them.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::range::TimeRange;
use crate::recurrence::{expand_rule, local_instant, Frequency, RecurringRule};

/// Rule as persisted on a schedule. Weekdays are 1 (Monday) through 7 (Sunday).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub frequency: Frequency,
    #[serde(default)]
    pub interval: u32,
    #[serde(default)]
    pub weekdays: Vec<u8>,
    pub starts_at: Option<DateTime<Utc>>,
    pub duration_min: u32,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub exceptions: Vec<NaiveDate>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "version")]
enum StoredRule {
    #[serde(rename = "1")]
    V1(ScheduleRule),
}

/// Validates and serializes a rule for storage on a schedule.
pub fn encode_rule(rule: &ScheduleRule) -> Result<String, EngineError> {
    if rule.duration_min == 0 {
        return Err(EngineError::InvalidArgument("duration_min must be positive"));
    }
    if rule.starts_at.is_none() {
        return Err(EngineError::InvalidRule("starts_at is required".into()));
    }
    if rule.weekdays.iter().any(|d| !(1..=7).contains(d)) {
        return Err(EngineError::InvalidArgument("weekdays must be within 1..=7"));
    }
    serde_json::to_string(&StoredRule::V1(rule.clone()))
        .map_err(|e| EngineError::Internal(e.to_string()))
}

/// `Ok(None)` means the schedule carries no rule. A rule that is present but
/// unreadable is an error of its own.
pub fn decode_rule(raw: Option<&str>) -> Result<Option<ScheduleRule>, EngineError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    match serde_json::from_str::<StoredRule>(raw) {
        Ok(StoredRule::V1(rule)) => Ok(Some(rule)),
        Err(e) => Err(EngineError::RuleDecode(e.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub id: Ulid,
    pub provider_id: Ulid,
    /// First local date the schedule is valid on.
    pub start_date: Option<NaiveDate>,
    /// Last local date the schedule is valid on, inclusive.
    pub end_date: Option<NaiveDate>,
    /// IANA name. Empty means UTC.
    pub time_zone: String,
    /// Encoded [`ScheduleRule`], see [`encode_rule`].
    pub rule: Option<String>,
}

impl Schedule {
    pub fn new(provider_id: Ulid, time_zone: impl Into<String>, rule: &ScheduleRule) -> Result<Self, EngineError> {
        Ok(Self {
            id: Ulid::new(),
            provider_id,
            start_date: None,
            end_date: None,
            time_zone: time_zone.into(),
            rule: Some(encode_rule(rule)?),
        })
    }

    pub fn with_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn has_valid_timezone(&self) -> bool {
        self.time_zone.is_empty() || self.time_zone.parse::<Tz>().is_ok()
    }

    /// Schedule timezone, UTC when absent or unknown.
    pub fn timezone(&self) -> Tz {
        self.time_zone.parse().unwrap_or(Tz::UTC)
    }

    pub fn decoded_rule(&self) -> Result<Option<ScheduleRule>, EngineError> {
        decode_rule(self.rule.as_deref())
    }
}

fn weekday_from_iso(n: u8) -> Option<Weekday> {
    Some(match n {
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        6 => Weekday::Sat,
        7 => Weekday::Sun,
        _ => return None,
    })
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// Expands a schedule's rule inside `window`, clipped to the schedule's
/// validity dates. Results are in UTC.
///
/// The rule's time of day is taken in the schedule timezone and anchored on the
/// schedule's start date, or on the rule's own start date when the schedule
/// has none.
pub fn expand_schedule(schedule: &Schedule, window: &TimeRange) -> Result<Vec<TimeRange>, EngineError> {
    let Some(stored) = schedule.decoded_rule()? else {
        return Ok(Vec::new());
    };

    let tz = schedule.timezone();
    let mut clipped = window.with_timezone(&tz);
    if let Some(first) = schedule.start_date.and_then(|d| local_instant(&tz, d, NaiveTime::MIN)) {
        clipped.start = clipped.start.max(first);
    }
    let last = schedule
        .end_date
        .and_then(|d| local_instant(&tz, d, end_of_day()));
    if let Some(last) = last {
        clipped.end = clipped.end.min(last);
    }
    if clipped.end <= clipped.start {
        return Ok(Vec::new());
    }

    let Some(starts_at) = stored.starts_at else {
        return Err(EngineError::InvalidRule("starts_at is required".into()));
    };
    let starts_local = starts_at.with_timezone(&tz);
    let base_date = schedule.start_date.unwrap_or(starts_local.date_naive());
    let start_time = local_instant(&tz, base_date, starts_local.time())
        .ok_or_else(|| EngineError::InvalidRule("start time does not exist locally".into()))?;

    let rule = RecurringRule {
        frequency: stored.frequency,
        interval: stored.interval,
        weekdays: stored.weekdays.iter().copied().filter_map(weekday_from_iso).collect(),
        start_time: Some(start_time),
        duration: TimeDelta::minutes(i64::from(stored.duration_min)),
        until: stored.until.map(|u| u.with_timezone(&tz)).or(last),
        count: stored.count.filter(|c| *c > 0),
        exceptions: stored.exceptions.iter().copied().collect::<BTreeSet<_>>(),
    };

    let occurrences = expand_rule(&rule, &clipped)?;
    Ok(occurrences
        .into_iter()
        .map(|r| r.with_timezone(&Tz::UTC))
        .collect())
}
