//! Daily/weekly recurrence rules and their expansion into concrete intervals.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeDelta, TimeZone, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::limits::MAX_OCCURRENCES_PER_EXPANSION;
use crate::range::TimeRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
}

/// A recurrence anchored at `start_time`, whose timezone is the rule's timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringRule {
    pub frequency: Frequency,
    /// Step in days or weeks. Zero is treated as one.
    pub interval: u32,
    /// Weekly only. Empty means "the anchor's weekday".
    pub weekdays: Vec<Weekday>,
    pub start_time: Option<DateTime<Tz>>,
    pub duration: TimeDelta,
    pub until: Option<DateTime<Tz>>,
    /// Maximum number of occurrences overlapping the window.
    pub count: Option<u32>,
    /// Local calendar dates skipped entirely.
    pub exceptions: BTreeSet<NaiveDate>,
}

impl RecurringRule {
    pub fn daily(start_time: DateTime<Tz>, duration: TimeDelta) -> Self {
        Self {
            frequency: Frequency::Daily,
            interval: 1,
            weekdays: Vec::new(),
            start_time: Some(start_time),
            duration,
            until: None,
            count: None,
            exceptions: BTreeSet::new(),
        }
    }

    pub fn weekly(start_time: DateTime<Tz>, duration: TimeDelta, weekdays: Vec<Weekday>) -> Self {
        Self {
            frequency: Frequency::Weekly,
            weekdays,
            ..Self::daily(start_time, duration)
        }
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_until(mut self, until: DateTime<Tz>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_exceptions(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.exceptions.extend(dates);
        self
    }

    fn step(&self) -> u64 {
        u64::from(self.interval.max(1))
    }
}

/// Resolves a local wall-clock time. Ambiguous times take the earlier instant,
/// times inside a DST gap are shifted forward one hour.
pub(crate) fn local_instant(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            let shifted = naive.checked_add_signed(TimeDelta::hours(1))?;
            tz.from_local_datetime(&shifted).earliest()
        })
}

/// Whole days an occurrence of `duration` can reach into, rounded up.
fn span_days(duration: TimeDelta) -> i64 {
    let days = duration.num_days();
    if duration > TimeDelta::days(days) { days + 1 } else { days }
}

/// Collects occurrences of `rule` that overlap `window` (exclusive touch).
///
/// Occurrences come back ordered by start, in the rule's timezone.
pub fn expand_rule(rule: &RecurringRule, window: &TimeRange) -> Result<Vec<TimeRange>, EngineError> {
    if rule.duration <= TimeDelta::zero() {
        return Err(EngineError::InvalidRule("duration must be positive".into()));
    }
    let Some(anchor) = rule.start_time else {
        return Err(EngineError::InvalidRule("start time is required".into()));
    };
    if window.end <= window.start {
        return Ok(Vec::new());
    }

    let tz = anchor.timezone();
    let window = window.with_timezone(&tz);
    let mut out = Expansion {
        rule,
        window,
        tz,
        time: anchor.naive_local().time(),
        anchor,
        emitted: Vec::new(),
    };

    if rule.frequency == Frequency::Weekly && !rule.weekdays.is_empty() {
        out.weekly_by_day()?;
    } else {
        out.stepped()?;
    }

    metrics::histogram!(crate::observability::EXPANSION_OCCURRENCES)
        .record(out.emitted.len() as f64);
    Ok(out.emitted)
}

struct Expansion<'a> {
    rule: &'a RecurringRule,
    window: TimeRange,
    tz: Tz,
    time: NaiveTime,
    anchor: DateTime<Tz>,
    emitted: Vec<TimeRange>,
}

enum Step {
    Continue,
    Stop,
}

impl Expansion<'_> {
    fn budget_spent(&self) -> bool {
        self.rule
            .count
            .is_some_and(|c| self.emitted.len() >= c as usize)
    }

    /// Handles one occurrence start. `Stop` means no later occurrence can be kept.
    fn offer(&mut self, start: DateTime<Tz>) -> Result<Step, EngineError> {
        if self.rule.until.is_some_and(|u| start > u) {
            return Ok(Step::Stop);
        }
        if self.rule.exceptions.contains(&start.date_naive()) {
            return Ok(Step::Continue);
        }
        let Some(end) = start.checked_add_signed(self.rule.duration) else {
            if start >= self.window.end {
                return Ok(Step::Stop);
            }
            return Err(EngineError::InvalidRange);
        };
        let occurrence = TimeRange { start, end };
        if occurrence.overlaps(&self.window, false) {
            if self.emitted.len() >= MAX_OCCURRENCES_PER_EXPANSION {
                return Err(EngineError::LimitExceeded("occurrences per expansion"));
            }
            self.emitted.push(occurrence);
            if self.budget_spent() {
                return Ok(Step::Stop);
            }
        } else if start >= self.window.end {
            return Ok(Step::Stop);
        }
        Ok(Step::Continue)
    }

    /// Daily rules, and weekly rules without a weekday set, advance a single
    /// cursor by `interval` days or weeks.
    fn stepped(&mut self) -> Result<(), EngineError> {
        if self.budget_spent() {
            return Ok(());
        }
        let step_days = match self.rule.frequency {
            Frequency::Daily => self.rule.step(),
            Frequency::Weekly => 7 * self.rule.step(),
        };
        let anchor_date = self.anchor.date_naive();

        // Occurrences ending before the window cannot overlap it and do not
        // count against the budget, so whole steps before it are skipped.
        let gap = (self.window.start.date_naive() - anchor_date).num_days()
            - span_days(self.rule.duration)
            - 1;
        let mut index = if gap > 0 { gap as u64 / step_days } else { 0 };

        loop {
            let Some(date) = anchor_date.checked_add_days(Days::new(index * step_days)) else {
                return Ok(());
            };
            let start = if index == 0 {
                self.anchor
            } else {
                match local_instant(&self.tz, date, self.time) {
                    Some(t) => t,
                    None => return Ok(()),
                }
            };
            if let Step::Stop = self.offer(start)? {
                return Ok(());
            }
            index += 1;
        }
    }

    /// Weekly rules with a weekday set walk Monday-anchored weeks, `interval`
    /// weeks apart, emitting one occurrence per listed weekday.
    fn weekly_by_day(&mut self) -> Result<(), EngineError> {
        let mut days: Vec<Weekday> = self.rule.weekdays.clone();
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();

        let anchor_date = self.anchor.date_naive();
        let Some(first_monday) = anchor_date
            .checked_sub_days(Days::new(u64::from(anchor_date.weekday().num_days_from_monday())))
        else {
            return Ok(());
        };
        let step_days = 7 * self.rule.step();

        let gap = (self.window.start.date_naive() - first_monday).num_days()
            - span_days(self.rule.duration)
            - 7;
        let mut week = if gap > 0 { gap as u64 / step_days } else { 0 };

        loop {
            if self.budget_spent() {
                return Ok(());
            }
            let Some(monday) = first_monday.checked_add_days(Days::new(week * step_days)) else {
                return Ok(());
            };
            if monday > self.window.end.date_naive() {
                return Ok(());
            }
            if self.rule.until.is_some_and(|u| monday > u.date_naive()) {
                return Ok(());
            }

            for day in &days {
                let Some(date) =
                    monday.checked_add_days(Days::new(u64::from(day.num_days_from_monday())))
                else {
                    return Ok(());
                };
                let Some(start) = local_instant(&self.tz, date, self.time) else {
                    continue;
                };
                if start < self.anchor {
                    continue;
                }
                if let Step::Stop = self.offer(start)? {
                    if self.budget_spent() || self.rule.until.is_some_and(|u| start > u) {
                        return Ok(());
                    }
                    // Past the window end: later days of this week are later still.
                    break;
                }
            }
            week += 1;
        }
    }
}
