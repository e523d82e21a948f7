//! Anchor-aligned billing cycle window arithmetic.
//!
//! Pure, deterministic, UTC-only. Given a subscription's effective lifetime,
//! an optional trial end, and a recurrence config, compute the half-open
//! `[start, end)` window that `now` falls inside, or walk forward through a
//! sequence of upcoming windows. No I/O, no clocks read internally — callers
//! always pass `now` explicitly so the math stays reproducible in tests.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recurrence granularity for a billing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Interval {
    Minute,
    Day,
    Week,
    Month,
    Year,
    Onetime,
}

/// The calendar position that aligns cycle boundaries.
///
/// `Numeric` carries second (0-59) for `Minute`, hour (0-23) for `Day`,
/// weekday (0-6, Sunday = 0) for `Week`, or day-of-month (1-31) for
/// `Month`/`Year`. `DayOfCreation` derives the anchor from the
/// subscription's effective start instead of a caller-supplied value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Anchor {
    Numeric(u32),
    DayOfCreation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleConfig {
    pub interval: Interval,
    pub interval_count: u32,
    pub anchor: Anchor,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CycleError {
    #[error("interval_count must be >= 1")]
    ZeroIntervalCount,
    #[error("numeric anchor {0} is out of range for interval {1:?}")]
    AnchorOutOfRange(u32, Interval),
}

impl CycleConfig {
    pub fn validate(&self) -> Result<(), CycleError> {
        if self.interval_count == 0 {
            return Err(CycleError::ZeroIntervalCount);
        }
        if let Anchor::Numeric(value) = self.anchor {
            let max = match self.interval {
                Interval::Minute => 59,
                Interval::Day => 23,
                Interval::Week => 6,
                Interval::Month | Interval::Year => 31,
                Interval::Onetime => 0,
            };
            if self.interval != Interval::Onetime && value > max {
                return Err(CycleError::AnchorOutOfRange(value, self.interval));
            }
        }
        Ok(())
    }
}

/// A half-open `[start, end)` billing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Fraction of a full cycle this window represents, in basis points of
    /// a `[0.0, 1.0]` ratio stored as an integer to stay float-comparison-free
    /// in callers that need exact equality; use [`CycleWindow::proration_factor`]
    /// for the ratio itself.
    proration_factor_milli: u32,
    pub is_trial: bool,
}

impl CycleWindow {
    fn new(start: DateTime<Utc>, end: DateTime<Utc>, proration_factor: f64, is_trial: bool) -> Self {
        let clamped = proration_factor.clamp(0.0, 1.0);
        Self {
            start,
            end,
            proration_factor_milli: (clamped * 1000.0).round() as u32,
            is_trial,
        }
    }

    pub fn proration_factor(&self) -> f64 {
        self.proration_factor_milli as f64 / 1000.0
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Current cycle window containing `now`, or `None` when `now` falls
/// outside the subscription's effective lifetime.
pub fn calculate_cycle_window(
    effective_start: DateTime<Utc>,
    effective_end: Option<DateTime<Utc>>,
    trial_ends_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &CycleConfig,
) -> Option<CycleWindow> {
    if now < effective_start {
        return None;
    }
    if let Some(end) = effective_end {
        if now >= end {
            return None;
        }
    }

    if let Some(trial_end) = trial_ends_at {
        if now < trial_end {
            let end = clamp_end(trial_end, effective_end);
            return Some(CycleWindow::new(effective_start, end, 0.0, true));
        }
    }

    if config.interval == Interval::Onetime {
        let end = effective_end.unwrap_or(far_future());
        return Some(CycleWindow::new(effective_start, end, 1.0, false));
    }

    let anchor = resolve_anchor(config, effective_start);
    let paid_start = effective_start.max(trial_ends_at.unwrap_or(effective_start));

    if config.interval == Interval::Minute {
        let start = minute_floor(now, config.interval_count, anchor);
        let raw_end = minute_step(start, config.interval_count);
        let end = clamp_end(raw_end, effective_end);
        let factor = proration(start, end, raw_end - start);
        return Some(CycleWindow::new(start, end, factor, false));
    }

    let first_aligned = ceil_boundary(config.interval, config.interval_count, anchor, paid_start);
    if now < first_aligned {
        let end = clamp_end(first_aligned, effective_end);
        let prev = step_boundary_back(config.interval, config.interval_count, anchor, first_aligned);
        let factor = proration(paid_start, end, first_aligned - prev);
        return Some(CycleWindow::new(paid_start, end, factor, false));
    }

    let mut current = first_aligned;
    let mut guard = 0u32;
    loop {
        let next = step_boundary(config.interval, config.interval_count, anchor, current);
        if now < next {
            let end = clamp_end(next, effective_end);
            let factor = proration(current, end, next - current);
            return Some(CycleWindow::new(current, end, factor, false));
        }
        current = next;
        guard += 1;
        if guard > 100_000 {
            let end = clamp_end(next, effective_end);
            return Some(CycleWindow::new(current, end, 1.0, false));
        }
    }
}

/// Windows covering `[effective_start, reference]` plus `count` additional
/// future windows, stopping at `effective_end` when present.
pub fn calculate_next_n_cycles(
    reference: DateTime<Utc>,
    effective_start: DateTime<Utc>,
    effective_end: Option<DateTime<Utc>>,
    trial_ends_at: Option<DateTime<Utc>>,
    config: &CycleConfig,
    count: u32,
) -> Vec<CycleWindow> {
    let mut windows = Vec::new();
    let mut paid_start = effective_start;

    if let Some(trial_end) = trial_ends_at {
        if trial_end > effective_start {
            let end = clamp_end(trial_end, effective_end);
            windows.push(CycleWindow::new(effective_start, end, 0.0, true));
            if end < trial_end {
                return windows;
            }
            paid_start = trial_end;
        }
    }

    if config.interval == Interval::Onetime {
        let end = effective_end.unwrap_or(far_future());
        if end > paid_start {
            windows.push(CycleWindow::new(paid_start, end, 1.0, false));
        }
        return windows;
    }

    if let Some(eend) = effective_end {
        if paid_start >= eend {
            return windows;
        }
    }

    let anchor = resolve_anchor(config, effective_start);

    let mut current = if config.interval == Interval::Minute {
        minute_floor(paid_start, config.interval_count, anchor)
    } else {
        let first_aligned = ceil_boundary(config.interval, config.interval_count, anchor, paid_start);
        if first_aligned > paid_start {
            let end = clamp_end(first_aligned, effective_end);
            let prev = step_boundary_back(config.interval, config.interval_count, anchor, first_aligned);
            let factor = proration(paid_start, end, first_aligned - prev);
            windows.push(CycleWindow::new(paid_start, end, factor, false));
            if end < first_aligned {
                return windows;
            }
        }
        first_aligned
    };

    let mut windows_past_reference = 0u32;
    let mut guard = 0u32;
    loop {
        let next = step_boundary(config.interval, config.interval_count, anchor, current);
        let mut end = next;
        let mut capped = false;
        if let Some(eend) = effective_end {
            if eend <= current {
                break;
            }
            if eend < end {
                end = eend;
                capped = true;
            }
        }
        let factor = if capped {
            proration(current, end, next - current)
        } else {
            1.0
        };
        windows.push(CycleWindow::new(current, end, factor, false));
        if capped {
            break;
        }
        if end > reference {
            windows_past_reference += 1;
        }
        if windows_past_reference > count {
            break;
        }
        current = next;
        guard += 1;
        if guard > 200_000 {
            break;
        }
    }

    windows
}

fn clamp_end(end: DateTime<Utc>, effective_end: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match effective_end {
        Some(eend) if eend < end => eend,
        _ => end,
    }
}

fn proration(start: DateTime<Utc>, end: DateTime<Utc>, nominal: ChronoDuration) -> f64 {
    let nominal_secs = nominal.num_seconds().max(1) as f64;
    let actual_secs = (end - start).num_seconds().max(0) as f64;
    (actual_secs / nominal_secs).clamp(0.0, 1.0)
}

fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).single().expect("valid far-future timestamp")
}

fn resolve_anchor(config: &CycleConfig, effective_start: DateTime<Utc>) -> u32 {
    match config.anchor {
        Anchor::Numeric(value) => value,
        Anchor::DayOfCreation => match config.interval {
            Interval::Minute => effective_start.second(),
            Interval::Day => effective_start.hour(),
            Interval::Week => effective_start.weekday().num_days_from_sunday(),
            Interval::Month | Interval::Year => effective_start.day(),
            Interval::Onetime => 0,
        },
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month");
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid next month");
    (next - first).num_days() as u32
}

fn set_day_of_month_midnight(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    let capped = day.clamp(1, days_in_month(year, month));
    let date = NaiveDate::from_ymd_opt(year, month, capped).expect("valid date");
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("valid midnight"))
}

fn add_calendar_months(year: i32, month: u32, months: i32) -> (i32, u32) {
    let total = year * 12 + (month as i32 - 1) + months;
    let y = total.div_euclid(12);
    let m = (total.rem_euclid(12) + 1) as u32;
    (y, m)
}

fn minute_floor(from: DateTime<Utc>, count: u32, anchor_second: u32) -> DateTime<Utc> {
    let count = count.max(1);
    let anchor_second = anchor_second % 60;
    let floored_minute = (from.minute() / count) * count;
    let candidate = from
        .with_minute(floored_minute)
        .and_then(|d| d.with_second(anchor_second))
        .and_then(|d| d.with_nanosecond(0))
        .expect("valid minute/second fields");
    if candidate > from {
        candidate - ChronoDuration::minutes(count as i64)
    } else {
        candidate
    }
}

fn minute_step(boundary: DateTime<Utc>, count: u32) -> DateTime<Utc> {
    boundary + ChronoDuration::minutes(count.max(1) as i64)
}

fn day_boundary_ceil(from: DateTime<Utc>, anchor_hour: u32) -> DateTime<Utc> {
    let naive = from.date_naive().and_hms_opt(anchor_hour % 24, 0, 0).expect("valid hour");
    let candidate = Utc.from_utc_datetime(&naive);
    if candidate >= from {
        candidate
    } else {
        candidate + ChronoDuration::days(1)
    }
}

fn week_boundary_ceil(from: DateTime<Utc>, anchor_weekday: u32) -> DateTime<Utc> {
    let anchor_weekday = anchor_weekday % 7;
    let current = from.date_naive();
    let current_wd = current.weekday().num_days_from_sunday();
    let diff = (anchor_weekday + 7 - current_wd) % 7;
    let candidate_date = current + ChronoDuration::days(diff as i64);
    let candidate = Utc.from_utc_datetime(&candidate_date.and_hms_opt(0, 0, 0).expect("valid midnight"));
    if candidate >= from {
        candidate
    } else {
        candidate + ChronoDuration::weeks(1)
    }
}

fn month_boundary_ceil(from: DateTime<Utc>, anchor_day: u32) -> DateTime<Utc> {
    let candidate = set_day_of_month_midnight(from.year(), from.month(), anchor_day);
    if candidate >= from {
        candidate
    } else {
        let (y, m) = add_calendar_months(from.year(), from.month(), 1);
        set_day_of_month_midnight(y, m, anchor_day)
    }
}

fn year_boundary_ceil(from: DateTime<Utc>, anchor_day: u32) -> DateTime<Utc> {
    month_boundary_ceil(from, anchor_day)
}

fn ceil_boundary(interval: Interval, count: u32, anchor: u32, from: DateTime<Utc>) -> DateTime<Utc> {
    match interval {
        Interval::Minute => minute_floor(from, count, anchor),
        Interval::Day => day_boundary_ceil(from, anchor),
        Interval::Week => week_boundary_ceil(from, anchor),
        Interval::Month => month_boundary_ceil(from, anchor),
        Interval::Year => year_boundary_ceil(from, anchor),
        Interval::Onetime => from,
    }
}

fn step_boundary(interval: Interval, count: u32, anchor: u32, boundary: DateTime<Utc>) -> DateTime<Utc> {
    let count = count.max(1);
    match interval {
        Interval::Minute => minute_step(boundary, count),
        Interval::Day => boundary + ChronoDuration::days(count as i64),
        Interval::Week => boundary + ChronoDuration::weeks(count as i64),
        Interval::Month => {
            let (y, m) = add_calendar_months(boundary.year(), boundary.month(), count as i32);
            set_day_of_month_midnight(y, m, anchor)
        }
        Interval::Year => {
            let (y, m) = add_calendar_months(boundary.year(), boundary.month(), 12 * count as i32);
            set_day_of_month_midnight(y, m, anchor)
        }
        Interval::Onetime => boundary,
    }
}

fn step_boundary_back(interval: Interval, count: u32, anchor: u32, boundary: DateTime<Utc>) -> DateTime<Utc> {
    let count = count.max(1);
    match interval {
        Interval::Minute => boundary - ChronoDuration::minutes(count as i64),
        Interval::Day => boundary - ChronoDuration::days(count as i64),
        Interval::Week => boundary - ChronoDuration::weeks(count as i64),
        Interval::Month => {
            let (y, m) = add_calendar_months(boundary.year(), boundary.month(), -(count as i32));
            set_day_of_month_midnight(y, m, anchor)
        }
        Interval::Year => {
            let (y, m) = add_calendar_months(boundary.year(), boundary.month(), -12 * count as i32);
            set_day_of_month_midnight(y, m, anchor)
        }
        Interval::Onetime => boundary,
    }
}
