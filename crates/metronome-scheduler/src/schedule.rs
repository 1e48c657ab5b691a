//! Schedule expressions — parsing, validation, and next-fire computation.
//!
//! Three textual forms:
//! - `@at 2026-03-01T09:00:00Z` — one-shot at an absolute time
//! - `@every 30m` — fixed interval (units: s, m, h, d)
//! - `0 8 * * *` — 5-field cron: MIN HOUR DOM MON DOW
//!
//! Cron fields support `*`, `N`, `*/S`, `N-M`, `N-M/S`, and comma lists.
//! No cron crate dependency — the parser is small enough to own.
//!
//! Parsing normalizes: `@every 5m` becomes `@every 300s`, `@at` times are
//! canonicalized to UTC, cron whitespace is collapsed. Normalization is
//! idempotent, so stored and re-validated expressions compare equal.

use chrono::{DateTime, Datelike, Duration, SecondsFormat, TimeZone, Timelike, Utc};
use metronome_core::{MetronomeError, Result};

/// Bound on the forward search for a cron match. An expression with no
/// match inside this window can never fire (e.g. `0 0 31 2 *`).
const CRON_SEARCH_DAYS: i64 = 400;

/// A parsed, normalized schedule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fire once at an absolute time.
    Once { at: DateTime<Utc> },
    /// Fire every `every_secs` seconds, anchored to the previous fire.
    Interval { every_secs: u64 },
    /// Fire on a cron schedule.
    Cron(CronFields),
}

/// Parsed cron field sets. Matching values are sorted and deduplicated;
/// `text` is the normalized expression the sets were parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronFields {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_is_wildcard: bool,
    dow_is_wildcard: bool,
    text: String,
}

impl Schedule {
    /// Parse and normalize an expression. Pure and deterministic.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if let Some(rest) = expr.strip_prefix("@at ") {
            let at = DateTime::parse_from_rfc3339(rest.trim()).map_err(|e| {
                MetronomeError::InvalidExpression(format!("bad @at timestamp '{}': {e}", rest.trim()))
            })?;
            return Ok(Schedule::Once { at: at.with_timezone(&Utc) });
        }
        if let Some(rest) = expr.strip_prefix("@every ") {
            let every_secs = parse_interval(rest.trim())?;
            return Ok(Schedule::Interval { every_secs });
        }
        if expr.starts_with('@') {
            return Err(MetronomeError::InvalidExpression(format!(
                "unknown directive '{expr}' (expected @at or @every)"
            )));
        }
        Ok(Schedule::Cron(CronFields::parse(expr)?))
    }

    /// Parse with the acceptance rules for administrative input: an
    /// expression that can never produce a future fire time is rejected.
    /// A one-shot time already in the past is rejected unless
    /// `allow_expired` is set, in which case it fires immediately on
    /// registration.
    pub fn validate(expr: &str, allow_expired: bool) -> Result<Self> {
        let schedule = Self::parse(expr)?;
        let now = Utc::now();
        match &schedule {
            Schedule::Once { at } => {
                if *at <= now && !allow_expired {
                    return Err(MetronomeError::InvalidExpression(format!(
                        "one-shot time {} is in the past",
                        at.to_rfc3339_opts(SecondsFormat::Secs, true)
                    )));
                }
            }
            Schedule::Interval { .. } => {}
            Schedule::Cron(fields) => {
                if fields.next_after(now).is_none() {
                    return Err(MetronomeError::InvalidExpression(format!(
                        "cron expression '{}' never fires",
                        fields.text
                    )));
                }
            }
        }
        Ok(schedule)
    }

    /// Normalized textual form. `parse(s.normalized()) == parse(s)`.
    pub fn normalized(&self) -> String {
        match self {
            Schedule::Once { at } => {
                format!("@at {}", at.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            Schedule::Interval { every_secs } => format!("@every {every_secs}s"),
            Schedule::Cron(fields) => fields.text.clone(),
        }
    }

    /// First fire time for a freshly registered entry. An expired
    /// one-shot (admitted with `allow_expired`) fires immediately.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once { at } => Some((*at).max(now)),
            Schedule::Interval { every_secs } => {
                Some(now + Duration::seconds(*every_secs as i64))
            }
            Schedule::Cron(fields) => fields.next_after(now),
        }
    }

    /// Fire time when resuming a paused entry. Strictly in the future:
    /// a one-shot whose moment passed while paused is never backfilled.
    pub fn next_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once { at } => (*at > now).then_some(*at),
            Schedule::Interval { every_secs } => {
                Some(now + Duration::seconds(*every_secs as i64))
            }
            Schedule::Cron(fields) => fields.next_after(now),
        }
    }

    /// Next fire after a fire at `fired_at`. Anchored to the scheduled
    /// fire time, not to "now", so intervals do not drift.
    pub fn next_after(&self, fired_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once { .. } => None,
            Schedule::Interval { every_secs } => {
                Some(fired_at + Duration::seconds(*every_secs as i64))
            }
            Schedule::Cron(fields) => fields.next_after(fired_at),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.normalized())
    }
}

/// Parse `@every` bodies: `300s`, `5m`, `2h`, `1d`, or a bare second count.
fn parse_interval(s: &str) -> Result<u64> {
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| MetronomeError::InvalidExpression(format!("bad interval '{s}'")))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        _ => {
            return Err(MetronomeError::InvalidExpression(format!(
                "bad interval unit '{unit}' (expected s, m, h, or d)"
            )));
        }
    };
    if secs == 0 {
        return Err(MetronomeError::InvalidExpression("interval must be at least 1s".into()));
    }
    Ok(secs)
}

impl CronFields {
    /// Parse a 5-field cron expression: MIN HOUR DOM MON DOW.
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(MetronomeError::InvalidExpression(format!(
                "'{expr}' has {} fields, need 5: MIN HOUR DOM MON DOW",
                parts.len()
            )));
        }

        let minutes = parse_field(parts[0], 0, 59)
            .ok_or_else(|| field_err(expr, "minute", parts[0]))?;
        let hours = parse_field(parts[1], 0, 23)
            .ok_or_else(|| field_err(expr, "hour", parts[1]))?;
        let days_of_month = parse_field(parts[2], 1, 31)
            .ok_or_else(|| field_err(expr, "day-of-month", parts[2]))?;
        let months = parse_field(parts[3], 1, 12)
            .ok_or_else(|| field_err(expr, "month", parts[3]))?;
        // 0 and 7 both mean Sunday
        let days_of_week = parse_field(parts[4], 0, 7)
            .map(|mut v| {
                if v.contains(&7) {
                    v.retain(|d| *d != 7);
                    if !v.contains(&0) {
                        v.insert(0, 0);
                    }
                }
                v
            })
            .ok_or_else(|| field_err(expr, "day-of-week", parts[4]))?;

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_is_wildcard: parts[2] == "*",
            dow_is_wildcard: parts[4] == "*",
            text: parts.join(" "),
        })
    }

    /// Least time strictly after `after` matching all fields, or None
    /// within the search window.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Start at the next whole minute
        let mut candidate = (after + Duration::minutes(1))
            .with_second(0)
            .and_then(|c| c.with_nanosecond(0))
            .unwrap_or(after);
        let horizon = after + Duration::days(CRON_SEARCH_DAYS);

        while candidate <= horizon {
            if !self.day_matches(candidate) {
                // Skip to midnight of the next day
                candidate = Utc
                    .with_ymd_and_hms(candidate.year(), candidate.month(), candidate.day(), 0, 0, 0)
                    .single()?
                    + Duration::days(1);
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate
                    .with_minute(0)
                    .unwrap_or(candidate)
                    + Duration::hours(1);
                continue;
            }
            if self.minutes.contains(&candidate.minute()) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }

    /// Date-level match. Per classic cron: when both DOM and DOW are
    /// restricted, a day matching either fires.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        if !self.months.contains(&t.month()) {
            return false;
        }
        let dom_ok = self.days_of_month.contains(&t.day());
        let dow_ok = self
            .days_of_week
            .contains(&t.weekday().num_days_from_sunday());
        match (self.dom_is_wildcard, self.dow_is_wildcard) {
            (true, true) => true,
            (false, true) => dom_ok,
            (true, false) => dow_ok,
            (false, false) => dom_ok || dow_ok,
        }
    }
}

fn field_err(expr: &str, field: &str, token: &str) -> MetronomeError {
    MetronomeError::InvalidExpression(format!("'{expr}': bad {field} field '{token}'"))
}

/// Parse one cron field into a sorted list of matching values.
/// Accepts `*`, `N`, `*/S`, `N-M`, `N-M/S`, and comma lists of those.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().ok()?;
                if step == 0 {
                    return None;
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (a.parse().ok()?, b.parse().ok()?)
        } else {
            let n: u32 = range.parse().ok()?;
            (n, n)
        };
        if lo < min || hi > max || lo > hi {
            return None;
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_hour() {
        let s = Schedule::parse("0 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 30, 0).unwrap();
        let next = s.next_after(after).unwrap();
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_specific_time() {
        let s = Schedule::parse("0 8 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 7, 0, 0).unwrap();
        let next = s.next_after(after).unwrap();
        assert_eq!(next.hour(), 8);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.day(), 22);
    }

    #[test]
    fn test_day_of_week() {
        // Mondays at 9:00. 2026-02-22 is a Sunday.
        let s = Schedule::parse("0 9 * * 1").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        let next = s.next_after(after).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
        assert_eq!(next.day(), 23);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn test_ranges_and_steps() {
        let s = Schedule::parse("*/15 8-17 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 17, 50, 0).unwrap();
        let next = s.next_after(after).unwrap();
        // Past the working window: rolls to 8:00 the next day
        assert_eq!(next.hour(), 8);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.day(), 23);
    }

    #[test]
    fn test_dom_dow_either_matches() {
        // "the 1st, or any Monday" — classic cron OR semantics
        let s = Schedule::parse("0 0 1 * 1").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 0, 0, 0).unwrap();
        let next = s.next_after(after).unwrap();
        // Monday Feb 23 comes before March 1
        assert_eq!(next.day(), 23);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(Schedule::parse("bad").is_err());
        assert!(Schedule::parse("61 * * * *").is_err());
        assert!(Schedule::parse("* * 0 * *").is_err());
        assert!(Schedule::parse("*/0 * * * *").is_err());
        assert!(Schedule::parse("@every 0s").is_err());
        assert!(Schedule::parse("@every 5x").is_err());
        assert!(Schedule::parse("@at not-a-time").is_err());
        assert!(Schedule::parse("@wat").is_err());
    }

    #[test]
    fn test_unsatisfiable_cron_rejected() {
        // February 31st never exists
        assert!(Schedule::validate("0 0 31 2 *", false).is_err());
    }

    #[test]
    fn test_expired_one_shot() {
        let expr = "@at 2020-01-01T00:00:00Z";
        assert!(Schedule::validate(expr, false).is_err());
        // Admitted with the explicit flag, fires immediately
        let s = Schedule::validate(expr, true).unwrap();
        let now = Utc::now();
        assert_eq!(s.first_fire(now), Some(now));
    }

    #[test]
    fn test_normalization_idempotent() {
        for expr in [
            "@every 5m",
            "@every 300s",
            "@at 2030-06-01T12:00:00+02:00",
            "0  8  *  * *",
            "*/15 8-17 1,15 * 1-5",
        ] {
            let once = Schedule::parse(expr).unwrap().normalized();
            let twice = Schedule::parse(&once).unwrap().normalized();
            assert_eq!(once, twice, "normalization not idempotent for '{expr}'");
        }
        assert_eq!(Schedule::parse("@every 5m").unwrap().normalized(), "@every 300s");
        assert_eq!(
            Schedule::parse("@at 2030-06-01T12:00:00+02:00").unwrap().normalized(),
            "@at 2030-06-01T10:00:00Z"
        );
    }

    #[test]
    fn test_interval_anchored_to_fire_time() {
        let s = Schedule::parse("@every 60s").unwrap();
        let fired = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 0).unwrap();
        // Next fire is fired_at + 60s regardless of how long the run took
        assert_eq!(s.next_after(fired).unwrap(), fired + Duration::seconds(60));
    }

    #[test]
    fn test_resume_never_backfills() {
        let now = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 0).unwrap();
        // A one-shot that came due while paused stays dead on resume
        let missed = Schedule::Once { at: now - Duration::hours(1) };
        assert_eq!(missed.next_from(now), None);
        // Interval and cron resume strictly after "now"
        let every = Schedule::parse("@every 60s").unwrap();
        assert!(every.next_from(now).unwrap() > now);
        let cron = Schedule::parse("*/5 * * * *").unwrap();
        assert!(cron.next_from(now).unwrap() > now);
    }

    #[test]
    fn test_one_shot_fires_once() {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let s = Schedule::Once { at };
        assert_eq!(s.first_fire(at - Duration::hours(1)), Some(at));
        assert_eq!(s.next_after(at), None);
    }
}
