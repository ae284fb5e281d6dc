//! Schedule expressions: cron (5, 6 or 7 fields, or `@daily` style
//! descriptors) and fixed intervals written as `@every 30s`.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::error::{CadenceError, Result};

/// Cap on how many missed ticks are counted when catching up.
const MAX_MISSED_COUNT: usize = 10_000;

#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(parse_error(expr, "empty expression"));
        }

        if let Some(rest) = trimmed.strip_prefix("@every") {
            let interval = parse_interval(rest)
                .ok_or_else(|| parse_error(expr, "expected an interval like 30s, 5m or 1h30m"))?;
            return Ok(Schedule::Every(interval));
        }

        let normalized = normalize_cron(trimmed);
        cron::Schedule::from_str(&normalized)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| parse_error(expr, &e.to_string()))
    }

    /// Parse and require at least one fire time after `now`.
    pub fn parse_upcoming(expr: &str, now: DateTime<Utc>) -> Result<Self> {
        let schedule = Self::parse(expr)?;
        if schedule.next_after(now).is_none() {
            return Err(parse_error(expr, "schedule has no future fire time"));
        }
        Ok(schedule)
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(s) => s.after(&after).next(),
            Schedule::Every(interval) => after.checked_add_signed(*interval),
        }
    }

    /// Number of fire times in `(from, to]`, capped.
    pub fn missed_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        if to <= from {
            return 0;
        }
        match self {
            Schedule::Cron(s) => s
                .after(&from)
                .take_while(|t| *t <= to)
                .take(MAX_MISSED_COUNT)
                .count(),
            Schedule::Every(interval) => {
                let step = interval.num_milliseconds().max(1);
                let span = (to - from).num_milliseconds();
                ((span / step) as usize).min(MAX_MISSED_COUNT)
            }
        }
    }
}

fn parse_error(expr: &str, reason: &str) -> CadenceError {
    CadenceError::ScheduleParse {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}

/// The `cron` crate wants a leading seconds field; standard 5-field
/// expressions get `0` seconds.
fn normalize_cron(expr: &str) -> String {
    if expr.starts_with('@') {
        return expr.to_string();
    }
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// Parse `1d12h`, `90s`, `5m` style intervals. Zero is rejected.
fn parse_interval(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let mut total_secs: i64 = 0;
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let n: i64 = digits.parse().ok()?;
        digits.clear();
        let unit = match ch {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        total_secs = total_secs.checked_add(n.checked_mul(unit)?)?;
    }
    if !digits.is_empty() {
        return None;
    }

    (total_secs > 0).then(|| Duration::seconds(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let schedule = Schedule::parse("0 * * * *").unwrap();
        let next = schedule.next_after(at(10, 15, 30)).unwrap();
        assert_eq!(next, at(11, 0, 0));
    }

    #[test]
    fn six_field_cron_keeps_seconds() {
        let schedule = Schedule::parse("*/10 * * * * *").unwrap();
        let next = schedule.next_after(at(10, 0, 1)).unwrap();
        assert_eq!(next.second(), 10);
    }

    #[test]
    fn descriptor_is_accepted() {
        let schedule = Schedule::parse("@hourly").unwrap();
        assert_eq!(schedule.next_after(at(10, 15, 0)).unwrap(), at(11, 0, 0));
    }

    #[test]
    fn every_interval() {
        let schedule = Schedule::parse("@every 1h30m").unwrap();
        assert_eq!(schedule.next_after(at(10, 0, 0)).unwrap(), at(11, 30, 0));
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for expr in ["", "not a cron", "@every", "@every 0s", "@every 5x", "@every 10"] {
            let err = Schedule::parse(expr).unwrap_err();
            assert!(
                matches!(err, CadenceError::ScheduleParse { .. }),
                "{expr} should be a parse error"
            );
        }
    }

    #[test]
    fn schedule_without_future_fire_is_rejected() {
        let err = Schedule::parse_upcoming("0 0 0 1 1 * 2001", Utc::now()).unwrap_err();
        assert!(matches!(err, CadenceError::ScheduleParse { .. }));
    }

    #[test]
    fn missed_ticks_are_counted() {
        let schedule = Schedule::parse("0 * * * *").unwrap();
        assert_eq!(schedule.missed_between(at(9, 30, 0), at(12, 30, 0)), 3);
        assert_eq!(schedule.missed_between(at(12, 30, 0), at(9, 30, 0)), 0);

        let every = Schedule::parse("@every 10m").unwrap();
        assert_eq!(every.missed_between(at(10, 0, 0), at(11, 0, 0)), 6);
    }
}
