//! Business-day scheduling math: when the next run happens, and which instants
//! within a day's kill window a given MTBF should produce.
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Weekday};
use rand::Rng;
use thiserror::Error;

/// Errors produced while parsing an mtbf label value.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MtbfError {
    /// The value wasn't a bare integer (days, for backward compatibility) or a Go-style
    /// duration string such as `"36h"` or `"90m"`.
    #[error("{0:?} is not a valid mtbf: expected a number of days or a duration like \"36h\"")]
    Malformed(String),
    /// The parsed duration was shorter than one minute.
    #[error("smallest valid mtbf is one minute, got {0:?}")]
    TooShort(String),
}

fn is_weekday(d: Weekday) -> bool {
    !matches!(d, Weekday::Sat | Weekday::Sun)
}

/// Returns the next calendar date, strictly after `now`'s date, that falls on a weekday.
fn next_weekday_date<Tz: TimeZone>(now: &DateTime<Tz>) -> (i32, u32, u32) {
    let mut check = now.clone();
    loop {
        check = check + chrono::Duration::days(1);
        if is_weekday(check.weekday()) {
            return (check.year(), check.month(), check.day());
        }
    }
}

/// Computes the next instant the daily schedule should be built, given the local `now`
/// and the configured run hour. If today is still a weekday and `run_hour` hasn't passed
/// yet, returns today at `run_hour`; otherwise advances to the next weekday.
pub fn next_runtime<Tz: TimeZone>(now: &DateTime<Tz>, run_hour: u32) -> DateTime<Tz>
where
    Tz::Offset: Copy,
{
    if is_weekday(now.weekday()) {
        if let Some(today_runtime) = now
            .timezone()
            .with_ymd_and_hms(now.year(), now.month(), now.day(), run_hour, 0, 0)
            .single()
        {
            if today_runtime > *now {
                return today_runtime;
            }
        }
    }

    let (year, month, day) = next_weekday_date(now);
    now.timezone()
        .with_ymd_and_hms(year, month, day, run_hour, 0, 0)
        .single()
        .expect("constructed date is a valid local time")
}

/// Parses an mtbf label value into a [`Duration`]. A bare integer is interpreted as a
/// number of days for backward compatibility; anything else must be a Go-style duration
/// string (`"90m"`, `"36h"`). The minimum valid value is one minute.
pub fn parse_mtbf(raw: &str) -> Result<Duration, MtbfError> {
    let trimmed = raw.trim_end_matches('d');

    let normalized = if let Ok(days) = trimmed.parse::<i64>() {
        format!("{}h", days * 24)
    } else {
        raw.to_string()
    };

    let duration = parse_go_duration(&normalized)
        .ok_or_else(|| MtbfError::Malformed(raw.to_string()))?;

    if duration < Duration::from_secs(60) {
        return Err(MtbfError::TooShort(raw.to_string()));
    }
    Ok(duration)
}

/// Parses a minimal subset of Go's `time.ParseDuration` grammar: a sequence of
/// `<number><unit>` pairs where unit is one of `h`, `m`, `s`.
fn parse_go_duration(s: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut rest = s;
    if rest.is_empty() {
        return None;
    }
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return None;
        }
        let (num_str, tail) = rest.split_at(digits_end);
        let num: f64 = num_str.parse().ok()?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        if unit_end == 0 {
            return None;
        }
        let (unit, remainder) = tail.split_at(unit_end);
        let seconds = match unit {
            "h" => num * 3600.0,
            "m" => num * 60.0,
            "s" => num,
            _ => return None,
        };
        total += Duration::from_secs_f64(seconds);
        rest = remainder;
    }
    Some(total)
}

/// Produces the kill instant(s) a given mtbf should contribute to today's schedule.
///
/// If the mtbf is at least one day, a single random instant uniformly distributed within
/// `[start_hour, end_hour)` today is returned. Otherwise the range is walked forward in
/// steps of a random offset up to `2 * mtbf`, emitting an instant each time the walk is
/// still inside the window, so that victims with a short mtbf can be attacked more than
/// once per day.
pub fn random_kill_times<Tz: TimeZone, R: Rng>(
    now: &DateTime<Tz>,
    mtbf: Duration,
    start_hour: u32,
    end_hour: u32,
    rng: &mut R,
) -> Vec<DateTime<Tz>>
where
    Tz::Offset: Copy,
{
    let one_day = Duration::from_secs(24 * 3600);
    let today_start = now
        .timezone()
        .with_ymd_and_hms(now.year(), now.month(), now.day(), start_hour, 0, 0)
        .single()
        .expect("constructed date is a valid local time");
    let today_end = now
        .timezone()
        .with_ymd_and_hms(now.year(), now.month(), now.day(), end_hour, 0, 0)
        .single()
        .expect("constructed date is a valid local time");

    if mtbf >= one_day {
        let minutes_in_range = ((end_hour as i64) - (start_hour as i64)) * 60;
        let offset_minutes = rng.gen_range(0..minutes_in_range.max(1));
        return vec![today_start + chrono::Duration::minutes(offset_minutes)];
    }

    let mut times = Vec::new();
    let mut cursor = now.clone();
    if cursor < today_start {
        return vec![today_start];
    }
    loop {
        let window = mtbf * 2;
        let window_secs = window.as_secs().max(1) as i64;
        let offset_secs = rng.gen_range(0..window_secs);
        let candidate = cursor.clone() + chrono::Duration::seconds(offset_secs);
        if candidate < today_end {
            times.push(candidate.clone());
            cursor = candidate;
        } else {
            break;
        }
    }
    times
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::mock::StepRng;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn next_runtime_stays_today_before_run_hour() {
        // 2026-07-27 is a Monday.
        let now = utc(2026, 7, 27, 6, 0);
        let next = next_runtime(&now, 8);
        assert_eq!(next, utc(2026, 7, 27, 8, 0));
    }

    #[test]
    fn next_runtime_advances_past_run_hour() {
        let now = utc(2026, 7, 27, 9, 0);
        let next = next_runtime(&now, 8);
        assert_eq!(next, utc(2026, 7, 28, 8, 0));
    }

    #[test]
    fn next_runtime_skips_weekend() {
        // 2026-07-31 is a Friday.
        let now = utc(2026, 7, 31, 23, 0);
        let next = next_runtime(&now, 8);
        // Next weekday is Monday 2026-08-03.
        assert_eq!(next, utc(2026, 8, 3, 8, 0));
    }

    #[test]
    fn parse_mtbf_bare_integer_is_days() {
        assert_eq!(parse_mtbf("2").unwrap(), Duration::from_secs(2 * 24 * 3600));
    }

    #[test]
    fn parse_mtbf_trailing_d_is_days() {
        assert_eq!(parse_mtbf("3d").unwrap(), Duration::from_secs(3 * 24 * 3600));
    }

    #[test]
    fn parse_mtbf_duration_string() {
        assert_eq!(parse_mtbf("36h").unwrap(), Duration::from_secs(36 * 3600));
        assert_eq!(parse_mtbf("90m").unwrap(), Duration::from_secs(90 * 60));
    }

    #[test]
    fn parse_mtbf_rejects_sub_minute() {
        assert_eq!(parse_mtbf("30s").unwrap_err(), MtbfError::TooShort("30s".to_string()));
    }

    #[test]
    fn parse_mtbf_rejects_garbage() {
        assert!(matches!(parse_mtbf("banana"), Err(MtbfError::Malformed(_))));
    }

    #[test]
    fn random_kill_times_long_mtbf_yields_single_instant() {
        let now = utc(2026, 7, 27, 1, 0);
        let mut rng = StepRng::new(5, 1);
        let times = random_kill_times(&now, Duration::from_secs(2 * 24 * 3600), 10, 16, &mut rng);
        assert_eq!(times.len(), 1);
        assert!(times[0] >= utc(2026, 7, 27, 10, 0));
        assert!(times[0] < utc(2026, 7, 27, 16, 0));
    }

    #[test]
    fn random_kill_times_short_mtbf_can_yield_multiple() {
        let now = utc(2026, 7, 27, 10, 0);
        let mut rng = StepRng::new(0, 1);
        let times = random_kill_times(&now, Duration::from_secs(3600), 10, 16, &mut rng);
        assert!(!times.is_empty());
        for t in &times {
            assert!(*t < utc(2026, 7, 27, 16, 0));
        }
    }

    #[test]
    fn random_kill_times_before_window_returns_window_start() {
        let now = utc(2026, 7, 27, 2, 0);
        let mut rng = StepRng::new(0, 1);
        let times = random_kill_times(&now, Duration::from_secs(3600), 10, 16, &mut rng);
        assert_eq!(times, vec![utc(2026, 7, 27, 10, 0)]);
    }
}
