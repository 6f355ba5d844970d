//! Recurring wall-clock windows used by the scheduler's time policy.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// A recurring window of wall-clock time.
///
/// A job is "in window" iff, at the current instant rendered in `tz` (or
/// the host-local zone when absent), the weekday matches `days` (when
/// given) and the minute-of-day lies in `[start, end)`. `end < start`
/// wraps past midnight; `start == end` means always in window. The gating
/// weekday is that of the current instant, including on the far side of a
/// midnight wrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    /// Weekday filter, entries among `sun`, `mon`, `tue`, `wed`, `thu`,
    /// `fri`, `sat` (case-insensitive). Absent means every day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<Vec<String>>,
    /// Inclusive start of the window, `"HH:MM"`.
    pub start: String,
    /// Exclusive end of the window, `"HH:MM"`.
    pub end: String,
    /// IANA zone name. Absent or unparseable falls back to the local zone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

impl TimeWindow {
    /// Whether both `start` and `end` parse as `HH:MM`.
    ///
    /// A window that is not well-formed never matches; callers treat jobs
    /// whose windows are all malformed as having no policy windows.
    pub fn is_well_formed(&self) -> bool {
        parse_hhmm(&self.start).is_some() && parse_hhmm(&self.end).is_some()
    }

    /// Whether `now` falls inside this window.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            tracing::warn!(
                "ignoring malformed time window {:?}-{:?}",
                self.start,
                self.end
            );
            return false;
        };

        let (weekday, minute) = self.render_parts(now);

        if let Some(days) = &self.days {
            if !days.iter().any(|d| day_matches(d, weekday)) {
                return false;
            }
        }

        if start == end {
            return true;
        }
        if end > start {
            minute >= start && minute < end
        } else {
            minute >= start || minute < end
        }
    }

    fn render_parts(&self, now: DateTime<Utc>) -> (Weekday, u32) {
        if let Some(name) = &self.tz {
            if let Ok(zone) = name.parse::<chrono_tz::Tz>() {
                let local = now.with_timezone(&zone);
                return (local.weekday(), local.hour() * 60 + local.minute());
            }
            tracing::warn!("unknown tz {name:?} in time window; using local zone");
        }
        let local = now.with_timezone(&chrono::Local);
        (local.weekday(), local.hour() * 60 + local.minute())
    }
}

/// Whether any well-formed window in `windows` contains `now`.
pub fn any_contains(windows: &[TimeWindow], now: DateTime<Utc>) -> bool {
    windows.iter().any(|w| w.contains(now))
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

fn day_matches(name: &str, weekday: Weekday) -> bool {
    let expected = match weekday {
        Weekday::Sun => "sun",
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
    };
    name.eq_ignore_ascii_case(expected)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{TimeWindow, any_contains, parse_hhmm};

    fn window(start: &str, end: &str, days: Option<&[&str]>) -> TimeWindow {
        TimeWindow {
            days: days.map(|d| d.iter().map(|s| s.to_string()).collect()),
            start: start.to_string(),
            end: end.to_string(),
            tz: Some("UTC".to_string()),
        }
    }

    // 2026-01-05 is a Monday.
    fn monday(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, minute, 0).unwrap()
    }

    #[test]
    fn plain_window_is_half_open() {
        let w = window("09:00", "17:00", None);
        assert!(!w.contains(monday(8, 59)));
        assert!(w.contains(monday(9, 0)));
        assert!(w.contains(monday(16, 59)));
        assert!(!w.contains(monday(17, 0)));
    }

    #[test]
    fn wrapped_window_spans_midnight() {
        let w = window("22:00", "02:00", None);
        assert!(w.contains(monday(23, 30)));
        assert!(w.contains(monday(1, 59)));
        assert!(!w.contains(monday(2, 0)));
        assert!(!w.contains(monday(12, 0)));
    }

    #[test]
    fn equal_bounds_always_match() {
        let w = window("00:00", "00:00", None);
        assert!(w.contains(monday(0, 0)));
        assert!(w.contains(monday(13, 37)));
    }

    #[test]
    fn day_filter_gates_on_the_current_instant() {
        let w = window("22:00", "02:00", Some(&["mon"]));
        assert!(w.contains(monday(23, 0)));
        // Monday 01:00 is inside the wrap but Sunday is the listed day's
        // predecessor, not Monday, so the instant's own weekday decides.
        assert!(w.contains(monday(1, 0)));

        let sun_only = window("22:00", "02:00", Some(&["sun"]));
        assert!(!sun_only.contains(monday(1, 0)));
    }

    #[test]
    fn day_names_are_case_insensitive() {
        let w = window("00:00", "00:00", Some(&["MON"]));
        assert!(w.contains(monday(10, 0)));
    }

    #[test]
    fn zone_shifts_the_rendered_instant() {
        let mut w = window("09:00", "17:00", None);
        w.tz = Some("Asia/Tokyo".to_string());
        // 01:00 UTC on Monday is 10:00 JST.
        assert!(w.contains(monday(1, 0)));
        // 12:00 UTC on Monday is 21:00 JST.
        assert!(!w.contains(monday(12, 0)));
    }

    #[test]
    fn malformed_bounds_never_match() {
        let w = window("9am", "17:00", None);
        assert!(!w.is_well_formed());
        assert!(!w.contains(monday(10, 0)));
    }

    #[test]
    fn any_contains_is_a_disjunction() {
        let windows = vec![
            window("00:00", "01:00", None),
            window("09:00", "17:00", None),
        ];
        assert!(any_contains(&windows, monday(10, 0)));
        assert!(!any_contains(&windows, monday(5, 0)));
    }

    #[test]
    fn hhmm_parser_rejects_out_of_range_values() {
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("1:00"), None);
        assert_eq!(parse_hhmm("12:30"), Some(12 * 60 + 30));
    }
}
