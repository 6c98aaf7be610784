//! Weekly recurrence windows gating a policy.
//!
//! A schedule is a set of weekdays plus a daily time range, evaluated in
//! the schedule's own time zone. A policy carrying a schedule only admits
//! while `now`, viewed in that zone, falls inside the window.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A weekly window: days-of-week bitmask, daily start/end, time zone.
///
/// Windows where `end <= start` wrap past midnight; the day bit refers to
/// the day the window *opens*.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    /// Bitmask of weekdays, bit 0 = Monday through bit 6 = Sunday.
    pub days: u8,
    /// Daily opening time in the schedule's zone.
    pub start: NaiveTime,
    /// Daily closing time (exclusive) in the schedule's zone.
    pub end: NaiveTime,
    /// IANA zone the window is evaluated in.
    pub zone: Tz,
}

const DAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

fn day_bit(day: Weekday) -> u8 {
    1 << day.num_days_from_monday()
}

impl WeeklySchedule {
    /// Whether `at` lies inside the window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.zone);
        let time = local.time();
        let today = day_bit(local.weekday());

        if self.start < self.end {
            self.days & today != 0 && time >= self.start && time < self.end
        } else {
            // Overnight window: open on the listed day, spills into the next.
            let yesterday = day_bit(local.weekday().pred());
            (self.days & today != 0 && time >= self.start)
                || (self.days & yesterday != 0 && time < self.end)
        }
    }

    /// Parse `"mon-fri 09:00-17:00 Europe/Warsaw"` style text.
    ///
    /// Days accept single names and ranges, comma-separated
    /// (`mon,wed-fri`). Times are `HH:MM` in the named zone.
    ///
    /// # Errors
    ///
    /// Returns an error naming the malformed part.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut parts = text.split_whitespace();
        let (Some(days), Some(range), Some(zone)) = (parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("schedule must be '<days> <HH:MM-HH:MM> <zone>', got '{text}'");
        };
        if parts.next().is_some() {
            anyhow::bail!("trailing tokens in schedule '{text}'");
        }

        let days = parse_days(days)?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("time range must be HH:MM-HH:MM, got '{range}'"))?;
        let start = NaiveTime::parse_from_str(start, "%H:%M")
            .map_err(|e| anyhow::anyhow!("bad start time '{start}': {e}"))?;
        let end = NaiveTime::parse_from_str(end, "%H:%M")
            .map_err(|e| anyhow::anyhow!("bad end time '{end}': {e}"))?;
        let zone: Tz = zone
            .parse()
            .map_err(|e| anyhow::anyhow!("unknown time zone '{zone}': {e}"))?;

        Ok(Self {
            days,
            start,
            end,
            zone,
        })
    }
}

fn parse_day(name: &str) -> anyhow::Result<u8> {
    DAY_NAMES
        .iter()
        .position(|d| name.eq_ignore_ascii_case(d))
        .map(|i| u8::try_from(i).unwrap_or(0))
        .ok_or_else(|| anyhow::anyhow!("unknown weekday '{name}'"))
}

fn parse_days(spec: &str) -> anyhow::Result<u8> {
    let mut mask = 0u8;
    for part in spec.split(',') {
        if let Some((from, to)) = part.split_once('-') {
            let from = parse_day(from)?;
            let to = parse_day(to)?;
            if from > to {
                anyhow::bail!("weekday range '{part}' runs backwards");
            }
            for day in from..=to {
                mask |= 1 << day;
            }
        } else {
            mask |= 1 << parse_day(part)?;
        }
    }
    if mask == 0 {
        anyhow::bail!("empty weekday set '{spec}'");
    }
    Ok(mask)
}

impl std::fmt::Display for WeeklySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let days: Vec<&str> = DAY_NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.days & (1 << i) != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(
            f,
            "{} {:02}:{:02}-{:02}:{:02} {}",
            days.join(","),
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute(),
            self.zone
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn workweek() -> WeeklySchedule {
        WeeklySchedule::parse("mon-fri 09:00-17:00 Europe/Warsaw").unwrap()
    }

    #[test]
    fn parses_ranges_and_lists() {
        let s = WeeklySchedule::parse("mon,wed-fri 08:30-18:00 UTC").unwrap();
        assert_eq!(s.days, 0b0001_1101); // mon, wed, thu, fri
        assert_eq!(s.start, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(WeeklySchedule::parse("mon-fri 09:00-17:00").is_err());
        assert!(WeeklySchedule::parse("mon-fri 9am-5pm UTC").is_err());
        assert!(WeeklySchedule::parse("fri-mon 09:00-17:00 UTC").is_err());
        assert!(WeeklySchedule::parse("mon-fri 09:00-17:00 Mars/Olympus").is_err());
    }

    #[test]
    fn window_respects_zone() {
        let s = workweek();
        // Wednesday 10:00 Warsaw summer time is 08:00 UTC.
        let inside = Utc.with_ymd_and_hms(2026, 7, 1, 8, 0, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2026, 7, 1, 20, 0, 0).unwrap();
        assert!(s.contains(inside));
        assert!(!s.contains(outside));
    }

    #[test]
    fn weekend_is_closed_for_workweek() {
        let s = workweek();
        // Saturday noon Warsaw.
        let saturday = Utc.with_ymd_and_hms(2026, 7, 4, 10, 0, 0).unwrap();
        assert!(!s.contains(saturday));
    }

    #[test]
    fn overnight_window_spills_into_next_day() {
        let s = WeeklySchedule::parse("fri 22:00-02:00 UTC").unwrap();
        let friday_night = Utc.with_ymd_and_hms(2026, 7, 3, 23, 0, 0).unwrap();
        let saturday_early = Utc.with_ymd_and_hms(2026, 7, 4, 1, 0, 0).unwrap();
        let saturday_late = Utc.with_ymd_and_hms(2026, 7, 4, 3, 0, 0).unwrap();
        assert!(s.contains(friday_night));
        assert!(s.contains(saturday_early));
        assert!(!s.contains(saturday_late));
    }

    #[test]
    fn display_round_trips() {
        let s = workweek();
        let reparsed = WeeklySchedule::parse(&s.to_string()).unwrap();
        assert_eq!(s, reparsed);
    }
}
