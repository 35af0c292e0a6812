//! Deployment window recurrence.
//!
//! Supports the RRULE subset used by deployment-window rules:
//! `FREQ=HOURLY|DAILY|WEEKLY`, `INTERVAL`, `BYDAY`, `BYHOUR`,
//! `BYMINUTE`. Each occurrence opens a window of fixed duration; the
//! timezone is a fixed UTC offset like `+02:00` (absent means UTC).
//! Interval anchoring counts from the Unix epoch.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc,
    Weekday,
};

use crate::error::{PolicyError, PolicyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freq {
    Hourly,
    Daily,
    Weekly,
}

/// Whether `now` falls inside a window, and when the state flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Inside a window that closes at `until`.
    Inside { until: DateTime<Utc> },
    /// Outside; the next window (if any within the scan horizon) opens
    /// at `next_start`.
    Outside { next_start: Option<DateTime<Utc>> },
}

/// A compiled recurrence plus window duration.
#[derive(Debug, Clone)]
pub struct Window {
    freq: Freq,
    interval: i64,
    by_day: Vec<Weekday>,
    by_hour: Vec<u32>,
    by_minute: Vec<u32>,
    duration: Duration,
    offset: FixedOffset,
}

/// Days scanned forward for the next occurrence before giving up.
const SCAN_HORIZON_DAYS: i64 = 370;

impl Window {
    pub fn parse(
        rrule: &str,
        duration_seconds: u64,
        timezone: Option<&str>,
    ) -> PolicyResult<Self> {
        let mut freq = None;
        let mut interval = 1i64;
        let mut by_day = Vec::new();
        let mut by_hour = Vec::new();
        let mut by_minute = Vec::new();

        for part in rrule.split(';').filter(|p| !p.is_empty()) {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| PolicyError::InvalidRule(format!("bad rrule part {part:?}")))?;
            match name.to_ascii_uppercase().as_str() {
                "FREQ" => {
                    freq = Some(match value.to_ascii_uppercase().as_str() {
                        "HOURLY" => Freq::Hourly,
                        "DAILY" => Freq::Daily,
                        "WEEKLY" => Freq::Weekly,
                        other => {
                            return Err(PolicyError::InvalidRule(format!(
                                "unsupported FREQ {other:?}"
                            )));
                        }
                    });
                }
                "INTERVAL" => {
                    interval = value.parse().map_err(|_| {
                        PolicyError::InvalidRule(format!("bad INTERVAL {value:?}"))
                    })?;
                    if interval < 1 {
                        return Err(PolicyError::InvalidRule("INTERVAL must be >= 1".into()));
                    }
                }
                "BYDAY" => {
                    for code in value.split(',') {
                        by_day.push(parse_weekday(code)?);
                    }
                }
                "BYHOUR" => {
                    for h in value.split(',') {
                        let hour: u32 = h.parse().map_err(|_| {
                            PolicyError::InvalidRule(format!("bad BYHOUR {h:?}"))
                        })?;
                        if hour > 23 {
                            return Err(PolicyError::InvalidRule(format!("BYHOUR {hour} out of range")));
                        }
                        by_hour.push(hour);
                    }
                }
                "BYMINUTE" => {
                    for m in value.split(',') {
                        let minute: u32 = m.parse().map_err(|_| {
                            PolicyError::InvalidRule(format!("bad BYMINUTE {m:?}"))
                        })?;
                        if minute > 59 {
                            return Err(PolicyError::InvalidRule(format!(
                                "BYMINUTE {minute} out of range"
                            )));
                        }
                        by_minute.push(minute);
                    }
                }
                other => {
                    return Err(PolicyError::InvalidRule(format!(
                        "unsupported rrule part {other:?}"
                    )));
                }
            }
        }

        let freq = freq.ok_or_else(|| PolicyError::InvalidRule("rrule missing FREQ".into()))?;
        if freq == Freq::Weekly && by_day.is_empty() {
            return Err(PolicyError::InvalidRule("FREQ=WEEKLY requires BYDAY".into()));
        }
        if duration_seconds == 0 {
            return Err(PolicyError::InvalidRule("window duration must be > 0".into()));
        }
        by_hour.sort_unstable();
        by_minute.sort_unstable();

        Ok(Self {
            freq,
            interval,
            by_day,
            by_hour,
            by_minute,
            duration: Duration::seconds(duration_seconds as i64),
            offset: parse_offset(timezone)?,
        })
    }

    /// Classify `now` against the recurrence.
    pub fn state_at(&self, now: DateTime<Utc>) -> WindowState {
        let local_now = now.with_timezone(&self.offset);
        let today = local_now.date_naive();

        // Latest start at or before now whose window still contains it.
        let back_days = self.duration.num_days() + 2;
        let mut containing: Option<DateTime<FixedOffset>> = None;
        for delta in 0..=back_days {
            let day = today - Duration::days(delta);
            for time in self.starts_on_day(day) {
                let start = match self.offset.from_local_datetime(&day.and_time(time)).single() {
                    Some(dt) => dt,
                    None => continue,
                };
                if start <= local_now
                    && start + self.duration > local_now
                    && containing.is_none_or(|best| start > best)
                {
                    containing = Some(start);
                }
            }
        }
        if let Some(start) = containing {
            return WindowState::Inside {
                until: (start + self.duration).with_timezone(&Utc),
            };
        }

        // First start strictly after now.
        for delta in 0..SCAN_HORIZON_DAYS {
            let day = today + Duration::days(delta);
            for time in self.starts_on_day(day) {
                let Some(start) = self.offset.from_local_datetime(&day.and_time(time)).single()
                else {
                    continue;
                };
                if start > local_now {
                    return WindowState::Outside {
                        next_start: Some(start.with_timezone(&Utc)),
                    };
                }
            }
        }
        WindowState::Outside { next_start: None }
    }

    /// Occurrence start times on a local date, ascending.
    fn starts_on_day(&self, day: NaiveDate) -> Vec<NaiveTime> {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(day);
        let days_since_epoch = day.signed_duration_since(epoch).num_days();

        let hours: Vec<u32> = if self.by_hour.is_empty() {
            vec![0]
        } else {
            self.by_hour.clone()
        };
        let minutes: Vec<u32> = if self.by_minute.is_empty() {
            vec![0]
        } else {
            self.by_minute.clone()
        };

        let day_matches = match self.freq {
            Freq::Weekly => {
                self.by_day.contains(&day.weekday())
                    && days_since_epoch.div_euclid(7) % self.interval == 0
            }
            Freq::Daily => {
                days_since_epoch.rem_euclid(self.interval) == 0
                    && (self.by_day.is_empty() || self.by_day.contains(&day.weekday()))
            }
            Freq::Hourly => self.by_day.is_empty() || self.by_day.contains(&day.weekday()),
        };
        if !day_matches {
            return Vec::new();
        }

        let mut starts = Vec::new();
        match self.freq {
            Freq::Hourly => {
                for hour in 0..24u32 {
                    if (days_since_epoch * 24 + hour as i64).rem_euclid(self.interval) != 0 {
                        continue;
                    }
                    for &minute in &minutes {
                        if let Some(t) = NaiveTime::from_hms_opt(hour, minute, 0) {
                            starts.push(t);
                        }
                    }
                }
            }
            Freq::Daily | Freq::Weekly => {
                for &hour in &hours {
                    for &minute in &minutes {
                        if let Some(t) = NaiveTime::from_hms_opt(hour, minute, 0) {
                            starts.push(t);
                        }
                    }
                }
            }
        }
        starts
    }
}

fn parse_weekday(code: &str) -> PolicyResult<Weekday> {
    match code.to_ascii_uppercase().as_str() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        other => Err(PolicyError::InvalidRule(format!("bad BYDAY code {other:?}"))),
    }
}

/// Parse a `+HH:MM` / `-HH:MM` offset; absent means UTC.
fn parse_offset(timezone: Option<&str>) -> PolicyResult<FixedOffset> {
    let Some(tz) = timezone else {
        return FixedOffset::east_opt(0)
            .ok_or_else(|| PolicyError::InvalidRule("bad UTC offset".into()));
    };
    let bad = || PolicyError::InvalidRule(format!("bad timezone offset {tz:?}"));
    let (sign, rest) = match tz.split_at_checked(1) {
        Some(("+", rest)) => (1i32, rest),
        Some(("-", rest)) => (-1i32, rest),
        _ => return Err(bad()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(bad)?;
    let hours: i32 = hours.parse().map_err(|_| bad())?;
    let minutes: i32 = minutes.parse().map_err(|_| bad())?;
    if hours > 14 || minutes > 59 {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}
