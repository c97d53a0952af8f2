//! Lightweight crontab matcher.
//! Fields: minute, hour, day of month, month, day of week (no seconds).
//! Each field accepts `*`, `N`, `A-B`, `*/N`, `A-B/N`, `N/S` and comma lists.
//! Day of week runs 0-6 from Sunday; 7 is accepted as Sunday.
//!
//! Like classic cron, when both day-of-month and day-of-week are restricted a
//! day matches if either field matches.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

/// Upper bound on search steps in `next_after` (a few years of day/hour hops).
const MAX_SEARCH_STEPS: usize = 20_000;

/// A parsed crontab schedule. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse the five crontab fields.
    pub fn parse(
        minute: &str,
        hour: &str,
        day_of_week: &str,
        day_of_month: &str,
        month: &str,
    ) -> Result<Self, String> {
        let minutes = parse_field(minute, 0, 59).map_err(|e| format!("minute: {e}"))?;
        let hours = parse_field(hour, 0, 23).map_err(|e| format!("hour: {e}"))?;
        let days_of_month =
            parse_field(day_of_month, 1, 31).map_err(|e| format!("day_of_month: {e}"))?;
        let months = parse_field(month, 1, 12).map_err(|e| format!("month: {e}"))?;
        let mut days_of_week =
            parse_field(day_of_week, 0, 7).map_err(|e| format!("day_of_week: {e}"))?;
        // 7 is Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week |= 1;
        }

        Ok(Self {
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: (days_of_week & 0x7f) as u8,
            dom_restricted: day_of_month.trim() != "*",
            dow_restricted: day_of_week.trim() != "*",
        })
    }

    /// Whether `at` falls inside a matching minute.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes & (1 << at.minute()) != 0
            && self.hours & (1 << at.hour()) != 0
            && self.months & (1 << at.month()) != 0
            && self.day_matches(at)
    }

    /// First matching minute strictly after `after`.
    /// Returns `None` when nothing matches within the search horizon (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ts = after.timestamp();
        let mut candidate = DateTime::from_timestamp(ts - ts.rem_euclid(60) + 60, 0)?;

        for _ in 0..MAX_SEARCH_STEPS {
            if self.months & (1 << candidate.month()) == 0 {
                candidate = start_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate) {
                candidate = candidate
                    .date_naive()
                    .succ_opt()?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }
            if self.hours & (1 << candidate.hour()) == 0 {
                let ts = candidate.timestamp();
                candidate = DateTime::from_timestamp(ts - ts.rem_euclid(3600) + 3600, 0)?;
                continue;
            }
            if self.minutes & (1 << candidate.minute()) == 0 {
                candidate += chrono::Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom = self.days_of_month & (1 << at.day()) != 0;
        let dow = self.days_of_week & (1 << at.weekday().num_days_from_sunday()) != 0;
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

fn start_of_next_month(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Parse a cron field into a bitmask of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Result<u64, String> {
    let field = field.trim();
    if field.is_empty() {
        return Err("empty field".into());
    }

    let mut mask = 0u64;
    for part in field.split(',') {
        let part = part.trim();
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if n == 0 {
                    return Err("step must be positive".into());
                }
                (range, Some(n))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let n = parse_value(range, min, max)?;
            // "5/15" means from 5 to the end of the range, every 15
            if step.is_some() { (n, max) } else { (n, n) }
        };
        if lo > hi {
            return Err(format!("range {lo}-{hi} is reversed"));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= 1 << v;
        }
    }

    Ok(mask)
}

fn parse_value(s: &str, min: u32, max: u32) -> Result<u32, String> {
    let n: u32 = s.trim().parse().map_err(|_| format!("invalid value '{s}'"))?;
    if n < min || n > max {
        return Err(format!("{n} is outside {min}-{max}"));
    }
    Ok(n)
}
