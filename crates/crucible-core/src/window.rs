//! Maintenance window: a UTC time-of-day interval, possibly wrapping
//! midnight.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};

use crate::domain::error::{CrucibleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl MaintenanceWindow {
    /// `start == end` means the window never closes.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse `"HH:MM"` bounds.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| {
                CrucibleError::InvalidConfig(format!("maintenance window time {s:?}: {e}"))
            })
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }

    pub fn always_open() -> Self {
        Self::new(NaiveTime::default(), NaiveTime::default())
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn wraps_midnight(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let t = now.time();
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    /// Date on which the most recent window opening at or before `now`
    /// occurred. Keys the nightly budget.
    pub fn night_of(&self, now: DateTime<Utc>) -> NaiveDate {
        let date = now.date_naive();
        if now.time() >= self.start {
            date
        } else {
            date - Duration::days(1)
        }
    }

    /// When the window containing `now` closes, if it is open.
    pub fn closes_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.contains(now) || self.start == self.end {
            return None;
        }
        let opened = self.night_of(now).and_time(self.start).and_utc();
        let length = if self.wraps_midnight() {
            Duration::days(1) - (self.start - self.end)
        } else {
            self.end - self.start
        };
        Some(opened + length)
    }
}

impl fmt::Display for MaintenanceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02} UTC",
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute()
        )
    }
}
