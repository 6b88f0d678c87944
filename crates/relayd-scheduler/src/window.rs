//! Enforcement windows.
//!
//! A schedule with a window re-sends its action every `every_minutes`
//! while the local time is inside `[start_minute, end_minute]`, holding a
//! state across a range rather than firing once at an edge.

use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

use relayd_storage::ScheduleRecord;

pub const MINUTES_PER_DAY: u16 = 1440;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnforcementWindow {
    pub start_minute: u16,
    pub end_minute: u16,
    pub every_minutes: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    Execute,
    OutsideWindow,
    NotAligned,
}

impl fmt::Display for WindowDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WindowDecision::Execute => "execute",
            WindowDecision::OutsideWindow => "outside_window",
            WindowDecision::NotAligned => "not_aligned",
        };
        write!(f, "{}", s)
    }
}

impl EnforcementWindow {
    /// Build a window, clamping bounds to a day and the interval to `1..=1440`.
    pub fn new(start_minute: u16, end_minute: u16, every_minutes: u16) -> Self {
        Self {
            start_minute: start_minute.min(MINUTES_PER_DAY - 1),
            end_minute: end_minute.min(MINUTES_PER_DAY - 1),
            every_minutes: every_minutes.clamp(1, MINUTES_PER_DAY),
        }
    }

    /// The window of a schedule, if all three fields are set.
    pub fn from_schedule(schedule: &ScheduleRecord) -> Option<Self> {
        match (
            schedule.window_start_minute,
            schedule.window_end_minute,
            schedule.enforce_every_minute,
        ) {
            (Some(start), Some(end), Some(every)) => Some(Self::new(start, end, every)),
            _ => None,
        }
    }

    /// Whether the window crosses midnight.
    pub fn wraps(&self) -> bool {
        self.start_minute > self.end_minute
    }

    pub fn contains(&self, minute: u16) -> bool {
        if self.wraps() {
            minute >= self.start_minute || minute <= self.end_minute
        } else {
            minute >= self.start_minute && minute <= self.end_minute
        }
    }

    pub fn decide(&self, local_minute: u16) -> WindowDecision {
        if !self.contains(local_minute) {
            return WindowDecision::OutsideWindow;
        }
        let elapsed = if local_minute >= self.start_minute {
            local_minute - self.start_minute
        } else {
            MINUTES_PER_DAY - self.start_minute + local_minute
        };
        if elapsed % self.every_minutes == 0 {
            WindowDecision::Execute
        } else {
            WindowDecision::NotAligned
        }
    }
}

/// Minute of the local day (`0..1440`) of an instant.
pub fn local_minute_of_day(at: DateTime<Utc>, tz: Tz) -> u16 {
    let local = at.with_timezone(&tz);
    (local.hour() * 60 + local.minute()) as u16
}
