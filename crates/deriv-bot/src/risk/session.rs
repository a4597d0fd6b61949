//! UTC session gate.
//!
//! Entries are permitted only inside the configured UTC trading hours and
//! never inside the weekend maintenance window (Sat 23:55 → Sun 00:05).

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

/// Trading-hours gate on the UTC clock.
#[derive(Debug, Clone)]
pub struct SessionGate {
    start_hour: u32,
    end_hour: u32,
}

impl SessionGate {
    /// `start..end` as UTC hours, end exclusive.
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    /// True when `now` falls inside the trading session and outside the
    /// maintenance window.
    pub fn permits(&self, now: DateTime<Utc>) -> bool {
        if in_maintenance_window(now) {
            return false;
        }
        let hour = now.hour();
        hour >= self.start_hour && hour < self.end_hour
    }
}

/// Broker maintenance: Saturday 23:55 UTC through Sunday 00:05 UTC.
fn in_maintenance_window(now: DateTime<Utc>) -> bool {
    match now.weekday() {
        Weekday::Sat => now.hour() == 23 && now.minute() >= 55,
        Weekday::Sun => now.hour() == 0 && now.minute() < 5,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_inside_session_hours() {
        let gate = SessionGate::new(8, 21);
        // 2025-06-04 is a Wednesday.
        assert!(gate.permits(at(2025, 6, 4, 8, 0)));
        assert!(gate.permits(at(2025, 6, 4, 20, 59)));
    }

    #[test]
    fn test_outside_session_hours() {
        let gate = SessionGate::new(8, 21);
        assert!(!gate.permits(at(2025, 6, 4, 7, 59)));
        assert!(!gate.permits(at(2025, 6, 4, 21, 0)));
        assert!(!gate.permits(at(2025, 6, 4, 23, 30)));
    }

    #[test]
    fn test_maintenance_window_blocks() {
        // Around-the-clock gate so only the maintenance check applies.
        let gate = SessionGate::new(0, 24);
        // 2025-06-07 is a Saturday, 2025-06-08 a Sunday.
        assert!(gate.permits(at(2025, 6, 7, 23, 54)));
        assert!(!gate.permits(at(2025, 6, 7, 23, 55)));
        assert!(!gate.permits(at(2025, 6, 7, 23, 59)));
        assert!(!gate.permits(at(2025, 6, 8, 0, 0)));
        assert!(!gate.permits(at(2025, 6, 8, 0, 4)));
        assert!(gate.permits(at(2025, 6, 8, 0, 5)));
    }

    #[test]
    fn test_midweek_midnight_is_not_maintenance() {
        let gate = SessionGate::new(0, 24);
        assert!(gate.permits(at(2025, 6, 4, 0, 0)));
    }
}
