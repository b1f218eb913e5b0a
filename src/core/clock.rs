//! Time sources shared read-only across threads

use chrono::{Local, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Nanosecond timestamp source plus a human readable local time.
pub trait Clock: Send + Sync {
    /// Nanoseconds since the UNIX epoch.
    fn now_nanos(&self) -> u64;

    /// Local date and time, e.g. `2024-10-14 09:30:00.000125`.
    fn local_date_time(&self) -> String {
        Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }

    fn name(&self) -> &str {
        "Clock"
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64
    }

    fn name(&self) -> &str {
        "SystemClock"
    }
}

/// Clock that only moves when told to. Used for replays and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self { nanos: AtomicU64::new(start_nanos) }
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }

    pub fn advance(&self, nanos: u64) -> u64 {
        self.nanos.fetch_add(nanos, Ordering::AcqRel) + nanos
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }

    fn local_date_time(&self) -> String {
        let nanos = self.now_nanos();
        chrono::DateTime::from_timestamp((nanos / 1_000_000_000) as i64, (nanos % 1_000_000_000) as u32)
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            .unwrap_or_default()
    }

    fn name(&self) -> &str {
        "ManualClock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock::new();
        let t1 = clock.now_nanos();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t2 = clock.now_nanos();
        assert!(t2 > t1);
        assert!(!clock.local_date_time().is_empty());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_nanos(), 1_000);
        assert_eq!(clock.advance(500), 1_500);
        clock.set(42);
        assert_eq!(clock.now_nanos(), 42);
    }
}
