use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Source of `created_at` timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that never hands out the same or an earlier instant twice, so payments
/// recorded by this process keep a stable order.
#[derive(Debug)]
pub struct SystemClock {
    last: Mutex<DateTime<Utc>>,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let mut now = Utc::now();
        if now <= *last {
            now = *last + Duration::microseconds(1);
        }
        *last = now;
        now
    }
}

/// Clock that advances one second per reading from a fixed start.
#[cfg(test)]
pub struct SteppingClock {
    next: Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl SteppingClock {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        SteppingClock {
            next: Mutex::new(start),
        }
    }
}

#[cfg(test)]
impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut next = self.next.lock().unwrap();
        let now = *next;
        *next = now + Duration::seconds(1);
        now
    }
}
