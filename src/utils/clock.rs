use chrono::{DateTime, Utc};
use mockall::automock;

/// Injectable time source. Scheduling decisions (latest-build delay,
/// last-run bookkeeping) go through this so they are testable without
/// wall-clock sleeps.
#[automock]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
