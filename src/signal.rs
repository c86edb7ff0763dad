//! Dispatcher wake-up signalling.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

/// Wakes the dispatcher when queue state changes out-of-band.
///
/// Passing [`wake_sentinel`] as the candidate next-fire-time forces an
/// immediate re-evaluation of the trigger table.
#[async_trait]
pub trait SchedulerSignaler: Send + Sync {
    async fn signal_scheduling_change(&self, candidate_next_fire_time: DateTime<Utc>);
}

/// The far-past timestamp the base signaler interprets as "re-check now".
///
/// The exact instant is an interface quirk of the signaler contract;
/// it must be preserved bit-exactly.
pub fn wake_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1982, 6, 28, 0, 0, 0).unwrap()
}

/// Signaler that drops all signals; useful for embedded and test setups
/// that poll instead.
#[derive(Debug, Default)]
pub struct NoopSignaler;

#[async_trait]
impl SchedulerSignaler for NoopSignaler {
    async fn signal_scheduling_change(&self, _candidate_next_fire_time: DateTime<Utc>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_is_fixed() {
        assert_eq!(wake_sentinel().to_rfc3339(), "1982-06-28T00:00:00+00:00");
    }
}
