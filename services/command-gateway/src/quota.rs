use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::auth::QuotaLimits;
use crate::error::GatewayError;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding 60s window as a timestamp ring buffer. Prune on every arrival;
/// the oldest surviving timestamp gives the retry hint.
#[derive(Default)]
struct SlidingWindow {
    arrivals: VecDeque<Instant>,
}

impl SlidingWindow {
    fn try_admit(&mut self, limit: u32, now: Instant) -> Result<(), u64> {
        while self
            .arrivals
            .front()
            .map(|first| now.duration_since(*first) >= WINDOW)
            .unwrap_or(false)
        {
            self.arrivals.pop_front();
        }
        if self.arrivals.len() >= limit as usize {
            let oldest = self.arrivals.front().copied().unwrap_or(now);
            let retry_after = WINDOW.saturating_sub(now.duration_since(oldest));
            return Err(retry_after.as_millis().max(1) as u64);
        }
        self.arrivals.push_back(now);
        Ok(())
    }
}

#[derive(Default)]
struct CredentialUsage {
    schedule: SlidingWindow,
    cancel: SlidingWindow,
    day: Option<NaiveDate>,
    daily_count: u32,
}

/// Per-credential quota accounting, sharded by credential id. Burst is not
/// tracked here: it is checked against the kernel's live non-terminal count.
#[derive(Clone, Default)]
pub struct QuotaLedger {
    usage: Arc<Mutex<HashMap<String, CredentialUsage>>>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn admit_schedule(
        &self,
        credential_id: &str,
        limits: &QuotaLimits,
    ) -> Result<(), GatewayError> {
        let mut usage = self.usage.lock().await;
        let entry = usage.entry(credential_id.to_string()).or_default();

        let today = Utc::now().date_naive();
        if entry.day != Some(today) {
            entry.day = Some(today);
            entry.daily_count = 0;
        }
        if entry.daily_count >= limits.daily {
            let midnight = (today + chrono::Duration::days(1))
                .and_hms_opt(0, 0, 0)
                .map(|at| at.and_utc())
                .unwrap_or_else(Utc::now);
            let retry_after_ms = (midnight - Utc::now()).num_milliseconds().max(1) as u64;
            return Err(GatewayError::QuotaExceeded {
                kind: "daily",
                retry_after_ms,
            });
        }

        entry
            .schedule
            .try_admit(limits.schedule_per_minute, Instant::now())
            .map_err(|retry_after_ms| GatewayError::QuotaExceeded {
                kind: "schedule_per_minute",
                retry_after_ms,
            })?;
        entry.daily_count += 1;
        Ok(())
    }

    pub async fn admit_cancel(
        &self,
        credential_id: &str,
        limits: &QuotaLimits,
    ) -> Result<(), GatewayError> {
        let mut usage = self.usage.lock().await;
        let entry = usage.entry(credential_id.to_string()).or_default();
        entry
            .cancel
            .try_admit(limits.cancel_per_minute, Instant::now())
            .map_err(|retry_after_ms| GatewayError::QuotaExceeded {
                kind: "cancel_per_minute",
                retry_after_ms,
            })
    }
}

/// Burst check against the kernel's current non-terminal count. Reads from
/// the local projection are eventually consistent, so slight over-admission
/// is tolerated.
pub fn check_burst(active_count: usize, limits: &QuotaLimits) -> Result<(), GatewayError> {
    if active_count >= limits.burst as usize {
        Err(GatewayError::QuotaExceeded {
            kind: "burst",
            // Something has to fire or be cancelled first; suggest a short
            // poll interval rather than guessing at the next fire instant.
            retry_after_ms: 1_000,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(schedule: u32, cancel: u32) -> QuotaLimits {
        QuotaLimits {
            schedule_per_minute: schedule,
            cancel_per_minute: cancel,
            burst: 3,
            daily: 100,
        }
    }

    #[tokio::test]
    async fn schedule_window_admits_up_to_the_limit() {
        let ledger = QuotaLedger::new();
        let limits = limits(3, 3);
        for _ in 0..3 {
            ledger.admit_schedule("cred-1", &limits).await.expect("admitted");
        }
        let err = ledger.admit_schedule("cred-1", &limits).await.unwrap_err();
        match err {
            GatewayError::QuotaExceeded {
                kind,
                retry_after_ms,
            } => {
                assert_eq!(kind, "schedule_per_minute");
                assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn windows_are_sharded_by_credential() {
        let ledger = QuotaLedger::new();
        let limits = limits(1, 1);
        ledger.admit_schedule("cred-1", &limits).await.expect("first");
        ledger
            .admit_schedule("cred-2", &limits)
            .await
            .expect("other credential unaffected");
    }

    #[tokio::test]
    async fn cancel_window_is_independent_of_schedule() {
        let ledger = QuotaLedger::new();
        let limits = limits(1, 2);
        ledger.admit_schedule("cred-1", &limits).await.expect("schedule");
        ledger.admit_cancel("cred-1", &limits).await.expect("cancel 1");
        ledger.admit_cancel("cred-1", &limits).await.expect("cancel 2");
        assert!(ledger.admit_cancel("cred-1", &limits).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_after_sixty_seconds() {
        let ledger = QuotaLedger::new();
        let limits = limits(1, 1);
        ledger.admit_schedule("cred-1", &limits).await.expect("first");
        assert!(ledger.admit_schedule("cred-1", &limits).await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        ledger
            .admit_schedule("cred-1", &limits)
            .await
            .expect("window slid");
    }

    #[test]
    fn burst_check_compares_against_active_count() {
        let limits = limits(10, 10);
        assert!(check_burst(2, &limits).is_ok());
        let err = check_burst(3, &limits).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::QuotaExceeded { kind: "burst", .. }
        ));
    }
}
