use std::{collections::VecDeque, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

const DEFAULT_WINDOW: usize = 512;

/// One observed firing delta. Always >= 0 in steady state; a negative delta
/// means the wall clock stepped backwards under us.
#[derive(Clone, Debug, PartialEq)]
pub struct JitterSample {
    pub timer_id: Uuid,
    pub tenant_id: String,
    pub delta_ms: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct JitterState {
    samples: VecDeque<i64>,
    breach_ticks: u32,
}

/// Sliding window over observed (fired_at - fire_at) deltas, exposing the
/// 99th percentile. Sustained breaches of the warn threshold surface as a
/// clock-drift health signal.
#[derive(Clone)]
pub struct JitterWindow {
    state: Arc<RwLock<JitterState>>,
    window: usize,
    warn_threshold_ms: i64,
    breach_tick_limit: u32,
}

impl JitterWindow {
    pub fn new(window: usize, warn_threshold_ms: i64, breach_tick_limit: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(JitterState::default())),
            window: window.max(1),
            warn_threshold_ms,
            breach_tick_limit: breach_tick_limit.max(1),
        }
    }

    pub fn with_warn_threshold(warn_threshold_ms: i64) -> Self {
        Self::new(DEFAULT_WINDOW, warn_threshold_ms, 10)
    }

    pub async fn record(
        &self,
        scheduled: DateTime<Utc>,
        actual: DateTime<Utc>,
        timer_id: Uuid,
        tenant_id: &str,
    ) -> JitterSample {
        let delta_ms = (actual - scheduled).num_milliseconds();
        let mut state = self.state.write().await;
        state.samples.push_back(delta_ms);
        if state.samples.len() > self.window {
            state.samples.pop_front();
        }
        drop(state);
        JitterSample {
            timer_id,
            tenant_id: tenant_id.to_string(),
            delta_ms,
            recorded_at: Utc::now(),
        }
    }

    pub async fn p99_ms(&self) -> i64 {
        let state = self.state.read().await;
        percentile(&state.samples, 0.99)
    }

    /// Called once per tick. Returns true when the p99 has stayed above the
    /// warn threshold for more than the configured number of ticks.
    pub async fn observe_tick(&self) -> bool {
        let mut state = self.state.write().await;
        let p99 = percentile(&state.samples, 0.99);
        if p99 > self.warn_threshold_ms && !state.samples.is_empty() {
            state.breach_ticks = state.breach_ticks.saturating_add(1);
        } else {
            state.breach_ticks = 0;
        }
        state.breach_ticks > self.breach_tick_limit
    }
}

fn percentile(samples: &VecDeque<i64>, quantile: f64) -> i64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted: Vec<i64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64) * quantile).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn p99_tracks_the_tail_of_the_window() {
        let window = JitterWindow::new(100, 500, 3);
        let base = Utc::now();
        for _ in 0..99 {
            window
                .record(base, base + Duration::milliseconds(10), Uuid::new_v4(), "t")
                .await;
        }
        window
            .record(base, base + Duration::milliseconds(900), Uuid::new_v4(), "t")
            .await;
        assert_eq!(window.p99_ms().await, 900);
    }

    #[tokio::test]
    async fn sustained_breach_raises_drift_signal() {
        let window = JitterWindow::new(16, 100, 2);
        let base = Utc::now();
        for _ in 0..16 {
            window
                .record(base, base + Duration::milliseconds(800), Uuid::new_v4(), "t")
                .await;
        }

        assert!(!window.observe_tick().await);
        assert!(!window.observe_tick().await);
        assert!(window.observe_tick().await);
    }

    #[tokio::test]
    async fn breach_counter_resets_when_jitter_recovers() {
        let window = JitterWindow::new(4, 100, 2);
        let base = Utc::now();
        for _ in 0..4 {
            window
                .record(base, base + Duration::milliseconds(800), Uuid::new_v4(), "t")
                .await;
        }
        assert!(!window.observe_tick().await);

        // Flush the window with healthy samples.
        for _ in 0..4 {
            window
                .record(base, base + Duration::milliseconds(5), Uuid::new_v4(), "t")
                .await;
        }
        assert!(!window.observe_tick().await);
        assert!(!window.observe_tick().await);
        assert!(!window.observe_tick().await);
    }
}
