use crate::rollup::aggregate::run_pass;
use crate::rollup::bucket::{
    self, AggregationWindow, Granularity,
};
use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub next_fire_times: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassOutcome {
    pub granularity: Granularity,
    pub bucket: String,
    pub rows: usize,
}

/// Drives the rollup cadence: every hour (at a configurable minute offset)
/// it finalizes the hour that just closed and refreshes the open day, week
/// and month buckets. When a tick lands on a day, week or month boundary
/// the period that just ended gets one final recompute as well.
pub struct AggregationScheduler {
    storage: Arc<dyn Storage>,
    offset_minutes: u32,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl AggregationScheduler {
    pub fn new(storage: Arc<dyn Storage>, offset_minutes: u32) -> Self {
        Self {
            storage,
            offset_minutes: offset_minutes % 60,
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let now = Utc::now();
        let mut next_fire_times = HashMap::new();
        next_fire_times.insert(
            "hourly".to_string(),
            bucket::next_hourly_fire(now, self.offset_minutes),
        );
        next_fire_times.insert(
            "daily".to_string(),
            Self::next_boundary_fire(Granularity::Day, now, self.offset_minutes),
        );
        next_fire_times.insert(
            "weekly".to_string(),
            Self::next_boundary_fire(Granularity::Week, now, self.offset_minutes),
        );
        next_fire_times.insert(
            "monthly".to_string(),
            Self::next_boundary_fire(Granularity::Month, now, self.offset_minutes),
        );

        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            next_fire_times,
        }
    }

    /// Next boundary tick for a granularity, strictly after `now`. Within
    /// the first `offset_minutes` of a fresh period the fire time is still
    /// ahead in the current period, not a whole period away.
    fn next_boundary_fire(
        granularity: Granularity,
        now: DateTime<Utc>,
        offset_minutes: u32,
    ) -> DateTime<Utc> {
        let offset = Duration::minutes(offset_minutes as i64);
        let candidate = bucket::period_start(granularity, now) + offset;
        if candidate > now {
            candidate
        } else {
            bucket::next_period_start(granularity, now) + offset
        }
    }

    /// Recompute the bucket containing `at` (default now) for one
    /// granularity, or for all four when none is given.
    pub async fn manual_update(
        &self,
        granularity: Option<Granularity>,
        at: Option<DateTime<Utc>>,
    ) -> Result<Vec<PassOutcome>, StorageError> {
        let now = Utc::now();
        let at = at.unwrap_or(now);
        let granularities: Vec<Granularity> = match granularity {
            Some(g) => vec![g],
            None => Granularity::all().to_vec(),
        };

        let mut outcomes = Vec::new();
        for g in granularities {
            let window = bucket::window_containing(g, at, now);
            let rows = run_pass(&self.storage, g, &window).await?;
            outcomes.push(PassOutcome {
                granularity: g,
                bucket: window.bucket,
                rows,
            });
        }
        Ok(outcomes)
    }

    /// The passes one hourly tick owes, given `now`.
    fn tick_targets(now: DateTime<Utc>) -> Vec<(Granularity, AggregationWindow)> {
        let mut targets = vec![
            (
                Granularity::Hour,
                bucket::previous_closed_window(Granularity::Hour, now),
            ),
            (Granularity::Day, bucket::open_window(Granularity::Day, now)),
            (
                Granularity::Week,
                bucket::open_window(Granularity::Week, now),
            ),
            (
                Granularity::Month,
                bucket::open_window(Granularity::Month, now),
            ),
        ];

        // A tick in the first hour of a period also finalizes the period
        // that just closed.
        let hour_start = bucket::period_start(Granularity::Hour, now);
        for g in [Granularity::Day, Granularity::Week, Granularity::Month] {
            if bucket::period_start(g, now) == hour_start {
                targets.push((g, bucket::previous_closed_window(g, now)));
            }
        }

        targets
    }

    async fn run_tick(storage: &Arc<dyn Storage>, now: DateTime<Utc>) {
        let targets = Self::tick_targets(now);
        let passes = targets
            .iter()
            .map(|(g, window)| run_pass(storage, *g, window));

        for ((g, window), result) in targets.iter().zip(futures::future::join_all(passes).await) {
            match result {
                Ok(rows) => {
                    info!(granularity = %g, bucket = %window.bucket, rows, "Rollup updated")
                }
                Err(e) => {
                    error!(granularity = %g, bucket = %window.bucket, error = %e, "Rollup pass failed")
                }
            }
        }
    }

    pub fn start(self: &Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut cancel = self.cancel.lock().unwrap();
            if let Some(previous) = cancel.take() {
                previous.cancel();
            }
            *cancel = Some(token.clone());
        }
        self.running.store(true, Ordering::SeqCst);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                offset_minutes = scheduler.offset_minutes,
                "Aggregation scheduler started"
            );

            // Catch up on startup so a restart mid-hour leaves no gap.
            Self::run_tick(&scheduler.storage, Utc::now()).await;

            loop {
                let now = Utc::now();
                let fire_at = bucket::next_hourly_fire(now, scheduler.offset_minutes);
                let sleep_for = (fire_at - now).to_std().unwrap_or_default();

                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Aggregation scheduler stopped");
                        break;
                    }
                    _ = tokio::time::sleep(sleep_for) => {
                        Self::run_tick(&scheduler.storage, Utc::now()).await;
                    }
                }
            }
            scheduler.running.store(false, Ordering::SeqCst);
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        } else {
            warn!("Aggregation scheduler stop requested but it was never started");
        }
    }
}
