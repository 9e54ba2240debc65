use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Backend health as seen by the probe loop.
///
/// `max_retries` is informational metadata; probing never stops on its own,
/// no matter how many consecutive failures accumulate.
#[derive(Debug, Clone, Serialize)]
pub struct HealthState {
    pub is_healthy: bool,
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub max_retries: u32,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Periodically probes the backend and tracks its health.
///
/// The registered "recovered" hook fires on every unhealthy-to-healthy
/// transition, before the state flips to healthy. The "steady" hook fires on
/// every probe that finds an already-healthy backend still healthy; it is
/// how queued backlog gets drained even when no outage was ever observed.
pub struct HealthMonitor {
    storage: Arc<dyn Storage>,
    state: RwLock<HealthState>,
    recoveries: AtomicU64,
    on_recovered: Mutex<Option<Hook>>,
    on_steady: Mutex<Option<Hook>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(storage: Arc<dyn Storage>, max_retries: u32) -> Self {
        Self {
            storage,
            state: RwLock::new(HealthState {
                is_healthy: true,
                last_check: Utc::now(),
                consecutive_failures: 0,
                max_retries,
            }),
            recoveries: AtomicU64::new(0),
            on_recovered: Mutex::new(None),
            on_steady: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    pub fn on_recovered(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_recovered.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn on_steady(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_steady.lock().unwrap() = Some(Arc::new(hook));
    }

    pub async fn state(&self) -> HealthState {
        self.state.read().await.clone()
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.read().await.is_healthy
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// One connectivity + permission check against the backend.
    pub async fn probe(&self) -> bool {
        match self.storage.probe().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Health probe failed");
                false
            }
        }
    }

    /// Run a single probe cycle: probe, update state, fire hooks.
    pub async fn check_now(&self) -> HealthState {
        let healthy = self.probe().await;

        let was_healthy = self.state.read().await.is_healthy;

        if healthy {
            if !was_healthy {
                self.recoveries.fetch_add(1, Ordering::Relaxed);
                info!(
                    recoveries = self.recoveries(),
                    "Backend recovered, triggering reconciliation"
                );
                // The recovered hook runs before the state flips healthy.
                if let Some(hook) = self.on_recovered.lock().unwrap().clone() {
                    hook();
                }
            } else if let Some(hook) = self.on_steady.lock().unwrap().clone() {
                hook();
            }
        }

        let mut state = self.state.write().await;
        state.last_check = Utc::now();
        if healthy {
            state.is_healthy = true;
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            if state.is_healthy {
                warn!(
                    consecutive_failures = state.consecutive_failures,
                    "Backend unhealthy, caching writes until it recovers"
                );
                state.is_healthy = false;
            }
        }
        state.clone()
    }

    /// Probe immediately, then on a fixed interval until `stop()` is called.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let token = CancellationToken::new();
        {
            let mut cancel = self.cancel.lock().unwrap();
            if let Some(previous) = cancel.take() {
                previous.cancel();
            }
            *cancel = Some(token.clone());
        }

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Health monitor started");
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Health monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.check_now().await;
                    }
                }
            }
        });
    }

    /// Cancels the next scheduled probe; an in-flight probe completes.
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        } else {
            error!("Health monitor stop requested but it was never started");
        }
    }
}
