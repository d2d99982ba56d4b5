//! Next-run polling coordination: periodic refresh, last-request-wins
//! response handling, consecutive-failure circuit breaking and manual triggers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sparvi_client::{ApiError, AutomationApi, ErrorCategory};
use sparvi_core::{NextRunInfo, NextRuns, UpcomingRun};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sparvi-poller";

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// `None` polls every connection the caller can see.
    pub connection_id: Option<String>,
    pub refresh_interval: Duration,
    pub enabled: bool,
    /// Pause before the first fetch so many coordinators mounting together
    /// do not hit the API at the same instant.
    pub settle_delay: Duration,
    /// Consecutive failures after which timer-driven polling pauses.
    pub failure_threshold: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            connection_id: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            enabled: true,
            settle_delay: DEFAULT_SETTLE_DELAY,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(connection_id: Option<String>) -> Self {
        Self {
            connection_id,
            ..Self::default()
        }
    }

    pub fn for_connection(connection_id: impl Into<String>) -> Self {
        Self::new(Some(connection_id.into()))
    }

    pub fn all_connections() -> Self {
        Self::new(None)
    }

    pub fn from_env() -> Self {
        let env_ms = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let defaults = Self::default();
        Self {
            connection_id: std::env::var("SPARVI_CONNECTION_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            refresh_interval: env_ms("SPARVI_REFRESH_INTERVAL_MS")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.refresh_interval),
            enabled: std::env::var("SPARVI_POLL_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            settle_delay: env_ms("SPARVI_SETTLE_DELAY_MS").unwrap_or(defaults.settle_delay),
            failure_threshold: std::env::var("SPARVI_FAILURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|t| *t > 0)
                .unwrap_or(defaults.failure_threshold),
        }
    }

    /// A zero interval falls back to the default.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = if interval.is_zero() {
            DEFAULT_REFRESH_INTERVAL
        } else {
            interval
        };
        self
    }

    /// Timer period actually used; a zero interval set directly on the field
    /// still polls at the default rate.
    pub fn poll_period(&self) -> Duration {
        if self.refresh_interval.is_zero() {
            DEFAULT_REFRESH_INTERVAL
        } else {
            self.refresh_interval
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn is_multi_connection(&self) -> bool {
        self.connection_id.is_none()
    }
}

/// Opaque marker for the fetch whose response may still be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(Uuid);

impl RequestToken {
    fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollError {
    pub category: ErrorCategory,
    pub message: String,
    pub detail: String,
}

impl PollError {
    pub fn from_api(err: &ApiError) -> Self {
        let category = err.category();
        let message = match category {
            ErrorCategory::Network => "Unable to reach the automation service".to_string(),
            ErrorCategory::Timeout => "Timed out loading next run times".to_string(),
            ErrorCategory::Unknown => format!("Failed to load next run times: {err}"),
        };
        Self {
            category,
            message,
            detail: err.to_string(),
        }
    }
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.category)
    }
}

/// Observable coordinator state. Each coordinator owns exactly one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollState {
    pub next_runs: NextRuns,
    pub loading: bool,
    pub error: Option<PollError>,
    pub consecutive_error_count: u32,
    pub circuit_open: bool,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub current_request: Option<RequestToken>,
}

impl PollState {
    fn initial(config: &CoordinatorConfig) -> Self {
        Self {
            next_runs: NextRuns::empty(config.is_multi_connection()),
            loading: config.enabled,
            error: None,
            consecutive_error_count: 0,
            circuit_open: false,
            last_updated: None,
            current_request: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    Idle,
    Polling,
    Error,
    CircuitOpen,
    Stopped,
}

pub type ErrorCallback = Arc<dyn Fn(&PollError) + Send + Sync>;

struct Shared {
    api: Arc<dyn AutomationApi>,
    config: CoordinatorConfig,
    enabled: AtomicBool,
    live: AtomicBool,
    stopped: AtomicBool,
    state: watch::Sender<PollState>,
    on_error: Option<ErrorCallback>,
}

impl Shared {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn circuit_open(&self) -> bool {
        self.state.borrow().circuit_open
    }

    async fn fetch(&self, force_fresh: bool) {
        if !self.is_enabled() || !self.is_live() {
            return;
        }

        let token = RequestToken::fresh();
        self.state.send_modify(|s| s.current_request = Some(token));

        let result = match &self.config.connection_id {
            Some(connection_id) => self.api.next_run_times(connection_id, force_fresh).await,
            None => self.api.next_run_times_all(force_fresh).await,
        };
        self.apply(token, result);
    }

    fn apply(&self, token: RequestToken, result: Result<NextRuns, ApiError>) {
        let threshold = self.config.failure_threshold;
        let mut failure: Option<(PollError, u32, bool)> = None;

        let applied = self.state.send_if_modified(|s| {
            if !self.is_live() || s.current_request != Some(token) {
                return false;
            }
            s.current_request = None;
            s.loading = false;
            match &result {
                Ok(runs) => {
                    s.next_runs = runs.clone();
                    s.error = None;
                    s.consecutive_error_count = 0;
                    s.circuit_open = false;
                    s.last_updated = Some(Utc::now());
                }
                Err(err) => {
                    let poll_error = PollError::from_api(err);
                    s.consecutive_error_count = s.consecutive_error_count.saturating_add(1);
                    s.error = Some(poll_error.clone());
                    let opened = !s.circuit_open && s.consecutive_error_count >= threshold;
                    if opened {
                        s.circuit_open = true;
                    }
                    failure = Some((poll_error, s.consecutive_error_count, opened));
                }
            }
            true
        });

        if !applied {
            debug!("discarding superseded or post-stop next-run response");
            return;
        }

        match failure {
            None => debug!(entries = self.state.borrow().next_runs.len(), "next-run times updated"),
            Some((err, count, opened)) => {
                warn!(error = %err, consecutive_errors = count, "next-run poll failed");
                if opened {
                    warn!(threshold, "circuit opened; scheduled polling paused until a manual refresh succeeds");
                }
                if let Some(callback) = &self.on_error {
                    callback(&err);
                }
            }
        }
    }
}

async fn run_timer(shared: Arc<Shared>) {
    tokio::time::sleep(shared.config.settle_delay).await;
    if !shared.is_live() || !shared.is_enabled() {
        return;
    }
    let initial = shared.clone();
    tokio::spawn(async move { initial.fetch(false).await });

    let period = shared.config.poll_period();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !shared.is_live() || !shared.is_enabled() {
            break;
        }
        if shared.circuit_open() {
            debug!("circuit open; skipping scheduled poll");
            continue;
        }
        // Each poll runs on its own task so a hung request cannot stall the timer.
        let tick = shared.clone();
        tokio::spawn(async move { tick.fetch(true).await });
    }
}

/// Polls next scheduled automation runs for one connection or for all of them.
///
/// Every response is applied only if it belongs to the most recently issued
/// request and the coordinator has not been stopped. Public methods never
/// fail; failures land in [`PollState::error`] and [`PollState::circuit_open`].
pub struct NextRunCoordinator {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl NextRunCoordinator {
    pub fn new(api: Arc<dyn AutomationApi>, config: CoordinatorConfig) -> Self {
        Self::build(api, config, None)
    }

    pub fn with_error_callback(
        api: Arc<dyn AutomationApi>,
        config: CoordinatorConfig,
        on_error: impl Fn(&PollError) + Send + Sync + 'static,
    ) -> Self {
        Self::build(api, config, Some(Arc::new(on_error)))
    }

    fn build(
        api: Arc<dyn AutomationApi>,
        config: CoordinatorConfig,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        let (state, _) = watch::channel(PollState::initial(&config));
        Self {
            shared: Arc::new(Shared {
                api,
                enabled: AtomicBool::new(config.enabled),
                live: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                config,
                state,
                on_error,
            }),
            timer: Mutex::new(None),
        }
    }

    /// Construct and start in one step. Must run inside a Tokio runtime.
    pub fn spawn(api: Arc<dyn AutomationApi>, config: CoordinatorConfig) -> Self {
        let coordinator = Self::new(api, config);
        coordinator.start();
        coordinator
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    fn timer_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_timer(&self) {
        let mut slot = self.timer_slot();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(run_timer(self.shared.clone())));
    }

    /// Mount the coordinator. Must run inside a Tokio runtime.
    pub fn start(&self) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            warn!("start called on a stopped coordinator; ignoring");
            return;
        }
        if self.shared.live.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.shared.is_enabled() {
            self.shared.state.send_modify(|s| s.loading = false);
            return;
        }
        info!(
            connection_id = self.shared.config.connection_id.as_deref().unwrap_or("*"),
            refresh_interval_ms = self.shared.config.poll_period().as_millis() as u64,
            "starting next-run polling"
        );
        self.spawn_timer();
    }

    /// Unmount: later responses are discarded and the timer is cancelled.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if !self.shared.live.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.timer_slot().take() {
            timer.abort();
        }
        self.shared.state.send_modify(|s| s.current_request = None);
        debug!("next-run polling stopped");
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Toggle polling on a mounted coordinator.
    pub fn set_enabled(&self, enabled: bool) {
        if self.shared.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        if !self.is_live() {
            self.shared.state.send_modify(|s| s.loading = enabled && !self.shared.stopped.load(Ordering::SeqCst));
            return;
        }
        if enabled {
            self.shared.state.send_modify(|s| s.loading = true);
            self.spawn_timer();
        } else {
            if let Some(timer) = self.timer_slot().take() {
                timer.abort();
            }
            self.shared.state.send_modify(|s| {
                s.current_request = None;
                s.loading = false;
            });
        }
    }

    /// Issue a poll now. Supersedes any request still in flight.
    pub async fn fetch(&self, force_fresh: bool) {
        self.shared.fetch(force_fresh).await;
    }

    /// Manual refresh. Attempts even while the circuit is open and closes it on success.
    pub async fn refresh(&self) {
        if !self.is_enabled() || !self.is_live() {
            return;
        }
        self.shared.state.send_modify(|s| s.loading = true);
        self.shared.fetch(true).await;
    }

    /// Trigger `automation_type` on the configured connection. Without a
    /// configured connection there is no target and this returns `false`.
    pub async fn trigger_manual_run(&self, automation_type: &str) -> bool {
        match self.shared.config.connection_id.as_deref() {
            Some(connection_id) => self.trigger_manual_run_for(connection_id, automation_type).await,
            None => {
                warn!(automation_type, "manual trigger needs an explicit connection in all-connections mode");
                false
            }
        }
    }

    /// The run is scheduled asynchronously; call [`Self::refresh`] after a
    /// short delay to observe it.
    pub async fn trigger_manual_run_for(&self, connection_id: &str, automation_type: &str) -> bool {
        match self.shared.api.trigger_run(connection_id, automation_type).await {
            Ok(true) => {
                info!(connection_id, automation_type, "manual run triggered");
                true
            }
            Ok(false) => {
                warn!(connection_id, automation_type, "manual run was not accepted");
                false
            }
            Err(err) => {
                warn!(connection_id, automation_type, error = %err, "manual run trigger failed");
                false
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> PollState {
        self.shared.state.borrow().clone()
    }

    pub fn phase(&self) -> PollPhase {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return PollPhase::Stopped;
        }
        if !self.is_enabled() || !self.is_live() {
            return PollPhase::Idle;
        }
        let state = self.shared.state.borrow();
        if state.circuit_open {
            PollPhase::CircuitOpen
        } else if state.error.is_some() {
            PollPhase::Error
        } else {
            PollPhase::Polling
        }
    }

    /// In all-connections mode `connection_id` selects the connection.
    pub fn next_run(&self, automation_type: &str, connection_id: Option<&str>) -> Option<NextRunInfo> {
        self.shared
            .state
            .borrow()
            .next_runs
            .get(automation_type, connection_id)
            .cloned()
    }

    pub fn has_overdue_runs(&self) -> bool {
        self.shared.state.borrow().next_runs.has_overdue()
    }

    pub fn overdue_count(&self) -> usize {
        self.shared.state.borrow().next_runs.overdue_count()
    }

    pub fn next_upcoming_run(&self) -> Option<UpcomingRun> {
        self.shared.state.borrow().next_runs.next_upcoming()
    }
}

impl Drop for NextRunCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for NextRunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NextRunCoordinator")
            .field("config", &self.shared.config)
            .field("live", &self.is_live())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
