use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::model::{
    ConnectivityEvent, ExchangeId, FundingFeed, LinkState, RateTick, TickSource, Transport,
};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_RECOVERY_DELAY_MS: u64 = 10_000;
const CONTROL_TICK: StdDuration = StdDuration::from_secs(1);
const POLL_BACKOFF_CAP: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Ws,
    Rest,
    Hybrid,
}

impl SourceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Rest => "rest",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub mode: SourceMode,
    pub ws_available: bool,
    pub rest_active: bool,
    pub last_switch_at: DateTime<Utc>,
    pub switch_reason: String,
    pub last_data_at: Option<DateTime<Utc>>,
    pub last_ws_frame_at: Option<DateTime<Utc>>,
    ws_disabled: bool,
    ws_up_since: Option<DateTime<Utc>>,
    hybrid_since: Option<DateTime<Utc>>,
}

impl SourceStatus {
    fn new(mode: SourceMode, reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            mode,
            ws_available: false,
            rest_active: false,
            last_switch_at: now,
            switch_reason: reason.to_owned(),
            last_data_at: None,
            last_ws_frame_at: None,
            ws_disabled: false,
            ws_up_since: None,
            hybrid_since: None,
        }
    }

    fn switch(&mut self, mode: SourceMode, reason: &str, now: DateTime<Utc>) {
        self.mode = mode;
        self.switch_reason = reason.to_owned();
        self.last_switch_at = now;
        self.hybrid_since = (mode == SourceMode::Hybrid).then_some(now);
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub poll_interval: StdDuration,
    pub recovery_delay: Duration,
    /// Per-exchange WS-frame staleness thresholds.
    pub ws_stale: HashMap<ExchangeId, Duration>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            poll_interval: StdDuration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            recovery_delay: Duration::milliseconds(DEFAULT_RECOVERY_DELAY_MS as i64),
            ws_stale: ExchangeId::ALL
                .into_iter()
                .map(|e| (e, Duration::milliseconds(e.default_stale_ms() as i64)))
                .collect(),
        }
    }
}

/// Per-exchange transport arbitration.
///
/// Tracks one funding-data state record per exchange and moves it between
/// `WS`, `REST` and the `HYBRID` overlap window. The manager only decides;
/// the pipeline task reads the mode and acts.
pub struct DataSourceManager {
    states: RwLock<HashMap<ExchangeId, SourceStatus>>,
    cfg: SourceConfig,
}

impl DataSourceManager {
    pub fn new(exchanges: &[ExchangeId], cfg: SourceConfig) -> Self {
        let now = Utc::now();
        let states = exchanges
            .iter()
            .map(|&e| {
                let status = match e.funding_feed() {
                    FundingFeed::RestOnly => SourceStatus::new(SourceMode::Rest, "rest-only", now),
                    _ => SourceStatus::new(SourceMode::Ws, "startup", now),
                };
                (e, status)
            })
            .collect();
        Self {
            states: RwLock::new(states),
            cfg,
        }
    }

    pub fn note_tick(&self, exchange: ExchangeId, source: TickSource, at: DateTime<Utc>) {
        let mut states = self.states.write();
        if let Some(status) = states.get_mut(&exchange) {
            status.last_data_at = Some(status.last_data_at.map_or(at, |seen| seen.max(at)));
            if source == TickSource::Ws {
                status.last_ws_frame_at =
                    Some(status.last_ws_frame_at.map_or(at, |seen| seen.max(at)));
            }
        }
    }

    pub fn note_connectivity(&self, event: &ConnectivityEvent, now: DateTime<Utc>) {
        if event.transport != Transport::Ws {
            return;
        }
        let mut states = self.states.write();
        if let Some(status) = states.get_mut(&event.exchange) {
            match event.state {
                LinkState::Up => {
                    if !status.ws_available {
                        status.ws_up_since = Some(now);
                    }
                    status.ws_available = true;
                }
                LinkState::Down => {
                    status.ws_available = false;
                    status.ws_up_since = None;
                }
            }
        }
    }

    pub fn set_rest_active(&self, exchange: ExchangeId, active: bool) {
        if let Some(status) = self.states.write().get_mut(&exchange) {
            status.rest_active = active;
        }
    }

    /// Operator command: keep this exchange on REST regardless of
    /// WebSocket health. `evaluate` moves it off WS on its next step and
    /// never recovers it.
    pub fn disable_ws(&self, exchange: ExchangeId) {
        if let Some(status) = self.states.write().get_mut(&exchange) {
            status.ws_disabled = true;
        }
    }

    pub fn ws_disabled(&self, exchange: ExchangeId) -> bool {
        self.states
            .read()
            .get(&exchange)
            .map(|s| s.ws_disabled)
            .unwrap_or(false)
    }

    pub fn mode(&self, exchange: ExchangeId) -> SourceMode {
        self.states
            .read()
            .get(&exchange)
            .map(|s| s.mode)
            .unwrap_or(SourceMode::Rest)
    }

    pub fn status(&self, exchange: ExchangeId) -> Option<SourceStatus> {
        self.states.read().get(&exchange).cloned()
    }

    pub fn snapshot(&self) -> Vec<(ExchangeId, SourceStatus)> {
        let mut all: Vec<_> = self
            .states
            .read()
            .iter()
            .map(|(e, s)| (*e, s.clone()))
            .collect();
        all.sort_by_key(|(e, _)| *e);
        all
    }

    fn ws_stale_threshold(&self, exchange: ExchangeId) -> Duration {
        self.cfg
            .ws_stale
            .get(&exchange)
            .copied()
            .unwrap_or_else(|| Duration::milliseconds(exchange.default_stale_ms() as i64))
    }

    /// Run one transition step for `exchange`. Returns the new mode when a
    /// switch happened.
    pub fn evaluate(&self, exchange: ExchangeId, now: DateTime<Utc>) -> Option<SourceMode> {
        if exchange.funding_feed() == FundingFeed::RestOnly {
            return None;
        }

        let stale = self.ws_stale_threshold(exchange);
        let recovery = self.cfg.recovery_delay;
        let mut states = self.states.write();
        let status = states.get_mut(&exchange)?;

        if status.ws_disabled {
            if status.mode != SourceMode::Rest {
                status.switch(SourceMode::Rest, "ws-disabled", now);
                return Some(SourceMode::Rest);
            }
            return None;
        }

        let ws_frames_fresh = status
            .last_ws_frame_at
            .is_some_and(|at| now - at <= stale);
        let ws_silent_too_long = match status.last_ws_frame_at {
            Some(at) => now - at > stale,
            // Never saw a frame: stale once the socket has had a full
            // threshold window since the last switch.
            None => now - status.last_switch_at > stale,
        };

        match status.mode {
            SourceMode::Ws => {
                if !status.ws_available {
                    status.switch(SourceMode::Rest, "ws-disconnected", now);
                    return Some(SourceMode::Rest);
                }
                if ws_silent_too_long {
                    status.switch(SourceMode::Rest, "ws-stale", now);
                    return Some(SourceMode::Rest);
                }
                None
            }
            SourceMode::Rest => {
                let recovered = status.ws_available
                    && ws_frames_fresh
                    && status
                        .ws_up_since
                        .is_some_and(|since| now - since >= recovery);
                if recovered {
                    status.switch(SourceMode::Hybrid, "ws-recovering", now);
                    return Some(SourceMode::Hybrid);
                }
                None
            }
            SourceMode::Hybrid => {
                if !status.ws_available || ws_silent_too_long {
                    status.switch(SourceMode::Rest, "ws-lost-during-recovery", now);
                    return Some(SourceMode::Rest);
                }
                let overlap_done = status
                    .hybrid_since
                    .is_some_and(|since| now - since >= recovery);
                if overlap_done {
                    status.switch(SourceMode::Ws, "ws-recovered", now);
                    return Some(SourceMode::Ws);
                }
                None
            }
        }
    }
}

/// Drive one exchange: spawn its WS subscription (when it has one) and poll
/// REST according to the manager's mode. Runs until `cancel` fires.
pub async fn run_exchange_pipeline(
    exchange: Arc<dyn Exchange>,
    manager: Arc<DataSourceManager>,
    tick_tx: mpsc::Sender<RateTick>,
    conn_tx: mpsc::Sender<ConnectivityEvent>,
    cancel: CancellationToken,
    poll_interval: StdDuration,
) {
    let id = exchange.id();

    let ws_handle = if id.funding_feed() != FundingFeed::RestOnly && !manager.ws_disabled(id) {
        let ws_exchange = Arc::clone(&exchange);
        let ws_tx = tick_tx.clone();
        let ws_conn = conn_tx.clone();
        let ws_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = ws_exchange.run_funding_ws(ws_tx, ws_conn, ws_cancel).await {
                error!(exchange = %ws_exchange.id(), error = ?e, "funding ws task failed");
            }
        }))
    } else {
        None
    };

    let mut control = tokio::time::interval(CONTROL_TICK);
    let mut next_poll = Instant::now();
    let mut poll_backoff = poll_interval;
    let mut rest_was_ok = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = control.tick() => {}
        }

        let now = Utc::now();
        if let Some(mode) = manager.evaluate(id, now) {
            let status = manager.status(id);
            info!(
                exchange = %id,
                mode = %mode,
                reason = status.map(|s| s.switch_reason).unwrap_or_default(),
                "data source switched"
            );
        }

        let symbols = match manager.mode(id) {
            SourceMode::Rest | SourceMode::Hybrid => exchange.subscriptions().pollable_symbols(),
            // Even in WS mode, symbols the WS feed rejected stay on REST.
            SourceMode::Ws => exchange.subscriptions().ws_fallback_symbols(),
        };

        if symbols.is_empty() {
            manager.set_rest_active(id, false);
            continue;
        }
        if Instant::now() < next_poll {
            continue;
        }

        match exchange.fetch_funding(&symbols).await {
            Ok(ticks) => {
                if !rest_was_ok {
                    let _ = conn_tx
                        .send(ConnectivityEvent {
                            exchange: id,
                            transport: Transport::Rest,
                            state: LinkState::Up,
                            reason: "poll recovered".into(),
                        })
                        .await;
                }
                rest_was_ok = true;
                manager.set_rest_active(id, true);
                poll_backoff = poll_interval;
                next_poll = Instant::now() + poll_interval;
                for tick in ticks {
                    let _ = tick_tx.send(tick).await;
                }
            }
            Err(report) => {
                if rest_was_ok {
                    let _ = conn_tx
                        .send(ConnectivityEvent {
                            exchange: id,
                            transport: Transport::Rest,
                            state: LinkState::Down,
                            reason: format!("{}", report.current_context()),
                        })
                        .await;
                }
                rest_was_ok = false;
                let delay = classify_poll_failure(id, &report, poll_backoff);
                next_poll = Instant::now() + delay;
                poll_backoff = (poll_backoff * 2).min(POLL_BACKOFF_CAP);
            }
        }
    }

    if let Some(handle) = ws_handle {
        let _ = handle.await;
    }
    debug!(exchange = %id, "exchange pipeline stopped");
}

/// Log a REST poll failure per its error kind and pick the next delay.
/// The poller itself never stops; mode decisions stay with the manager.
fn classify_poll_failure(
    exchange: ExchangeId,
    report: &error_stack::Report<ExchangeError>,
    backoff: StdDuration,
) -> StdDuration {
    match report.current_context() {
        ExchangeError::RateLimited {
            retry_after_secs, ..
        } => {
            warn!(exchange = %exchange, retry_after = ?retry_after_secs, "rest poll rate limited");
            retry_after_secs
                .map(StdDuration::from_secs)
                .unwrap_or(backoff)
        }
        ExchangeError::Request { .. } | ExchangeError::Connection { .. } => {
            warn!(exchange = %exchange, error = ?report, "rest poll failed");
            backoff
        }
        ExchangeError::ResponseParse { .. } => {
            warn!(exchange = %exchange, error = ?report, "rest poll returned malformed payload");
            backoff
        }
        ExchangeError::AuthFailed { .. } => {
            error!(exchange = %exchange, error = ?report, "rest poll authentication rejected");
            backoff
        }
        other => {
            error!(exchange = %exchange, error = %other, "rest poll failed unexpectedly");
            backoff
        }
    }
}
