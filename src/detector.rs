use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::RateCache;
use crate::exchange::Exchange;
use crate::model::{
    DisappearReason, ExchangeId, Opportunity, OpportunityClosed, OpportunityEvent,
    OpportunityHistory, OpportunityStatus, PipelineEvent, RateTick, Severity,
};
use crate::persist::{PersistHandle, PersistRequest};
use crate::symbol::Symbol;

pub const DEFAULT_SHARD_COUNT: usize = 4;
pub const DEFAULT_QUEUE_CAP: usize = 1024;
pub const DEFAULT_MIN_HOLD_MS: i64 = 2_000;
pub const DEFAULT_MAX_STALE_MS: i64 = 30_000;
const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub minimum_spread: Decimal,
    pub warning_spread: Decimal,
    pub critical_spread: Decimal,
    /// How long the spread must sit below minimum before an active
    /// opportunity expires.
    pub min_hold: Duration,
    /// How long both legs may be stale before an active opportunity expires.
    pub max_stale: Duration,
    pub shard_count: usize,
    pub queue_cap: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            minimum_spread: Decimal::new(5, 4),
            warning_spread: Decimal::new(10, 4),
            critical_spread: Decimal::new(30, 4),
            min_hold: Duration::milliseconds(DEFAULT_MIN_HOLD_MS),
            max_stale: Duration::milliseconds(DEFAULT_MAX_STALE_MS),
            shard_count: DEFAULT_SHARD_COUNT,
            queue_cap: DEFAULT_QUEUE_CAP,
        }
    }
}

impl DetectorConfig {
    pub fn severity_for(&self, spread: Decimal) -> Severity {
        if spread >= self.critical_spread {
            Severity::Critical
        } else if spread >= self.warning_spread {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}

/// `|spread| × fundingsPerDay × 365` where fundings per day derive from the
/// shorter leg interval.
pub fn annualized_return(spread: Decimal, min_interval_hours: u32) -> Decimal {
    let fundings_per_day = Decimal::from(24) / Decimal::from(min_interval_hours.max(1));
    spread.abs() * fundings_per_day * Decimal::from(365)
}

/// Best `(long, short)` leg pair over the fresh snapshot.
#[derive(Debug, Clone)]
pub struct SpreadCandidate {
    pub long: RateTick,
    pub short: RateTick,
    pub spread: Decimal,
    pub min_interval_hours: u32,
}

impl SpreadCandidate {
    pub fn annualized(&self) -> Decimal {
        annualized_return(self.spread, self.min_interval_hours)
    }
}

/// Maximum of `short.rate − long.rate` over all ordered exchange pairs.
/// Ties prefer the shorter funding interval (higher APY), then the
/// alphabetically first pair.
pub fn best_candidate(fresh: &[RateTick]) -> Option<SpreadCandidate> {
    let mut best: Option<SpreadCandidate> = None;
    for long in fresh {
        for short in fresh {
            if long.exchange == short.exchange {
                continue;
            }
            let spread = short.funding_rate - long.funding_rate;
            let min_interval_hours = long
                .funding_interval_hours
                .min(short.funding_interval_hours)
                .max(1);

            let better = match &best {
                None => true,
                Some(current) => match spread.cmp(&current.spread) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => {
                        match min_interval_hours.cmp(&current.min_interval_hours) {
                            std::cmp::Ordering::Less => true,
                            std::cmp::Ordering::Greater => false,
                            std::cmp::Ordering::Equal => {
                                (long.exchange.as_str(), short.exchange.as_str())
                                    < (current.long.exchange.as_str(), current.short.exchange.as_str())
                            }
                        }
                    }
                },
            };

            if better {
                best = Some(SpreadCandidate {
                    long: long.clone(),
                    short: short.clone(),
                    spread,
                    min_interval_hours,
                });
            }
        }
    }
    best
}

struct SymbolState {
    opp: Opportunity,
    long_rate: Decimal,
    short_rate: Decimal,
    next_funding_time: DateTime<Utc>,
    spread_sum: Decimal,
    spread_samples: u32,
    below_min_since: Option<DateTime<Utc>>,
    stale_since: Option<DateTime<Utc>>,
    last_emitted_spread: Decimal,
}

/// What one engine step produced: lifecycle events for the debouncer plus
/// persistence writes, in causal order.
#[derive(Default)]
pub struct EngineOut {
    pub events: Vec<PipelineEvent>,
    pub persists: Vec<PersistRequest>,
}

/// Per-shard detection state. Symbols are sharded by stable hash, so all
/// transitions for one symbol run on one worker and stay serialised.
pub struct ShardEngine {
    cfg: DetectorConfig,
    cache: Arc<RateCache>,
    exchanges: HashMap<ExchangeId, Arc<dyn Exchange>>,
    states: HashMap<Symbol, SymbolState>,
    active_gauge: Arc<AtomicUsize>,
}

impl ShardEngine {
    pub fn new(
        cfg: DetectorConfig,
        cache: Arc<RateCache>,
        exchanges: HashMap<ExchangeId, Arc<dyn Exchange>>,
        active_gauge: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            cfg,
            cache,
            exchanges,
            states: HashMap::new(),
            active_gauge,
        }
    }

    fn is_unsupported(&self, exchange: ExchangeId, symbol: &Symbol) -> bool {
        self.exchanges
            .get(&exchange)
            .map(|e| e.subscriptions().is_unsupported(symbol))
            .unwrap_or(false)
    }

    pub fn on_tick(&mut self, tick: RateTick, now: DateTime<Utc>) -> EngineOut {
        let symbol = tick.symbol.clone();
        if !self.cache.put(tick) {
            // Out-of-order write, dropped silently.
            return EngineOut::default();
        }
        self.evaluate_symbol(&symbol, now)
    }

    /// Periodic pass over active opportunities for guard windows that must
    /// fire even when no new tick arrives.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> EngineOut {
        let mut out = EngineOut::default();
        let symbols: Vec<Symbol> = self.states.keys().cloned().collect();

        for symbol in symbols {
            let Some(state) = self.states.get_mut(&symbol) else {
                continue;
            };

            let long_fresh = self
                .cache
                .get(state.opp.long_exchange, &symbol)
                .is_some_and(|t| now - t.received_at <= self.cache.stale_threshold(t.exchange));
            let short_fresh = self
                .cache
                .get(state.opp.short_exchange, &symbol)
                .is_some_and(|t| now - t.received_at <= self.cache.stale_threshold(t.exchange));

            if !long_fresh && !short_fresh {
                let since = *state.stale_since.get_or_insert(now);
                if now - since >= self.cfg.max_stale {
                    self.expire(&symbol, DisappearReason::DataUnavailable, now, &mut out);
                    continue;
                }
            } else {
                state.stale_since = None;
            }

            let Some(state) = self.states.get(&symbol) else {
                continue;
            };
            if let Some(since) = state.below_min_since
                && now - since >= self.cfg.min_hold
            {
                self.expire(&symbol, DisappearReason::RateDropped, now, &mut out);
            }
        }
        out
    }

    fn evaluate_symbol(&mut self, symbol: &Symbol, now: DateTime<Utc>) -> EngineOut {
        let fresh: Vec<RateTick> = self
            .cache
            .snapshot_symbol(symbol)
            .into_iter()
            .filter(|t| self.cache.is_fresh(t, now))
            .filter(|t| !self.is_unsupported(t.exchange, symbol))
            .collect();

        // A spread needs two live legs; with fewer, leave state untouched
        // and let the staleness sweep decide.
        if fresh.len() < 2 {
            return EngineOut::default();
        }
        let Some(candidate) = best_candidate(&fresh) else {
            return EngineOut::default();
        };

        let mut out = EngineOut::default();
        if self.states.contains_key(symbol) {
            if candidate.spread >= self.cfg.minimum_spread {
                self.update_active(symbol, &candidate, now, &mut out);
            } else {
                self.note_below_minimum(symbol, now, &mut out);
            }
        } else if candidate.spread >= self.cfg.minimum_spread {
            self.open(symbol, &candidate, now, &mut out);
        }
        out
    }

    fn open(
        &mut self,
        symbol: &Symbol,
        candidate: &SpreadCandidate,
        now: DateTime<Utc>,
        out: &mut EngineOut,
    ) {
        let severity = self.cfg.severity_for(candidate.spread);
        let opp = Opportunity {
            id: Uuid::new_v4(),
            symbol: symbol.clone(),
            long_exchange: candidate.long.exchange,
            short_exchange: candidate.short.exchange,
            entry_spread: candidate.spread,
            current_spread: candidate.spread,
            max_spread: candidate.spread,
            max_spread_at: now,
            first_detected_at: now,
            last_notified_at: Some(now),
            notification_count: 1,
            severity,
            annualized_return: candidate.annualized(),
            funding_interval_hours: candidate.min_interval_hours,
            status: OpportunityStatus::Active,
        };

        info!(
            symbol = %symbol,
            long = %opp.long_exchange,
            short = %opp.short_exchange,
            spread = %opp.entry_spread,
            severity = %severity,
            "opportunity appeared"
        );

        let state = SymbolState {
            opp,
            long_rate: candidate.long.funding_rate,
            short_rate: candidate.short.funding_rate,
            next_funding_time: candidate
                .long
                .next_funding_time
                .min(candidate.short.next_funding_time),
            spread_sum: candidate.spread,
            spread_samples: 1,
            below_min_since: None,
            stale_since: None,
            last_emitted_spread: candidate.spread,
        };

        self.active_gauge.fetch_add(1, Ordering::Relaxed);
        out.persists
            .push(PersistRequest::SaveOpportunity(state.opp.clone()));
        out.events
            .push(PipelineEvent::Appeared(snapshot_event(&state, now)));
        self.states.insert(symbol.clone(), state);
    }

    fn update_active(
        &mut self,
        symbol: &Symbol,
        candidate: &SpreadCandidate,
        now: DateTime<Utc>,
        out: &mut EngineOut,
    ) {
        let Some(state) = self.states.get_mut(symbol) else {
            return;
        };
        state.below_min_since = None;
        state.stale_since = None;
        state.spread_sum += candidate.spread;
        state.spread_samples += 1;

        let pair_changed = (candidate.long.exchange, candidate.short.exchange)
            != (state.opp.long_exchange, state.opp.short_exchange);
        let new_severity = self.cfg.severity_for(candidate.spread);
        let severity_changed = new_severity != state.opp.severity;
        let relative_gate = {
            let change = (candidate.spread - state.last_emitted_spread).abs();
            change >= state.last_emitted_spread.abs() * Decimal::new(1, 1)
        };

        // The opportunity is continuous across a change of optimal
        // counterparties; swap the legs in place rather than closing.
        state.opp.long_exchange = candidate.long.exchange;
        state.opp.short_exchange = candidate.short.exchange;
        state.opp.current_spread = candidate.spread;
        state.opp.severity = new_severity;
        state.opp.annualized_return = candidate.annualized();
        state.opp.funding_interval_hours = candidate.min_interval_hours;
        state.long_rate = candidate.long.funding_rate;
        state.short_rate = candidate.short.funding_rate;
        state.next_funding_time = candidate
            .long
            .next_funding_time
            .min(candidate.short.next_funding_time);
        if candidate.spread > state.opp.max_spread {
            state.opp.max_spread = candidate.spread;
            state.opp.max_spread_at = now;
        }

        if pair_changed || severity_changed || relative_gate {
            state.opp.last_notified_at = Some(now);
            state.opp.notification_count += 1;
            state.last_emitted_spread = candidate.spread;

            debug!(
                symbol = %symbol,
                spread = %candidate.spread,
                pair_changed,
                severity = %new_severity,
                "opportunity updated"
            );
            out.persists
                .push(PersistRequest::UpdateOpportunity(state.opp.clone()));
            out.events
                .push(PipelineEvent::Updated(snapshot_event(state, now)));
        }
    }

    fn note_below_minimum(&mut self, symbol: &Symbol, now: DateTime<Utc>, out: &mut EngineOut) {
        let Some(state) = self.states.get_mut(symbol) else {
            return;
        };
        let since = *state.below_min_since.get_or_insert(now);
        if now - since >= self.cfg.min_hold {
            self.expire(symbol, DisappearReason::RateDropped, now, out);
        }
    }

    fn expire(
        &mut self,
        symbol: &Symbol,
        reason: DisappearReason,
        now: DateTime<Utc>,
        out: &mut EngineOut,
    ) {
        let Some(mut state) = self.states.remove(symbol) else {
            return;
        };
        self.active_gauge.fetch_sub(1, Ordering::Relaxed);

        state.opp.status = OpportunityStatus::Expired;
        state.opp.last_notified_at = Some(now);
        state.opp.notification_count += 1;

        let duration_ms = (now - state.opp.first_detected_at).num_milliseconds();
        let average_spread = state.spread_sum / Decimal::from(state.spread_samples.max(1));
        let history = OpportunityHistory {
            opportunity_id: state.opp.id,
            symbol: symbol.clone(),
            long_exchange: state.opp.long_exchange,
            short_exchange: state.opp.short_exchange,
            duration_ms,
            max_spread: state.opp.max_spread,
            average_spread,
            disappear_reason: reason,
            notification_count: state.opp.notification_count,
            ended_at: now,
        };

        info!(
            symbol = %symbol,
            reason = %reason,
            duration_ms,
            max_spread = %state.opp.max_spread,
            "opportunity disappeared"
        );

        out.persists
            .push(PersistRequest::UpdateOpportunity(state.opp.clone()));
        out.persists.push(PersistRequest::SaveHistory(history));
        out.events.push(PipelineEvent::Disappeared(OpportunityClosed {
            opportunity: state.opp,
            duration_ms,
            disappear_reason: reason,
            at: now,
        }));
    }
}

fn snapshot_event(state: &SymbolState, at: DateTime<Utc>) -> OpportunityEvent {
    OpportunityEvent {
        opportunity: state.opp.clone(),
        long_rate: state.long_rate,
        short_rate: state.short_rate,
        next_funding_time: state.next_funding_time,
        at,
    }
}

/// Stable shard assignment so per-symbol transitions stay serialised.
pub fn shard_for(symbol: &Symbol, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    (hasher.finish() as usize) % shards.max(1)
}

pub struct DetectorHandles {
    pub intake_tx: mpsc::Sender<RateTick>,
    pub tasks: Vec<JoinHandle<()>>,
    pub active_opportunities: Arc<AtomicUsize>,
    pub dropped_ticks: Arc<AtomicU64>,
    pub dropped_events: Arc<AtomicU64>,
}

/// Spawn the router plus one worker per shard.
pub fn spawn(
    cfg: DetectorConfig,
    cache: Arc<RateCache>,
    exchanges: HashMap<ExchangeId, Arc<dyn Exchange>>,
    manager: Arc<crate::source::DataSourceManager>,
    events_tx: mpsc::Sender<PipelineEvent>,
    persist: PersistHandle,
    cancel: CancellationToken,
) -> DetectorHandles {
    let active_opportunities = Arc::new(AtomicUsize::new(0));
    let dropped_ticks = Arc::new(AtomicU64::new(0));
    let dropped_events = Arc::new(AtomicU64::new(0));

    let mut tasks = Vec::new();
    let mut shard_txs = Vec::with_capacity(cfg.shard_count.max(1));
    for _ in 0..cfg.shard_count.max(1) {
        let (tx, rx) = mpsc::channel::<RateTick>(cfg.queue_cap);
        shard_txs.push(tx);
        let engine = ShardEngine::new(
            cfg.clone(),
            Arc::clone(&cache),
            exchanges.clone(),
            Arc::clone(&active_opportunities),
        );
        tasks.push(tokio::spawn(shard_worker(
            engine,
            rx,
            events_tx.clone(),
            persist.clone(),
            Arc::clone(&dropped_events),
            cancel.clone(),
        )));
    }

    let (intake_tx, intake_rx) = mpsc::channel::<RateTick>(cfg.queue_cap);
    tasks.push(tokio::spawn(route_loop(
        intake_rx,
        shard_txs,
        manager,
        Arc::clone(&dropped_ticks),
        cancel.clone(),
    )));

    DetectorHandles {
        intake_tx,
        tasks,
        active_opportunities,
        dropped_ticks,
        dropped_events,
    }
}

async fn route_loop(
    mut rx: mpsc::Receiver<RateTick>,
    shard_txs: Vec<mpsc::Sender<RateTick>>,
    manager: Arc<crate::source::DataSourceManager>,
    dropped_ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let tick = tokio::select! {
            _ = cancel.cancelled() => break,
            tick = rx.recv() => match tick {
                Some(tick) => tick,
                None => break,
            },
        };

        manager.note_tick(tick.exchange, tick.source, tick.received_at);
        let idx = shard_for(&tick.symbol, shard_txs.len());
        // A full shard drops the tick; the key retains only its latest
        // observation anyway, so replacement is lossless in effect.
        if shard_txs[idx].try_send(tick).is_err() {
            dropped_ticks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn shard_worker(
    mut engine: ShardEngine,
    mut rx: mpsc::Receiver<RateTick>,
    events_tx: mpsc::Sender<PipelineEvent>,
    persist: PersistHandle,
    dropped_events: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        let out = tokio::select! {
            _ = cancel.cancelled() => break,
            tick = rx.recv() => match tick {
                Some(tick) => engine.on_tick(tick, Utc::now()),
                None => break,
            },
            _ = sweep.tick() => engine.sweep(Utc::now()),
        };
        forward(out, &events_tx, &persist, &dropped_events).await;
    }
}

async fn forward(
    out: EngineOut,
    events_tx: &mpsc::Sender<PipelineEvent>,
    persist: &PersistHandle,
    dropped_events: &AtomicU64,
) {
    for request in out.persists {
        persist.enqueue(request);
    }
    for event in out.events {
        match &event {
            // Updates are droppable under backpressure; appeared and
            // disappeared must survive to preserve the lifecycle ordering.
            PipelineEvent::Updated(_) => {
                if events_tx.try_send(event).is_err() {
                    dropped_events.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                let _ = events_tx.send(event).await;
            }
        }
    }
}
