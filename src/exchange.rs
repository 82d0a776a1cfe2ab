pub mod bingx;
pub mod binance;
pub mod gateio;
pub mod mexc;
pub mod okx;
pub mod ws;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use error_stack::Report;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::ExchangeError;
use crate::model::{ConnectivityEvent, ExchangeId, RateTick};
use crate::symbol::Symbol;

/// Funding-interval data is refreshed from the exchange once a day.
const INTERVAL_REFRESH_HOURS: i64 = 24;
pub const DEFAULT_FUNDING_INTERVAL_HOURS: u32 = 8;

/// Abstraction over a perpetual-futures exchange.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn Exchange`).
pub trait Exchange: Send + Sync {
    fn id(&self) -> ExchangeId;

    /// The symbol sets this client is watching.
    fn subscriptions(&self) -> &SubscriptionSet;

    /// Cached funding-interval hours per symbol.
    fn intervals(&self) -> &IntervalBook;

    /// Fetch current funding rates via REST for the given symbols.
    ///
    /// Symbols the exchange reports as unknown are marked unsupported on
    /// the subscription set and skipped; the call fails only for errors
    /// affecting the whole batch (network, rate limit, auth).
    fn fetch_funding(
        &self,
        symbols: &[Symbol],
    ) -> BoxFuture<'_, Result<Vec<RateTick>, Report<ExchangeError>>>;

    /// Fetch funding-interval hours for all listed markets.
    fn fetch_funding_intervals(
        &self,
    ) -> BoxFuture<'_, Result<HashMap<Symbol, u32>, Report<ExchangeError>>>;

    /// Run the WebSocket funding subscription until `cancel` fires.
    ///
    /// Reconnects with jittered exponential backoff, replays the active
    /// subscription set after every reconnect, and publishes normalised
    /// `RateTick`s into `tx` and transport state changes into `events`.
    /// REST-only exchanges return immediately.
    fn run_funding_ws(
        &self,
        tx: mpsc::Sender<RateTick>,
        events: mpsc::Sender<ConnectivityEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<(), Report<ExchangeError>>>;
}

/// Per-exchange symbol bookkeeping.
///
/// `active` is what the operator asked for. `ws_unsupported` symbols were
/// rejected by the WS subscribe ack and are routed to REST on this exchange
/// only. `unsupported` symbols are not listed at all and never participate
/// in spreads involving this exchange.
pub struct SubscriptionSet {
    active: RwLock<BTreeSet<Symbol>>,
    ws_unsupported: RwLock<BTreeSet<Symbol>>,
    unsupported: RwLock<BTreeSet<Symbol>>,
    changed: Notify,
}

impl Default for SubscriptionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(BTreeSet::new()),
            ws_unsupported: RwLock::new(BTreeSet::new()),
            unsupported: RwLock::new(BTreeSet::new()),
            changed: Notify::new(),
        }
    }

    /// Add symbols to the active set. Idempotent; returns how many were new.
    pub fn subscribe(&self, symbols: &[Symbol]) -> usize {
        let mut active = self.active.write();
        let added = symbols
            .iter()
            .filter(|s| active.insert((*s).clone()))
            .count();
        drop(active);
        if added > 0 {
            self.changed.notify_waiters();
        }
        added
    }

    /// Remove symbols from the active set. Reserved for operator tooling.
    #[allow(dead_code)]
    pub fn unsubscribe(&self, symbols: &[Symbol]) -> usize {
        let mut active = self.active.write();
        let removed = symbols.iter().filter(|s| active.remove(s)).count();
        drop(active);
        if removed > 0 {
            self.changed.notify_waiters();
        }
        removed
    }

    /// Symbols to subscribe on the WebSocket feed.
    pub fn ws_symbols(&self) -> Vec<Symbol> {
        let ws_unsupported = self.ws_unsupported.read();
        let unsupported = self.unsupported.read();
        self.active
            .read()
            .iter()
            .filter(|s| !ws_unsupported.contains(*s) && !unsupported.contains(*s))
            .cloned()
            .collect()
    }

    /// Every symbol REST may poll (all active minus unlisted markets).
    pub fn pollable_symbols(&self) -> Vec<Symbol> {
        let unsupported = self.unsupported.read();
        self.active
            .read()
            .iter()
            .filter(|s| !unsupported.contains(*s))
            .cloned()
            .collect()
    }

    /// Symbols that need REST even while the WS feed is healthy.
    pub fn ws_fallback_symbols(&self) -> Vec<Symbol> {
        let unsupported = self.unsupported.read();
        self.ws_unsupported
            .read()
            .iter()
            .filter(|s| !unsupported.contains(*s))
            .cloned()
            .collect()
    }

    /// WS subscribe ack rejected the symbol; route it to REST here.
    pub fn mark_ws_unsupported(&self, symbol: &Symbol) -> bool {
        self.ws_unsupported.write().insert(symbol.clone())
    }

    /// The exchange does not list the market at all.
    pub fn mark_unsupported(&self, symbol: &Symbol) -> bool {
        self.unsupported.write().insert(symbol.clone())
    }

    pub fn is_unsupported(&self, symbol: &Symbol) -> bool {
        self.unsupported.read().contains(symbol)
    }

    /// Resolves when the active set changes (used to re-send subscribe
    /// frames on a live connection).
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// Funding-interval hours per symbol, cached for 24 h.
pub struct IntervalBook {
    map: RwLock<HashMap<Symbol, u32>>,
    refreshed_at: RwLock<Option<DateTime<Utc>>>,
}

impl Default for IntervalBook {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalBook {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            refreshed_at: RwLock::new(None),
        }
    }

    /// Interval hours for `symbol`; unknown markets default to 8 h.
    pub fn hours(&self, symbol: &Symbol) -> u32 {
        self.map
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(DEFAULT_FUNDING_INTERVAL_HOURS)
    }

    pub fn replace(&self, intervals: HashMap<Symbol, u32>, now: DateTime<Utc>) {
        *self.map.write() = intervals;
        *self.refreshed_at.write() = Some(now);
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match *self.refreshed_at.read() {
            Some(at) => now - at >= Duration::hours(INTERVAL_REFRESH_HOURS),
            None => true,
        }
    }
}

/// Partial funding observation waiting for a mark price.
#[derive(Debug, Clone)]
pub struct PendingFunding {
    pub funding_rate: Decimal,
    pub funding_interval_hours: u32,
    pub next_funding_time: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
}

/// Merges funding frames with the most recent mark price when an exchange
/// pushes them on distinct channels. A funding frame with no mark seen yet
/// is held for at most `hold` before it is released with `mark_price=None`.
pub struct MarkMerge {
    marks: HashMap<Symbol, (Decimal, Option<Decimal>)>,
    pending: HashMap<Symbol, PendingFunding>,
    hold: Duration,
}

impl MarkMerge {
    pub fn new(hold_ms: i64) -> Self {
        Self {
            marks: HashMap::new(),
            pending: HashMap::new(),
            hold: Duration::milliseconds(hold_ms),
        }
    }

    /// Record a mark-price frame. Releases the pending funding observation
    /// for the symbol, if one was waiting.
    pub fn on_mark(
        &mut self,
        symbol: &Symbol,
        mark: Decimal,
        index: Option<Decimal>,
    ) -> Option<(Symbol, PendingFunding, Decimal, Option<Decimal>)> {
        self.marks.insert(symbol.clone(), (mark, index));
        self.pending
            .remove(symbol)
            .map(|pending| (symbol.clone(), pending, mark, index))
    }

    /// Record a funding frame. Returns the mark to merge if one is known;
    /// otherwise the observation is queued.
    pub fn on_funding(
        &mut self,
        symbol: Symbol,
        funding: PendingFunding,
    ) -> Option<(Decimal, Option<Decimal>)> {
        match self.marks.get(&symbol) {
            Some(&(mark, index)) => Some((mark, index)),
            None => {
                self.pending.insert(symbol, funding);
                None
            }
        }
    }

    /// Pending observations older than the hold window, released markless.
    pub fn flush_expired(&mut self, now: DateTime<Utc>) -> Vec<(Symbol, PendingFunding)> {
        let hold = self.hold;
        let expired: Vec<Symbol> = self
            .pending
            .iter()
            .filter(|(_, p)| now - p.queued_at >= hold)
            .map(|(s, _)| s.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|s| self.pending.remove(&s).map(|p| (s, p)))
            .collect()
    }
}
