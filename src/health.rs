use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::RateCache;
use crate::model::ExchangeId;
use crate::notify::ChannelStats;
use crate::persist::PersistHandle;
use crate::source::DataSourceManager;

pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeHealth {
    pub exchange: ExchangeId,
    pub mode: String,
    pub ws_available: bool,
    pub rest_active: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    pub name: String,
    /// Success rate over the sliding 5-minute window; `None` when idle.
    pub success_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub as_of: DateTime<Utc>,
    pub exchanges: Vec<ExchangeHealth>,
    pub active_opportunities: usize,
    pub debounce_depth: usize,
    pub dropped_ticks: u64,
    pub dropped_events: u64,
    pub dropped_persist_records: u64,
    pub channels: Vec<ChannelHealth>,
}

/// Periodic cross-component heartbeat. Observes; never acts.
pub struct HealthMonitor {
    cache: Arc<RateCache>,
    manager: Arc<DataSourceManager>,
    active_opportunities: Arc<AtomicUsize>,
    debounce_depth: Arc<AtomicUsize>,
    dropped_ticks: Arc<AtomicU64>,
    dropped_events: Arc<AtomicU64>,
    persist: PersistHandle,
    channels: Vec<(String, Arc<ChannelStats>)>,
    interval: StdDuration,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<RateCache>,
        manager: Arc<DataSourceManager>,
        active_opportunities: Arc<AtomicUsize>,
        debounce_depth: Arc<AtomicUsize>,
        dropped_ticks: Arc<AtomicU64>,
        dropped_events: Arc<AtomicU64>,
        persist: PersistHandle,
        channels: Vec<(String, Arc<ChannelStats>)>,
        interval: StdDuration,
    ) -> Self {
        Self {
            cache,
            manager,
            active_opportunities,
            debounce_depth,
            dropped_ticks,
            dropped_events,
            persist,
            channels,
            interval,
        }
    }

    pub fn report(&self, now: DateTime<Utc>) -> HealthReport {
        let exchanges = self
            .manager
            .snapshot()
            .into_iter()
            .map(|(exchange, status)| ExchangeHealth {
                exchange,
                mode: status.mode.as_str().to_owned(),
                ws_available: status.ws_available,
                rest_active: status.rest_active,
                last_seen: self.cache.last_seen(exchange).or(status.last_data_at),
                stale: self.cache.is_source_stale(exchange, now),
            })
            .collect();

        let channels = self
            .channels
            .iter()
            .map(|(name, stats)| ChannelHealth {
                name: name.clone(),
                success_rate: stats.success_rate(now),
            })
            .collect();

        HealthReport {
            as_of: now,
            exchanges,
            active_opportunities: self.active_opportunities.load(Ordering::Relaxed),
            debounce_depth: self.debounce_depth.load(Ordering::Relaxed),
            dropped_ticks: self.dropped_ticks.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            dropped_persist_records: self.persist.dropped(),
            channels,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.report(Utc::now());
            info!(
                target: "health",
                active = report.active_opportunities,
                debounce_depth = report.debounce_depth,
                dropped_ticks = report.dropped_ticks,
                dropped_events = report.dropped_events,
                dropped_persist = report.dropped_persist_records,
                report = %serde_json::to_string(&report).unwrap_or_default(),
                "health report"
            );

            for exchange in &report.exchanges {
                if exchange.stale {
                    warn!(
                        target: "health",
                        exchange = %exchange.exchange,
                        mode = %exchange.mode,
                        last_seen = ?exchange.last_seen,
                        "source is stale"
                    );
                }
            }
        }
        debug!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::model::{RateTick, TickSource};
    use crate::persist::testing::MemoryPersistence;
    use crate::source::SourceConfig;
    use crate::symbol::Symbol;
    use rust_decimal_macros::dec;

    fn tick(exchange: ExchangeId, at_secs: i64) -> RateTick {
        RateTick {
            exchange,
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            funding_rate: dec!(0.0001),
            funding_interval_hours: 8,
            next_funding_time: DateTime::from_timestamp(at_secs + 3600, 0).unwrap(),
            mark_price: None,
            index_price: None,
            source: TickSource::Ws,
            received_at: DateTime::from_timestamp(at_secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn report_flags_stale_sources() {
        let cache = Arc::new(RateCache::new(CacheConfig::default()));
        let manager = Arc::new(DataSourceManager::new(
            &[ExchangeId::Binance, ExchangeId::Okx],
            SourceConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let (persist, _writer) =
            crate::persist::spawn_writer(Arc::new(MemoryPersistence::default()), cancel.clone());

        cache.put(tick(ExchangeId::Binance, 0));
        cache.put(tick(ExchangeId::Okx, 80));

        let monitor = HealthMonitor::new(
            Arc::clone(&cache),
            Arc::clone(&manager),
            Arc::new(AtomicUsize::new(2)),
            Arc::new(AtomicUsize::new(1)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(3)),
            persist,
            Vec::new(),
            StdDuration::from_secs(30),
        );

        // Binance (30s threshold) is stale at t=100; OKX (90s) is not.
        let report = monitor.report(DateTime::from_timestamp(100, 0).unwrap());
        assert_eq!(report.active_opportunities, 2);
        assert_eq!(report.debounce_depth, 1);
        assert_eq!(report.dropped_events, 3);
        assert_eq!(report.exchanges.len(), 2);

        let by_exchange: std::collections::HashMap<_, _> = report
            .exchanges
            .iter()
            .map(|e| (e.exchange, e.stale))
            .collect();
        assert!(by_exchange[&ExchangeId::Binance]);
        assert!(!by_exchange[&ExchangeId::Okx]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn report_serialises_for_consumers() {
        let cache = Arc::new(RateCache::new(CacheConfig::default()));
        let manager = Arc::new(DataSourceManager::new(
            &[ExchangeId::Bingx],
            SourceConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let (persist, _writer) =
            crate::persist::spawn_writer(Arc::new(MemoryPersistence::default()), cancel.clone());

        let monitor = HealthMonitor::new(
            cache,
            manager,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            persist,
            Vec::new(),
            StdDuration::from_secs(30),
        );

        let report = monitor.report(Utc::now());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["exchanges"][0]["exchange"], "bingx");
        assert_eq!(json["exchanges"][0]["mode"], "rest");
        cancel.cancel();
    }
}
