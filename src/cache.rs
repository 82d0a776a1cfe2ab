use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::model::{ExchangeId, RateTick};
use crate::symbol::Symbol;

pub const DEFAULT_MAX_ENTRIES_PER_EXCHANGE: usize = 100;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries_per_exchange: usize,
    /// Per-exchange staleness thresholds in milliseconds.
    pub stale_ms: HashMap<ExchangeId, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries_per_exchange: DEFAULT_MAX_ENTRIES_PER_EXCHANGE,
            stale_ms: ExchangeId::ALL
                .into_iter()
                .map(|e| (e, e.default_stale_ms()))
                .collect(),
        }
    }
}

struct Entry {
    tick: RateTick,
    last_read: u64,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<Symbol, Entry>,
    last_seen: Option<DateTime<Utc>>,
}

/// Latest tick per `(exchange, symbol)`.
///
/// Writes for a key only ever move `received_at` forward; readers see either
/// the previous or the next coherent tick. Capacity is bounded per exchange
/// with least-recently-read eviction.
pub struct RateCache {
    shards: HashMap<ExchangeId, Mutex<Shard>>,
    read_seq: AtomicU64,
    cfg: CacheConfig,
}

impl RateCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            shards: ExchangeId::ALL
                .into_iter()
                .map(|e| (e, Mutex::new(Shard::default())))
                .collect(),
            read_seq: AtomicU64::new(0),
            cfg,
        }
    }

    fn next_seq(&self) -> u64 {
        self.read_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Store `tick` unless a newer tick for the key is already present.
    /// Returns `false` on an out-of-order (dropped) write.
    pub fn put(&self, tick: RateTick) -> bool {
        let mut shard = self.shards[&tick.exchange].lock();

        if let Some(existing) = shard.entries.get(&tick.symbol)
            && existing.tick.received_at > tick.received_at
        {
            return false;
        }

        shard.last_seen = Some(match shard.last_seen {
            Some(seen) => seen.max(tick.received_at),
            None => tick.received_at,
        });

        let seq = self.next_seq();
        let symbol = tick.symbol.clone();
        let previous = shard.entries.insert(
            symbol.clone(),
            Entry {
                tick,
                last_read: seq,
            },
        );
        if let (Some(prev), Some(entry)) = (previous, shard.entries.get_mut(&symbol)) {
            // Overwrites keep the key's read recency.
            entry.last_read = entry.last_read.max(prev.last_read);
        }

        if shard.entries.len() > self.cfg.max_entries_per_exchange {
            let victim = shard
                .entries
                .iter()
                .filter(|(key, _)| **key != symbol)
                .min_by_key(|(_, entry)| entry.last_read)
                .map(|(key, _)| key.clone());
            if let Some(victim) = victim {
                shard.entries.remove(&victim);
            }
        }

        true
    }

    pub fn get(&self, exchange: ExchangeId, symbol: &Symbol) -> Option<RateTick> {
        let seq = self.next_seq();
        let mut shard = self.shards[&exchange].lock();
        let entry = shard.entries.get_mut(symbol)?;
        entry.last_read = seq;
        Some(entry.tick.clone())
    }

    /// Latest tick for `symbol` on every exchange that has one, in stable
    /// exchange order.
    pub fn snapshot_symbol(&self, symbol: &Symbol) -> Vec<RateTick> {
        ExchangeId::ALL
            .into_iter()
            .filter_map(|exchange| self.get(exchange, symbol))
            .collect()
    }

    /// Most recent `received_at` across all symbols of `exchange`.
    pub fn last_seen(&self, exchange: ExchangeId) -> Option<DateTime<Utc>> {
        self.shards[&exchange].lock().last_seen
    }

    pub fn stale_threshold(&self, exchange: ExchangeId) -> Duration {
        let ms = self
            .cfg
            .stale_ms
            .get(&exchange)
            .copied()
            .unwrap_or_else(|| exchange.default_stale_ms());
        Duration::milliseconds(ms as i64)
    }

    /// Staleness is strict: a tick is stale once `now - received_at`
    /// exceeds the exchange threshold.
    pub fn is_fresh(&self, tick: &RateTick, now: DateTime<Utc>) -> bool {
        now - tick.received_at <= self.stale_threshold(tick.exchange)
    }

    pub fn is_source_stale(&self, exchange: ExchangeId, now: DateTime<Utc>) -> bool {
        match self.last_seen(exchange) {
            Some(seen) => now - seen > self.stale_threshold(exchange),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TickSource;
    use rust_decimal_macros::dec;

    fn tick(exchange: ExchangeId, symbol: &str, at_secs: i64) -> RateTick {
        RateTick {
            exchange,
            symbol: Symbol::parse(symbol).unwrap(),
            funding_rate: dec!(0.0001),
            funding_interval_hours: 8,
            next_funding_time: DateTime::from_timestamp(at_secs + 3600, 0).unwrap(),
            mark_price: Some(dec!(50000)),
            index_price: None,
            source: TickSource::Ws,
            received_at: DateTime::from_timestamp(at_secs, 0).unwrap(),
        }
    }

    #[test]
    fn put_keeps_newest_tick_per_key() {
        let cache = RateCache::new(CacheConfig::default());
        assert!(cache.put(tick(ExchangeId::Binance, "BTCUSDT", 100)));
        assert!(cache.put(tick(ExchangeId::Binance, "BTCUSDT", 200)));

        let stored = cache
            .get(ExchangeId::Binance, &Symbol::parse("BTCUSDT").unwrap())
            .unwrap();
        assert_eq!(stored.received_at.timestamp(), 200);
    }

    #[test]
    fn put_drops_out_of_order_tick() {
        let cache = RateCache::new(CacheConfig::default());
        assert!(cache.put(tick(ExchangeId::Okx, "BTCUSDT", 200)));
        assert!(!cache.put(tick(ExchangeId::Okx, "BTCUSDT", 100)));

        let stored = cache
            .get(ExchangeId::Okx, &Symbol::parse("BTCUSDT").unwrap())
            .unwrap();
        assert_eq!(stored.received_at.timestamp(), 200);
    }

    #[test]
    fn put_accepts_equal_timestamp_overwrite() {
        let cache = RateCache::new(CacheConfig::default());
        let mut first = tick(ExchangeId::Mexc, "ETHUSDT", 100);
        first.funding_rate = dec!(0.0001);
        let mut second = tick(ExchangeId::Mexc, "ETHUSDT", 100);
        second.funding_rate = dec!(0.0002);

        assert!(cache.put(first));
        assert!(cache.put(second));
        let stored = cache
            .get(ExchangeId::Mexc, &Symbol::parse("ETHUSDT").unwrap())
            .unwrap();
        assert_eq!(stored.funding_rate, dec!(0.0002));
    }

    #[test]
    fn snapshot_collects_all_exchanges_for_symbol() {
        let cache = RateCache::new(CacheConfig::default());
        cache.put(tick(ExchangeId::Binance, "BTCUSDT", 100));
        cache.put(tick(ExchangeId::Okx, "BTCUSDT", 110));
        cache.put(tick(ExchangeId::Okx, "ETHUSDT", 120));

        let snapshot = cache.snapshot_symbol(&Symbol::parse("BTCUSDT").unwrap());
        let exchanges: Vec<_> = snapshot.iter().map(|t| t.exchange).collect();
        assert_eq!(exchanges, vec![ExchangeId::Binance, ExchangeId::Okx]);
    }

    #[test]
    fn last_seen_tracks_exchange_maximum() {
        let cache = RateCache::new(CacheConfig::default());
        cache.put(tick(ExchangeId::Gateio, "BTCUSDT", 100));
        cache.put(tick(ExchangeId::Gateio, "ETHUSDT", 250));
        cache.put(tick(ExchangeId::Gateio, "SOLUSDT", 180));

        assert_eq!(
            cache.last_seen(ExchangeId::Gateio).unwrap().timestamp(),
            250
        );
        assert_eq!(cache.last_seen(ExchangeId::Bingx), None);
    }

    #[test]
    fn staleness_boundary_is_strict() {
        let cache = RateCache::new(CacheConfig::default());
        let t = tick(ExchangeId::Binance, "BTCUSDT", 0);
        cache.put(t.clone());

        // Threshold for binance is 30s: exactly 30s old is still fresh.
        let at_threshold = DateTime::from_timestamp(30, 0).unwrap();
        let past_threshold = DateTime::from_timestamp(31, 0).unwrap();
        assert!(cache.is_fresh(&t, at_threshold));
        assert!(!cache.is_fresh(&t, past_threshold));
        assert!(!cache.is_source_stale(ExchangeId::Binance, at_threshold));
        assert!(cache.is_source_stale(ExchangeId::Binance, past_threshold));
    }

    #[test]
    fn eviction_removes_least_recently_read() {
        let cfg = CacheConfig {
            max_entries_per_exchange: 2,
            ..CacheConfig::default()
        };
        let cache = RateCache::new(cfg);
        cache.put(tick(ExchangeId::Binance, "BTCUSDT", 100));
        cache.put(tick(ExchangeId::Binance, "ETHUSDT", 101));

        // Touch BTC so ETH becomes the LRU entry.
        cache.get(ExchangeId::Binance, &Symbol::parse("BTCUSDT").unwrap());
        cache.put(tick(ExchangeId::Binance, "SOLUSDT", 102));

        assert!(
            cache
                .get(ExchangeId::Binance, &Symbol::parse("BTCUSDT").unwrap())
                .is_some()
        );
        assert!(
            cache
                .get(ExchangeId::Binance, &Symbol::parse("ETHUSDT").unwrap())
                .is_none()
        );
        assert!(
            cache
                .get(ExchangeId::Binance, &Symbol::parse("SOLUSDT").unwrap())
                .is_some()
        );
    }

    #[test]
    fn stale_entries_are_retained_until_overwritten() {
        let cache = RateCache::new(CacheConfig::default());
        cache.put(tick(ExchangeId::Okx, "BTCUSDT", 0));

        let much_later = DateTime::from_timestamp(10_000, 0).unwrap();
        let stored = cache
            .get(ExchangeId::Okx, &Symbol::parse("BTCUSDT").unwrap())
            .unwrap();
        assert!(!cache.is_fresh(&stored, much_later));
        assert_eq!(stored.received_at.timestamp(), 0);
    }
}
