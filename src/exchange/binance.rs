use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::exchange::ws::{self, BackoffPolicy, SessionEnd};
use crate::exchange::{Exchange, IntervalBook, SubscriptionSet};
use crate::model::{
    ConnectivityEvent, ExchangeId, LinkState, RateTick, TickSource, Transport,
    next_funding_boundary,
};
use crate::symbol::{Symbol, exchange_form, from_exchange_form};

const BINANCE_BASE_URL: &str = "https://fapi.binance.com";
const BINANCE_WS_BASE: &str = "wss://fstream.binance.com/stream";
// Reconnect before the 24-hour auto-disconnect (23 hours)
const WS_RECONNECT_SECS: u64 = 23 * 60 * 60;
/// premiumIndex weight is low; stay well under the 2400 weight/min limit.
const BINANCE_REQUESTS_PER_SECOND: u32 = 10;

pub struct BinanceExchange {
    client: reqwest::Client,
    rate_limiter: DefaultDirectRateLimiter,
    subs: SubscriptionSet,
    intervals: IntervalBook,
}

impl BinanceExchange {
    pub fn new() -> Self {
        let quota = Quota::per_second(nonzero!(BINANCE_REQUESTS_PER_SECOND));
        Self {
            client: reqwest::Client::new(),
            rate_limiter: RateLimiter::direct(quota),
            subs: SubscriptionSet::new(),
            intervals: IntervalBook::new(),
        }
    }

    async fn funding_ws_session(
        &self,
        tx: &mpsc::Sender<RateTick>,
        events: &mpsc::Sender<ConnectivityEvent>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, Report<ExchangeError>> {
        let symbols = self.subs.ws_symbols();
        if symbols.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                _ = self.subs.changed() => {
                    return Ok(SessionEnd::Disconnected { delivered_frames: true });
                }
            }
        }

        let streams: Vec<String> = symbols
            .iter()
            .map(|s| {
                format!(
                    "{}@markPrice",
                    exchange_form(s, ExchangeId::Binance).to_lowercase()
                )
            })
            .collect();
        let ws_url = format!("{}?streams={}", BINANCE_WS_BASE, streams.join("/"));

        let (ws_stream, _) =
            connect_async(&ws_url)
                .await
                .change_context(ExchangeError::Connection {
                    exchange: "binance".into(),
                })?;
        let (mut write, mut read) = ws_stream.split();

        let _ = events
            .send(ConnectivityEvent {
                exchange: ExchangeId::Binance,
                transport: Transport::Ws,
                state: LinkState::Up,
                reason: "connected".into(),
            })
            .await;
        info!(symbols = symbols.len(), "binance funding ws connected");

        // Reconnect after 23h to stay ahead of Binance's 24h auto-disconnect
        let reconnect_timer = sleep(Duration::from_secs(WS_RECONNECT_SECS));
        tokio::pin!(reconnect_timer);
        let mut idle_check = tokio::time::interval(ws::IDLE_CHECK_INTERVAL);
        let mut last_frame = Instant::now();
        let mut delivered = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("binance funding ws cancelled");
                    return Ok(SessionEnd::Cancelled);
                }
                _ = &mut reconnect_timer => {
                    info!("binance funding ws 23h limit reached, reconnecting");
                    return Ok(SessionEnd::Disconnected { delivered_frames: delivered });
                }
                _ = self.subs.changed() => {
                    info!("binance subscription set changed, reconnecting");
                    return Ok(SessionEnd::Disconnected { delivered_frames: true });
                }
                _ = idle_check.tick() => {
                    if last_frame.elapsed() > ws::DEFAULT_IDLE_TIMEOUT {
                        warn!("binance funding ws idle, forcing reconnect");
                        return Ok(SessionEnd::Disconnected { delivered_frames: delivered });
                    }
                }
                msg = read.next() => {
                    match msg {
                        None => return Ok(SessionEnd::Disconnected { delivered_frames: delivered }),
                        Some(Err(e)) => {
                            return Err(Report::new(e).change_context(ExchangeError::Connection {
                                exchange: "binance".into(),
                            }));
                        }
                        Some(Ok(Message::Text(text))) => {
                            last_frame = Instant::now();
                            match serde_json::from_str::<BinanceCombinedMsg<BinanceMarkPriceEvent>>(&text) {
                                Ok(combined) => {
                                    if let Some(tick) = combined.data.into_tick(&self.intervals) {
                                        delivered = true;
                                        let _ = tx.send(tick).await;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "binance funding frame parse error");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            // Server pings every ~3 min; pong keeps the stream alive
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }
}

impl Default for BinanceExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange for BinanceExchange {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn subscriptions(&self) -> &SubscriptionSet {
        &self.subs
    }

    fn intervals(&self) -> &IntervalBook {
        &self.intervals
    }

    fn fetch_funding(
        &self,
        symbols: &[Symbol],
    ) -> BoxFuture<'_, Result<Vec<RateTick>, Report<ExchangeError>>> {
        let symbols = symbols.to_vec();
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/fapi/v1/premiumIndex", BINANCE_BASE_URL);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if response.status().as_u16() == 429 {
                let retry_after = retry_after_secs(&response);
                return Err(Report::new(ExchangeError::RateLimited {
                    exchange: "binance".into(),
                    retry_after_secs: retry_after,
                }));
            }
            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<BinancePremiumIndex> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            let received_at = Utc::now();
            let mut by_symbol: HashMap<Symbol, BinancePremiumIndex> = raw
                .into_iter()
                .filter_map(|row| {
                    from_exchange_form(&row.symbol, ExchangeId::Binance)
                        .ok()
                        .map(|s| (s, row))
                })
                .collect();

            let mut ticks = Vec::with_capacity(symbols.len());
            for symbol in &symbols {
                match by_symbol.remove(symbol) {
                    Some(row) => {
                        if let Some(tick) = row.into_tick(symbol.clone(), &self.intervals, received_at) {
                            ticks.push(tick);
                        }
                    }
                    None => {
                        debug!(symbol = %symbol, "binance does not list market, marking unsupported");
                        self.subs.mark_unsupported(symbol);
                    }
                }
            }
            Ok(ticks)
        })
    }

    fn fetch_funding_intervals(
        &self,
    ) -> BoxFuture<'_, Result<HashMap<Symbol, u32>, Report<ExchangeError>>> {
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/fapi/v1/fundingInfo", BINANCE_BASE_URL);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<BinanceFundingInfo> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            // fundingInfo only lists markets that deviate from the 8h default
            Ok(raw
                .into_iter()
                .filter_map(|row| {
                    from_exchange_form(&row.symbol, ExchangeId::Binance)
                        .ok()
                        .map(|s| (s, row.funding_interval_hours))
                })
                .collect())
        })
    }

    fn run_funding_ws(
        &self,
        tx: mpsc::Sender<RateTick>,
        events: mpsc::Sender<ConnectivityEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
        Box::pin(async move {
            let policy = BackoffPolicy::ws_default();
            let mut attempt = 0u32;

            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let reason = match self.funding_ws_session(&tx, &events, &cancel).await {
                    Ok(SessionEnd::Cancelled) => break,
                    Ok(SessionEnd::Disconnected { delivered_frames }) => {
                        if delivered_frames {
                            attempt = 0;
                        }
                        "disconnected".to_owned()
                    }
                    Err(e) => {
                        warn!(error = %e, "binance funding ws failed");
                        format!("{e}")
                    }
                };

                let _ = events
                    .send(ConnectivityEvent {
                        exchange: ExchangeId::Binance,
                        transport: Transport::Ws,
                        state: LinkState::Down,
                        reason,
                    })
                    .await;

                let delay = policy.delay(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
            Ok(())
        })
    }
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BinancePremiumIndex {
    symbol: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "indexPrice")]
    index_price: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
}

impl BinancePremiumIndex {
    fn into_tick(
        self,
        symbol: Symbol,
        intervals: &IntervalBook,
        received_at: DateTime<Utc>,
    ) -> Option<RateTick> {
        let funding_rate: Decimal = match self.last_funding_rate.parse() {
            Ok(rate) => rate,
            Err(_) => {
                warn!(symbol = %symbol, raw = %self.last_funding_rate, "binance funding rate parse error");
                return None;
            }
        };
        let interval_hours = intervals.hours(&symbol);
        let next_funding_time = DateTime::from_timestamp_millis(self.next_funding_time)
            .filter(|t| t.timestamp() > 0)
            .unwrap_or_else(|| next_funding_boundary(received_at, interval_hours));

        Some(RateTick {
            exchange: ExchangeId::Binance,
            symbol,
            funding_rate,
            funding_interval_hours: interval_hours,
            next_funding_time,
            mark_price: self.mark_price.parse().ok(),
            index_price: self.index_price.parse().ok(),
            source: TickSource::Rest,
            received_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BinanceFundingInfo {
    symbol: String,
    #[serde(rename = "fundingIntervalHours")]
    funding_interval_hours: u32,
}

// ── WebSocket message types ───────────────────────────────────────────────────

/// Combined stream wrapper: `{ "stream": "...", "data": { ... } }`
#[derive(Debug, Deserialize)]
struct BinanceCombinedMsg<T> {
    data: T,
}

/// `markPriceUpdate` event: funding rate, mark and index in one frame.
#[derive(Debug, Deserialize)]
struct BinanceMarkPriceEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: String,
    #[serde(rename = "i")]
    index_price: String,
    #[serde(rename = "r")]
    funding_rate: String,
    /// Next funding time (ms epoch)
    #[serde(rename = "T")]
    next_funding_time: i64,
}

impl BinanceMarkPriceEvent {
    fn into_tick(self, intervals: &IntervalBook) -> Option<RateTick> {
        let symbol = from_exchange_form(&self.symbol, ExchangeId::Binance).ok()?;
        let funding_rate: Decimal = self.funding_rate.parse().ok()?;
        let received_at = Utc::now();
        let interval_hours = intervals.hours(&symbol);
        let next_funding_time = DateTime::from_timestamp_millis(self.next_funding_time)
            .filter(|t| t.timestamp() > 0)
            .unwrap_or_else(|| next_funding_boundary(received_at, interval_hours));

        Some(RateTick {
            exchange: ExchangeId::Binance,
            symbol,
            funding_rate,
            funding_interval_hours: interval_hours,
            next_funding_time,
            mark_price: self.mark_price.parse().ok(),
            index_price: self.index_price.parse().ok(),
            source: TickSource::Ws,
            received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn mark_price_event_parses_into_tick() {
        let raw = r#"{
            "stream": "btcusdt@markPrice",
            "data": {
                "e": "markPriceUpdate",
                "E": 1704067200000,
                "s": "BTCUSDT",
                "p": "42001.50",
                "i": "41999.80",
                "P": "42000.00",
                "r": "0.00030000",
                "T": 1704096000000
            }
        }"#;
        let combined: BinanceCombinedMsg<BinanceMarkPriceEvent> =
            serde_json::from_str(raw).unwrap();
        let tick = combined.data.into_tick(&IntervalBook::new()).unwrap();

        assert_eq!(tick.exchange, ExchangeId::Binance);
        assert_eq!(tick.symbol.as_str(), "BTCUSDT");
        assert_eq!(tick.funding_rate, dec!(0.00030000));
        assert_eq!(tick.mark_price, Some(dec!(42001.50)));
        assert_eq!(tick.index_price, Some(dec!(41999.80)));
        assert_eq!(tick.funding_interval_hours, 8);
        assert_eq!(tick.next_funding_time.timestamp(), 1_704_096_000);
        assert_eq!(tick.source, TickSource::Ws);
    }

    #[test]
    fn mark_price_event_with_bad_rate_is_skipped() {
        let event = BinanceMarkPriceEvent {
            symbol: "BTCUSDT".into(),
            mark_price: "42000".into(),
            index_price: "42000".into(),
            funding_rate: "not-a-number".into(),
            next_funding_time: 1_704_096_000_000,
        };
        assert!(event.into_tick(&IntervalBook::new()).is_none());
    }

    #[test]
    fn mark_price_event_with_foreign_symbol_is_skipped() {
        let event = BinanceMarkPriceEvent {
            symbol: "BTCUSDT_240628".into(),
            mark_price: "42000".into(),
            index_price: "42000".into(),
            funding_rate: "0.0001".into(),
            next_funding_time: 1_704_096_000_000,
        };
        assert!(event.into_tick(&IntervalBook::new()).is_none());
    }

    #[test]
    fn premium_index_row_uses_interval_book() {
        let book = IntervalBook::new();
        book.replace(
            [(Symbol::parse("BTCUSDT").unwrap(), 4)].into_iter().collect(),
            Utc::now(),
        );
        let row = BinancePremiumIndex {
            symbol: "BTCUSDT".into(),
            mark_price: "42000.0".into(),
            index_price: "41990.0".into(),
            last_funding_rate: "0.0001".into(),
            next_funding_time: 1_704_096_000_000,
        };
        let tick = row
            .into_tick(Symbol::parse("BTCUSDT").unwrap(), &book, Utc::now())
            .unwrap();
        assert_eq!(tick.funding_interval_hours, 4);
        assert_eq!(tick.source, TickSource::Rest);
    }

    #[test]
    fn premium_index_zero_next_funding_falls_back_to_boundary() {
        let received_at = DateTime::from_timestamp(1_704_105_000, 0).unwrap();
        let row = BinancePremiumIndex {
            symbol: "BTCUSDT".into(),
            mark_price: "42000.0".into(),
            index_price: "41990.0".into(),
            last_funding_rate: "0.0001".into(),
            next_funding_time: 0,
        };
        let tick = row
            .into_tick(
                Symbol::parse("BTCUSDT").unwrap(),
                &IntervalBook::new(),
                received_at,
            )
            .unwrap();
        assert_eq!(tick.next_funding_time.timestamp() % (8 * 3600), 0);
        assert!(tick.next_funding_time > received_at);
    }

    /// Integration test: requires network access. Run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn integration_fetch_funding() {
        let exchange = BinanceExchange::new();
        let symbols = vec![Symbol::parse("BTCUSDT").unwrap()];
        let ticks = exchange.fetch_funding(&symbols).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].exchange, ExchangeId::Binance);
    }
}
