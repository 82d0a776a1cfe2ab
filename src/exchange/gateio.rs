use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
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

const GATEIO_BASE_URL: &str = "https://api.gateio.ws";
const GATEIO_WS_URL: &str = "wss://fx-ws.gateio.ws/v4/ws/usdt";
const WS_PING_INTERVAL_SECS: u64 = 15;
const GATEIO_REQUESTS_PER_SECOND: u32 = 10;

pub struct GateioExchange {
    client: reqwest::Client,
    rate_limiter: DefaultDirectRateLimiter,
    subs: SubscriptionSet,
    intervals: IntervalBook,
}

impl GateioExchange {
    pub fn new() -> Self {
        let quota = Quota::per_second(nonzero!(GATEIO_REQUESTS_PER_SECOND));
        Self {
            client: reqwest::Client::new(),
            rate_limiter: RateLimiter::direct(quota),
            subs: SubscriptionSet::new(),
            intervals: IntervalBook::new(),
        }
    }

    /// One call returns every USDT perpetual contract.
    async fn fetch_contracts(&self) -> Result<Vec<GateioContract>, Report<ExchangeError>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/api/v4/futures/usdt/contracts", GATEIO_BASE_URL);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .change_context(ExchangeError::Request {
                exchange: "gateio".into(),
            })?;

        if response.status().as_u16() == 429 {
            return Err(Report::new(ExchangeError::RateLimited {
                exchange: "gateio".into(),
                retry_after_secs: None,
            }));
        }
        if !response.status().is_success() {
            return Err(Report::new(ExchangeError::Request {
                exchange: "gateio".into(),
            })
            .attach(format!("HTTP status: {}", response.status())));
        }

        response
            .json()
            .await
            .change_context(ExchangeError::ResponseParse {
                exchange: "gateio".into(),
            })
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

        let (ws_stream, _) =
            connect_async(GATEIO_WS_URL)
                .await
                .change_context(ExchangeError::Connection {
                    exchange: "gateio".into(),
                })?;
        let (mut write, mut read) = ws_stream.split();

        let contracts: Vec<String> = symbols
            .iter()
            .map(|s| exchange_form(s, ExchangeId::Gateio))
            .collect();
        let subscribe_msg = json!({
            "time": Utc::now().timestamp(),
            "channel": "futures.tickers",
            "event": "subscribe",
            "payload": contracts,
        })
        .to_string();
        write
            .send(Message::Text(subscribe_msg.into()))
            .await
            .change_context(ExchangeError::Connection {
                exchange: "gateio".into(),
            })?;

        let _ = events
            .send(ConnectivityEvent {
                exchange: ExchangeId::Gateio,
                transport: Transport::Ws,
                state: LinkState::Up,
                reason: "connected".into(),
            })
            .await;
        info!(symbols = symbols.len(), "gateio ticker ws subscribed");

        let mut ping_timer =
            tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_timer.reset();
        let mut idle_check = tokio::time::interval(ws::IDLE_CHECK_INTERVAL);
        let mut last_frame = Instant::now();
        let mut delivered = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("gateio ticker ws cancelled");
                    return Ok(SessionEnd::Cancelled);
                }
                _ = self.subs.changed() => {
                    info!("gateio subscription set changed, reconnecting");
                    return Ok(SessionEnd::Disconnected { delivered_frames: true });
                }
                _ = ping_timer.tick() => {
                    let ping = json!({
                        "time": Utc::now().timestamp(),
                        "channel": "futures.ping",
                    })
                    .to_string();
                    let _ = write.send(Message::Text(ping.into())).await;
                }
                _ = idle_check.tick() => {
                    if last_frame.elapsed() > ws::DEFAULT_IDLE_TIMEOUT {
                        warn!("gateio ticker ws idle, forcing reconnect");
                        return Ok(SessionEnd::Disconnected { delivered_frames: delivered });
                    }
                }
                msg = read.next() => {
                    match msg {
                        None => return Ok(SessionEnd::Disconnected { delivered_frames: delivered }),
                        Some(Err(e)) => {
                            return Err(Report::new(e).change_context(ExchangeError::Connection {
                                exchange: "gateio".into(),
                            }));
                        }
                        Some(Ok(Message::Text(text))) => {
                            last_frame = Instant::now();
                            match serde_json::from_str::<GateioWsFrame>(&text) {
                                Ok(frame) => {
                                    for tick in frame.into_ticks(&self.intervals) {
                                        delivered = true;
                                        let _ = tx.send(tick).await;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, raw = %text, "gateio frame parse error");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }
}

impl Default for GateioExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange for GateioExchange {
    fn id(&self) -> ExchangeId {
        ExchangeId::Gateio
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
            let contracts = self.fetch_contracts().await?;
            let received_at = Utc::now();

            let mut by_symbol: HashMap<Symbol, GateioContract> = contracts
                .into_iter()
                .filter_map(|c| {
                    from_exchange_form(&c.name, ExchangeId::Gateio)
                        .ok()
                        .map(|s| (s, c))
                })
                .collect();

            let mut ticks = Vec::with_capacity(symbols.len());
            for symbol in &symbols {
                match by_symbol.remove(symbol) {
                    Some(contract) => {
                        if let Some(tick) =
                            contract.into_tick(symbol.clone(), &self.intervals, received_at)
                        {
                            ticks.push(tick);
                        }
                    }
                    None => {
                        debug!(symbol = %symbol, "gateio does not list contract, marking unsupported");
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
            let contracts = self.fetch_contracts().await?;
            let mut intervals = HashMap::new();
            let mut listed: HashSet<Symbol> = HashSet::new();

            for contract in contracts {
                let Some(symbol) = from_exchange_form(&contract.name, ExchangeId::Gateio).ok()
                else {
                    continue;
                };
                listed.insert(symbol.clone());
                let hours = contract.funding_interval / 3600;
                if (1..=24).contains(&hours) {
                    intervals.insert(symbol, hours);
                }
            }

            // The contract list is complete, so absence means unlisted.
            for symbol in self.subs.pollable_symbols() {
                if !listed.contains(&symbol) {
                    debug!(symbol = %symbol, "gateio does not list contract, marking unsupported");
                    self.subs.mark_unsupported(&symbol);
                }
            }

            Ok(intervals)
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
                        warn!(error = %e, "gateio ticker ws failed");
                        format!("{e}")
                    }
                };

                let _ = events
                    .send(ConnectivityEvent {
                        exchange: ExchangeId::Gateio,
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

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GateioContract {
    name: String,
    #[serde(default)]
    funding_rate: Option<String>,
    /// Funding interval in seconds
    #[serde(default)]
    funding_interval: u32,
    /// Next funding apply time (s epoch)
    #[serde(default)]
    funding_next_apply: i64,
    #[serde(default)]
    mark_price: Option<String>,
    #[serde(default)]
    index_price: Option<String>,
}

impl GateioContract {
    fn into_tick(
        self,
        symbol: Symbol,
        intervals: &IntervalBook,
        received_at: DateTime<Utc>,
    ) -> Option<RateTick> {
        let funding_rate: Decimal = match self.funding_rate.as_deref().map(str::parse) {
            Some(Ok(rate)) => rate,
            _ => {
                warn!(symbol = %symbol, "gateio funding rate missing or unparsable");
                return None;
            }
        };
        let interval_hours = {
            let hours = self.funding_interval / 3600;
            if (1..=24).contains(&hours) {
                hours
            } else {
                intervals.hours(&symbol)
            }
        };
        let next_funding_time = DateTime::from_timestamp(self.funding_next_apply, 0)
            .filter(|t| t.timestamp() > 0)
            .unwrap_or_else(|| next_funding_boundary(received_at, interval_hours));

        Some(RateTick {
            exchange: ExchangeId::Gateio,
            symbol,
            funding_rate,
            funding_interval_hours: interval_hours,
            next_funding_time,
            mark_price: self.mark_price.as_deref().and_then(|p| p.parse().ok()),
            index_price: self.index_price.as_deref().and_then(|p| p.parse().ok()),
            source: TickSource::Rest,
            received_at,
        })
    }
}

// ── WebSocket message types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GateioWsFrame {
    channel: String,
    event: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GateioTicker {
    contract: String,
    #[serde(default)]
    funding_rate: Option<String>,
    #[serde(default)]
    mark_price: Option<String>,
    #[serde(default)]
    index_price: Option<String>,
}

impl GateioWsFrame {
    fn into_ticks(self, intervals: &IntervalBook) -> Vec<RateTick> {
        if self.channel != "futures.tickers" || self.event != "update" {
            return Vec::new();
        }
        let Some(result) = self.result else {
            return Vec::new();
        };
        let rows: Vec<GateioTicker> = match serde_json::from_value(result) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "gateio ticker payload parse error");
                return Vec::new();
            }
        };

        let received_at = Utc::now();
        rows.into_iter()
            .filter_map(|row| row.into_tick(intervals, received_at))
            .collect()
    }
}

impl GateioTicker {
    fn into_tick(self, intervals: &IntervalBook, received_at: DateTime<Utc>) -> Option<RateTick> {
        let symbol = from_exchange_form(&self.contract, ExchangeId::Gateio).ok()?;
        let funding_rate: Decimal = self.funding_rate.as_deref()?.parse().ok()?;
        let interval_hours = intervals.hours(&symbol);

        Some(RateTick {
            exchange: ExchangeId::Gateio,
            symbol,
            funding_rate,
            funding_interval_hours: interval_hours,
            // The ticker stream omits the apply time; use the interval grid.
            next_funding_time: next_funding_boundary(received_at, interval_hours),
            mark_price: self.mark_price.as_deref().and_then(|p| p.parse().ok()),
            index_price: self.index_price.as_deref().and_then(|p| p.parse().ok()),
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
    fn ticker_update_frame_yields_ticks() {
        let raw = r#"{
            "time": 1704067200,
            "channel": "futures.tickers",
            "event": "update",
            "result": [{
                "contract": "BTC_USDT",
                "last": "42000.5",
                "funding_rate": "0.000053",
                "funding_rate_indicative": "0.00006",
                "mark_price": "42001.2",
                "index_price": "41999.9"
            }]
        }"#;
        let frame: GateioWsFrame = serde_json::from_str(raw).unwrap();
        let ticks = frame.into_ticks(&IntervalBook::new());

        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol.as_str(), "BTCUSDT");
        assert_eq!(ticks[0].funding_rate, dec!(0.000053));
        assert_eq!(ticks[0].mark_price, Some(dec!(42001.2)));
        assert_eq!(ticks[0].source, TickSource::Ws);
    }

    #[test]
    fn subscribe_ack_yields_no_ticks() {
        let raw = r#"{
            "time": 1704067200,
            "channel": "futures.tickers",
            "event": "subscribe",
            "result": {"status": "success"}
        }"#;
        let frame: GateioWsFrame = serde_json::from_str(raw).unwrap();
        assert!(frame.into_ticks(&IntervalBook::new()).is_empty());
    }

    #[test]
    fn ticker_without_funding_rate_is_skipped() {
        let ticker = GateioTicker {
            contract: "BTC_USDT".into(),
            funding_rate: None,
            mark_price: Some("42000".into()),
            index_price: None,
        };
        assert!(ticker.into_tick(&IntervalBook::new(), Utc::now()).is_none());
    }

    #[test]
    fn contract_interval_seconds_convert_to_hours() {
        let contract = GateioContract {
            name: "BTC_USDT".into(),
            funding_rate: Some("0.0001".into()),
            funding_interval: 14_400,
            funding_next_apply: 1_704_096_000,
            mark_price: Some("42000".into()),
            index_price: Some("41999".into()),
        };
        let tick = contract
            .into_tick(
                Symbol::parse("BTCUSDT").unwrap(),
                &IntervalBook::new(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(tick.funding_interval_hours, 4);
        assert_eq!(tick.next_funding_time.timestamp(), 1_704_096_000);
    }

    /// Integration test: requires network access. Run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn integration_fetch_funding() {
        let exchange = GateioExchange::new();
        let symbols = vec![Symbol::parse("BTCUSDT").unwrap()];
        let ticks = exchange.fetch_funding(&symbols).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].exchange, ExchangeId::Gateio);
    }
}
