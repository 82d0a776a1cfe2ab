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
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::exchange::ws::{self, BackoffPolicy, MARK_HOLD_MS, SessionEnd};
use crate::exchange::{Exchange, IntervalBook, MarkMerge, PendingFunding, SubscriptionSet};
use crate::model::{
    ConnectivityEvent, ExchangeId, LinkState, RateTick, TickSource, Transport,
    next_funding_boundary,
};
use crate::symbol::{Symbol, exchange_form, from_exchange_form};

const MEXC_BASE_URL: &str = "https://contract.mexc.com";
const MEXC_WS_URL: &str = "wss://contract.mexc.com/edge";
/// MEXC drops connections without a ping inside 60 s.
const WS_PING_INTERVAL_SECS: u64 = 15;
const MEXC_REQUESTS_PER_SECOND: u32 = 5;

pub struct MexcExchange {
    client: reqwest::Client,
    rate_limiter: DefaultDirectRateLimiter,
    subs: SubscriptionSet,
    intervals: IntervalBook,
}

impl MexcExchange {
    pub fn new() -> Self {
        let quota = Quota::per_second(nonzero!(MEXC_REQUESTS_PER_SECOND));
        Self {
            client: reqwest::Client::new(),
            rate_limiter: RateLimiter::direct(quota),
            subs: SubscriptionSet::new(),
            intervals: IntervalBook::new(),
        }
    }

    async fn fetch_funding_one(
        &self,
        symbol: &Symbol,
    ) -> Result<Option<RateTick>, Report<ExchangeError>> {
        self.rate_limiter.until_ready().await;

        let native = exchange_form(symbol, ExchangeId::Mexc);
        let url = format!("{}/api/v1/contract/funding_rate/{}", MEXC_BASE_URL, native);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .change_context(ExchangeError::Request {
                exchange: "mexc".into(),
            })?;

        if response.status().as_u16() == 429 {
            return Err(Report::new(ExchangeError::RateLimited {
                exchange: "mexc".into(),
                retry_after_secs: None,
            }));
        }
        if !response.status().is_success() {
            return Err(Report::new(ExchangeError::Request {
                exchange: "mexc".into(),
            })
            .attach(format!("HTTP status: {}", response.status())));
        }

        let envelope: MexcEnvelope<MexcFundingData> =
            response
                .json()
                .await
                .change_context(ExchangeError::ResponseParse {
                    exchange: "mexc".into(),
                })?;

        if !envelope.success {
            debug!(symbol = %symbol, code = envelope.code,
                "mexc does not list contract, marking unsupported");
            self.subs.mark_unsupported(symbol);
            return Ok(None);
        }

        let received_at = Utc::now();
        Ok(envelope
            .data
            .map(|data| data.into_tick(symbol.clone(), received_at)))
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
            connect_async(MEXC_WS_URL)
                .await
                .change_context(ExchangeError::Connection {
                    exchange: "mexc".into(),
                })?;
        let (mut write, mut read) = ws_stream.split();

        // Funding pushes carry no mark price; the ticker stream supplies it.
        for symbol in &symbols {
            let native = exchange_form(symbol, ExchangeId::Mexc);
            for method in ["sub.funding.rate", "sub.ticker"] {
                let frame = json!({"method": method, "param": {"symbol": native}}).to_string();
                write
                    .send(Message::Text(frame.into()))
                    .await
                    .change_context(ExchangeError::Connection {
                        exchange: "mexc".into(),
                    })?;
            }
        }

        let _ = events
            .send(ConnectivityEvent {
                exchange: ExchangeId::Mexc,
                transport: Transport::Ws,
                state: LinkState::Up,
                reason: "connected".into(),
            })
            .await;
        info!(symbols = symbols.len(), "mexc funding ws subscribed");

        let mut merge = MarkMerge::new(MARK_HOLD_MS);
        let mut ping_timer =
            tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_timer.reset();
        let mut flush_timer = tokio::time::interval(Duration::from_secs(1));
        let mut idle_check = tokio::time::interval(ws::IDLE_CHECK_INTERVAL);
        let mut last_frame = Instant::now();
        let mut delivered = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("mexc funding ws cancelled");
                    return Ok(SessionEnd::Cancelled);
                }
                _ = self.subs.changed() => {
                    info!("mexc subscription set changed, reconnecting");
                    return Ok(SessionEnd::Disconnected { delivered_frames: true });
                }
                _ = ping_timer.tick() => {
                    let _ = write
                        .send(Message::Text(json!({"method": "ping"}).to_string().into()))
                        .await;
                }
                _ = flush_timer.tick() => {
                    for (symbol, pending) in merge.flush_expired(Utc::now()) {
                        delivered = true;
                        let _ = tx.send(markless_tick(symbol, pending)).await;
                    }
                }
                _ = idle_check.tick() => {
                    if last_frame.elapsed() > ws::DEFAULT_IDLE_TIMEOUT {
                        warn!("mexc funding ws idle, forcing reconnect");
                        return Ok(SessionEnd::Disconnected { delivered_frames: delivered });
                    }
                }
                msg = read.next() => {
                    match msg {
                        None => return Ok(SessionEnd::Disconnected { delivered_frames: delivered }),
                        Some(Err(e)) => {
                            return Err(Report::new(e).change_context(ExchangeError::Connection {
                                exchange: "mexc".into(),
                            }));
                        }
                        Some(Ok(Message::Text(text))) => {
                            last_frame = Instant::now();
                            self.handle_frame(&text, &mut merge, tx, &mut delivered).await;
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

    async fn handle_frame(
        &self,
        text: &str,
        merge: &mut MarkMerge,
        tx: &mpsc::Sender<RateTick>,
        delivered: &mut bool,
    ) {
        let frame: MexcWsFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, raw = %text, "mexc frame parse error");
                return;
            }
        };

        match frame.channel.as_deref() {
            Some("push.funding.rate") => {
                let Some(data) = frame.data else { return };
                let push: MexcFundingPush = match serde_json::from_value(data) {
                    Ok(push) => push,
                    Err(e) => {
                        warn!(error = %e, "mexc funding push parse error");
                        return;
                    }
                };
                let Some(symbol) = from_exchange_form(&push.symbol, ExchangeId::Mexc).ok()
                else {
                    return;
                };
                let now = Utc::now();
                let interval_hours = self.intervals.hours(&symbol);
                let pending = PendingFunding {
                    funding_rate: push.funding_rate,
                    funding_interval_hours: interval_hours,
                    next_funding_time: push
                        .next_settle_time
                        .and_then(DateTime::from_timestamp_millis)
                        .unwrap_or_else(|| next_funding_boundary(now, interval_hours)),
                    queued_at: now,
                };
                if let Some((mark, index)) = merge.on_funding(symbol.clone(), pending.clone()) {
                    *delivered = true;
                    let _ = tx
                        .send(merged_tick(symbol, pending, Some(mark), index))
                        .await;
                }
            }
            Some("push.ticker") => {
                let Some(data) = frame.data else { return };
                let push: MexcTickerPush = match serde_json::from_value(data) {
                    Ok(push) => push,
                    Err(e) => {
                        warn!(error = %e, "mexc ticker push parse error");
                        return;
                    }
                };
                let Some(symbol) = from_exchange_form(&push.symbol, ExchangeId::Mexc).ok()
                else {
                    return;
                };
                let Some(mark) = push.fair_price else { return };
                if let Some((symbol, pending, mark, index)) =
                    merge.on_mark(&symbol, mark, push.index_price)
                {
                    *delivered = true;
                    let _ = tx
                        .send(merged_tick(symbol, pending, Some(mark), index))
                        .await;
                }
            }
            Some("rs.error") => {
                let detail = frame
                    .data
                    .as_ref()
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_owned();
                let rejected = self
                    .subs
                    .ws_symbols()
                    .into_iter()
                    .find(|s| detail.contains(&exchange_form(s, ExchangeId::Mexc)));
                match rejected {
                    Some(symbol) => {
                        warn!(symbol = %symbol, detail = %detail,
                            "mexc rejected subscription, routing symbol to REST");
                        self.subs.mark_ws_unsupported(&symbol);
                    }
                    None => warn!(detail = %detail, "mexc subscription error"),
                }
            }
            _ => {}
        }
    }
}

fn merged_tick(
    symbol: Symbol,
    pending: PendingFunding,
    mark_price: Option<Decimal>,
    index_price: Option<Decimal>,
) -> RateTick {
    RateTick {
        exchange: ExchangeId::Mexc,
        symbol,
        funding_rate: pending.funding_rate,
        funding_interval_hours: pending.funding_interval_hours,
        next_funding_time: pending.next_funding_time,
        mark_price,
        index_price,
        source: TickSource::Ws,
        received_at: Utc::now(),
    }
}

fn markless_tick(symbol: Symbol, pending: PendingFunding) -> RateTick {
    merged_tick(symbol, pending, None, None)
}

impl Default for MexcExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange for MexcExchange {
    fn id(&self) -> ExchangeId {
        ExchangeId::Mexc
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
            let mut ticks = Vec::with_capacity(symbols.len());
            for symbol in &symbols {
                if let Some(tick) = self.fetch_funding_one(symbol).await? {
                    ticks.push(tick);
                }
            }
            Ok(ticks)
        })
    }

    fn fetch_funding_intervals(
        &self,
    ) -> BoxFuture<'_, Result<HashMap<Symbol, u32>, Report<ExchangeError>>> {
        // collectCycle rides on the funding-rate endpoint.
        Box::pin(async move {
            let mut intervals = HashMap::new();
            for symbol in self.subs.pollable_symbols() {
                if let Some(tick) = self.fetch_funding_one(&symbol).await? {
                    intervals.insert(symbol, tick.funding_interval_hours);
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
                        warn!(error = %e, "mexc funding ws failed");
                        format!("{e}")
                    }
                };

                let _ = events
                    .send(ConnectivityEvent {
                        exchange: ExchangeId::Mexc,
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
struct MexcEnvelope<T> {
    success: bool,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct MexcFundingData {
    #[serde(rename = "fundingRate")]
    funding_rate: Decimal,
    /// Funding interval in hours
    #[serde(rename = "collectCycle", default)]
    collect_cycle: Option<u32>,
    /// Next settlement (ms epoch)
    #[serde(rename = "nextSettleTime", default)]
    next_settle_time: Option<i64>,
}

impl MexcFundingData {
    fn into_tick(self, symbol: Symbol, received_at: DateTime<Utc>) -> RateTick {
        let interval_hours = self
            .collect_cycle
            .filter(|h| (1..=24).contains(h))
            .unwrap_or(8);
        let next_funding_time = self
            .next_settle_time
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(|| next_funding_boundary(received_at, interval_hours));

        RateTick {
            exchange: ExchangeId::Mexc,
            symbol,
            funding_rate: self.funding_rate,
            funding_interval_hours: interval_hours,
            next_funding_time,
            mark_price: None,
            index_price: None,
            source: TickSource::Rest,
            received_at,
        }
    }
}

// ── WebSocket message types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MexcWsFrame {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MexcFundingPush {
    symbol: String,
    #[serde(rename = "fundingRate")]
    funding_rate: Decimal,
    #[serde(rename = "nextSettleTime", default)]
    next_settle_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MexcTickerPush {
    symbol: String,
    #[serde(rename = "fairPrice", default)]
    fair_price: Option<Decimal>,
    #[serde(rename = "indexPrice", default)]
    index_price: Option<Decimal>,
}
