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

const OKX_BASE_URL: &str = "https://www.okx.com";
const OKX_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
/// OKX closes connections idle for 30s; ping well inside that.
const WS_PING_INTERVAL_SECS: u64 = 25;
const OKX_REQUESTS_PER_SECOND: u32 = 5;
/// Instrument does not exist.
const OKX_CODE_NO_INSTRUMENT: &str = "51001";

pub struct OkxExchange {
    client: reqwest::Client,
    rate_limiter: DefaultDirectRateLimiter,
    subs: SubscriptionSet,
    intervals: IntervalBook,
}

impl OkxExchange {
    pub fn new() -> Self {
        let quota = Quota::per_second(nonzero!(OKX_REQUESTS_PER_SECOND));
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

        let inst_id = exchange_form(symbol, ExchangeId::Okx);
        let url = format!("{}/api/v5/public/funding-rate", OKX_BASE_URL);
        let response = self
            .client
            .get(&url)
            .query(&[("instId", inst_id.as_str())])
            .send()
            .await
            .change_context(ExchangeError::Request {
                exchange: "okx".into(),
            })?;

        if response.status().as_u16() == 429 {
            return Err(Report::new(ExchangeError::RateLimited {
                exchange: "okx".into(),
                retry_after_secs: None,
            }));
        }
        if !response.status().is_success() {
            return Err(Report::new(ExchangeError::Request {
                exchange: "okx".into(),
            })
            .attach(format!("HTTP status: {}", response.status())));
        }

        let envelope: OkxRestEnvelope<OkxFundingData> =
            response
                .json()
                .await
                .change_context(ExchangeError::ResponseParse {
                    exchange: "okx".into(),
                })?;

        if envelope.code == OKX_CODE_NO_INSTRUMENT {
            debug!(symbol = %symbol, "okx does not list market, marking unsupported");
            self.subs.mark_unsupported(symbol);
            return Ok(None);
        }
        if envelope.code != "0" {
            return Err(Report::new(ExchangeError::Request {
                exchange: "okx".into(),
            })
            .attach(format!("okx code {}: {}", envelope.code, envelope.msg)));
        }

        let received_at = Utc::now();
        Ok(envelope
            .data
            .into_iter()
            .next()
            .and_then(|row| row.into_tick(&self.intervals, TickSource::Rest, received_at)))
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
            connect_async(OKX_WS_URL)
                .await
                .change_context(ExchangeError::Connection {
                    exchange: "okx".into(),
                })?;
        let (mut write, mut read) = ws_stream.split();

        // Funding and mark price arrive on distinct channels; subscribe both.
        let args: Vec<serde_json::Value> = symbols
            .iter()
            .flat_map(|s| {
                let inst_id = exchange_form(s, ExchangeId::Okx);
                [
                    json!({"channel": "funding-rate", "instId": inst_id}),
                    json!({"channel": "mark-price", "instId": inst_id}),
                ]
            })
            .collect();
        let subscribe_msg = json!({"op": "subscribe", "args": args}).to_string();
        write
            .send(Message::Text(subscribe_msg.into()))
            .await
            .change_context(ExchangeError::Connection {
                exchange: "okx".into(),
            })?;

        let _ = events
            .send(ConnectivityEvent {
                exchange: ExchangeId::Okx,
                transport: Transport::Ws,
                state: LinkState::Up,
                reason: "connected".into(),
            })
            .await;
        info!(symbols = symbols.len(), "okx funding ws subscribed");

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
                    debug!("okx funding ws cancelled");
                    return Ok(SessionEnd::Cancelled);
                }
                _ = self.subs.changed() => {
                    info!("okx subscription set changed, reconnecting");
                    return Ok(SessionEnd::Disconnected { delivered_frames: true });
                }
                _ = ping_timer.tick() => {
                    let _ = write.send(Message::Text("ping".into())).await;
                }
                _ = flush_timer.tick() => {
                    for (symbol, pending) in merge.flush_expired(Utc::now()) {
                        delivered = true;
                        let _ = tx.send(markless_tick(symbol, pending)).await;
                    }
                }
                _ = idle_check.tick() => {
                    if last_frame.elapsed() > ws::DEFAULT_IDLE_TIMEOUT {
                        warn!("okx funding ws idle, forcing reconnect");
                        return Ok(SessionEnd::Disconnected { delivered_frames: delivered });
                    }
                }
                msg = read.next() => {
                    match msg {
                        None => return Ok(SessionEnd::Disconnected { delivered_frames: delivered }),
                        Some(Err(e)) => {
                            return Err(Report::new(e).change_context(ExchangeError::Connection {
                                exchange: "okx".into(),
                            }));
                        }
                        Some(Ok(Message::Text(text))) => {
                            last_frame = Instant::now();
                            if text.as_str() == "pong" {
                                continue;
                            }
                            if self.handle_frame(&text, &mut merge, tx, &mut delivered).await {
                                continue;
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

    /// Returns `true` when the frame was consumed.
    async fn handle_frame(
        &self,
        text: &str,
        merge: &mut MarkMerge,
        tx: &mpsc::Sender<RateTick>,
        delivered: &mut bool,
    ) -> bool {
        let frame: OkxWsFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, raw = %text, "okx frame parse error");
                return true;
            }
        };

        if frame.event.as_deref() == Some("error") {
            // Subscribe rejection for an unknown market names the instId in
            // either the echoed arg or the message text.
            let inst = frame.arg.as_ref().and_then(|a| a.inst_id.clone());
            let symbol = inst
                .as_deref()
                .and_then(|i| from_exchange_form(i, ExchangeId::Okx).ok())
                .or_else(|| {
                    let msg = frame.msg.as_deref().unwrap_or_default();
                    self.subs
                        .ws_symbols()
                        .into_iter()
                        .find(|s| msg.contains(&exchange_form(s, ExchangeId::Okx)))
                });
            match symbol {
                Some(symbol) => {
                    warn!(symbol = %symbol, msg = frame.msg.as_deref().unwrap_or(""),
                        "okx rejected subscription, routing symbol to REST");
                    self.subs.mark_ws_unsupported(&symbol);
                }
                None => {
                    warn!(code = frame.code.as_deref().unwrap_or(""),
                        msg = frame.msg.as_deref().unwrap_or(""), "okx subscribe error");
                }
            }
            return true;
        }

        let (Some(arg), Some(data)) = (frame.arg, frame.data) else {
            return true;
        };

        match arg.channel.as_str() {
            "funding-rate" => {
                let rows: Vec<OkxFundingData> = match serde_json::from_value(data) {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(error = %e, "okx funding data parse error");
                        return true;
                    }
                };
                let now = Utc::now();
                for row in rows {
                    let Some(symbol) = from_exchange_form(&row.inst_id, ExchangeId::Okx).ok()
                    else {
                        continue;
                    };
                    let Some(pending) = row.into_pending(&self.intervals, now) else {
                        continue;
                    };
                    if let Some((mark, index)) = merge.on_funding(symbol.clone(), pending.clone())
                    {
                        *delivered = true;
                        let _ = tx
                            .send(merged_tick(symbol, pending, Some(mark), index))
                            .await;
                    }
                }
            }
            "mark-price" => {
                let rows: Vec<OkxMarkData> = match serde_json::from_value(data) {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(error = %e, "okx mark data parse error");
                        return true;
                    }
                };
                for row in rows {
                    let Some(symbol) = from_exchange_form(&row.inst_id, ExchangeId::Okx).ok()
                    else {
                        continue;
                    };
                    let Some(mark) = row.mark_px.parse::<Decimal>().ok() else {
                        continue;
                    };
                    if let Some((symbol, pending, mark, index)) =
                        merge.on_mark(&symbol, mark, None)
                    {
                        *delivered = true;
                        let _ = tx
                            .send(merged_tick(symbol, pending, Some(mark), index))
                            .await;
                    }
                }
            }
            _ => {}
        }
        true
    }
}

fn merged_tick(
    symbol: Symbol,
    pending: PendingFunding,
    mark_price: Option<Decimal>,
    index_price: Option<Decimal>,
) -> RateTick {
    RateTick {
        exchange: ExchangeId::Okx,
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

impl Default for OkxExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange for OkxExchange {
    fn id(&self) -> ExchangeId {
        ExchangeId::Okx
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
        // OKX carries no interval field; derive it from the gap between the
        // current and next funding time per subscribed market.
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
                        warn!(error = %e, "okx funding ws failed");
                        format!("{e}")
                    }
                };

                let _ = events
                    .send(ConnectivityEvent {
                        exchange: ExchangeId::Okx,
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
struct OkxRestEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct OkxFundingData {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "fundingRate")]
    funding_rate: String,
    /// Current funding settlement time (ms epoch, as string)
    #[serde(rename = "fundingTime", default)]
    funding_time: String,
    #[serde(rename = "nextFundingTime", default)]
    next_funding_time: String,
}

impl OkxFundingData {
    fn interval_hours(&self, intervals: &IntervalBook, symbol: &Symbol) -> u32 {
        let funding: Option<i64> = self.funding_time.parse().ok();
        let next: Option<i64> = self.next_funding_time.parse().ok();
        match (funding, next) {
            (Some(funding), Some(next)) if next > funding => {
                let hours = (next - funding) / 3_600_000;
                u32::try_from(hours).ok().filter(|h| (1..=24).contains(h))
            }
            _ => None,
        }
        .unwrap_or_else(|| intervals.hours(symbol))
    }

    fn into_pending(self, intervals: &IntervalBook, now: DateTime<Utc>) -> Option<PendingFunding> {
        let symbol = from_exchange_form(&self.inst_id, ExchangeId::Okx).ok()?;
        let funding_rate: Decimal = match self.funding_rate.parse() {
            Ok(rate) => rate,
            Err(_) => {
                warn!(symbol = %symbol, raw = %self.funding_rate, "okx funding rate parse error");
                return None;
            }
        };
        let interval_hours = self.interval_hours(intervals, &symbol);
        let next_funding_time = self
            .next_funding_time
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(|| next_funding_boundary(now, interval_hours));

        Some(PendingFunding {
            funding_rate,
            funding_interval_hours: interval_hours,
            next_funding_time,
            queued_at: now,
        })
    }

    fn into_tick(
        self,
        intervals: &IntervalBook,
        source: TickSource,
        received_at: DateTime<Utc>,
    ) -> Option<RateTick> {
        let symbol = from_exchange_form(&self.inst_id, ExchangeId::Okx).ok()?;
        let pending = self.into_pending(intervals, received_at)?;
        Some(RateTick {
            exchange: ExchangeId::Okx,
            symbol,
            funding_rate: pending.funding_rate,
            funding_interval_hours: pending.funding_interval_hours,
            next_funding_time: pending.next_funding_time,
            mark_price: None,
            index_price: None,
            source,
            received_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OkxMarkData {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "markPx")]
    mark_px: String,
}

// ── WebSocket message types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OkxWsFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<OkxWsArg>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OkxWsArg {
    channel: String,
    #[serde(rename = "instId", default)]
    inst_id: Option<String>,
}
