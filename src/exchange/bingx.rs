use std::collections::HashMap;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExchangeError;
use crate::exchange::{Exchange, IntervalBook, SubscriptionSet};
use crate::model::{
    ConnectivityEvent, ExchangeId, RateTick, TickSource, next_funding_boundary,
};
use crate::symbol::{Symbol, from_exchange_form};

const BINGX_BASE_URL: &str = "https://open-api.bingx.com";
const BINGX_REQUESTS_PER_SECOND: u32 = 5;

/// BingX has no usable public funding WebSocket; this client is REST-only
/// and the source manager keeps it permanently in REST mode.
pub struct BingxExchange {
    client: reqwest::Client,
    rate_limiter: DefaultDirectRateLimiter,
    subs: SubscriptionSet,
    intervals: IntervalBook,
}

impl BingxExchange {
    pub fn new() -> Self {
        let quota = Quota::per_second(nonzero!(BINGX_REQUESTS_PER_SECOND));
        Self {
            client: reqwest::Client::new(),
            rate_limiter: RateLimiter::direct(quota),
            subs: SubscriptionSet::new(),
            intervals: IntervalBook::new(),
        }
    }
}

impl Default for BingxExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange for BingxExchange {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bingx
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

            let url = format!("{}/openApi/swap/v2/quote/premiumIndex", BINGX_BASE_URL);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "bingx".into(),
                })?;

            if response.status().as_u16() == 429 {
                return Err(Report::new(ExchangeError::RateLimited {
                    exchange: "bingx".into(),
                    retry_after_secs: None,
                }));
            }
            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "bingx".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let envelope: BingxEnvelope<Vec<BingxPremiumIndex>> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "bingx".into(),
                    })?;

            if envelope.code != 0 {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "bingx".into(),
                })
                .attach(format!("bingx code {}: {}", envelope.code, envelope.msg)));
            }

            let received_at = Utc::now();
            let mut by_symbol: HashMap<Symbol, BingxPremiumIndex> = envelope
                .data
                .unwrap_or_default()
                .into_iter()
                .filter_map(|row| {
                    from_exchange_form(&row.symbol, ExchangeId::Bingx)
                        .ok()
                        .map(|s| (s, row))
                })
                .collect();

            let mut ticks = Vec::with_capacity(symbols.len());
            for symbol in &symbols {
                match by_symbol.remove(symbol) {
                    Some(row) => {
                        if let Some(tick) =
                            row.into_tick(symbol.clone(), &self.intervals, received_at)
                        {
                            ticks.push(tick);
                        }
                    }
                    None => {
                        debug!(symbol = %symbol, "bingx does not list market, marking unsupported");
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
        // BingX publishes no interval endpoint; every market settles on the
        // 8h default.
        Box::pin(async move { Ok(HashMap::new()) })
    }

    fn run_funding_ws(
        &self,
        _tx: mpsc::Sender<RateTick>,
        _events: mpsc::Sender<ConnectivityEvent>,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
        Box::pin(async move { Ok(()) })
    }
}

#[derive(Debug, Deserialize)]
struct BingxEnvelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct BingxPremiumIndex {
    symbol: String,
    #[serde(rename = "markPrice", default)]
    mark_price: Option<String>,
    #[serde(rename = "indexPrice", default)]
    index_price: Option<String>,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime", default)]
    next_funding_time: Option<i64>,
}

impl BingxPremiumIndex {
    fn into_tick(
        self,
        symbol: Symbol,
        intervals: &IntervalBook,
        received_at: DateTime<Utc>,
    ) -> Option<RateTick> {
        let funding_rate: Decimal = match self.last_funding_rate.parse() {
            Ok(rate) => rate,
            Err(_) => {
                warn!(symbol = %symbol, raw = %self.last_funding_rate, "bingx funding rate parse error");
                return None;
            }
        };
        let interval_hours = intervals.hours(&symbol);
        let next_funding_time = self
            .next_funding_time
            .and_then(DateTime::from_timestamp_millis)
            .filter(|t| t.timestamp() > 0)
            .unwrap_or_else(|| next_funding_boundary(received_at, interval_hours));

        Some(RateTick {
            exchange: ExchangeId::Bingx,
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

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn premium_index_parses_into_tick() {
        let raw = r#"{
            "code": 0,
            "msg": "",
            "data": [{
                "symbol": "BTC-USDT",
                "markPrice": "42001.1",
                "indexPrice": "41999.8",
                "lastFundingRate": "0.0001",
                "nextFundingTime": 1704096000000
            }]
        }"#;
        let envelope: BingxEnvelope<Vec<BingxPremiumIndex>> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.code, 0);
        let row = envelope.data.unwrap().into_iter().next().unwrap();
        let tick = row
            .into_tick(
                Symbol::parse("BTCUSDT").unwrap(),
                &IntervalBook::new(),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(tick.exchange, ExchangeId::Bingx);
        assert_eq!(tick.funding_rate, dec!(0.0001));
        assert_eq!(tick.mark_price, Some(dec!(42001.1)));
        assert_eq!(tick.funding_interval_hours, 8);
        assert_eq!(tick.source, TickSource::Rest);
    }

    #[test]
    fn missing_next_funding_time_falls_back_to_boundary() {
        let row = BingxPremiumIndex {
            symbol: "BTC-USDT".into(),
            mark_price: None,
            index_price: None,
            last_funding_rate: "0.0002".into(),
            next_funding_time: None,
        };
        let received_at = DateTime::from_timestamp(1_704_105_000, 0).unwrap();
        let tick = row
            .into_tick(
                Symbol::parse("BTCUSDT").unwrap(),
                &IntervalBook::new(),
                received_at,
            )
            .unwrap();
        assert!(tick.next_funding_time > received_at);
        assert_eq!(tick.next_funding_time.timestamp() % (8 * 3600), 0);
        assert_eq!(tick.mark_price, None);
    }

    /// Integration test: requires network access. Run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn integration_fetch_funding() {
        let exchange = BingxExchange::new();
        let symbols = vec![Symbol::parse("BTCUSDT").unwrap()];
        let ticks = exchange.fetch_funding(&symbols).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].exchange, ExchangeId::Bingx);
    }
}
