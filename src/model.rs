use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::symbol::Symbol;

/// Closed set of supported exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Okx,
    Gateio,
    Mexc,
    Bingx,
}

impl ExchangeId {
    pub const ALL: [ExchangeId; 5] = [
        Self::Binance,
        Self::Okx,
        Self::Gateio,
        Self::Mexc,
        Self::Bingx,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Okx => "okx",
            Self::Gateio => "gateio",
            Self::Mexc => "mexc",
            Self::Bingx => "bingx",
        }
    }

    /// Parse a config-format name into an `ExchangeId`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "binance" => Some(Self::Binance),
            "okx" => Some(Self::Okx),
            "gateio" => Some(Self::Gateio),
            "mexc" => Some(Self::Mexc),
            "bingx" => Some(Self::Bingx),
            _ => None,
        }
    }

    /// How the exchange delivers funding rates in real time.
    pub fn funding_feed(self) -> FundingFeed {
        match self {
            Self::Binance | Self::Okx | Self::Mexc => FundingFeed::WsNative,
            Self::Gateio => FundingFeed::WsTicker,
            Self::Bingx => FundingFeed::RestOnly,
        }
    }

    /// Default staleness threshold, calibrated to the exchange's push
    /// cadence (OKX pushes funding roughly once a minute).
    pub fn default_stale_ms(self) -> u64 {
        match self {
            Self::Binance | Self::Gateio | Self::Bingx => 30_000,
            Self::Mexc => 60_000,
            Self::Okx => 90_000,
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Funding-feed capability of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingFeed {
    /// Dedicated funding or mark-price WebSocket channel.
    WsNative,
    /// Funding rate piggybacks on the futures ticker stream.
    WsTicker,
    /// No usable WebSocket funding feed; REST polling only.
    RestOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickSource {
    Ws,
    Rest,
}

impl fmt::Display for TickSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ws => f.write_str("ws"),
            Self::Rest => f.write_str("rest"),
        }
    }
}

/// One normalised funding-rate observation.
#[derive(Debug, Clone, Serialize)]
pub struct RateTick {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub funding_rate: Decimal,
    pub funding_interval_hours: u32,
    pub next_funding_time: DateTime<Utc>,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub source: TickSource,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Ws,
    Rest,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ws => f.write_str("ws"),
            Self::Rest => f.write_str("rest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// Transport up/down notice published by an exchange client.
#[derive(Debug, Clone)]
pub struct ConnectivityEvent {
    pub exchange: ExchangeId,
    pub transport: Transport,
    pub state: LinkState,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("INFO"),
            Self::Warning => f.write_str("WARNING"),
            Self::Critical => f.write_str("CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpportunityStatus {
    Active,
    Expired,
}

impl OpportunityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisappearReason {
    RateDropped,
    DataUnavailable,
}

impl DisappearReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateDropped => "RATE_DROPPED",
            Self::DataUnavailable => "DATA_UNAVAILABLE",
        }
    }
}

impl fmt::Display for DisappearReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cross-exchange arbitrage candidate. At most one is active per symbol;
/// the opportunity detector is the sole writer.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub symbol: Symbol,
    pub long_exchange: ExchangeId,
    pub short_exchange: ExchangeId,
    pub entry_spread: Decimal,
    pub current_spread: Decimal,
    pub max_spread: Decimal,
    pub max_spread_at: DateTime<Utc>,
    pub first_detected_at: DateTime<Utc>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub notification_count: u32,
    pub severity: Severity,
    pub annualized_return: Decimal,
    pub funding_interval_hours: u32,
    pub status: OpportunityStatus,
}

/// Append-only record written when an opportunity expires.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityHistory {
    pub opportunity_id: Uuid,
    pub symbol: Symbol,
    pub long_exchange: ExchangeId,
    pub short_exchange: ExchangeId,
    pub duration_ms: i64,
    pub max_spread: Decimal,
    pub average_spread: Decimal,
    pub disappear_reason: DisappearReason,
    pub notification_count: u32,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Sent,
    SuppressedDebounce,
    Failed,
}

impl NotificationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::SuppressedDebounce => "SUPPRESSED_DEBOUNCE",
            Self::Failed => "FAILED",
        }
    }
}

/// Append-only per-delivery-attempt record.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub opportunity_id: Uuid,
    pub channel: String,
    pub severity: Severity,
    pub delivered_at: DateTime<Utc>,
    pub outcome: NotificationOutcome,
    pub error_kind: Option<String>,
}

/// Snapshot carried by `appeared` / `updated` lifecycle events.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityEvent {
    pub opportunity: Opportunity,
    pub long_rate: Decimal,
    pub short_rate: Decimal,
    pub next_funding_time: DateTime<Utc>,
    pub at: DateTime<Utc>,
}

/// Terminal lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityClosed {
    pub opportunity: Opportunity,
    pub duration_ms: i64,
    pub disappear_reason: DisappearReason,
    pub at: DateTime<Utc>,
}

/// Typed lifecycle event stream emitted by the detector.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Appeared(OpportunityEvent),
    Updated(OpportunityEvent),
    Disappeared(OpportunityClosed),
}

impl PipelineEvent {
    pub fn opportunity(&self) -> &Opportunity {
        match self {
            Self::Appeared(e) | Self::Updated(e) => &e.opportunity,
            Self::Disappeared(e) => &e.opportunity,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.opportunity().symbol
    }

    pub fn severity(&self) -> Severity {
        self.opportunity().severity
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Appeared(_) => "appeared",
            Self::Updated(_) => "updated",
            Self::Disappeared(_) => "disappeared",
        }
    }
}

/// The next UTC instant that is a whole multiple of `interval_hours` from
/// midnight. Used when an exchange omits the next funding time.
pub fn next_funding_boundary(now: DateTime<Utc>, interval_hours: u32) -> DateTime<Utc> {
    let secs_per = i64::from(interval_hours.max(1)) * 3600;
    let next = (now.timestamp().div_euclid(secs_per) + 1) * secs_per;
    DateTime::from_timestamp(next, 0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_id_name_round_trip() {
        for exchange in ExchangeId::ALL {
            assert_eq!(ExchangeId::parse(exchange.as_str()), Some(exchange));
        }
        assert_eq!(ExchangeId::parse("bybit"), None);
    }

    #[test]
    fn exchange_id_serde_round_trip() {
        let json = serde_json::to_string(&ExchangeId::Gateio).unwrap();
        assert_eq!(json, "\"gateio\"");
        let parsed: ExchangeId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ExchangeId::Gateio);
    }

    #[test]
    fn severity_orders_by_escalation() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn funding_feed_matches_capability_table() {
        assert_eq!(ExchangeId::Binance.funding_feed(), FundingFeed::WsNative);
        assert_eq!(ExchangeId::Gateio.funding_feed(), FundingFeed::WsTicker);
        assert_eq!(ExchangeId::Bingx.funding_feed(), FundingFeed::RestOnly);
    }

    #[test]
    fn next_funding_boundary_rounds_up_to_interval() {
        // 2024-01-01T10:30:00Z with 8h intervals -> 16:00.
        let now = DateTime::from_timestamp(1_704_105_000, 0).unwrap();
        let next = next_funding_boundary(now, 8);
        assert_eq!(next.timestamp() % (8 * 3600), 0);
        assert_eq!(next, DateTime::from_timestamp(1_704_124_800, 0).unwrap());
    }

    #[test]
    fn next_funding_boundary_on_exact_boundary_moves_forward() {
        let boundary = DateTime::from_timestamp(1_704_124_800, 0).unwrap();
        let next = next_funding_boundary(boundary, 8);
        assert_eq!(next.timestamp(), 1_704_124_800 + 8 * 3600);
    }

    #[test]
    fn next_funding_boundary_handles_one_hour_interval() {
        let now = DateTime::from_timestamp(1_704_105_000, 0).unwrap();
        let next = next_funding_boundary(now, 1);
        assert_eq!(next.timestamp() % 3600, 0);
        assert!(next > now);
        assert!(next.timestamp() - now.timestamp() <= 3600);
    }
}
