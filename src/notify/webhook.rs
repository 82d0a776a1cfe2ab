use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde_json::json;

use crate::error::NotifyError;
use crate::model::PipelineEvent;
use crate::notify::{NotifyChannel, Verbosity};

/// Posts the event as JSON to a configured endpoint.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn format(&self, event: &PipelineEvent, verbosity: Verbosity) -> String {
        let opp = event.opportunity();
        let payload = match verbosity {
            Verbosity::Simple => json!({
                "event": event.kind(),
                "symbol": opp.symbol,
                "currentSpread": opp.current_spread,
                "annualizedReturn": opp.annualized_return,
                "severity": opp.severity,
            }),
            Verbosity::Detailed => serde_json::to_value(event).unwrap_or_else(|_| json!({})),
        };
        payload.to_string()
    }

    fn deliver(&self, payload: &str) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
        let body = payload.to_owned();
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .change_context(NotifyError::Delivery {
                    channel: "webhook".into(),
                })?;

            classify_status(response.status(), "webhook")
        })
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        // A webhook endpoint has no standard probe; reachability of the
        // host is the best signal available.
        Box::pin(async move { self.client.head(&self.url).send().await.is_ok() })
    }
}

/// 2xx is success, 429 and 5xx are retryable, any other 4xx is terminal.
pub fn classify_status(
    status: reqwest::StatusCode,
    channel: &str,
) -> Result<(), Report<NotifyError>> {
    if status.is_success() {
        return Ok(());
    }
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(Report::new(NotifyError::Delivery {
            channel: channel.to_owned(),
        })
        .attach(format!("HTTP status: {status}")));
    }
    Err(Report::new(NotifyError::Rejected {
        channel: channel.to_owned(),
        status: status.as_u16(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ExchangeId, Opportunity, OpportunityEvent, OpportunityStatus, Severity,
    };
    use crate::symbol::Symbol;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn event() -> PipelineEvent {
        let now = Utc::now();
        PipelineEvent::Appeared(OpportunityEvent {
            opportunity: Opportunity {
                id: Uuid::nil(),
                symbol: Symbol::parse("BTCUSDT").unwrap(),
                long_exchange: ExchangeId::Okx,
                short_exchange: ExchangeId::Binance,
                entry_spread: dec!(0.0006),
                current_spread: dec!(0.0006),
                max_spread: dec!(0.0006),
                max_spread_at: now,
                first_detected_at: now,
                last_notified_at: Some(now),
                notification_count: 1,
                severity: Severity::Info,
                annualized_return: dec!(0.657),
                funding_interval_hours: 8,
                status: OpportunityStatus::Active,
            },
            long_rate: dec!(-0.0003),
            short_rate: dec!(0.0003),
            next_funding_time: now,
            at: now,
        })
    }

    #[test]
    fn simple_payload_is_compact_json() {
        let channel = WebhookChannel::new("http://localhost/hook".into());
        let payload = channel.format(&event(), Verbosity::Simple);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(value["event"], "appeared");
        assert_eq!(value["symbol"], "BTCUSDT");
        assert_eq!(value["currentSpread"], "0.0006");
        assert!(value.get("long_rate").is_none());
    }

    #[test]
    fn detailed_payload_serialises_full_event() {
        let channel = WebhookChannel::new("http://localhost/hook".into());
        let payload = channel.format(&event(), Verbosity::Detailed);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(value["event"], "appeared");
        assert_eq!(value["opportunity"]["symbol"], "BTCUSDT");
        assert_eq!(value["long_rate"], "-0.0003");
    }

    #[test]
    fn status_classification_follows_retry_policy() {
        assert!(classify_status(reqwest::StatusCode::OK, "webhook").is_ok());

        let too_many = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "webhook")
            .unwrap_err();
        assert!(too_many.current_context().is_retryable());

        let server_err =
            classify_status(reqwest::StatusCode::BAD_GATEWAY, "webhook").unwrap_err();
        assert!(server_err.current_context().is_retryable());

        let bad_request =
            classify_status(reqwest::StatusCode::BAD_REQUEST, "webhook").unwrap_err();
        assert!(!bad_request.current_context().is_retryable());
    }
}
