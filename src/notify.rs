pub mod log;
pub mod telegram;
pub mod terminal;
pub mod webhook;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use error_stack::Report;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::model::{NotificationOutcome, NotificationRecord, PipelineEvent};
use crate::persist::{PersistHandle, PersistRequest};

pub const DELIVERY_TIMEOUT: StdDuration = StdDuration::from_secs(5);
pub const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: StdDuration = StdDuration::from_millis(500);
/// Success-rate window surfaced in health reports.
const STATS_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Simple,
    #[default]
    Detailed,
}

/// One notification sink. `format` builds the channel's payload, `deliver`
/// ships it; the fanout owns timeout, retry and record-keeping.
pub trait NotifyChannel: Send + Sync {
    fn name(&self) -> &str;

    fn format(&self, event: &PipelineEvent, verbosity: Verbosity) -> String;

    fn deliver(&self, payload: &str) -> BoxFuture<'_, Result<(), Report<NotifyError>>>;

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }
}

fn pct(value: Decimal) -> String {
    format!("{}%", (value * Decimal::from(100)).normalize())
}

/// Channel-agnostic text payload: symbol, spread and annualized return.
pub fn format_simple(event: &PipelineEvent) -> String {
    let opp = event.opportunity();
    match event {
        PipelineEvent::Disappeared(closed) => format!(
            "[GONE] {} after {}s ({}) max spread {}",
            opp.symbol,
            closed.duration_ms / 1000,
            closed.disappear_reason,
            pct(opp.max_spread),
        ),
        _ => format!(
            "[{}] {} spread {} annualized {}",
            event.kind().to_uppercase(),
            opp.symbol,
            pct(opp.current_spread),
            pct(opp.annualized_return),
        ),
    }
}

/// Adds legs, raw rates, funding schedule, severity and age.
pub fn format_detailed(event: &PipelineEvent) -> String {
    let opp = event.opportunity();
    match event {
        PipelineEvent::Appeared(e) | PipelineEvent::Updated(e) => {
            let age_secs = (e.at - opp.first_detected_at).num_seconds();
            format!(
                "[{}] {} {} | long {} ({}) short {} ({}) | spread {} annualized {} | \
                 next funding {} every {}h | active {}s",
                event.kind().to_uppercase(),
                opp.severity,
                opp.symbol,
                opp.long_exchange,
                pct(e.long_rate),
                opp.short_exchange,
                pct(e.short_rate),
                pct(opp.current_spread),
                pct(opp.annualized_return),
                e.next_funding_time.format("%H:%M:%SZ"),
                opp.funding_interval_hours,
                age_secs,
            )
        }
        PipelineEvent::Disappeared(closed) => format!(
            "[GONE] {} {} | long {} short {} | {} after {}s | max spread {}",
            opp.severity,
            opp.symbol,
            opp.long_exchange,
            opp.short_exchange,
            closed.disappear_reason,
            closed.duration_ms / 1000,
            pct(opp.max_spread),
        ),
    }
}

/// Sliding-window delivery outcomes for one channel.
pub struct ChannelStats {
    samples: Mutex<VecDeque<(DateTime<Utc>, bool)>>,
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
        }
    }
}

impl ChannelStats {
    pub fn record(&self, ok: bool, now: DateTime<Utc>) {
        let mut samples = self.samples.lock();
        samples.push_back((now, ok));
        let horizon = now - Duration::minutes(STATS_WINDOW_MINUTES);
        while samples.front().is_some_and(|(at, _)| *at < horizon) {
            samples.pop_front();
        }
    }

    /// `None` when no delivery happened inside the window.
    pub fn success_rate(&self, now: DateTime<Utc>) -> Option<f64> {
        let samples = self.samples.lock();
        let horizon = now - Duration::minutes(STATS_WINDOW_MINUTES);
        let recent: Vec<bool> = samples
            .iter()
            .filter(|(at, _)| *at >= horizon)
            .map(|(_, ok)| *ok)
            .collect();
        if recent.is_empty() {
            return None;
        }
        let ok = recent.iter().filter(|ok| **ok).count();
        Some(ok as f64 / recent.len() as f64)
    }
}

/// Dispatches every event to all channels concurrently with all-settled
/// semantics; one failing channel never affects the others.
pub struct NotificationFanout {
    channels: Vec<Arc<dyn NotifyChannel>>,
    stats: HashMap<String, Arc<ChannelStats>>,
    verbosity: Verbosity,
    persist: PersistHandle,
}

impl NotificationFanout {
    pub fn new(
        channels: Vec<Arc<dyn NotifyChannel>>,
        verbosity: Verbosity,
        persist: PersistHandle,
    ) -> Self {
        let stats = channels
            .iter()
            .map(|c| (c.name().to_owned(), Arc::new(ChannelStats::default())))
            .collect();
        Self {
            channels,
            stats,
            verbosity,
            persist,
        }
    }

    pub fn channel_stats(&self) -> Vec<(String, Arc<ChannelStats>)> {
        let mut all: Vec<_> = self
            .stats
            .iter()
            .map(|(name, stats)| (name.clone(), Arc::clone(stats)))
            .collect();
        all.sort_by(|(a, _), (b, _)| a.cmp(b));
        all
    }

    /// Probe every channel once; used at startup to surface dead endpoints
    /// before the first real notification.
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let checks = self
            .channels
            .iter()
            .map(|channel| async move { (channel.name().to_owned(), channel.health_check().await) });
        futures::future::join_all(checks).await
    }

    pub async fn dispatch(&self, event: &PipelineEvent) {
        let deliveries = self
            .channels
            .iter()
            .map(|channel| self.dispatch_one(channel, event));
        futures::future::join_all(deliveries).await;
    }

    async fn dispatch_one(&self, channel: &Arc<dyn NotifyChannel>, event: &PipelineEvent) {
        let payload = channel.format(event, self.verbosity);
        let result = deliver_with_retry(channel.as_ref(), &payload).await;
        let now = Utc::now();
        let ok = result.is_ok();

        if let Some(stats) = self.stats.get(channel.name()) {
            stats.record(ok, now);
        }

        let error_kind = result
            .as_ref()
            .err()
            .map(|report| report.current_context().kind().to_owned());
        if let Err(report) = &result {
            warn!(channel = channel.name(), error = ?report, "notification delivery failed");
        }

        self.persist
            .enqueue(PersistRequest::SaveNotification(NotificationRecord {
                opportunity_id: event.opportunity().id,
                channel: channel.name().to_owned(),
                severity: event.severity(),
                delivered_at: now,
                outcome: if ok {
                    NotificationOutcome::Sent
                } else {
                    NotificationOutcome::Failed
                },
                error_kind,
            }));
    }
}

/// Up to three attempts with doubling backoff. Rejections (non-429 4xx) are
/// terminal on the first attempt.
pub async fn deliver_with_retry(
    channel: &dyn NotifyChannel,
    payload: &str,
) -> Result<(), Report<NotifyError>> {
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(DELIVERY_TIMEOUT, channel.deliver(payload)).await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(report)) => report,
            Err(_) => Report::new(NotifyError::Timeout {
                channel: channel.name().to_owned(),
            }),
        };

        attempt += 1;
        if attempt >= MAX_ATTEMPTS || !outcome.current_context().is_retryable() {
            return Err(outcome);
        }
        sleep(RETRY_BASE * 2u32.saturating_pow(attempt - 1)).await;
    }
}

pub async fn run(
    fanout: Arc<NotificationFanout>,
    mut rx: mpsc::Receiver<PipelineEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        fanout.dispatch(&event).await;
    }
    debug!("notification fanout stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ExchangeId, Opportunity, OpportunityEvent, OpportunityStatus, Severity,
    };
    use crate::symbol::Symbol;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
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

    struct FlakyChannel {
        fail_first: u32,
        calls: AtomicU32,
        retryable: bool,
    }

    impl NotifyChannel for FlakyChannel {
        fn name(&self) -> &str {
            "flaky"
        }

        fn format(&self, event: &PipelineEvent, _verbosity: Verbosity) -> String {
            format_simple(event)
        }

        fn deliver(&self, _payload: &str) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.fail_first {
                    if self.retryable {
                        Err(Report::new(NotifyError::Delivery {
                            channel: "flaky".into(),
                        }))
                    } else {
                        Err(Report::new(NotifyError::Rejected {
                            channel: "flaky".into(),
                            status: 400,
                        }))
                    }
                } else {
                    Ok(())
                }
            })
        }
    }

    #[test]
    fn simple_payload_has_spread_and_annualized() {
        let text = format_simple(&event());
        assert!(text.contains("BTCUSDT"), "{text}");
        assert!(text.contains("0.06%"), "{text}");
        assert!(text.contains("65.7%"), "{text}");
    }

    #[test]
    fn detailed_payload_adds_legs_and_schedule() {
        let text = format_detailed(&event());
        assert!(text.contains("long okx"), "{text}");
        assert!(text.contains("short binance"), "{text}");
        assert!(text.contains("-0.03%"), "{text}");
        assert!(text.contains("every 8h"), "{text}");
        assert!(text.contains("INFO"), "{text}");
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let channel = FlakyChannel {
            fail_first: 2,
            calls: AtomicU32::new(0),
            retryable: true,
        };
        let result = deliver_with_retry(&channel, "payload").await;
        assert!(result.is_ok());
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let channel = FlakyChannel {
            fail_first: 5,
            calls: AtomicU32::new(0),
            retryable: false,
        };
        let result = deliver_with_retry(&channel, "payload").await;
        assert!(result.is_err());
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        let channel = FlakyChannel {
            fail_first: 10,
            calls: AtomicU32::new(0),
            retryable: true,
        };
        let result = deliver_with_retry(&channel, "payload").await;
        assert!(result.is_err());
        assert_eq!(channel.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn failing_channel_does_not_affect_others() {
        let cancel = CancellationToken::new();
        let backend = Arc::new(crate::persist::testing::MemoryPersistence::default());
        let (persist, _writer) = crate::persist::spawn_writer(backend.clone(), cancel.clone());

        let ok_channel = Arc::new(FlakyChannel {
            fail_first: 0,
            calls: AtomicU32::new(0),
            retryable: true,
        });
        let bad_channel = Arc::new(FlakyChannel {
            fail_first: 10,
            calls: AtomicU32::new(0),
            retryable: false,
        });

        struct Named(Arc<FlakyChannel>, &'static str);
        impl NotifyChannel for Named {
            fn name(&self) -> &str {
                self.1
            }
            fn format(&self, event: &PipelineEvent, verbosity: Verbosity) -> String {
                self.0.format(event, verbosity)
            }
            fn deliver(&self, payload: &str) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
                self.0.deliver(payload)
            }
        }

        let fanout = NotificationFanout::new(
            vec![
                Arc::new(Named(Arc::clone(&bad_channel), "bad")),
                Arc::new(Named(Arc::clone(&ok_channel), "ok")),
            ],
            Verbosity::Simple,
            persist,
        );

        fanout.dispatch(&event()).await;

        assert_eq!(ok_channel.calls.load(Ordering::SeqCst), 1);
        let now = Utc::now();
        let stats: HashMap<_, _> = fanout.channel_stats().into_iter().collect();
        assert_eq!(stats["ok"].success_rate(now), Some(1.0));
        assert_eq!(stats["bad"].success_rate(now), Some(0.0));

        // Both outcomes were recorded.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        cancel.cancel();
        let writes = backend.writes.lock().clone();
        assert!(writes.contains(&"notification:ok:SENT".to_owned()));
        assert!(writes.contains(&"notification:bad:FAILED".to_owned()));
    }

    #[test]
    fn stats_window_drops_old_samples() {
        let stats = ChannelStats::default();
        let start = Utc::now();
        stats.record(false, start);
        stats.record(true, start + Duration::minutes(6));

        let rate = stats.success_rate(start + Duration::minutes(6)).unwrap();
        assert_eq!(rate, 1.0);
    }
}
