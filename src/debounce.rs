use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{
    NotificationOutcome, NotificationRecord, PipelineEvent, Severity,
};
use crate::persist::{PersistHandle, PersistRequest};
use crate::symbol::Symbol;

pub const DEFAULT_DEBOUNCE_MS: i64 = 30_000;
/// Idle sleep when nothing is pending.
const IDLE_WAIT: StdDuration = StdDuration::from_secs(60);

struct Pending {
    event: PipelineEvent,
    due_at: DateTime<Utc>,
}

/// What one debouncer step decided: events to forward to the fanout and
/// records for events coalesced away.
#[derive(Default)]
pub struct DebounceOutput {
    pub released: Vec<PipelineEvent>,
    pub suppressed: Vec<NotificationRecord>,
}

/// Per-symbol timed coalescing of `updated` events.
///
/// `appeared` and `disappeared` always pass straight through, as do severity
/// upgrades. Everything else waits until the window measured from the last
/// released notification has elapsed; at most one update is pending per
/// symbol and a newer one replaces it.
pub struct Debouncer {
    window: Duration,
    last_released: HashMap<Symbol, (DateTime<Utc>, Severity)>,
    pending: HashMap<Symbol, Pending>,
    depth_gauge: Arc<AtomicUsize>,
}

impl Debouncer {
    pub fn new(window_ms: i64, depth_gauge: Arc<AtomicUsize>) -> Self {
        Self {
            window: Duration::milliseconds(window_ms),
            last_released: HashMap::new(),
            pending: HashMap::new(),
            depth_gauge,
        }
    }

    fn note_release(&mut self, event: &PipelineEvent, now: DateTime<Utc>) {
        self.last_released
            .insert(event.symbol().clone(), (now, event.severity()));
    }

    fn suppress(&mut self, event: PipelineEvent, now: DateTime<Utc>) -> NotificationRecord {
        NotificationRecord {
            opportunity_id: event.opportunity().id,
            channel: "debounce".into(),
            severity: event.severity(),
            delivered_at: now,
            outcome: NotificationOutcome::SuppressedDebounce,
            error_kind: None,
        }
    }

    fn sync_gauge(&self) {
        self.depth_gauge.store(self.pending.len(), Ordering::Relaxed);
    }

    pub fn on_event(&mut self, event: PipelineEvent, now: DateTime<Utc>) -> DebounceOutput {
        let mut out = DebounceOutput::default();
        let symbol = event.symbol().clone();

        match &event {
            PipelineEvent::Appeared(_) => {
                self.note_release(&event, now);
                out.released.push(event);
            }
            PipelineEvent::Disappeared(_) => {
                if let Some(pending) = self.pending.remove(&symbol) {
                    out.suppressed.push(self.suppress(pending.event, now));
                }
                self.last_released.remove(&symbol);
                out.released.push(event);
            }
            PipelineEvent::Updated(_) => {
                let last = self.last_released.get(&symbol).copied();
                let release_now = match last {
                    // Upgrades escalate immediately; downgrades wait.
                    Some((_, last_severity)) if event.severity() > last_severity => true,
                    Some((last_at, _)) => now - last_at >= self.window,
                    None => true,
                };

                if release_now {
                    if let Some(pending) = self.pending.remove(&symbol) {
                        out.suppressed.push(self.suppress(pending.event, now));
                    }
                    self.note_release(&event, now);
                    out.released.push(event);
                } else {
                    // The window counts from the last released notification,
                    // not from the first queued event.
                    let due_at = last
                        .map(|(at, _)| at + self.window)
                        .unwrap_or(now + self.window);
                    if let Some(replaced) = self.pending.insert(
                        symbol,
                        Pending { event, due_at },
                    ) {
                        out.suppressed.push(self.suppress(replaced.event, now));
                    }
                }
            }
        }

        self.sync_gauge();
        out
    }

    /// Release every pending update whose window has elapsed.
    pub fn due(&mut self, now: DateTime<Utc>) -> DebounceOutput {
        let mut out = DebounceOutput::default();
        let ready: Vec<Symbol> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due_at <= now)
            .map(|(s, _)| s.clone())
            .collect();

        for symbol in ready {
            if let Some(pending) = self.pending.remove(&symbol) {
                self.note_release(&pending.event, now);
                out.released.push(pending.event);
            }
        }

        self.sync_gauge();
        out
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.pending.values().map(|p| p.due_at).min()
    }

    #[allow(dead_code)]
    pub fn depth(&self) -> usize {
        self.pending.len()
    }
}

pub async fn run(
    mut debouncer: Debouncer,
    mut rx: mpsc::Receiver<PipelineEvent>,
    out_tx: mpsc::Sender<PipelineEvent>,
    persist: PersistHandle,
    cancel: CancellationToken,
) {
    loop {
        let wait = debouncer
            .next_deadline()
            .map(|due| (due - Utc::now()).to_std().unwrap_or(StdDuration::ZERO))
            .unwrap_or(IDLE_WAIT);

        let output = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => debouncer.on_event(event, Utc::now()),
                None => break,
            },
            _ = tokio::time::sleep(wait) => debouncer.due(Utc::now()),
        };

        for record in output.suppressed {
            persist.enqueue(PersistRequest::SaveNotification(record));
        }
        for event in output.released {
            let _ = out_tx.send(event).await;
        }
    }
    debug!("debouncer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ExchangeId, Opportunity, OpportunityClosed, OpportunityEvent, OpportunityStatus,
        DisappearReason,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn opportunity(severity: Severity, spread: Decimal) -> Opportunity {
        Opportunity {
            id: Uuid::nil(),
            symbol: Symbol::parse("ETHUSDT").unwrap(),
            long_exchange: ExchangeId::Okx,
            short_exchange: ExchangeId::Binance,
            entry_spread: spread,
            current_spread: spread,
            max_spread: spread,
            max_spread_at: at(0),
            first_detected_at: at(0),
            last_notified_at: Some(at(0)),
            notification_count: 1,
            severity,
            annualized_return: dec!(0.657),
            funding_interval_hours: 8,
            status: OpportunityStatus::Active,
        }
    }

    fn appeared(severity: Severity, now: DateTime<Utc>) -> PipelineEvent {
        PipelineEvent::Appeared(OpportunityEvent {
            opportunity: opportunity(severity, dec!(0.0006)),
            long_rate: dec!(-0.0003),
            short_rate: dec!(0.0003),
            next_funding_time: now + Duration::hours(1),
            at: now,
        })
    }

    fn updated(severity: Severity, spread: Decimal, now: DateTime<Utc>) -> PipelineEvent {
        PipelineEvent::Updated(OpportunityEvent {
            opportunity: opportunity(severity, spread),
            long_rate: dec!(-0.0003),
            short_rate: dec!(0.0003),
            next_funding_time: now + Duration::hours(1),
            at: now,
        })
    }

    fn disappeared(now: DateTime<Utc>) -> PipelineEvent {
        PipelineEvent::Disappeared(OpportunityClosed {
            opportunity: opportunity(Severity::Info, dec!(0.0006)),
            duration_ms: 10_000,
            disappear_reason: DisappearReason::RateDropped,
            at: now,
        })
    }

    fn debouncer() -> Debouncer {
        Debouncer::new(DEFAULT_DEBOUNCE_MS, Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn appeared_releases_immediately() {
        let mut d = debouncer();
        let out = d.on_event(appeared(Severity::Info, at(0)), at(0));
        assert_eq!(out.released.len(), 1);
        assert!(out.suppressed.is_empty());
        assert_eq!(d.depth(), 0);
    }

    #[test]
    fn updates_within_window_coalesce_to_one() {
        let mut d = debouncer();
        d.on_event(appeared(Severity::Info, at(0)), at(0));

        // Ten updates inside the 30s window: all queue, newer replaces older.
        let mut suppressed = 0;
        for i in 1..=10 {
            let out = d.on_event(
                updated(Severity::Info, dec!(0.0006), at(i)),
                at(i),
            );
            assert!(out.released.is_empty(), "update {i} must not release early");
            suppressed += out.suppressed.len();
        }
        assert_eq!(suppressed, 9);
        assert_eq!(d.depth(), 1);

        // Window measured from the appeared release at t=0.
        assert_eq!(d.next_deadline(), Some(at(30)));
        assert!(d.due(at(29)).released.is_empty());
        let out = d.due(at(30));
        assert_eq!(out.released.len(), 1);
        assert_eq!(d.depth(), 0);
    }

    #[test]
    fn severity_upgrade_releases_immediately() {
        let mut d = debouncer();
        d.on_event(appeared(Severity::Info, at(0)), at(0));
        d.on_event(updated(Severity::Info, dec!(0.0006), at(5)), at(5));

        let out = d.on_event(updated(Severity::Warning, dec!(0.0011), at(6)), at(6));
        assert_eq!(out.released.len(), 1);
        // The queued INFO update it overtook is recorded as suppressed.
        assert_eq!(out.suppressed.len(), 1);
        assert_eq!(
            out.suppressed[0].outcome,
            NotificationOutcome::SuppressedDebounce
        );
        assert_eq!(d.depth(), 0);
    }

    #[test]
    fn severity_downgrade_is_debounced() {
        let mut d = debouncer();
        d.on_event(appeared(Severity::Critical, at(0)), at(0));

        let out = d.on_event(updated(Severity::Warning, dec!(0.0011), at(5)), at(5));
        assert!(out.released.is_empty());
        assert_eq!(d.depth(), 1);
    }

    #[test]
    fn disappeared_releases_immediately_and_drops_pending() {
        let mut d = debouncer();
        d.on_event(appeared(Severity::Info, at(0)), at(0));
        d.on_event(updated(Severity::Info, dec!(0.0006), at(5)), at(5));
        assert_eq!(d.depth(), 1);

        let out = d.on_event(disappeared(at(6)), at(6));
        assert_eq!(out.released.len(), 1);
        assert_eq!(out.suppressed.len(), 1);
        assert_eq!(d.depth(), 0);
    }

    #[test]
    fn window_counts_from_last_release_not_first_queued() {
        let mut d = debouncer();
        d.on_event(appeared(Severity::Info, at(0)), at(0));
        // Queued at t=20: still due at t=30, not t=50.
        d.on_event(updated(Severity::Info, dec!(0.0006), at(20)), at(20));
        assert_eq!(d.next_deadline(), Some(at(30)));
    }

    #[test]
    fn update_after_window_expiry_releases_directly() {
        let mut d = debouncer();
        d.on_event(appeared(Severity::Info, at(0)), at(0));

        let out = d.on_event(updated(Severity::Info, dec!(0.0007), at(31)), at(31));
        assert_eq!(out.released.len(), 1);

        // The release resets the window.
        let out = d.on_event(updated(Severity::Info, dec!(0.0008), at(40)), at(40));
        assert!(out.released.is_empty());
        assert_eq!(d.next_deadline(), Some(at(61)));
    }

    #[tokio::test]
    async fn run_loop_releases_pending_after_window() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let backend = Arc::new(crate::persist::testing::MemoryPersistence::default());
        let (persist, _writer) = crate::persist::spawn_writer(backend, cancel.clone());

        // 100ms window keeps the test quick while exercising the timer path.
        let d = Debouncer::new(100, Arc::new(AtomicUsize::new(0)));
        let task = tokio::spawn(run(d, in_rx, out_tx, persist, cancel.clone()));

        let now = Utc::now();
        in_tx.send(appeared(Severity::Info, now)).await.unwrap();
        in_tx
            .send(updated(Severity::Info, dec!(0.0006), now))
            .await
            .unwrap();

        let first = tokio::time::timeout(StdDuration::from_secs(2), out_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(first.kind(), "appeared");

        let second = tokio::time::timeout(StdDuration::from_secs(2), out_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(second.kind(), "updated");

        cancel.cancel();
        let _ = task.await;
    }
}
