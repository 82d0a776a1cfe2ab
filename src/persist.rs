pub mod sqlite;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use error_stack::Report;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PersistError;
use crate::model::{NotificationRecord, Opportunity, OpportunityHistory};

pub const DEFAULT_QUEUE_CAP: usize = 256;
/// Records buffered across backend outages before drop-oldest kicks in.
const RETRY_BUFFER_CAP: usize = 512;
/// Writes already begun may finish within this deadline at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Narrow write-side port the pipeline invokes. The rest of the product
/// owns reads.
pub trait Persistence: Send + Sync {
    fn save_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> BoxFuture<'_, Result<(), Report<PersistError>>>;

    fn update_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> BoxFuture<'_, Result<(), Report<PersistError>>>;

    fn save_history(
        &self,
        history: &OpportunityHistory,
    ) -> BoxFuture<'_, Result<(), Report<PersistError>>>;

    fn save_notification(
        &self,
        record: &NotificationRecord,
    ) -> BoxFuture<'_, Result<(), Report<PersistError>>>;
}

#[derive(Debug, Clone)]
pub enum PersistRequest {
    SaveOpportunity(Opportunity),
    UpdateOpportunity(Opportunity),
    SaveHistory(OpportunityHistory),
    SaveNotification(NotificationRecord),
}

/// Fire-and-forget entry point into the single writer task. Queue order is
/// submission order, which preserves save-before-update-before-history per
/// opportunity because each opportunity has a single emitting shard.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<PersistRequest>,
    dropped: Arc<AtomicU64>,
}

impl PersistHandle {
    pub fn enqueue(&self, request: PersistRequest) {
        if self.tx.try_send(request).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn spawn_writer(
    backend: Arc<dyn Persistence>,
    cancel: CancellationToken,
) -> (PersistHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAP);
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = PersistHandle {
        tx,
        dropped: Arc::clone(&dropped),
    };
    let task = tokio::spawn(writer_loop(backend, rx, dropped, cancel));
    (handle, task)
}

async fn writer_loop(
    backend: Arc<dyn Persistence>,
    mut rx: mpsc::Receiver<PersistRequest>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut retry: VecDeque<PersistRequest> = VecDeque::new();

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        process(backend.as_ref(), request, &mut retry, &dropped).await;
    }

    // Cooperative drain: whatever is already queued gets a bounded chance
    // to land before the process exits.
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN, async {
        while let Some(front) = retry.pop_front() {
            if apply(backend.as_ref(), &front).await.is_err() {
                return;
            }
        }
        while let Ok(request) = rx.try_recv() {
            if apply(backend.as_ref(), &request).await.is_err() {
                return;
            }
        }
    })
    .await;
    debug!("persistence writer stopped");
}

async fn process(
    backend: &dyn Persistence,
    request: PersistRequest,
    retry: &mut VecDeque<PersistRequest>,
    dropped: &AtomicU64,
) {
    // Older buffered records must land first to keep causal order.
    while let Some(front) = retry.front() {
        if apply(backend, front).await.is_ok() {
            retry.pop_front();
        } else {
            break;
        }
    }

    if retry.is_empty() {
        if let Err(report) = apply(backend, &request).await {
            warn!(error = ?report, "persistence write failed, buffering");
            retry.push_back(request);
        }
        return;
    }

    retry.push_back(request);
    while retry.len() > RETRY_BUFFER_CAP {
        retry.pop_front();
        dropped.fetch_add(1, Ordering::Relaxed);
    }
}

async fn apply(
    backend: &dyn Persistence,
    request: &PersistRequest,
) -> Result<(), Report<PersistError>> {
    match request {
        PersistRequest::SaveOpportunity(opp) => backend.save_opportunity(opp).await,
        PersistRequest::UpdateOpportunity(opp) => backend.update_opportunity(opp).await,
        PersistRequest::SaveHistory(history) => backend.save_history(history).await,
        PersistRequest::SaveNotification(record) => backend.save_notification(record).await,
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory backend recording every write, optionally failing.
    #[derive(Default)]
    pub struct MemoryPersistence {
        pub writes: Mutex<Vec<String>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl MemoryPersistence {
        fn record(&self, label: String) -> Result<(), Report<PersistError>> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Report::new(PersistError::Write));
            }
            self.writes.lock().push(label);
            Ok(())
        }
    }

    impl Persistence for MemoryPersistence {
        fn save_opportunity(
            &self,
            opportunity: &Opportunity,
        ) -> BoxFuture<'_, Result<(), Report<PersistError>>> {
            let label = format!("save:{}", opportunity.id);
            Box::pin(async move { self.record(label) })
        }

        fn update_opportunity(
            &self,
            opportunity: &Opportunity,
        ) -> BoxFuture<'_, Result<(), Report<PersistError>>> {
            let label = format!("update:{}", opportunity.id);
            Box::pin(async move { self.record(label) })
        }

        fn save_history(
            &self,
            history: &OpportunityHistory,
        ) -> BoxFuture<'_, Result<(), Report<PersistError>>> {
            let label = format!("history:{}", history.opportunity_id);
            Box::pin(async move { self.record(label) })
        }

        fn save_notification(
            &self,
            record: &NotificationRecord,
        ) -> BoxFuture<'_, Result<(), Report<PersistError>>> {
            let label = format!("notification:{}:{}", record.channel, record.outcome.as_str());
            Box::pin(async move { self.record(label) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryPersistence;
    use super::*;
    use crate::model::{ExchangeId, OpportunityStatus, Severity};
    use crate::symbol::Symbol;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn opportunity() -> Opportunity {
        Opportunity {
            id: Uuid::new_v4(),
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            long_exchange: ExchangeId::Okx,
            short_exchange: ExchangeId::Binance,
            entry_spread: dec!(0.0006),
            current_spread: dec!(0.0006),
            max_spread: dec!(0.0006),
            max_spread_at: Utc::now(),
            first_detected_at: Utc::now(),
            last_notified_at: Some(Utc::now()),
            notification_count: 1,
            severity: Severity::Info,
            annualized_return: dec!(0.657),
            funding_interval_hours: 8,
            status: OpportunityStatus::Active,
        }
    }

    #[tokio::test]
    async fn writer_preserves_causal_order_per_opportunity() {
        let backend = Arc::new(MemoryPersistence::default());
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_writer(backend.clone(), cancel.clone());

        let opp = opportunity();
        handle.enqueue(PersistRequest::SaveOpportunity(opp.clone()));
        handle.enqueue(PersistRequest::UpdateOpportunity(opp.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = task.await;

        let writes = backend.writes.lock().clone();
        assert_eq!(
            writes,
            vec![format!("save:{}", opp.id), format!("update:{}", opp.id)]
        );
    }

    #[tokio::test]
    async fn backend_outage_buffers_then_replays_in_order() {
        let backend = Arc::new(MemoryPersistence::default());
        backend.fail.store(true, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (handle, task) = spawn_writer(backend.clone(), cancel.clone());

        let opp = opportunity();
        handle.enqueue(PersistRequest::SaveOpportunity(opp.clone()));
        handle.enqueue(PersistRequest::UpdateOpportunity(opp.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.writes.lock().is_empty());

        // Backend recovers; the next write flushes the buffer first.
        backend.fail.store(false, Ordering::Relaxed);
        handle.enqueue(PersistRequest::SaveNotification(NotificationRecord {
            opportunity_id: opp.id,
            channel: "terminal".into(),
            severity: Severity::Info,
            delivered_at: Utc::now(),
            outcome: crate::model::NotificationOutcome::Sent,
            error_kind: None,
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = task.await;

        let writes = backend.writes.lock().clone();
        assert_eq!(
            writes,
            vec![
                format!("save:{}", opp.id),
                format!("update:{}", opp.id),
                "notification:terminal:SENT".to_owned(),
            ]
        );
        assert_eq!(handle.dropped(), 0);
    }
}
