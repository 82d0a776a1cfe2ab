use std::path::Path;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};

use crate::error::PersistError;
use crate::model::{NotificationRecord, Opportunity, OpportunityHistory};
use crate::persist::Persistence;

/// Readers (operator tooling, ad-hoc queries on the db file) may hold the
/// database while the writer commits; wait this long before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Open (or create) the database file and bring the schema up to date.
    ///
    /// WAL mode lets the single writer task append without blocking anyone
    /// reading the same file, and under WAL `synchronous = NORMAL` keeps
    /// commits durable across crashes without an fsync per record.
    pub async fn open(path: &Path) -> Result<Self, Report<PersistError>> {
        // A bare filename has an empty parent; create_dir_all("") errors.
        let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = parent {
            std::fs::create_dir_all(dir)
                .change_context(PersistError::Migration)
                .attach_with(|| format!("creating {}", dir.display()))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        Self::connect(SqlitePoolOptions::new(), opts)
            .await
            .attach_with(|| format!("database: {}", path.display()))
    }

    /// In-memory database for tests. Capped to one connection: every
    /// SQLite `:memory:` connection is a separate database.
    pub async fn open_in_memory() -> Result<Self, Report<PersistError>> {
        let opts = SqliteConnectOptions::new().filename(":memory:");
        Self::connect(SqlitePoolOptions::new().max_connections(1), opts).await
    }

    async fn connect(
        pool_opts: SqlitePoolOptions,
        opts: SqliteConnectOptions,
    ) -> Result<Self, Report<PersistError>> {
        let pool = pool_opts
            .connect_with(opts)
            .await
            .change_context(PersistError::Migration)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(PersistError::Migration)?;

        Ok(Self { pool })
    }

    async fn upsert_opportunity(&self, opp: &Opportunity) -> Result<(), Report<PersistError>> {
        sqlx::query(
            "INSERT OR REPLACE INTO opportunities \
             (id, symbol, long_exchange, short_exchange, entry_spread, current_spread, \
              max_spread, max_spread_at, first_detected_at, last_notified_at, \
              notification_count, severity, annualized_return, funding_interval_hours, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(opp.id.to_string())
        .bind(opp.symbol.as_str())
        .bind(opp.long_exchange.to_string())
        .bind(opp.short_exchange.to_string())
        .bind(opp.entry_spread.to_string())
        .bind(opp.current_spread.to_string())
        .bind(opp.max_spread.to_string())
        .bind(opp.max_spread_at.to_rfc3339())
        .bind(opp.first_detected_at.to_rfc3339())
        .bind(opp.last_notified_at.map(|t| t.to_rfc3339()))
        .bind(opp.notification_count as i64)
        .bind(opp.severity.to_string())
        .bind(opp.annualized_return.to_string())
        .bind(opp.funding_interval_hours as i64)
        .bind(opp.status.as_str())
        .execute(&self.pool)
        .await
        .change_context(PersistError::Write)?;
        Ok(())
    }
}

impl Persistence for SqlitePersistence {
    fn save_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> BoxFuture<'_, Result<(), Report<PersistError>>> {
        let opportunity = opportunity.clone();
        Box::pin(async move { self.upsert_opportunity(&opportunity).await })
    }

    fn update_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> BoxFuture<'_, Result<(), Report<PersistError>>> {
        let opportunity = opportunity.clone();
        Box::pin(async move { self.upsert_opportunity(&opportunity).await })
    }

    fn save_history(
        &self,
        history: &OpportunityHistory,
    ) -> BoxFuture<'_, Result<(), Report<PersistError>>> {
        let history = history.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO opportunity_history \
                 (opportunity_id, symbol, long_exchange, short_exchange, duration_ms, \
                  max_spread, average_spread, disappear_reason, notification_count, ended_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(history.opportunity_id.to_string())
            .bind(history.symbol.as_str())
            .bind(history.long_exchange.to_string())
            .bind(history.short_exchange.to_string())
            .bind(history.duration_ms)
            .bind(history.max_spread.to_string())
            .bind(history.average_spread.to_string())
            .bind(history.disappear_reason.as_str())
            .bind(history.notification_count as i64)
            .bind(history.ended_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(PersistError::Write)?;
            Ok(())
        })
    }

    fn save_notification(
        &self,
        record: &NotificationRecord,
    ) -> BoxFuture<'_, Result<(), Report<PersistError>>> {
        let record = record.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO notifications \
                 (opportunity_id, channel, severity, delivered_at, outcome, error_kind) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(record.opportunity_id.to_string())
            .bind(&record.channel)
            .bind(record.severity.to_string())
            .bind(record.delivered_at.to_rfc3339())
            .bind(record.outcome.as_str())
            .bind(record.error_kind.as_deref())
            .execute(&self.pool)
            .await
            .change_context(PersistError::Write)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DisappearReason, ExchangeId, NotificationOutcome, OpportunityStatus, Severity,
    };
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
            current_spread: dec!(0.0007),
            max_spread: dec!(0.0008),
            max_spread_at: Utc::now(),
            first_detected_at: Utc::now(),
            last_notified_at: None,
            notification_count: 1,
            severity: Severity::Warning,
            annualized_return: dec!(0.657),
            funding_interval_hours: 8,
            status: OpportunityStatus::Active,
        }
    }

    #[tokio::test]
    async fn save_then_update_keeps_single_row() {
        let store = SqlitePersistence::open_in_memory().await.unwrap();
        let mut opp = opportunity();
        store.save_opportunity(&opp).await.unwrap();

        opp.current_spread = dec!(0.0009);
        opp.status = OpportunityStatus::Expired;
        store.update_opportunity(&opp).await.unwrap();

        let (count, spread, status): (i64, String, String) = sqlx::query_as(
            "SELECT COUNT(*), MAX(current_spread), MAX(status) FROM opportunities",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(spread, "0.0009");
        assert_eq!(status, "EXPIRED");
    }

    #[tokio::test]
    async fn history_and_notifications_are_append_only() {
        let store = SqlitePersistence::open_in_memory().await.unwrap();
        let opp = opportunity();

        let history = OpportunityHistory {
            opportunity_id: opp.id,
            symbol: opp.symbol.clone(),
            long_exchange: opp.long_exchange,
            short_exchange: opp.short_exchange,
            duration_ms: 12_500,
            max_spread: dec!(0.0008),
            average_spread: dec!(0.00065),
            disappear_reason: DisappearReason::RateDropped,
            notification_count: 3,
            ended_at: Utc::now(),
        };
        store.save_history(&history).await.unwrap();
        store.save_history(&history).await.unwrap();

        let record = NotificationRecord {
            opportunity_id: opp.id,
            channel: "webhook".into(),
            severity: Severity::Warning,
            delivered_at: Utc::now(),
            outcome: NotificationOutcome::Failed,
            error_kind: Some("timeout".into()),
        };
        store.save_notification(&record).await.unwrap();

        let history_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM opportunity_history")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(history_count.0, 2);

        let (outcome, error_kind): (String, Option<String>) =
            sqlx::query_as("SELECT outcome, error_kind FROM notifications")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(outcome, "FAILED");
        assert_eq!(error_kind.as_deref(), Some("timeout"));
    }
}
