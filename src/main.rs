mod cache;
mod config;
mod debounce;
mod detector;
mod error;
mod exchange;
mod health;
mod model;
mod notify;
mod persist;
mod source;
mod symbol;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cache::RateCache;
use config::{AppConfig, NotificationSection};
use debounce::Debouncer;
use detector::best_candidate;
use exchange::Exchange;
use exchange::bingx::BingxExchange;
use exchange::binance::BinanceExchange;
use exchange::gateio::GateioExchange;
use exchange::mexc::MexcExchange;
use exchange::okx::OkxExchange;
use health::HealthMonitor;
use model::{ExchangeId, LinkState, RateTick};
use notify::NotificationFanout;
use notify::log::LogChannel;
use notify::telegram::TelegramChannel;
use notify::terminal::TerminalChannel;
use notify::webhook::WebhookChannel;
use persist::sqlite::SqlitePersistence;
use source::DataSourceManager;
use symbol::Symbol;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const INTERVAL_REFRESH_CHECK: Duration = Duration::from_secs(3600);

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("no exchange client initialised")]
    Startup,
    #[display("runtime error")]
    Runtime,
}

/// Exit codes: 0 normal shutdown, 1 fatal configuration error,
/// 2 unrecoverable startup. 3 is reserved for a local admin endpoint
/// failing to bind; this build runs none.
fn exit_code(error: &AppError) -> i32 {
    match error {
        AppError::Config => 1,
        AppError::Startup => 2,
        AppError::Runtime => 1,
    }
}

#[derive(Parser)]
#[command(
    name = "funding-notifier",
    about = "Cross-exchange perpetual funding-rate arbitrage monitor"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live monitoring pipeline
    Watch,
    /// One-shot REST snapshot of funding rates across exchanges
    Rates,
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(exit_code(report.current_context()));
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => run_watch(&config).await,
        Command::Rates => run_rates(&config).await,
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn build_exchanges(ids: &[ExchangeId]) -> Vec<Arc<dyn Exchange>> {
    ids.iter()
        .map(|id| match id {
            ExchangeId::Binance => Arc::new(BinanceExchange::new()) as Arc<dyn Exchange>,
            ExchangeId::Okx => Arc::new(OkxExchange::new()) as Arc<dyn Exchange>,
            ExchangeId::Gateio => Arc::new(GateioExchange::new()) as Arc<dyn Exchange>,
            ExchangeId::Mexc => Arc::new(MexcExchange::new()) as Arc<dyn Exchange>,
            ExchangeId::Bingx => Arc::new(BingxExchange::new()) as Arc<dyn Exchange>,
        })
        .collect()
}

fn build_channels(section: &NotificationSection) -> Vec<Arc<dyn notify::NotifyChannel>> {
    let mut channels: Vec<Arc<dyn notify::NotifyChannel>> = Vec::new();
    for channel in section.channels.iter().filter(|c| c.enabled) {
        match channel.kind.as_str() {
            "terminal" => channels.push(Arc::new(TerminalChannel)),
            "log" => channels.push(Arc::new(LogChannel)),
            "webhook" => {
                if let Some(url) = &channel.url {
                    channels.push(Arc::new(WebhookChannel::new(url.clone())));
                }
            }
            "telegram" => {
                if let (Some(token), Some(chat_id)) = (&channel.bot_token, &channel.chat_id) {
                    channels.push(Arc::new(TelegramChannel::new(
                        token.clone(),
                        chat_id.clone(),
                    )));
                }
            }
            other => warn!(kind = other, "unknown notification channel, skipping"),
        }
    }

    if channels.is_empty() {
        channels.push(Arc::new(TerminalChannel));
    }
    channels
}

/// Fetch funding intervals once per exchange. Marks unlisted symbols
/// unsupported as a side effect and reports how many clients came up.
async fn startup_probe(exchanges: &[Arc<dyn Exchange>]) -> usize {
    let probes = exchanges.iter().map(|exchange| async move {
        match exchange.fetch_funding_intervals().await {
            Ok(intervals) => {
                info!(
                    exchange = %exchange.id(),
                    markets = intervals.len(),
                    "funding intervals loaded"
                );
                exchange.intervals().replace(intervals, Utc::now());
                true
            }
            Err(report) => {
                warn!(exchange = %exchange.id(), error = ?report, "startup probe failed");
                false
            }
        }
    });

    futures::future::join_all(probes)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count()
}

async fn interval_refresh_loop(exchanges: Vec<Arc<dyn Exchange>>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(INTERVAL_REFRESH_CHECK);
    ticker.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for exchange in &exchanges {
            if !exchange.intervals().needs_refresh(Utc::now()) {
                continue;
            }
            match exchange.fetch_funding_intervals().await {
                Ok(intervals) => exchange.intervals().replace(intervals, Utc::now()),
                Err(report) => {
                    warn!(exchange = %exchange.id(), error = ?report, "interval refresh failed");
                }
            }
        }
    }
}

async fn run_watch(config: &AppConfig) -> Result<(), Report<AppError>> {
    let exchange_ids = config.exchange_ids();
    let symbols = config.watch_symbols();
    let exchanges = build_exchanges(&exchange_ids);

    for exchange in &exchanges {
        exchange.subscriptions().subscribe(&symbols);
    }

    let initialised = startup_probe(&exchanges).await;
    if initialised == 0 {
        return Err(Report::new(AppError::Startup));
    }
    info!(
        exchanges = exchanges.len(),
        initialised,
        symbols = symbols.len(),
        "startup probe complete"
    );

    let db_path = format!("{}/funding-notifier.db", config.general.data_dir);
    let persistence = Arc::new(
        SqlitePersistence::open(Path::new(&db_path))
            .await
            .change_context(AppError::Startup)?,
    );

    let cancel = CancellationToken::new();
    let (persist_handle, persist_task) = persist::spawn_writer(persistence, cancel.clone());

    let cache = Arc::new(RateCache::new(config.cache_config()));
    let manager = Arc::new(DataSourceManager::new(
        &exchange_ids,
        config.source_config(),
    ));
    for exchange in config.ws_disabled_ids() {
        info!(exchange = %exchange, "websocket disabled by config, polling REST only");
        manager.disable_ws(exchange);
    }

    let fanout = Arc::new(NotificationFanout::new(
        build_channels(&config.notification),
        config.notification.verbosity,
        persist_handle.clone(),
    ));
    for (channel, healthy) in fanout.health_check().await {
        if healthy {
            info!(channel, "notification channel ready");
        } else {
            warn!(channel, "notification channel failed health check");
        }
    }

    let detector_cfg = config.detector_config();
    let (events_tx, events_rx) = mpsc::channel(detector_cfg.queue_cap);
    let (released_tx, released_rx) = mpsc::channel(256);
    let (conn_tx, mut conn_rx) = mpsc::channel(256);

    let registry: HashMap<ExchangeId, Arc<dyn Exchange>> = exchanges
        .iter()
        .map(|e| (e.id(), Arc::clone(e)))
        .collect();
    let detector = detector::spawn(
        detector_cfg,
        Arc::clone(&cache),
        registry,
        Arc::clone(&manager),
        events_tx,
        persist_handle.clone(),
        cancel.clone(),
    );

    let mut task_handles = detector.tasks;

    let debounce_depth = Arc::new(AtomicUsize::new(0));
    let debouncer = Debouncer::new(config.detector.debounce_ms, Arc::clone(&debounce_depth));
    task_handles.push(tokio::spawn(debounce::run(
        debouncer,
        events_rx,
        released_tx,
        persist_handle.clone(),
        cancel.clone(),
    )));

    task_handles.push(tokio::spawn(notify::run(
        Arc::clone(&fanout),
        released_rx,
        cancel.clone(),
    )));

    for exchange in &exchanges {
        task_handles.push(tokio::spawn(source::run_exchange_pipeline(
            Arc::clone(exchange),
            Arc::clone(&manager),
            detector.intake_tx.clone(),
            conn_tx.clone(),
            cancel.clone(),
            config.source_config().poll_interval,
        )));
    }
    drop(conn_tx);

    let conn_manager = Arc::clone(&manager);
    task_handles.push(tokio::spawn(async move {
        while let Some(event) = conn_rx.recv().await {
            conn_manager.note_connectivity(&event, Utc::now());
            match event.state {
                LinkState::Up => info!(
                    exchange = %event.exchange,
                    transport = %event.transport,
                    "transport up"
                ),
                LinkState::Down => warn!(
                    exchange = %event.exchange,
                    transport = %event.transport,
                    reason = %event.reason,
                    "transport down"
                ),
            }
        }
    }));

    task_handles.push(tokio::spawn(interval_refresh_loop(
        exchanges.clone(),
        cancel.clone(),
    )));

    let monitor = HealthMonitor::new(
        Arc::clone(&cache),
        Arc::clone(&manager),
        detector.active_opportunities,
        debounce_depth,
        detector.dropped_ticks,
        detector.dropped_events,
        persist_handle.clone(),
        fanout.channel_stats(),
        config.report_interval(),
    );
    task_handles.push(tokio::spawn(monitor.run(cancel.clone())));

    info!("pipeline running, press ctrl+c to stop");
    tokio::signal::ctrl_c()
        .await
        .change_context(AppError::Runtime)?;

    info!("ctrl+c received, shutting down");
    cancel.cancel();

    for handle in task_handles {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
    }
    // The writer drains in-flight records on its own 2s deadline.
    let _ = tokio::time::timeout(Duration::from_secs(3), persist_task).await;

    info!("shutdown complete");
    Ok(())
}

async fn run_rates(config: &AppConfig) -> Result<(), Report<AppError>> {
    let symbols = config.watch_symbols();
    let exchanges = build_exchanges(&config.exchange_ids());
    for exchange in &exchanges {
        exchange.subscriptions().subscribe(&symbols);
    }

    let initialised = startup_probe(&exchanges).await;
    if initialised == 0 {
        return Err(Report::new(AppError::Startup));
    }

    let fetches = exchanges.iter().map(|exchange| async move {
        let pollable = exchange.subscriptions().pollable_symbols();
        match exchange.fetch_funding(&pollable).await {
            Ok(ticks) => ticks,
            Err(report) => {
                warn!(exchange = %exchange.id(), error = ?report, "rates fetch failed");
                Vec::new()
            }
        }
    });
    let all_ticks: Vec<RateTick> = futures::future::join_all(fetches)
        .await
        .into_iter()
        .flatten()
        .collect();

    let mut by_symbol: HashMap<Symbol, Vec<RateTick>> = HashMap::new();
    for tick in all_ticks {
        println!(
            "{:<10} {:<8} rate={:<12} interval={}h next={}",
            tick.symbol,
            tick.exchange,
            tick.funding_rate,
            tick.funding_interval_hours,
            tick.next_funding_time.format("%H:%M:%SZ"),
        );
        by_symbol.entry(tick.symbol.clone()).or_default().push(tick);
    }

    let mut spread_symbols: Vec<&Symbol> = by_symbol
        .iter()
        .filter(|(_, ticks)| ticks.len() >= 2)
        .map(|(symbol, _)| symbol)
        .collect();
    spread_symbols.sort();

    for symbol in spread_symbols {
        if let Some(candidate) = best_candidate(&by_symbol[symbol]) {
            println!(
                "{symbol}: long {} short {} spread={} annualized={}",
                candidate.long.exchange,
                candidate.short.exchange,
                candidate.spread,
                candidate.annualized(),
            );
        }
    }

    Ok(())
}
