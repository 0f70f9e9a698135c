//! # mx-runner
//!
//! Entry point for the market-data sync layer.
//!
//! Loads a JSON configuration file, opens the streaming connection, seeds
//! every configured instrument from the REST backend, subscribes to the live
//! topics and periodically logs the merged state until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! mx-runner config.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mx_core::config::AppConfig;
use mx_core::logging::{LogSettings, init_logging};
use mx_core::source::{EnvToken, StaticToken, TokenProvider};
use mx_core::ws::{WsConnConfig, WsConnector};
use mx_rest::HttpMarketSource;
use mx_sync::{BackoffPolicy, ConnectOptions, ConnectionManager, MarketSync, SyncOptions};
use tracing::{info, warn};

/// Market data sync runner.
#[derive(Parser)]
#[command(name = "mx-runner", about = "Real-time market data sync runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,

    /// Seconds between state summaries.
    #[arg(long, default_value_t = 30)]
    report_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = mx_core::config::load_config(&cli.config)?;

    // 2. Initialize logging
    let module_name = config.module_name();
    let log_dir = cli.log_dir.clone().or_else(|| config.app.log_path.clone());
    init_logging(&LogSettings {
        level: &cli.log_level,
        dir: log_dir.as_deref(),
        file_prefix: &module_name,
        json: config.app.log_json,
    });

    info!(
        "{module_name} starting, config={} log_level={}",
        cli.config.display(),
        cli.log_level
    );
    info!(
        "config loaded: {} instrument(s), rest={}, reconnect={}",
        config.instruments.len(),
        config.rest.is_some(),
        config.reconnect.enabled
    );

    // 3. Build the service
    let sync = build_service(&config)?;
    let supervisor = config
        .reconnect
        .enabled
        .then(|| sync.spawn_supervisor(BackoffPolicy::from(&config.reconnect)));

    // 4. Connect, seed and subscribe
    if let Err(e) = sync.connect().await {
        warn!("initial connect failed: {e}");
    }
    seed_and_watch(&sync, &config).await;

    info!("running, press Ctrl+C to stop");

    // 5. Report until shutdown
    let mut report = tokio::time::interval(Duration::from_secs(cli.report_secs.max(1)));
    loop {
        tokio::select! {
            _ = report.tick() => log_summary(&sync, &config).await,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown signal received");
                break;
            }
        }
    }

    // 6. Tear down
    if let Some(supervisor) = supervisor {
        supervisor.stop().await;
    }
    sync.disconnect().await;

    info!("stopped");
    Ok(())
}

fn build_service(config: &AppConfig) -> Result<MarketSync> {
    let token: Arc<dyn TokenProvider> = match &config.stream.token_env {
        Some(var) => Arc::new(EnvToken::new(var.clone())),
        None => Arc::new(StaticToken(None)),
    };

    let connector = Arc::new(WsConnector::new(WsConnConfig {
        url: config.stream.url.clone(),
        extra_headers: config.stream.extra_headers.clone(),
        heartbeat_interval: config.stream.heartbeat_interval(),
    }));

    let connection = ConnectionManager::new(
        connector,
        Arc::clone(&token),
        ConnectOptions::from(&config.stream),
    );
    let mut sync = MarketSync::new(connection, SyncOptions::from(&config.aggregation));

    if let Some(rest) = &config.rest {
        sync = sync.with_source(Arc::new(HttpMarketSource::new(rest, token)?));
        info!("rest source at {}", rest.base_url);
    }
    Ok(sync)
}

async fn seed_and_watch(sync: &MarketSync, config: &AppConfig) {
    for symbol in &config.instruments {
        if config.rest.is_some() {
            if let Err(e) = sync.refresh_quote(symbol).await {
                warn!("[{symbol}] quote snapshot failed: {e}");
            }
        }

        if sync.watch_instrument(symbol).await.is_none() {
            warn!("[{symbol}] not subscribed, data stays stale");
        }
    }

    if config.index_topic && sync.watch_index().await.is_none() {
        warn!("index topic not subscribed");
    }

    if let Some(chart) = &config.chart {
        if config.rest.is_some() {
            match sync.load_history(&chart.instrument, chart.resolution).await {
                Ok(n) => info!("[{}] loaded {n} {} candles", chart.instrument, chart.resolution.as_str()),
                Err(e) => warn!("[{}] history load failed: {e}", chart.instrument),
            }
        }
        let rebuilt = sync.focus_chart(&chart.instrument, chart.resolution);
        info!(
            "[{}] chart focused at {}, {rebuilt} live candle(s)",
            chart.instrument,
            chart.resolution.as_str()
        );
    }
}

async fn log_summary(sync: &MarketSync, config: &AppConfig) {
    for price in sync.last_prices() {
        let state = sync.feed_state(&price.ticker).await;
        info!(
            "[{}] {:.4} {:+.4} ({:+.2}%) vol={:.0} {state:?}",
            price.ticker, price.price, price.change, price.change_percent, price.volume
        );
    }

    if let Some(chart) = &config.chart {
        let series = sync.series(&chart.instrument, chart.resolution);
        match series.last() {
            Some(last) => info!("[{}] {} candles, last {last}", chart.instrument, series.len()),
            None => info!("[{}] no candles yet", chart.instrument),
        }
    }
}
