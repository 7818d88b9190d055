use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use statarb::backtest;
use statarb::config::BacktestConfig;
use statarb::market_data::{PriceTable, SignalTable};
use statarb::report::{self, PerformanceReport};
use statarb::selection;
use std::env;
use std::io::Write;
use std::str::FromStr;

fn main() -> std::io::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .expect("Invalid TIMEZONE_OFFSET");
    let offset = FixedOffset::east_opt(offset_seconds).expect("Invalid offset");
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();

    log::info!("Starting stat-arb backtest...");
    let cfg = BacktestConfig::from_env_or_yaml().expect("invalid backtest config");
    run(&cfg).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

fn run(cfg: &BacktestConfig) -> anyhow::Result<()> {
    let prices = PriceTable::load(cfg)?;
    prices.log_stats(&cfg.universe);
    prices.warn_short_series(cfg);

    let signals = SignalTable::load(&cfg.signals_file)?;
    log::info!(
        "loaded mispricing indices for {} weeks from {}",
        signals.week_count(),
        cfg.signals_file
    );

    let selections = selection::select_all_weeks(&prices, cfg);
    let outcome = backtest::run_backtest(cfg, &prices, &selections, &signals)?;

    let performance = PerformanceReport::from_outcome(&outcome, cfg);
    performance.log_summary();
    if let Some(path) = &cfg.trajectory_file {
        report::write_trajectory_csv(path, &outcome)?;
    }
    if let Some(path) = &cfg.summary_file {
        report::write_weekly_summary_csv(path, &outcome)?;
    }
    Ok(())
}
