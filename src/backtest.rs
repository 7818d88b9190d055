use anyhow::{bail, Context, Result};

use crate::config::BacktestConfig;
use crate::market_data::{PriceTable, SignalTable};
use crate::selection::WeekSelection;
use crate::strategy::{StrategyError, WeekStrategy, HOURS_PER_WEEK};

/// One driven week: its hour-by-hour value trajectory, the terminal value
/// minus the incoming value, and the leg trades executed.
#[derive(Debug, Clone)]
pub struct WeekResult {
    pub week: usize,
    pub values: Vec<f64>,
    pub net_change: f64,
    pub trades: u32,
}

/// Aggregated result of the whole run, the contract the reporter consumes.
#[derive(Debug, Clone)]
pub struct BacktestOutcome {
    pub weekly: Vec<WeekResult>,
    pub cumulative_net: Vec<f64>,
    pub total_net_change: f64,
    pub total_trades: u64,
    pub initial_capital: f64,
}

impl BacktestOutcome {
    pub fn final_value(&self) -> f64 {
        self.initial_capital + self.total_net_change
    }

    /// Weekly-sampled portfolio values (initial capital plus cumulative net),
    /// the series the performance statistics are computed on.
    pub fn weekly_closing_values(&self) -> Vec<f64> {
        self.cumulative_net
            .iter()
            .map(|net| self.initial_capital + net)
            .collect()
    }
}

/// Running aggregates folded across weeks. The only state that crosses a
/// week boundary is the scalar incoming value; position state never does.
#[derive(Debug)]
struct Accumulator {
    value: f64,
    total_net: f64,
    total_trades: u64,
    cumulative_net: Vec<f64>,
    weekly: Vec<WeekResult>,
}

impl Accumulator {
    fn new(initial_capital: f64, weeks: usize) -> Self {
        Self {
            value: initial_capital,
            total_net: 0.0,
            total_trades: 0,
            cumulative_net: Vec::with_capacity(weeks),
            weekly: Vec::with_capacity(weeks),
        }
    }

    fn push(&mut self, result: WeekResult) {
        if let Some(terminal) = result.values.last() {
            self.value = *terminal;
        }
        self.total_net += result.net_change;
        self.total_trades += u64::from(result.trades);
        self.cumulative_net.push(self.total_net);
        self.weekly.push(result);
    }

    fn finish(self, initial_capital: f64) -> BacktestOutcome {
        BacktestOutcome {
            weekly: self.weekly,
            cumulative_net: self.cumulative_net,
            total_net_change: self.total_net,
            total_trades: self.total_trades,
            initial_capital,
        }
    }
}

/// Drive the weekly engine over the whole schedule in order. A week without
/// a selected pair holds the portfolio flat; an engine error aborts the run,
/// since skipping a week would corrupt the value continuity.
pub fn run_backtest(
    cfg: &BacktestConfig,
    prices: &PriceTable,
    selections: &[Option<WeekSelection>],
    signals: &SignalTable,
) -> Result<BacktestOutcome> {
    if selections.len() != cfg.trading_weeks {
        bail!(
            "selection schedule covers {} weeks, expected {}",
            selections.len(),
            cfg.trading_weeks
        );
    }
    let mut acc = Accumulator::new(cfg.initial_capital, cfg.trading_weeks);
    for (week, selection) in selections.iter().enumerate() {
        let incoming = acc.value;
        let result = match selection {
            Some(pair) => simulate_week(cfg, prices, signals, pair, week, incoming)
                .with_context(|| format!("backtest aborted in week {}", week))?,
            None => flat_week(week, incoming),
        };
        log::debug!(
            "week {:>3}: trades={:<2} net={:+.2} value={:.2}",
            week,
            result.trades,
            result.net_change,
            incoming + result.net_change
        );
        acc.push(result);
    }
    let outcome = acc.finish(cfg.initial_capital);
    log::info!(
        "backtest finished: {} weeks, {} leg trades, net change {:+.2}",
        cfg.trading_weeks,
        outcome.total_trades,
        outcome.total_net_change
    );
    Ok(outcome)
}

fn simulate_week(
    cfg: &BacktestConfig,
    prices: &PriceTable,
    signals: &SignalTable,
    pair: &WeekSelection,
    week: usize,
    incoming: f64,
) -> Result<WeekResult> {
    let week_signals = signals.week(week).ok_or_else(|| StrategyError::DataFormat {
        week,
        hour: 0,
        detail: format!(
            "no mispricing index for selected pair {}/{}",
            pair.coins[0], pair.coins[1]
        ),
    })?;
    let engine = WeekStrategy::new(
        prices,
        pair,
        week_signals,
        week,
        cfg.week_offset(week),
        cfg.entry_threshold,
        cfg.close_threshold,
        incoming,
    )?;
    let outcome = engine.run()?;
    let terminal = outcome.values[HOURS_PER_WEEK - 1];
    Ok(WeekResult {
        week,
        values: outcome.values,
        net_change: terminal - incoming,
        trades: outcome.trades,
    })
}

fn flat_week(week: usize, incoming: f64) -> WeekResult {
    WeekResult {
        week,
        values: vec![incoming; HOURS_PER_WEEK],
        net_change: 0.0,
        trades: 0,
    }
}
