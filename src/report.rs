use anyhow::{Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::backtest::BacktestOutcome;
use crate::config::BacktestConfig;

// statistics are sampled on weekly closes
const WEEKS_PER_YEAR: f64 = 52.0;

/// Return/risk statistics over the weekly closing values, plus flat-fee
/// accounting over the executed leg trades.
#[derive(Debug, Clone)]
pub struct PerformanceReport {
    pub total_return: f64,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub return_over_max_drawdown: f64,
    pub total_trades: u64,
    pub fee_amount: f64,
    pub fee_share_of_gross_pnl_pct: Option<f64>,
    pub initial_capital: f64,
    pub final_value: f64,
}

impl PerformanceReport {
    pub fn from_outcome(outcome: &BacktestOutcome, cfg: &BacktestConfig) -> Self {
        let weekly_values = outcome.weekly_closing_values();
        let returns = log_returns(&weekly_values);
        let annualized_return = mean(&returns) * WEEKS_PER_YEAR;
        let annualized_volatility = sample_std(&returns) * WEEKS_PER_YEAR.sqrt();
        let sharpe_ratio = if annualized_volatility > 0.0 {
            (annualized_return - cfg.risk_free_rate) / annualized_volatility
        } else {
            0.0
        };
        let total_return = match weekly_values.first() {
            Some(first) if *first != 0.0 => {
                (weekly_values[weekly_values.len() - 1] - first) / first
            }
            _ => 0.0,
        };
        let max_drawdown = max_drawdown(&weekly_values);
        let return_over_max_drawdown = if max_drawdown < 0.0 {
            (total_return / max_drawdown).abs()
        } else {
            0.0
        };
        let fee_amount = outcome.total_trades as f64 * cfg.fee_notional * cfg.fee_rate;
        let fee_share_of_gross_pnl_pct = if outcome.total_net_change.abs() > f64::EPSILON {
            Some(fee_amount * 100.0 / outcome.total_net_change)
        } else {
            None
        };
        Self {
            total_return,
            annualized_return,
            annualized_volatility,
            sharpe_ratio,
            max_drawdown,
            return_over_max_drawdown,
            total_trades: outcome.total_trades,
            fee_amount,
            fee_share_of_gross_pnl_pct,
            initial_capital: outcome.initial_capital,
            final_value: outcome.final_value(),
        }
    }

    pub fn log_summary(&self) {
        log::info!(
            "[REPORT] total return {:.2}% (annualized {:.2}%)",
            self.total_return * 100.0,
            self.annualized_return * 100.0
        );
        log::info!(
            "[REPORT] annualized volatility {:.2}% sharpe {:.2}",
            self.annualized_volatility * 100.0,
            self.sharpe_ratio
        );
        log::info!(
            "[REPORT] max drawdown {:.2}% return over max drawdown {:.2}",
            self.max_drawdown * 100.0,
            self.return_over_max_drawdown
        );
        log::info!(
            "[REPORT] {} leg trades, fees {}",
            self.total_trades,
            format_usd(self.fee_amount)
        );
        if let Some(share) = self.fee_share_of_gross_pnl_pct {
            log::info!("[REPORT] transaction costs over gross P&L {:.1}%", share);
        }
        log::info!(
            "[REPORT] portfolio value {} -> {}",
            format_usd(self.initial_capital),
            format_usd(self.final_value)
        );
    }
}

/// Hour-by-hour value trajectory, one row per simulated hour.
pub fn write_trajectory_csv<P: AsRef<Path>>(path: P, outcome: &BacktestOutcome) -> Result<()> {
    let path_ref = path.as_ref();
    let file = File::create(path_ref)
        .with_context(|| format!("failed to create trajectory file {}", path_ref.display()))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "week,hour,value")?;
    for week in &outcome.weekly {
        for (hour, value) in week.values.iter().enumerate() {
            writeln!(writer, "{},{},{}", week.week, hour, value)?;
        }
    }
    writer.flush()?;
    log::info!("wrote value trajectory to {}", path_ref.display());
    Ok(())
}

/// Per-week aggregates, one row per trading week.
pub fn write_weekly_summary_csv<P: AsRef<Path>>(path: P, outcome: &BacktestOutcome) -> Result<()> {
    let path_ref = path.as_ref();
    let file = File::create(path_ref)
        .with_context(|| format!("failed to create summary file {}", path_ref.display()))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "week,trades,net_change,cumulative_net,closing_value")?;
    for (week, cumulative) in outcome.weekly.iter().zip(outcome.cumulative_net.iter()) {
        writeln!(
            writer,
            "{},{},{},{},{}",
            week.week,
            week.trades,
            week.net_change,
            cumulative,
            outcome.initial_capital + cumulative
        )?;
    }
    writer.flush()?;
    log::info!("wrote weekly summary to {}", path_ref.display());
    Ok(())
}

fn format_usd(amount: f64) -> String {
    Decimal::from_f64(amount)
        .map(|d| format!("{} USD", d.round_dp(2)))
        .unwrap_or_else(|| format!("{:.2} USD", amount))
}

fn log_returns(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Most negative peak-to-trough ratio over the series; 0 when it never
/// trades below a previous peak.
fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0f64;
    for value in values {
        if *value > peak {
            peak = *value;
        }
        if peak > 0.0 {
            let drawdown = (value - peak) / peak;
            if drawdown < worst {
                worst = drawdown;
            }
        }
    }
    worst
}
