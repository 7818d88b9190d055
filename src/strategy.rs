use std::fmt;

use crate::market_data::{PriceTable, WeekSignals};
use crate::selection::WeekSelection;

/// Simulation clock length of one trading week.
pub const HOURS_PER_WEEK: usize = 168;

/// Position held by the pair portfolio. Transitions happen at hour
/// boundaries only and at most one position is open at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Flat,
    LongLeg1ShortLeg2,
    LongLeg2ShortLeg1,
}

impl PositionState {
    pub fn is_open(self) -> bool {
        !matches!(self, PositionState::Flat)
    }
}

#[derive(Debug)]
pub enum StrategyError {
    DataFormat {
        week: usize,
        hour: usize,
        detail: String,
    },
    Arithmetic {
        week: usize,
        hour: usize,
        symbol: String,
    },
}

impl fmt::Display for StrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyError::DataFormat { week, hour, detail } => {
                write!(f, "malformed data in week {} hour {}: {}", week, hour, detail)
            }
            StrategyError::Arithmetic { week, hour, symbol } => {
                write!(
                    f,
                    "zero previous leg value for {} in week {} hour {}",
                    symbol, week, hour
                )
            }
        }
    }
}

impl std::error::Error for StrategyError {}

/// One simulated week: the hour-by-hour portfolio value, the signed per-leg
/// exposure table (hedge-ratio units) and the number of leg trades executed.
#[derive(Debug, Clone)]
pub struct WeekOutcome {
    pub values: Vec<f64>,
    pub exposures: Vec<[f64; 2]>,
    pub trades: u32,
    pub final_state: PositionState,
}

/// Simulates one week of the mispricing-index strategy for a selected pair.
///
/// Purely functional over its inputs: the same pair, betas, signals and
/// prices always produce a bit-identical trajectory. Positions still open
/// at hour 167 are left open; the driver carries only the value forward.
#[derive(Debug)]
pub struct WeekStrategy<'a> {
    prices: &'a PriceTable,
    selection: &'a WeekSelection,
    signals: &'a WeekSignals,
    week: usize,
    week_offset: usize,
    entry_threshold: f64,
    close_threshold: f64,
    incoming_value: f64,
    state: PositionState,
    values: Vec<f64>,
    exposures: Vec<[f64; 2]>,
    trades: u32,
}

impl<'a> WeekStrategy<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prices: &'a PriceTable,
        selection: &'a WeekSelection,
        signals: &'a WeekSignals,
        week: usize,
        week_offset: usize,
        entry_threshold: f64,
        close_threshold: f64,
        incoming_value: f64,
    ) -> Result<Self, StrategyError> {
        for (name, series) in [("h12", &signals.h12), ("h21", &signals.h21)] {
            if series.len() != HOURS_PER_WEEK {
                return Err(StrategyError::DataFormat {
                    week,
                    hour: 0,
                    detail: format!(
                        "{} has {} observations, expected {}",
                        name,
                        series.len(),
                        HOURS_PER_WEEK
                    ),
                });
            }
        }
        Ok(Self {
            prices,
            selection,
            signals,
            week,
            week_offset,
            entry_threshold,
            close_threshold,
            incoming_value,
            state: PositionState::Flat,
            values: vec![0.0; HOURS_PER_WEEK],
            exposures: vec![[0.0; 2]; HOURS_PER_WEEK],
            trades: 0,
        })
    }

    /// Consumes the simulator: one call, one week, no reuse.
    pub fn run(mut self) -> Result<WeekOutcome, StrategyError> {
        for hour in 0..HOURS_PER_WEEK {
            self.step(hour)?;
        }
        Ok(WeekOutcome {
            values: self.values,
            exposures: self.exposures,
            trades: self.trades,
            final_state: self.state,
        })
    }

    fn step(&mut self, hour: usize) -> Result<(), StrategyError> {
        match self.state {
            PositionState::Flat => {
                // No P&L accrues on the opening hour itself; the position is
                // taken at this hour's close and earns from the next hour.
                self.carry_value(hour);
                let (h12, h21) = self.signals_at(hour)?;
                if let Some(direction) =
                    evaluate_open_signal(h12, h21, self.entry_threshold)
                {
                    self.exposures[hour] = self.entry_exposures(direction);
                    self.trades += 2;
                    self.state = direction;
                }
            }
            _ => {
                let (h12, h21) = self.signals_at(hour)?;
                if evaluate_close_signal(h12, h21, self.close_threshold) {
                    // revalue through this hour first, then flatten both legs
                    self.accrue_returns(hour)?;
                    self.exposures[hour] = [0.0, 0.0];
                    self.trades += 2;
                    self.state = PositionState::Flat;
                } else {
                    self.accrue_returns(hour)?;
                }
            }
        }
        Ok(())
    }

    fn carry_value(&mut self, hour: usize) {
        self.values[hour] = if hour == 0 {
            self.incoming_value
        } else {
            self.values[hour - 1]
        };
    }

    fn entry_exposures(&self, direction: PositionState) -> [f64; 2] {
        let [beta1, beta2] = self.selection.betas;
        match direction {
            PositionState::LongLeg1ShortLeg2 => [beta1, -beta2],
            PositionState::LongLeg2ShortLeg1 => [-beta1, beta2],
            PositionState::Flat => [0.0, 0.0],
        }
    }

    /// Accrue one hour of P&L while a position is held. Each leg contributes
    /// half of its signed hourly close-to-close return; the sign rides on
    /// the held quantity, so the beta magnitude cancels out of the ratio.
    fn accrue_returns(&mut self, hour: usize) -> Result<(), StrategyError> {
        debug_assert!(hour > 0, "no position can be held before the first hour");
        let previous_value = self.values[hour - 1];
        let absolute_hour = self.week_offset + hour;
        let mut total_return = 0.0;
        for leg in 0..2 {
            let symbol = &self.selection.coins[leg];
            let quantity = self.exposures[hour - 1][leg];
            let previous_close = self.close_at(symbol, absolute_hour - 1, hour)?;
            let current_close = self.close_at(symbol, absolute_hour, hour)?;
            let previous_leg_value = quantity * previous_close;
            if previous_leg_value == 0.0 {
                return Err(StrategyError::Arithmetic {
                    week: self.week,
                    hour,
                    symbol: symbol.clone(),
                });
            }
            let leg_return =
                (quantity * current_close - previous_leg_value) / previous_leg_value.abs();
            total_return += leg_return / 2.0;
            self.exposures[hour][leg] = quantity;
        }
        self.values[hour] = previous_value * (1.0 + total_return);
        Ok(())
    }

    fn signals_at(&self, hour: usize) -> Result<(f64, f64), StrategyError> {
        let h12 = self.signals.h12[hour];
        let h21 = self.signals.h21[hour];
        if !h12.is_finite() || !h21.is_finite() {
            return Err(StrategyError::DataFormat {
                week: self.week,
                hour,
                detail: "non-finite mispricing index".to_string(),
            });
        }
        Ok((h12, h21))
    }

    fn close_at(
        &self,
        symbol: &str,
        absolute_hour: usize,
        hour: usize,
    ) -> Result<f64, StrategyError> {
        self.prices
            .close(symbol, absolute_hour)
            .ok_or_else(|| StrategyError::DataFormat {
                week: self.week,
                hour,
                detail: format!("no close price for {} at absolute hour {}", symbol, absolute_hour),
            })
    }
}

/// Entry signal: leg 1 rich against leg 2 opens long-2/short-1 and the
/// mirror condition opens long-1/short-2. With the entry threshold below
/// 0.5 the two conditions can never hold at once.
fn evaluate_open_signal(h12: f64, h21: f64, entry_threshold: f64) -> Option<PositionState> {
    if h12 < entry_threshold && h21 > 1.0 - entry_threshold {
        Some(PositionState::LongLeg2ShortLeg1)
    } else if h21 < entry_threshold && h12 > 1.0 - entry_threshold {
        Some(PositionState::LongLeg1ShortLeg2)
    } else {
        None
    }
}

/// Close signal: both indices have converged to the middle of their range.
fn evaluate_close_signal(h12: f64, h21: f64, close_threshold: f64) -> bool {
    (h12 - 0.5).abs() < close_threshold && (h21 - 0.5).abs() < close_threshold
}
