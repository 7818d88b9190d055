use crate::config::{BacktestConfig, CointegrationTest};
use crate::market_data::PriceTable;
use crate::strategy::HOURS_PER_WEEK;

/// The pair traded for one week: two instruments and their hedge ratios,
/// fixed before the week starts and immutable during it.
#[derive(Debug, Clone, PartialEq)]
pub struct WeekSelection {
    pub coins: [String; 2],
    pub betas: [f64; 2],
}

/// Rank every week's universe against the anchor and pick at most one pair
/// per week. Depends only on historical closes, so the whole schedule can
/// be computed before any simulation starts.
pub fn select_all_weeks(prices: &PriceTable, cfg: &BacktestConfig) -> Vec<Option<WeekSelection>> {
    let mut selections = Vec::with_capacity(cfg.trading_weeks);
    for week in 0..cfg.trading_weeks {
        let selection = select_for_week(prices, cfg, week);
        match &selection {
            Some(sel) => log::debug!(
                "week {}: selected {}/{} betas {:.4}/{:.4}",
                week,
                sel.coins[0],
                sel.coins[1],
                sel.betas[0],
                sel.betas[1]
            ),
            None => log::debug!("week {}: no cointegrated pair", week),
        }
        selections.push(selection);
    }
    let active = selections.iter().filter(|s| s.is_some()).count();
    log::info!(
        "pair selection done: {}/{} weeks have a tradable pair",
        active,
        cfg.trading_weeks
    );
    selections
}

/// Selection lookback for week `i` covers hours [i*H, (training_weeks+i)*H).
/// Coins whose history cannot cover the window are skipped; fewer than two
/// eligible coins leaves the week unselected.
pub fn select_for_week(
    prices: &PriceTable,
    cfg: &BacktestConfig,
    week: usize,
) -> Option<WeekSelection> {
    let begin = week * HOURS_PER_WEEK;
    let end = begin + cfg.training_hours();
    let anchor = prices.closes(&cfg.anchor_symbol)?;
    if anchor.len() < end {
        log::debug!(
            "week {}: anchor {} history too short for the selection window",
            week,
            cfg.anchor_symbol
        );
        return None;
    }
    let anchor_window = &anchor[begin..end];
    let anchor_returns = log_returns(anchor_window);

    // (tau, coin, beta), ranked by tau
    let mut ranked: Vec<(f64, String, f64)> = Vec::new();
    for symbol in &cfg.universe {
        if symbol == &cfg.anchor_symbol {
            continue;
        }
        let Some(closes) = prices.closes(symbol) else {
            continue;
        };
        if closes.len() < end {
            continue;
        }
        let window = &closes[begin..end];
        let Some(beta) = hedge_ratio(anchor_window, window) else {
            continue;
        };
        let spread: Vec<f64> = anchor_window
            .iter()
            .zip(window)
            .map(|(y, x)| y - beta * x)
            .collect();
        let eligible = match cfg.cointegration_test {
            CointegrationTest::Adf => adf_p_value(&spread) < cfg.adf_p_threshold,
            CointegrationTest::Kss => kss_t_stat(&spread) < cfg.kss_t_crit,
        };
        if !eligible {
            continue;
        }
        let tau = kendall_tau(&anchor_returns, &log_returns(window));
        ranked.push((tau, symbol.clone(), beta));
    }
    if ranked.len() < 2 {
        return None;
    }
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let (_, first_coin, first_beta) = ranked[0].clone();
    let (_, second_coin, second_beta) = ranked[1].clone();
    Some(WeekSelection {
        coins: [first_coin, second_coin],
        betas: [first_beta, second_beta],
    })
}

/// OLS through the origin, the hedge ratio the selection regressions use.
fn hedge_ratio(y: &[f64], x: &[f64]) -> Option<f64> {
    let n = y.len().min(x.len());
    if n < 2 {
        return None;
    }
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for i in 0..n {
        sum_xy += x[i] * y[i];
        sum_xx += x[i] * x[i];
    }
    if sum_xx.abs() < 1e-12 {
        return None;
    }
    Some(sum_xy / sum_xx)
}

/// Dickey-Fuller regression on the spread levels, no constant:
/// ds_t = phi * s_{t-1} + eps. Step p-values off the critical table.
fn adf_p_value(spread: &[f64]) -> f64 {
    if spread.len() < 5 {
        return 1.0;
    }
    let mut num = 0.0;
    let mut den = 0.0;
    for win in spread.windows(2) {
        let prev = win[0];
        let diff = win[1] - win[0];
        num += prev * diff;
        den += prev * prev;
    }
    if den.abs() < 1e-12 {
        return 1.0;
    }
    let phi = num / den;
    let n = spread.len() - 1;
    let mut rss = 0.0;
    for win in spread.windows(2) {
        let err = (win[1] - win[0]) - phi * win[0];
        rss += err * err;
    }
    let sigma2 = rss / (n.saturating_sub(1)).max(1) as f64;
    let se = (sigma2 / den).sqrt();
    let t_stat = if se < 1e-12 { 0.0 } else { phi / se };
    df_p_value(t_stat, n)
}

fn df_p_value(t_stat: f64, n: usize) -> f64 {
    // Interpolated Dickey-Fuller critical values (no constant), approximate
    const CRITS: &[(usize, f64, f64, f64)] = &[
        (25, -2.66, -1.95, -1.60),
        (50, -2.62, -1.95, -1.61),
        (100, -2.60, -1.95, -1.61),
        (250, -2.58, -1.95, -1.62),
        (500, -2.58, -1.95, -1.62),
    ];
    let (c1, c5, c10) = interpolate_crits(n, CRITS);
    if t_stat < c1 {
        0.005
    } else if t_stat < c5 {
        0.025
    } else if t_stat < c10 {
        0.075
    } else {
        0.5
    }
}

fn interpolate_crits(n: usize, table: &[(usize, f64, f64, f64)]) -> (f64, f64, f64) {
    if n <= table[0].0 {
        return (table[0].1, table[0].2, table[0].3);
    }
    for w in table.windows(2) {
        let (n1, c1_1, c5_1, c10_1) = w[0];
        let (n2, c1_2, c5_2, c10_2) = w[1];
        if n >= n1 && n <= n2 {
            let t = (n - n1) as f64 / (n2 - n1) as f64;
            let lerp = |a: f64, b: f64| a + t * (b - a);
            return (lerp(c1_1, c1_2), lerp(c5_1, c5_2), lerp(c10_1, c10_2));
        }
    }
    let last = table.last().unwrap();
    (last.1, last.2, last.3)
}

/// KSS nonlinear unit-root regression: ds_t = delta * s_{t-1}^3 + eps.
/// Returns the t-statistic on delta; strongly negative means mean-reverting.
fn kss_t_stat(spread: &[f64]) -> f64 {
    if spread.len() < 5 {
        return 0.0;
    }
    let mut num = 0.0;
    let mut den = 0.0;
    for win in spread.windows(2) {
        let cubed = win[0] * win[0] * win[0];
        let diff = win[1] - win[0];
        num += cubed * diff;
        den += cubed * cubed;
    }
    if den.abs() < 1e-12 {
        return 0.0;
    }
    let delta = num / den;
    let n = spread.len() - 1;
    let mut rss = 0.0;
    for win in spread.windows(2) {
        let cubed = win[0] * win[0] * win[0];
        let err = (win[1] - win[0]) - delta * cubed;
        rss += err * err;
    }
    let sigma2 = rss / (n.saturating_sub(1)).max(1) as f64;
    let se = (sigma2 / den).sqrt();
    if se < 1e-12 {
        return 0.0;
    }
    delta / se
}

fn log_returns(closes: &[f64]) -> Vec<f64> {
    closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

/// Kendall tau-b with tie correction, plain O(n^2) pair scan.
fn kendall_tau(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let mut concordant = 0i64;
    let mut discordant = 0i64;
    let mut ties_a = 0i64;
    let mut ties_b = 0i64;
    for i in 0..n {
        for j in (i + 1)..n {
            let da = a[i] - a[j];
            let db = b[i] - b[j];
            if da == 0.0 {
                ties_a += 1;
            }
            if db == 0.0 {
                ties_b += 1;
            }
            if da != 0.0 && db != 0.0 {
                if (da > 0.0) == (db > 0.0) {
                    concordant += 1;
                } else {
                    discordant += 1;
                }
            }
        }
    }
    let n0 = (n * (n - 1) / 2) as f64;
    let denom = ((n0 - ties_a as f64) * (n0 - ties_b as f64)).sqrt();
    if denom <= 0.0 {
        return 0.0;
    }
    (concordant - discordant) as f64 / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BacktestConfig;

    fn test_config(universe: &[&str]) -> BacktestConfig {
        BacktestConfig {
            data_dir: String::new(),
            signals_file: String::new(),
            anchor_symbol: "BTC".to_string(),
            universe: universe.iter().map(|s| s.to_string()).collect(),
            entry_threshold: 0.1,
            close_threshold: 0.1,
            trading_weeks: 1,
            training_weeks: 3,
            initial_capital: 200_000.0,
            fee_rate: 0.0004,
            fee_notional: 100_000.0,
            cointegration_test: CointegrationTest::Adf,
            adf_p_threshold: 0.1,
            kss_t_crit: -2.66,
            risk_free_rate: 0.0,
            trajectory_file: None,
            summary_file: None,
        }
    }

    // bounded deterministic wiggle; step must stay coprime with 23 so the
    // sequence actually cycles
    fn wiggle(i: usize, step: usize) -> f64 {
        (((i * step) % 23) as f64 - 11.0) * 0.1
    }

    fn anchor_series(len: usize) -> Vec<f64> {
        (0..len).map(|i| 100.0 + wiggle(i, 7) * 10.0).collect()
    }

    #[test]
    fn hedge_ratio_is_through_the_origin() {
        let x: Vec<f64> = (1..50).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v).collect();
        let beta = hedge_ratio(&y, &x).unwrap();
        assert!((beta - 2.0).abs() < 1e-12);
        // an added offset shifts the origin fit away from the slope
        let y_off: Vec<f64> = x.iter().map(|v| 2.0 * v + 100.0).collect();
        let beta_off = hedge_ratio(&y_off, &x).unwrap();
        assert!(beta_off > 2.0);
    }

    #[test]
    fn adf_flags_mean_reverting_spreads() {
        let spread: Vec<f64> = (0..500).map(|i| wiggle(i, 4)).collect();
        assert!(adf_p_value(&spread) < 0.1);
    }

    #[test]
    fn adf_does_not_flag_trending_spreads() {
        let spread: Vec<f64> = (0..500).map(|i| 10.0 + i as f64 * 0.5).collect();
        assert!(adf_p_value(&spread) >= 0.1);
    }

    #[test]
    fn kss_is_negative_for_mean_reverting_spreads() {
        let spread: Vec<f64> = (0..500).map(|i| wiggle(i, 8)).collect();
        assert!(kss_t_stat(&spread) < -2.66);
    }

    #[test]
    fn kendall_tau_matches_perfect_orderings() {
        let a: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let b: Vec<f64> = a.iter().map(|v| v * 3.0 + 1.0).collect();
        let c: Vec<f64> = a.iter().map(|v| -v).collect();
        assert!((kendall_tau(&a, &b) - 1.0).abs() < 1e-12);
        assert!((kendall_tau(&a, &c) + 1.0).abs() < 1e-12);
        let flat = vec![1.0; 20];
        assert_eq!(kendall_tau(&a, &flat), 0.0);
    }

    #[test]
    fn selects_the_two_cointegrated_coins() {
        let cfg = test_config(&["BTC", "AAA", "BBB", "CCC"]);
        let len = cfg.training_hours();
        let anchor = anchor_series(len);
        // AAA and BBB track the anchor with a small bounded wiggle; CCC trends
        let aaa: Vec<f64> = anchor
            .iter()
            .enumerate()
            .map(|(i, v)| (v + wiggle(i, 19)) / 2.0)
            .collect();
        let bbb: Vec<f64> = anchor
            .iter()
            .enumerate()
            .map(|(i, v)| (v + wiggle(i, 9) * 4.0) / 1.25)
            .collect();
        let ccc: Vec<f64> = (0..len).map(|i| 50.0 + i as f64).collect();
        let prices = PriceTable::from_closes([
            ("BTC".to_string(), anchor),
            ("AAA".to_string(), aaa),
            ("BBB".to_string(), bbb),
            ("CCC".to_string(), ccc),
        ]);
        let selection = select_for_week(&prices, &cfg, 0).unwrap();
        let mut coins = selection.coins.clone();
        coins.sort();
        assert_eq!(coins, ["AAA".to_string(), "BBB".to_string()]);
        for (coin, beta) in selection.coins.iter().zip(selection.betas.iter()) {
            let expected = if coin == "AAA" { 2.0 } else { 1.25 };
            assert!(
                (beta - expected).abs() < 0.1,
                "beta for {} was {}",
                coin,
                beta
            );
        }
    }

    #[test]
    fn fewer_than_two_eligible_coins_selects_nothing() {
        let cfg = test_config(&["BTC", "AAA"]);
        let len = cfg.training_hours();
        let anchor = anchor_series(len);
        let aaa: Vec<f64> = anchor
            .iter()
            .enumerate()
            .map(|(i, v)| (v + wiggle(i, 19)) / 2.0)
            .collect();
        let prices = PriceTable::from_closes([
            ("BTC".to_string(), anchor),
            ("AAA".to_string(), aaa),
        ]);
        assert!(select_for_week(&prices, &cfg, 0).is_none());
    }

    #[test]
    fn short_history_leaves_the_week_unselected() {
        let cfg = test_config(&["BTC", "AAA", "BBB"]);
        let prices = PriceTable::from_closes([
            ("BTC".to_string(), vec![100.0; 10]),
            ("AAA".to_string(), vec![50.0; 10]),
            ("BBB".to_string(), vec![25.0; 10]),
        ]);
        assert!(select_for_week(&prices, &cfg, 0).is_none());
    }
}
