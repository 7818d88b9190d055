use anyhow::{anyhow, bail, Context, Result};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::config::BacktestConfig;
use crate::strategy::HOURS_PER_WEEK;

// Kline dumps are named the way the collector writes them:
// {data_dir}/KLINE_INTERVAL_1HOUR_FUT_{SYMBOL}USDT.csv
const KLINE_FILE_PREFIX: &str = "KLINE_INTERVAL_1HOUR_FUT_";
const KLINE_FILE_SUFFIX: &str = "USDT.csv";
const OPEN_TIME_COLUMN: &str = "Open time";
const OPEN_COLUMN: &str = "Open";
const CLOSE_COLUMN: &str = "Close";

#[derive(Debug, Clone)]
struct CoinSeries {
    open_times: Vec<i64>,
    opens: Vec<f64>,
    closes: Vec<f64>,
}

/// Hourly close prices per instrument, keyed by absolute hour offset.
#[derive(Debug, Clone)]
pub struct PriceTable {
    series: HashMap<String, CoinSeries>,
}

#[derive(Debug, Clone)]
pub struct CoinStats {
    pub mean_close: f64,
    pub total_return_pct: f64,
    pub volatility_pct: f64,
    pub skewness: f64,
    pub kurtosis: f64,
}

impl PriceTable {
    pub fn load(cfg: &BacktestConfig) -> Result<Self> {
        let mut series = HashMap::new();
        for symbol in &cfg.universe {
            let path = kline_path(&cfg.data_dir, symbol);
            let coin = load_kline_file(&path)
                .with_context(|| format!("failed to load klines for {}", symbol))?;
            log::info!(
                "loaded {} hourly klines for {} ({} .. {})",
                coin.closes.len(),
                symbol,
                format_ms(coin.open_times.first().copied()),
                format_ms(coin.open_times.last().copied()),
            );
            series.insert(symbol.clone(), coin);
        }
        Ok(Self { series })
    }

    /// Programmatic provider, used by tests and alternate data sources.
    pub fn from_closes<I>(closes: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<f64>)>,
    {
        let series = closes
            .into_iter()
            .map(|(symbol, closes)| {
                let open_times = (0..closes.len()).map(|i| i as i64 * 3_600_000).collect();
                let coin = CoinSeries {
                    open_times,
                    opens: closes.clone(),
                    closes,
                };
                (symbol, coin)
            })
            .collect();
        Self { series }
    }

    /// Close price at an absolute hour offset. `None` signals a hole the
    /// caller must treat as a data error, never as zero.
    pub fn close(&self, symbol: &str, absolute_hour: usize) -> Option<f64> {
        self.series
            .get(symbol)
            .and_then(|coin| coin.closes.get(absolute_hour))
            .copied()
    }

    pub fn closes(&self, symbol: &str) -> Option<&[f64]> {
        self.series.get(symbol).map(|coin| coin.closes.as_slice())
    }

    pub fn series_len(&self, symbol: &str) -> usize {
        self.series
            .get(symbol)
            .map(|coin| coin.closes.len())
            .unwrap_or(0)
    }

    /// Descriptive statistics over the whole loaded series, the set the
    /// research notebooks print before a run.
    pub fn describe(&self, symbol: &str) -> Option<CoinStats> {
        let coin = self.series.get(symbol)?;
        if coin.closes.len() < 2 {
            return None;
        }
        let n = coin.closes.len() as f64;
        let mean_close = coin.closes.iter().sum::<f64>() / n;
        let total_return_pct = (coin.closes[coin.closes.len() - 1] / coin.opens[0] - 1.0) * 100.0;
        let log_diffs: Vec<f64> = coin
            .closes
            .windows(2)
            .map(|w| (w[1] / w[0]).ln())
            .collect();
        let volatility_pct = population_std(&log_diffs) * n.sqrt() * 100.0;
        let body: Vec<f64> = coin
            .closes
            .iter()
            .zip(coin.opens.iter())
            .map(|(close, open)| close - open)
            .collect();
        let (skewness, kurtosis) = skew_kurtosis(&body);
        Some(CoinStats {
            mean_close,
            total_return_pct,
            volatility_pct,
            skewness,
            kurtosis,
        })
    }

    pub fn log_stats(&self, universe: &[String]) {
        for symbol in universe {
            if let Some(stats) = self.describe(symbol) {
                log::debug!(
                    "[STATS] {} mean={:.2} return={:.2}% vol={:.2}% skew={:.2} kurt={:.2}",
                    symbol,
                    stats.mean_close,
                    stats.total_return_pct,
                    stats.volatility_pct,
                    stats.skewness,
                    stats.kurtosis
                );
            }
        }
    }

    /// Warn up front when a series cannot cover every hour the run will
    /// query; the affected weeks will surface as data errors or empty
    /// selections later.
    pub fn warn_short_series(&self, cfg: &BacktestConfig) {
        let required = cfg.required_history_hours();
        for symbol in &cfg.universe {
            let len = self.series_len(symbol);
            if len < required {
                log::warn!(
                    "{} has {} hourly closes, {} required to cover all {} trading weeks",
                    symbol,
                    len,
                    required,
                    cfg.trading_weeks
                );
            }
        }
    }
}

fn kline_path(data_dir: &str, symbol: &str) -> PathBuf {
    Path::new(data_dir).join(format!("{KLINE_FILE_PREFIX}{symbol}{KLINE_FILE_SUFFIX}"))
}

fn load_kline_file(path: &Path) -> Result<CoinSeries> {
    let file =
        File::open(path).with_context(|| format!("failed to open kline file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let header = lines
        .next()
        .ok_or_else(|| anyhow!("{}: empty kline file", path.display()))?
        .with_context(|| format!("{}: failed to read header", path.display()))?;
    let columns: Vec<String> = header.split(',').map(|c| c.trim().to_string()).collect();
    let open_time_idx = column_index(&columns, OPEN_TIME_COLUMN, path)?;
    let open_idx = column_index(&columns, OPEN_COLUMN, path)?;
    let close_idx = column_index(&columns, CLOSE_COLUMN, path)?;

    let mut open_times = Vec::new();
    let mut opens = Vec::new();
    let mut closes = Vec::new();
    for (row, line) in lines.enumerate() {
        let line =
            line.with_context(|| format!("{}: failed to read line {}", path.display(), row + 2))?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        open_times.push(parse_ms_field(&fields, open_time_idx, path, row + 2, OPEN_TIME_COLUMN)?);
        opens.push(parse_price_field(&fields, open_idx, path, row + 2, OPEN_COLUMN)?);
        closes.push(parse_price_field(&fields, close_idx, path, row + 2, CLOSE_COLUMN)?);
    }
    if closes.is_empty() {
        bail!("{}: kline file has no data rows", path.display());
    }
    Ok(CoinSeries {
        open_times,
        opens,
        closes,
    })
}

fn column_index(columns: &[String], name: &str, path: &Path) -> Result<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| anyhow!("{}: missing '{}' column", path.display(), name))
}

fn parse_price_field(
    fields: &[&str],
    idx: usize,
    path: &Path,
    lineno: usize,
    name: &str,
) -> Result<f64> {
    let raw = fields
        .get(idx)
        .ok_or_else(|| anyhow!("{} line {}: missing '{}' field", path.display(), lineno, name))?;
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            anyhow!(
                "{} line {}: non-numeric '{}' value '{}'",
                path.display(),
                lineno,
                name,
                raw
            )
        })
}

fn parse_ms_field(
    fields: &[&str],
    idx: usize,
    path: &Path,
    lineno: usize,
    name: &str,
) -> Result<i64> {
    let raw = fields
        .get(idx)
        .ok_or_else(|| anyhow!("{} line {}: missing '{}' field", path.display(), lineno, name))?;
    raw.trim().parse::<i64>().map_err(|_| {
        anyhow!(
            "{} line {}: invalid '{}' timestamp '{}'",
            path.display(),
            lineno,
            name,
            raw
        )
    })
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt()
}

fn skew_kurtosis(values: &[f64]) -> (f64, f64) {
    if values.len() < 2 {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
    for v in values {
        let d = v - mean;
        m2 += d * d;
        m3 += d * d * d;
        m4 += d * d * d * d;
    }
    m2 /= n;
    m3 /= n;
    m4 /= n;
    if m2 <= 0.0 {
        return (0.0, 0.0);
    }
    (m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SignalLeg {
    H12,
    H21,
}

/// One trading week's mispricing indices, one observation per hour.
#[derive(Debug, Clone)]
pub struct WeekSignals {
    pub h12: Vec<f64>,
    pub h21: Vec<f64>,
}

/// Precomputed mispricing indices keyed by week, loaded from the signal
/// file the research pipeline exports (`week_N_h12;week_N_h21;...`).
#[derive(Debug, Clone, Default)]
pub struct SignalTable {
    weeks: HashMap<usize, WeekSignals>,
}

impl SignalTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open signal file {}", path_ref.display()))?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header = lines
            .next()
            .ok_or_else(|| anyhow!("{}: empty signal file", path_ref.display()))?
            .with_context(|| format!("{}: failed to read header", path_ref.display()))?;
        // Unrecognized columns (the exporter's unnamed index column included)
        // are skipped; only week_N_h12/week_N_h21 columns are read.
        let mut mapped: Vec<(usize, usize, SignalLeg)> = Vec::new();
        for (idx, name) in header.split(';').enumerate() {
            if let Some((week, leg)) = parse_signal_column(name) {
                mapped.push((idx, week, leg));
            }
        }
        if mapped.is_empty() {
            bail!("{}: no week_N_h12/week_N_h21 columns found", path_ref.display());
        }

        let mut columns: HashMap<(usize, SignalLeg), Vec<f64>> = HashMap::new();
        for (row, line) in lines.enumerate() {
            let line = line.with_context(|| {
                format!("{}: failed to read line {}", path_ref.display(), row + 2)
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(';').collect();
            for (idx, week, leg) in &mapped {
                let raw = fields.get(*idx).ok_or_else(|| {
                    anyhow!(
                        "{} line {}: missing value for week {} column",
                        path_ref.display(),
                        row + 2,
                        week + 1
                    )
                })?;
                // the exporter writes decimal commas
                let value = raw
                    .trim()
                    .replace(',', ".")
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| {
                        anyhow!(
                            "{} line {}: non-numeric mispricing value '{}' for week {}",
                            path_ref.display(),
                            row + 2,
                            raw,
                            week + 1
                        )
                    })?;
                columns.entry((*week, *leg)).or_default().push(value);
            }
        }

        let mut weeks = HashMap::new();
        let mut indices: Vec<usize> = columns.keys().map(|(week, _)| *week).collect();
        indices.sort_unstable();
        indices.dedup();
        for week in indices {
            let h12 = columns.remove(&(week, SignalLeg::H12)).ok_or_else(|| {
                anyhow!("{}: missing week_{}_h12 column", path_ref.display(), week + 1)
            })?;
            let h21 = columns.remove(&(week, SignalLeg::H21)).ok_or_else(|| {
                anyhow!("{}: missing week_{}_h21 column", path_ref.display(), week + 1)
            })?;
            for (name, series) in [("h12", &h12), ("h21", &h21)] {
                if series.len() != HOURS_PER_WEEK {
                    bail!(
                        "{}: week_{}_{} has {} rows, expected {}",
                        path_ref.display(),
                        week + 1,
                        name,
                        series.len(),
                        HOURS_PER_WEEK
                    );
                }
            }
            weeks.insert(week, WeekSignals { h12, h21 });
        }
        Ok(Self { weeks })
    }

    /// Programmatic provider, used by tests and alternate data sources.
    pub fn from_weeks<I>(weeks: I) -> Self
    where
        I: IntoIterator<Item = (usize, WeekSignals)>,
    {
        Self {
            weeks: weeks.into_iter().collect(),
        }
    }

    pub fn week(&self, week: usize) -> Option<&WeekSignals> {
        self.weeks.get(&week)
    }

    pub fn week_count(&self) -> usize {
        self.weeks.len()
    }
}

fn parse_signal_column(name: &str) -> Option<(usize, SignalLeg)> {
    let rest = name.trim().trim_matches('"').strip_prefix("week_")?;
    let (number, leg) = rest.split_once('_')?;
    let week = number.parse::<usize>().ok().filter(|w| *w > 0)?;
    let leg = match leg {
        "h12" => SignalLeg::H12,
        "h21" => SignalLeg::H21,
        _ => return None,
    };
    Some((week - 1, leg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_kline_file(dir: &Path, symbol: &str, rows: &[(i64, f64, f64)]) -> PathBuf {
        let path = kline_path(dir.to_str().unwrap(), symbol);
        let mut file = File::create(&path).unwrap();
        writeln!(file, ",Open time,Open,High,Low,Close,Volume,Close time").unwrap();
        for (i, (ts, open, close)) in rows.iter().enumerate() {
            writeln!(
                file,
                "{i},{ts},{open},{h},{l},{close},1000,{ct}",
                h = open.max(*close),
                l = open.min(*close),
                ct = ts + 3_599_999
            )
            .unwrap();
        }
        path
    }

    #[test]
    fn kline_loader_maps_header_columns() {
        let dir = tempfile::tempdir().unwrap();
        write_kline_file(
            dir.path(),
            "BTC",
            &[
                (1_569_888_000_000, 8300.0, 8310.5),
                (1_569_891_600_000, 8310.5, 8290.0),
            ],
        );
        let series = load_kline_file(&kline_path(dir.path().to_str().unwrap(), "BTC")).unwrap();
        assert_eq!(series.closes, vec![8310.5, 8290.0]);
        assert_eq!(series.opens, vec![8300.0, 8310.5]);
        assert_eq!(series.open_times[0], 1_569_888_000_000);
    }

    #[test]
    fn kline_loader_rejects_non_numeric_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = kline_path(dir.path().to_str().unwrap(), "BTC");
        let mut file = File::create(&path).unwrap();
        writeln!(file, ",Open time,Open,High,Low,Close,Volume,Close time").unwrap();
        writeln!(file, "0,1569888000000,8300.0,8350.0,8290.0,oops,1000,1569891599999").unwrap();
        let err = load_kline_file(&path).unwrap_err();
        assert!(err.to_string().contains("non-numeric"));
    }

    #[test]
    fn kline_loader_rejects_missing_close_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = kline_path(dir.path().to_str().unwrap(), "BTC");
        let mut file = File::create(&path).unwrap();
        writeln!(file, ",Open time,Open,High,Low,Volume").unwrap();
        writeln!(file, "0,1569888000000,8300.0,8350.0,8290.0,1000").unwrap();
        let err = load_kline_file(&path).unwrap_err();
        assert!(err.to_string().contains("'Close'"));
    }

    #[test]
    fn price_table_lookup_is_bounds_checked() {
        let table = PriceTable::from_closes([("BTC".to_string(), vec![1.0, 2.0, 3.0])]);
        assert_eq!(table.close("BTC", 2), Some(3.0));
        assert_eq!(table.close("BTC", 3), None);
        assert_eq!(table.close("ETH", 0), None);
        assert_eq!(table.series_len("BTC"), 3);
    }

    #[test]
    fn describe_computes_whole_period_return() {
        let table = PriceTable::from_closes([("BTC".to_string(), vec![100.0, 110.0, 120.0])]);
        let stats = table.describe("BTC").unwrap();
        // from_closes seeds opens with closes, so the first open is 100
        assert!((stats.total_return_pct - 20.0).abs() < 1e-9);
        assert!((stats.mean_close - 110.0).abs() < 1e-9);
    }

    fn signal_header_and_rows(weeks: &[usize], rows: usize) -> String {
        let mut out = String::new();
        out.push_str("\"\"");
        for week in weeks {
            out.push_str(&format!(";week_{week}_h12;week_{week}_h21"));
        }
        out.push('\n');
        for row in 0..rows {
            out.push_str(&row.to_string());
            for _ in weeks {
                out.push_str(";0,45;0,55");
            }
            out.push('\n');
        }
        out
    }

    #[test]
    fn signal_loader_normalizes_decimal_commas() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(signal_header_and_rows(&[1, 3], HOURS_PER_WEEK).as_bytes())
            .unwrap();
        let table = SignalTable::load(file.path()).unwrap();
        assert_eq!(table.week_count(), 2);
        let week0 = table.week(0).unwrap();
        assert_eq!(week0.h12.len(), HOURS_PER_WEEK);
        assert!((week0.h12[0] - 0.45).abs() < 1e-12);
        assert!((week0.h21[0] - 0.55).abs() < 1e-12);
        // week_3 columns map to week index 2; week 1 has no columns at all
        assert!(table.week(2).is_some());
        assert!(table.week(1).is_none());
    }

    #[test]
    fn signal_loader_rejects_short_weeks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(signal_header_and_rows(&[1], 10).as_bytes())
            .unwrap();
        let err = SignalTable::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("expected 168"));
    }

    #[test]
    fn signal_loader_requires_both_legs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut content = String::from("\"\";week_1_h12\n");
        for row in 0..HOURS_PER_WEEK {
            content.push_str(&format!("{row};0,5\n"));
        }
        file.write_all(content.as_bytes()).unwrap();
        let err = SignalTable::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("week_1_h21"));
    }

    #[test]
    fn signal_loader_rejects_non_numeric_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut content = String::from("\"\";week_1_h12;week_1_h21\n");
        content.push_str("0;abc;0,5\n");
        file.write_all(content.as_bytes()).unwrap();
        let err = SignalTable::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("non-numeric"));
    }
}
