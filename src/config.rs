use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs::File;
use std::path::Path;

use crate::strategy::HOURS_PER_WEEK;

const DEFAULT_DATA_DIR: &str = "Data";
const DEFAULT_SIGNALS_FILE: &str = "trading_signal_ADF.csv";
const DEFAULT_ANCHOR_SYMBOL: &str = "BTC";
const DEFAULT_UNIVERSE: &[&str] = &[
    "ADA", "ATOM", "BAT", "BCH", "BNB", "BTC", "DASH", "EOS", "ETC", "ETH", "IOTA", "LINK", "LTC",
    "ONT", "TRX", "XLM", "XMR", "XRP", "XTZ", "ZEC",
];
const DEFAULT_ENTRY_THRESHOLD: f64 = 0.1;
const DEFAULT_CLOSE_THRESHOLD: f64 = 0.1;
const DEFAULT_TRADING_WEEKS: usize = 104;
const DEFAULT_TRAINING_WEEKS: usize = 3;
const DEFAULT_INITIAL_CAPITAL_USD: f64 = 200_000.0;
const DEFAULT_FEE_RATE: f64 = 0.0004;
const DEFAULT_FEE_NOTIONAL_USD: f64 = 100_000.0;
const DEFAULT_ADF_P_THRESHOLD: f64 = 0.1;
const DEFAULT_KSS_T_CRIT: f64 = -2.66;
const DEFAULT_RISK_FREE_RATE: f64 = 0.0;

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::String(value) => value
                .split(',')
                .map(|item| item.trim().to_uppercase())
                .filter(|item| !item.is_empty())
                .collect(),
            StringOrVec::Vec(values) => values
                .into_iter()
                .map(|item| item.trim().to_uppercase())
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct BacktestYaml {
    data_dir: Option<String>,
    signals_file: Option<String>,
    anchor_symbol: Option<String>,
    universe_symbols: Option<StringOrVec>,
    entry_threshold: Option<f64>,
    close_threshold: Option<f64>,
    trading_weeks: Option<usize>,
    training_weeks: Option<usize>,
    initial_capital_usd: Option<f64>,
    fee_rate: Option<f64>,
    fee_notional_usd: Option<f64>,
    cointegration_test: Option<String>,
    adf_p_threshold: Option<f64>,
    kss_t_crit: Option<f64>,
    risk_free_rate: Option<f64>,
    trajectory_file: Option<String>,
    summary_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CointegrationTest {
    Adf,
    Kss,
}

impl std::str::FromStr for CointegrationTest {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adf" => Ok(CointegrationTest::Adf),
            "kss" => Ok(CointegrationTest::Kss),
            other => Err(ConfigError::UnknownCointegrationTest(other.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ThresholdOutOfRange { name: &'static str, value: f64 },
    NonPositive { name: &'static str },
    UnknownCointegrationTest(String),
    AnchorNotInUniverse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ThresholdOutOfRange { name, value } => {
                write!(f, "{} must lie in (0, 0.5), got {}", name, value)
            }
            ConfigError::NonPositive { name } => write!(f, "{} must be positive", name),
            ConfigError::UnknownCointegrationTest(value) => {
                write!(
                    f,
                    "unknown cointegration test '{}' (expected adf or kss)",
                    value
                )
            }
            ConfigError::AnchorNotInUniverse(anchor) => {
                write!(f, "anchor symbol {} is not part of the universe", anchor)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub signals_file: String,
    pub anchor_symbol: String,
    pub universe: Vec<String>,
    pub entry_threshold: f64,
    pub close_threshold: f64,
    pub trading_weeks: usize,
    pub training_weeks: usize,
    pub initial_capital: f64,
    pub fee_rate: f64,
    pub fee_notional: f64,
    pub cointegration_test: CointegrationTest,
    pub adf_p_threshold: f64,
    pub kss_t_crit: f64,
    pub risk_free_rate: f64,
    pub trajectory_file: Option<String>,
    pub summary_file: Option<String>,
}

impl BacktestConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("STATARB_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| {
                env::var("BACKTEST_CONFIG")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
            });
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open backtest config {}", path_ref.display()))?;
        let yaml: BacktestYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse backtest config {}", path_ref.display()))?;

        let universe = yaml
            .universe_symbols
            .map(StringOrVec::into_vec)
            .unwrap_or_else(default_universe);
        let cointegration_test = match yaml.cointegration_test {
            Some(raw) => raw.parse::<CointegrationTest>()?,
            None => CointegrationTest::Adf,
        };

        let mut cfg = BacktestConfig {
            data_dir: yaml.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            signals_file: yaml
                .signals_file
                .unwrap_or_else(|| DEFAULT_SIGNALS_FILE.to_string()),
            anchor_symbol: yaml
                .anchor_symbol
                .map(|value| value.trim().to_uppercase())
                .unwrap_or_else(|| DEFAULT_ANCHOR_SYMBOL.to_string()),
            universe,
            entry_threshold: yaml.entry_threshold.unwrap_or(DEFAULT_ENTRY_THRESHOLD),
            close_threshold: yaml.close_threshold.unwrap_or(DEFAULT_CLOSE_THRESHOLD),
            trading_weeks: yaml.trading_weeks.unwrap_or(DEFAULT_TRADING_WEEKS),
            training_weeks: yaml.training_weeks.unwrap_or(DEFAULT_TRAINING_WEEKS),
            initial_capital: yaml
                .initial_capital_usd
                .unwrap_or(DEFAULT_INITIAL_CAPITAL_USD),
            fee_rate: yaml.fee_rate.unwrap_or(DEFAULT_FEE_RATE),
            fee_notional: yaml.fee_notional_usd.unwrap_or(DEFAULT_FEE_NOTIONAL_USD),
            cointegration_test,
            adf_p_threshold: yaml.adf_p_threshold.unwrap_or(DEFAULT_ADF_P_THRESHOLD),
            kss_t_crit: yaml.kss_t_crit.unwrap_or(DEFAULT_KSS_T_CRIT),
            risk_free_rate: yaml.risk_free_rate.unwrap_or(DEFAULT_RISK_FREE_RATE),
            trajectory_file: yaml.trajectory_file,
            summary_file: yaml.summary_file,
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        let signals_file =
            env::var("SIGNALS_FILE").unwrap_or_else(|_| DEFAULT_SIGNALS_FILE.to_string());
        let anchor_symbol = env::var("ANCHOR_SYMBOL")
            .map(|value| value.trim().to_uppercase())
            .unwrap_or_else(|_| DEFAULT_ANCHOR_SYMBOL.to_string());
        let universe = env::var("UNIVERSE_SYMBOLS")
            .ok()
            .map(|raw| StringOrVec::String(raw).into_vec())
            .filter(|symbols| !symbols.is_empty())
            .unwrap_or_else(default_universe);
        let entry_threshold = env::var("ENTRY_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ENTRY_THRESHOLD);
        let close_threshold = env::var("CLOSE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CLOSE_THRESHOLD);
        let trading_weeks = env::var("TRADING_WEEKS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TRADING_WEEKS);
        let training_weeks = env::var("TRAINING_WEEKS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TRAINING_WEEKS);
        let initial_capital = env::var("INITIAL_CAPITAL_USD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_INITIAL_CAPITAL_USD);
        let fee_rate = env::var("FEE_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_FEE_RATE);
        let fee_notional = env::var("FEE_NOTIONAL_USD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_FEE_NOTIONAL_USD);
        let cointegration_test = match env::var("COINTEGRATION_TEST") {
            Ok(raw) if !raw.trim().is_empty() => raw.parse::<CointegrationTest>()?,
            _ => CointegrationTest::Adf,
        };
        let adf_p_threshold = env::var("ADF_P_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ADF_P_THRESHOLD);
        let kss_t_crit = env::var("KSS_T_CRIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_KSS_T_CRIT);
        let risk_free_rate = env::var("RISK_FREE_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RISK_FREE_RATE);
        let trajectory_file = env::var("TRAJECTORY_FILE")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let summary_file = env::var("SUMMARY_FILE")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let cfg = BacktestConfig {
            data_dir,
            signals_file,
            anchor_symbol,
            universe,
            entry_threshold,
            close_threshold,
            trading_weeks,
            training_weeks,
            initial_capital,
            fee_rate,
            fee_notional,
            cointegration_test,
            adf_p_threshold,
            kss_t_crit,
            risk_free_rate,
            trajectory_file,
            summary_file,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("DATA_DIR") {
            if !value.trim().is_empty() {
                self.data_dir = value;
            }
        }
        if let Ok(value) = env::var("SIGNALS_FILE") {
            if !value.trim().is_empty() {
                self.signals_file = value;
            }
        }
        if let Ok(value) = env::var("ANCHOR_SYMBOL") {
            if !value.trim().is_empty() {
                self.anchor_symbol = value.trim().to_uppercase();
            }
        }
        if let Ok(value) = env::var("UNIVERSE_SYMBOLS") {
            let symbols = StringOrVec::String(value).into_vec();
            if !symbols.is_empty() {
                self.universe = symbols;
            }
        }
        if let Ok(value) = env::var("ENTRY_THRESHOLD") {
            if let Ok(parsed) = value.parse() {
                self.entry_threshold = parsed;
            }
        }
        if let Ok(value) = env::var("CLOSE_THRESHOLD") {
            if let Ok(parsed) = value.parse() {
                self.close_threshold = parsed;
            }
        }
        if let Ok(value) = env::var("TRADING_WEEKS") {
            if let Ok(parsed) = value.parse() {
                self.trading_weeks = parsed;
            }
        }
        if let Ok(value) = env::var("TRAINING_WEEKS") {
            if let Ok(parsed) = value.parse() {
                self.training_weeks = parsed;
            }
        }
        if let Ok(value) = env::var("INITIAL_CAPITAL_USD") {
            if let Ok(parsed) = value.parse() {
                self.initial_capital = parsed;
            }
        }
        if let Ok(value) = env::var("FEE_RATE") {
            if let Ok(parsed) = value.parse() {
                self.fee_rate = parsed;
            }
        }
        if let Ok(value) = env::var("FEE_NOTIONAL_USD") {
            if let Ok(parsed) = value.parse() {
                self.fee_notional = parsed;
            }
        }
        if let Ok(value) = env::var("COINTEGRATION_TEST") {
            if !value.trim().is_empty() {
                self.cointegration_test = value.parse::<CointegrationTest>()?;
            }
        }
        if let Ok(value) = env::var("ADF_P_THRESHOLD") {
            if let Ok(parsed) = value.parse() {
                self.adf_p_threshold = parsed;
            }
        }
        if let Ok(value) = env::var("KSS_T_CRIT") {
            if let Ok(parsed) = value.parse() {
                self.kss_t_crit = parsed;
            }
        }
        if let Ok(value) = env::var("RISK_FREE_RATE") {
            if let Ok(parsed) = value.parse() {
                self.risk_free_rate = parsed;
            }
        }
        if let Ok(value) = env::var("TRAJECTORY_FILE") {
            if !value.trim().is_empty() {
                self.trajectory_file = Some(value);
            }
        }
        if let Ok(value) = env::var("SUMMARY_FILE") {
            if !value.trim().is_empty() {
                self.summary_file = Some(value);
            }
        }
        Ok(())
    }

    /// Thresholds and counts are checked once here so a bad run aborts
    /// before any data is loaded, never mid-simulation.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(self.entry_threshold > 0.0 && self.entry_threshold < 0.5) {
            return Err(ConfigError::ThresholdOutOfRange {
                name: "entry_threshold",
                value: self.entry_threshold,
            });
        }
        if !(self.close_threshold > 0.0 && self.close_threshold < 0.5) {
            return Err(ConfigError::ThresholdOutOfRange {
                name: "close_threshold",
                value: self.close_threshold,
            });
        }
        if self.trading_weeks == 0 {
            return Err(ConfigError::NonPositive {
                name: "trading_weeks",
            });
        }
        if !(self.initial_capital > 0.0) {
            return Err(ConfigError::NonPositive {
                name: "initial_capital_usd",
            });
        }
        if self.fee_rate < 0.0 {
            return Err(ConfigError::NonPositive { name: "fee_rate" });
        }
        if self.fee_notional < 0.0 {
            return Err(ConfigError::NonPositive {
                name: "fee_notional_usd",
            });
        }
        if !self
            .universe
            .iter()
            .any(|symbol| symbol == &self.anchor_symbol)
        {
            return Err(ConfigError::AnchorNotInUniverse(self.anchor_symbol.clone()));
        }
        Ok(())
    }

    /// Hours of selection lookback preceding trading week 0.
    pub fn training_hours(&self) -> usize {
        self.training_weeks * HOURS_PER_WEEK
    }

    /// Absolute hour of the first simulated hour of `week`.
    pub fn week_offset(&self, week: usize) -> usize {
        (self.training_weeks + week) * HOURS_PER_WEEK
    }

    /// Total hours of history the run will query, lookback included.
    pub fn required_history_hours(&self) -> usize {
        (self.training_weeks + self.trading_weeks) * HOURS_PER_WEEK
    }
}

fn default_universe() -> Vec<String> {
    DEFAULT_UNIVERSE.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> BacktestConfig {
        BacktestConfig {
            data_dir: "Data".to_string(),
            signals_file: "signals.csv".to_string(),
            anchor_symbol: "BTC".to_string(),
            universe: vec!["BTC".to_string(), "ETH".to_string()],
            entry_threshold: 0.1,
            close_threshold: 0.1,
            trading_weeks: 104,
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

    #[test]
    fn yaml_config_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "data_dir: klines\nsignals_file: mi.csv\nentry_threshold: 0.05\nuniverse_symbols: \"btc, eth, ada\"\ncointegration_test: kss\ntrading_weeks: 10"
        )
        .unwrap();
        let cfg = BacktestConfig::from_yaml_path(file.path()).unwrap();
        assert_eq!(cfg.data_dir, "klines");
        assert_eq!(cfg.signals_file, "mi.csv");
        assert_eq!(cfg.entry_threshold, 0.05);
        assert_eq!(cfg.universe, vec!["BTC", "ETH", "ADA"]);
        assert_eq!(cfg.cointegration_test, CointegrationTest::Kss);
        assert_eq!(cfg.trading_weeks, 10);
        // untouched fields keep their defaults
        assert_eq!(cfg.close_threshold, DEFAULT_CLOSE_THRESHOLD);
        assert_eq!(cfg.initial_capital, DEFAULT_INITIAL_CAPITAL_USD);
    }

    #[test]
    fn validate_rejects_entry_threshold_at_half() {
        let mut cfg = base_config();
        cfg.entry_threshold = 0.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ThresholdOutOfRange {
                name: "entry_threshold",
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_zero_close_threshold() {
        let mut cfg = base_config();
        cfg.close_threshold = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_anchor_in_universe() {
        let mut cfg = base_config();
        cfg.universe = vec!["ETH".to_string(), "ADA".to_string()];
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::AnchorNotInUniverse(_))
        ));
    }

    #[test]
    fn cointegration_test_parses_known_names() {
        assert_eq!(
            "adf".parse::<CointegrationTest>().unwrap(),
            CointegrationTest::Adf
        );
        assert_eq!(
            "KSS".parse::<CointegrationTest>().unwrap(),
            CointegrationTest::Kss
        );
        assert!("johansen".parse::<CointegrationTest>().is_err());
    }

    #[test]
    fn week_offset_includes_training_window() {
        let cfg = base_config();
        assert_eq!(cfg.week_offset(0), 504);
        assert_eq!(cfg.week_offset(1), 672);
        assert_eq!(cfg.required_history_hours(), 107 * HOURS_PER_WEEK);
    }
}
