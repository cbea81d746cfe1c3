use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use clap::Parser;

use crate::convert::ConvertOptions;
use crate::pipeline::PoolConfig;

pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_STAGGER_SECS: f64 = 5.0;
pub const DEFAULT_MIN_DISK_GB: f64 = 50.0;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;

/// Download Bybit historical order-book archives and store them as zstd
/// Parquet, one file per symbol per day.
#[derive(Debug, Parser)]
#[command(name = "bybit-archive", version, about)]
pub struct OrderbookArgs {
    /// Single symbol, e.g. BTCUSDT. Mutually additive with --symbols.
    pub symbol: Option<String>,

    /// Comma-separated symbol list, e.g. BTCUSDT,ETHUSDT.
    #[arg(long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// First day to download (inclusive), YYYY-MM-DD.
    #[arg(long)]
    pub start_date: NaiveDate,

    /// Last day to download (inclusive), YYYY-MM-DD.
    #[arg(long)]
    pub end_date: NaiveDate,

    /// Root of the local data tree.
    #[arg(long, default_value = "data")]
    pub output_dir: PathBuf,

    /// Number of concurrent download workers.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Maximum random per-worker startup delay, seconds.
    #[arg(long, default_value_t = DEFAULT_STAGGER_SECS)]
    pub stagger: f64,

    /// Halt new downloads when free disk space drops below this many GB.
    /// 0 disables the guard.
    #[arg(long, default_value_t = DEFAULT_MIN_DISK_GB)]
    pub min_disk: f64,

    /// Total fetch attempts per day, including the first.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Re-download days whose committed file already exists.
    #[arg(long)]
    pub force: bool,

    /// Print the planned URLs and exit without downloading.
    #[arg(long)]
    pub dry_run: bool,
}

impl OrderbookArgs {
    /// Positional symbol plus --symbols, in the order given.
    pub fn resolved_symbols(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(sym) = &self.symbol {
            out.push(sym.clone());
        }
        out.extend(self.symbols.iter().cloned());
        out
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.resolved_symbols().is_empty(),
            "no symbols given; pass a symbol argument or --symbols"
        );
        anyhow::ensure!(
            self.start_date <= self.end_date,
            "--start-date {} is after --end-date {}",
            self.start_date,
            self.end_date
        );
        anyhow::ensure!(self.workers >= 1, "--workers must be at least 1");
        anyhow::ensure!(self.max_attempts >= 1, "--max-attempts must be at least 1");
        anyhow::ensure!(
            self.stagger >= 0.0 && self.stagger.is_finite(),
            "--stagger must be a non-negative number of seconds"
        );
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            stagger_secs: self.stagger,
            max_attempts: self.max_attempts,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            convert: ConvertOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> OrderbookArgs {
        OrderbookArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn positional_and_list_symbols_combine() {
        let args = parse(&[
            "bybit-archive",
            "BTCUSDT",
            "--symbols",
            "ETHUSDT,SOLUSDT",
            "--start-date",
            "2025-05-01",
            "--end-date",
            "2025-05-03",
        ]);
        assert_eq!(args.resolved_symbols(), vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = parse(&[
            "bybit-archive",
            "BTCUSDT",
            "--start-date",
            "2025-05-01",
            "--end-date",
            "2025-05-01",
        ]);
        assert_eq!(args.workers, 3);
        assert_eq!(args.max_attempts, 5);
        assert_eq!(args.output_dir, PathBuf::from("data"));
        assert!(!args.force);
        assert!(!args.dry_run);
    }

    #[test]
    fn missing_symbols_fail_validation() {
        let args = parse(&[
            "bybit-archive",
            "--start-date",
            "2025-05-01",
            "--end-date",
            "2025-05-01",
        ]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn reversed_dates_fail_validation() {
        let args = parse(&[
            "bybit-archive",
            "BTCUSDT",
            "--start-date",
            "2025-05-02",
            "--end-date",
            "2025-05-01",
        ]);
        assert!(args.validate().is_err());
    }
}
