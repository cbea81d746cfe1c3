//! Fetches candles from the public kline REST endpoint month by month,
//! paging backwards from the newest candle, and writes one CSV per month by
//! atomic rename.

use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use chrono::{Datelike, Days, Months, NaiveDate};
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bybit_archive::fetch::{FetchError, Fetcher};
use bybit_archive::source::{self, Feed, Layout, MarketType};
use bybit_archive::util::time::date_start_ms;

const PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Parser)]
#[command(name = "download_klines", version, about)]
struct Args {
    /// Single symbol, e.g. BTCUSDT.
    symbol: Option<String>,

    /// Comma-separated symbol list.
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Candle interval: 1, 5, 15, 60, 240, D, W, M.
    #[arg(long, default_value = "1")]
    interval: String,

    /// Market the symbol trades on.
    #[arg(long, value_enum, default_value_t = MarketType::Spot)]
    source: MarketType,

    /// First day of candles (inclusive), YYYY-MM-DD.
    #[arg(long)]
    start_date: NaiveDate,

    /// Last day of candles (inclusive), YYYY-MM-DD.
    #[arg(long)]
    end_date: NaiveDate,

    /// Root of the local data tree.
    #[arg(long, default_value = "data")]
    output_dir: std::path::PathBuf,

    /// Re-download months whose CSV already exists.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct KlineResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: KlineResult,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut symbols: Vec<String> = args
        .symbol
        .iter()
        .chain(args.symbols.iter())
        .map(|s| s.trim().to_uppercase())
        .collect();
    symbols.sort();
    symbols.dedup();
    anyhow::ensure!(!symbols.is_empty(), "no symbols given");
    anyhow::ensure!(
        args.start_date <= args.end_date,
        "--start-date {} is after --end-date {}",
        args.start_date,
        args.end_date
    );

    let start = args.start_date.max(Feed::Klines.availability_floor());
    if args.end_date < start {
        info!("range ends before kline availability ({start}); nothing to do");
        return Ok(());
    }
    let layout = Layout::new(&args.output_dir);
    let fetcher = Fetcher::new(Duration::from_secs(30))?;

    for symbol in &symbols {
        for (month_start, month_end) in month_windows(start, args.end_date)? {
            let path = layout.klines_path(args.source, symbol, &args.interval, month_start, month_end);
            if !args.force && path.exists() {
                continue;
            }
            let candles = fetch_window(
                &fetcher,
                args.source,
                symbol,
                &args.interval,
                month_start,
                month_end,
            )?;
            if candles.is_empty() {
                info!("{symbol} {month_start}..{month_end} - not available");
                continue;
            }
            write_csv(&path, &candles)?;
            info!("{symbol}: {} candles -> {}", candles.len(), path.display());
        }
    }
    Ok(())
}

/// Calendar-month slices of the inclusive range, each clipped to it.
fn month_windows(start: NaiveDate, end: NaiveDate) -> anyhow::Result<Vec<(NaiveDate, NaiveDate)>> {
    let mut out = Vec::new();
    let mut cur = start;
    while cur <= end {
        let month_first = cur.with_day(1).context("invalid date")?;
        let next_month = month_first
            .checked_add_months(Months::new(1))
            .context("date overflow")?;
        let month_last = next_month
            .checked_sub_days(Days::new(1))
            .context("date underflow")?;
        let window_end = month_last.min(end);
        out.push((cur, window_end));
        cur = match window_end.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(out)
}

/// Page backwards from `end` until the page drains or crosses `start`.
/// Returns candles oldest-first, deduplicated by open time. A 404 from the
/// endpoint reads as "no candles for this window".
fn fetch_window(
    fetcher: &Fetcher,
    market: MarketType,
    symbol: &str,
    interval: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<Vec<Vec<String>>> {
    let start_ms = date_start_ms(start);
    let end_ms = end
        .checked_add_days(Days::new(1))
        .map(date_start_ms)
        .unwrap_or(i64::MAX)
        - 1;

    let mut candles: Vec<Vec<String>> = Vec::new();
    let mut cursor_end = end_ms;
    loop {
        let url = source::kline_rest_url(market, symbol, interval, start_ms, cursor_end, PAGE_LIMIT);
        let resp: KlineResponse = match fetcher.fetch_json(&url) {
            Ok(resp) => resp,
            Err(FetchError::MissingDay) => break,
            Err(err) => return Err(err).context(format!("fetch klines for {symbol}")),
        };
        anyhow::ensure!(
            resp.ret_code == 0,
            "kline api error {}: {}",
            resp.ret_code,
            resp.ret_msg
        );
        if resp.result.list.is_empty() {
            break;
        }

        // Rows arrive newest-first; the oldest open time drives the cursor.
        let oldest_ms = resp
            .result
            .list
            .last()
            .and_then(|row| row.first())
            .and_then(|ts| ts.parse::<i64>().ok())
            .context("kline row missing open time")?;
        candles.extend(resp.result.list);
        if oldest_ms <= start_ms {
            break;
        }
        cursor_end = oldest_ms - 1;
    }

    candles.retain(|row| {
        row.first()
            .and_then(|ts| ts.parse::<i64>().ok())
            .is_some_and(|ts| ts >= start_ms && ts <= end_ms)
    });
    candles.sort_by_key(|row| {
        row.first()
            .and_then(|ts| ts.parse::<i64>().ok())
            .unwrap_or(i64::MAX)
    });
    candles.dedup_by(|a, b| a.first() == b.first());
    Ok(candles)
}

/// Write the candle CSV next to its final path, then rename into place.
fn write_csv(path: &std::path::Path, candles: &[Vec<String>]) -> anyhow::Result<()> {
    let dir = path.parent().context("kline path has no parent")?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    writeln!(tmp, "ts,open,high,low,close,volume,turnover")?;
    for row in candles {
        writeln!(tmp, "{}", row.join(","))?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("publish {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn month_windows_clip_to_the_range() {
        let windows = month_windows(d(2025, 1, 15), d(2025, 3, 10)).unwrap();
        assert_eq!(
            windows,
            vec![
                (d(2025, 1, 15), d(2025, 1, 31)),
                (d(2025, 2, 1), d(2025, 2, 28)),
                (d(2025, 3, 1), d(2025, 3, 10)),
            ]
        );
    }

    #[test]
    fn single_month_range_is_one_window() {
        let windows = month_windows(d(2025, 5, 3), d(2025, 5, 20)).unwrap();
        assert_eq!(windows, vec![(d(2025, 5, 3), d(2025, 5, 20))]);
    }
}
