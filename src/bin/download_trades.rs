//! Downloads daily tick-trade archives (gzipped CSV) and stores them verbatim
//! under the raw data tree, committed by atomic rename.

use std::process::ExitCode;
use std::time::Duration;

use chrono::NaiveDate;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bybit_archive::fetch::{Backoff, FetchError, Fetcher};
use bybit_archive::source::{self, Feed, Layout};
use bybit_archive::util::time::date_range;

#[derive(Debug, Parser)]
#[command(name = "download_trades", version, about)]
struct Args {
    /// Single symbol, e.g. BTCUSDT.
    symbol: Option<String>,

    /// Comma-separated symbol list.
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// First day to download (inclusive), YYYY-MM-DD.
    #[arg(long)]
    start_date: NaiveDate,

    /// Last day to download (inclusive), YYYY-MM-DD.
    #[arg(long)]
    end_date: NaiveDate,

    /// Root of the local data tree.
    #[arg(long, default_value = "data")]
    output_dir: std::path::PathBuf,

    /// Number of concurrent download workers.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Total fetch attempts per day, including the first.
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Print the planned URLs and exit without downloading.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    match run(Args::parse()) {
        Ok(failed) if failed == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> anyhow::Result<u64> {
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

    let floor = Feed::Trades.availability_floor();
    let start = args.start_date.max(floor);
    if args.end_date < floor {
        info!("range ends before trade archives begin ({floor}); nothing to do");
        return Ok(0);
    }

    let layout = Layout::new(&args.output_dir);
    let mut tasks = Vec::new();
    for date in date_range(start, args.end_date) {
        for symbol in &symbols {
            if layout.raw_trades_path(symbol, date).exists() {
                continue;
            }
            tasks.push((symbol.clone(), date));
        }
    }
    info!("{} trade archives to download", tasks.len());
    if tasks.is_empty() {
        return Ok(0);
    }
    if args.dry_run {
        for (symbol, date) in &tasks {
            println!("{}", source::trades_archive_url(symbol, *date));
        }
        info!("dry run: nothing downloaded");
        return Ok(0);
    }

    let (task_tx, task_rx) = crossbeam_channel::unbounded::<(String, NaiveDate)>();
    for task in tasks {
        let _ = task_tx.send(task);
    }
    drop(task_tx);
    let (fail_tx, fail_rx) = crossbeam_channel::unbounded::<()>();

    std::thread::scope(|s| {
        for _ in 0..args.workers.max(1) {
            let task_rx = task_rx.clone();
            let fail_tx = fail_tx.clone();
            let layout = &layout;
            let max_attempts = args.max_attempts;
            s.spawn(move || {
                let Ok(fetcher) = Fetcher::new(Duration::from_secs(120)) else {
                    return;
                };
                while let Ok((symbol, date)) = task_rx.try_recv() {
                    if let Err(err) = download_day(&fetcher, layout, &symbol, date, max_attempts) {
                        warn!("{symbol} {date}: {err:#}");
                        let _ = fail_tx.send(());
                    }
                }
            });
        }
    });
    drop(fail_tx);

    let failed = fail_rx.try_iter().count() as u64;
    info!("done, {failed} failures");
    Ok(failed)
}

fn download_day(
    fetcher: &Fetcher,
    layout: &Layout,
    symbol: &str,
    date: NaiveDate,
    max_attempts: u32,
) -> anyhow::Result<()> {
    let url = source::trades_archive_url(symbol, date);
    let final_path = layout.raw_trades_path(symbol, date);
    let dir = layout.raw_dir(Feed::Trades, symbol);
    std::fs::create_dir_all(&dir)?;

    let mut backoff = Backoff::new(max_attempts);
    loop {
        match fetcher.fetch_archive(&url, &dir) {
            Ok(handle) => {
                let bytes = handle.bytes;
                handle.file.persist(&final_path)?;
                info!("{symbol} {date} - {:.1} MB", bytes as f64 / 1e6);
                return Ok(());
            }
            Err(FetchError::MissingDay) => {
                info!("{symbol} {date} - not available (404)");
                return Ok(());
            }
            Err(FetchError::Permanent { status }) => {
                anyhow::bail!("http error: {status}");
            }
            Err(FetchError::Transient(err)) => match backoff.next_delay() {
                Some(delay) => {
                    warn!("{symbol} {date} - {err:#}; retrying in {:.1}s", delay.as_secs_f64());
                    std::thread::sleep(delay);
                }
                None => return Err(err.context(format!("after {} attempts", backoff.attempts()))),
            },
        }
    }
}
