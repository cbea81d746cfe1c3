use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bybit_archive::config::OrderbookArgs;
use bybit_archive::pipeline::{plan_orderbook_tasks, run_pool, DiskGuard};
use bybit_archive::source::{self, Layout};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let args = OrderbookArgs::parse();
    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: OrderbookArgs) -> anyhow::Result<u8> {
    args.validate()?;
    let symbols = args.resolved_symbols();

    info!("bybit order-book archive downloader");
    info!(
        "symbols: {} | range: {} .. {} | output: {}",
        symbols.join(","),
        args.start_date,
        args.end_date,
        args.output_dir.display()
    );

    let layout = Layout::new(&args.output_dir);
    let tasks = plan_orderbook_tasks(
        &layout,
        &symbols,
        args.start_date,
        args.end_date,
        args.force,
    )?;
    if tasks.is_empty() {
        info!("nothing to do");
        return Ok(0);
    }

    if args.dry_run {
        for task in &tasks {
            println!("{}", source::orderbook_archive_url(&task.symbol, task.date));
        }
        info!("dry run: {} tasks, nothing downloaded", tasks.len());
        return Ok(0);
    }

    std::fs::create_dir_all(&args.output_dir)?;
    let guard = DiskGuard::new(&args.output_dir, args.min_disk);
    let total = tasks.len();
    let summary = run_pool(&layout, tasks, &args.pool_config(), &guard);

    info!(
        "done: {} committed, {} empty, {} failed, {} remaining of {total}",
        summary.committed, summary.empty, summary.failed, summary.remaining
    );
    info!(
        "wrote {} rows, {:.1} MB parquet",
        summary.rows,
        summary.bytes_written as f64 / 1e6
    );
    if let Some(free) = guard.last_free_bytes() {
        info!("free disk: {:.1} GB", free as f64 / 1e9);
    }
    if summary.halted {
        error!("stopped early: free disk space fell below {} GB", args.min_disk);
    }

    Ok(summary.exit_code())
}
