//! Offline converter: turn already-downloaded daily order-book ZIP archives
//! into committed Parquet files, without touching the network.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bybit_archive::convert::{convert_archive, ConvertOptions};
use bybit_archive::writer::count_rows;

#[derive(Debug, Parser)]
#[command(name = "convert_orderbook", version, about)]
struct Args {
    /// Directory holding `*_ob200.data.zip` archives.
    #[arg(long)]
    input: PathBuf,

    /// Directory for the committed Parquet files.
    #[arg(long)]
    output: PathBuf,

    /// Convert archives even when the Parquet file already exists.
    #[arg(long)]
    force: bool,

    /// Skip the post-commit row-count verification pass.
    #[arg(long)]
    no_verify: bool,
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
    let mut archives: Vec<PathBuf> = std::fs::read_dir(&args.input)
        .with_context(|| format!("read input dir {}", args.input.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "zip"))
        .collect();
    archives.sort();
    info!("{} archives under {}", archives.len(), args.input.display());

    let opts = ConvertOptions::default();
    let mut converted = 0u64;
    let mut skipped = 0u64;
    let mut failed = 0u64;
    for zip_path in &archives {
        let final_path = args.output.join(parquet_name(zip_path)?);
        if !args.force && final_path.exists() {
            skipped += 1;
            continue;
        }
        match convert_archive(zip_path, &final_path, &opts) {
            Ok(stats) => {
                if !args.no_verify {
                    let rows = count_rows(&final_path)?;
                    anyhow::ensure!(
                        rows == stats.rows,
                        "verification failed for {}: wrote {} rows, file reports {rows}",
                        final_path.display(),
                        stats.rows
                    );
                }
                info!(
                    "{} -> {} rows ({} lines skipped)",
                    zip_path.display(),
                    stats.rows,
                    stats.skipped
                );
                converted += 1;
            }
            Err(err) => {
                warn!("{}: {err:#}", zip_path.display());
                failed += 1;
            }
        }
    }

    info!("done: {converted} converted, {skipped} already present, {failed} failed");
    Ok(failed)
}

/// `2025-05-01_BTCUSDT_ob200.data.zip` -> `2025-05-01_BTCUSDT_ob200.parquet`.
fn parquet_name(zip_path: &std::path::Path) -> anyhow::Result<String> {
    let name = zip_path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("bad archive name {}", zip_path.display()))?;
    let stem = name
        .strip_suffix(".data.zip")
        .or_else(|| name.strip_suffix(".zip"))
        .unwrap_or(name);
    Ok(format!("{stem}.parquet"))
}
