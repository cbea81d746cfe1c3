pub mod disk;
pub mod plan;

pub use disk::DiskGuard;
pub use plan::plan_orderbook_tasks;

use std::fs;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use crossbeam_channel::{Receiver, Sender};
use rand::Rng;
use tracing::{info, warn};

use crate::convert::{self, ConvertOptions};
use crate::decode::CorruptArchiveError;
use crate::fetch::{Backoff, FetchError, Fetcher};
use crate::source::{self, Layout};
use crate::writer::DayFileWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Downloading,
    Parsing,
    Writing,
    Committed,
    Failed,
}

/// One (symbol, date) unit of work. Owned by a single worker once pulled.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub symbol: String,
    pub date: NaiveDate,
    pub attempt_count: u32,
    pub status: TaskStatus,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Committed { rows: u64, bytes: u64 },
    /// 404: the provider never published this day. Not a failure.
    Empty,
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrency degree (>= 1). Bounds total in-flight downloads.
    pub workers: usize,
    /// Maximum random startup delay per worker, in seconds.
    pub stagger_secs: f64,
    /// Total fetch attempts per task, including the first.
    pub max_attempts: u32,
    pub http_timeout: Duration,
    pub convert: ConvertOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            stagger_secs: 5.0,
            max_attempts: 5,
            http_timeout: Duration::from_secs(120),
            convert: ConvertOptions::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub committed: u64,
    pub empty: u64,
    pub failed: u64,
    /// Tasks never claimed because the disk guard halted the pool.
    pub remaining: u64,
    pub rows: u64,
    pub bytes_written: u64,
    pub halted: bool,
}

impl RunSummary {
    /// 0: everything committed or legitimately empty. 1: disk-guard halt with
    /// tasks remaining. 2: at least one permanent task failure.
    pub fn exit_code(&self) -> u8 {
        if self.halted && self.remaining > 0 {
            1
        } else if self.failed > 0 {
            2
        } else {
            0
        }
    }
}

/// Run the download-and-convert pipeline over `tasks` with a fixed pool of
/// worker threads pulling from a shared queue. Workers stop requesting work
/// once the disk guard halts; tasks already in flight run to a terminal state.
pub fn run_pool(
    layout: &Layout,
    tasks: Vec<DownloadTask>,
    cfg: &PoolConfig,
    guard: &DiskGuard,
) -> RunSummary {
    if tasks.is_empty() {
        return RunSummary::default();
    }

    let (task_tx, task_rx) = crossbeam_channel::unbounded::<DownloadTask>();
    for task in tasks {
        // Channel is unbounded and we hold the receiver: send cannot fail.
        let _ = task_tx.send(task);
    }
    drop(task_tx);
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<(DownloadTask, TaskOutcome)>();

    let workers = cfg.workers.max(1);
    info!("starting {workers} workers, stagger {:.1}s", cfg.stagger_secs);
    std::thread::scope(|s| {
        for worker_id in 1..=workers {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            s.spawn(move || worker_loop(worker_id, layout, cfg, guard, task_rx, done_tx));
        }
    });
    drop(done_tx);

    let mut summary = RunSummary {
        halted: guard.halted(),
        ..RunSummary::default()
    };
    while let Ok((task, outcome)) = done_rx.try_recv() {
        match outcome {
            TaskOutcome::Committed { rows, bytes } => {
                summary.committed += 1;
                summary.rows += rows;
                summary.bytes_written += bytes;
            }
            TaskOutcome::Empty => summary.empty += 1,
            TaskOutcome::Failed { error } => {
                summary.failed += 1;
                warn!("task failed: {} {}: {error}", task.symbol, task.date);
            }
        }
    }
    // Unclaimed tasks stay in the queue for reporting.
    while task_rx.try_recv().is_ok() {
        summary.remaining += 1;
    }
    summary
}

fn worker_loop(
    worker_id: usize,
    layout: &Layout,
    cfg: &PoolConfig,
    guard: &DiskGuard,
    task_rx: Receiver<DownloadTask>,
    done_tx: Sender<(DownloadTask, TaskOutcome)>,
) {
    if cfg.stagger_secs > 0.0 {
        let delay = rand::thread_rng().gen_range(0.0..cfg.stagger_secs);
        info!("[W{worker_id}] waiting {delay:.1}s before start");
        std::thread::sleep(Duration::from_secs_f64(delay));
    }

    let fetcher = match Fetcher::new(cfg.http_timeout) {
        Ok(f) => f,
        Err(err) => {
            warn!("[W{worker_id}] cannot build http client: {err:#}");
            return;
        }
    };

    loop {
        if guard.check() {
            info!("[W{worker_id}] disk guard halted; stopping");
            break;
        }
        let Ok(mut task) = task_rx.try_recv() else {
            break;
        };
        let outcome = run_task(worker_id, &fetcher, layout, &mut task, cfg);
        let _ = done_tx.send((task, outcome));
    }
}

/// Drive one task through fetch -> decode -> normalize -> write, with
/// classified retries. Always leaves the task in a terminal state.
fn run_task(
    worker_id: usize,
    fetcher: &Fetcher,
    layout: &Layout,
    task: &mut DownloadTask,
    cfg: &PoolConfig,
) -> TaskOutcome {
    let symbol = task.symbol.clone();
    let date = task.date;
    let url = source::orderbook_archive_url(&symbol, date);
    let final_path = layout.orderbook_parquet_path(&symbol, date);
    let out_dir = layout.orderbook_parquet_dir(&symbol);
    if let Err(err) = fs::create_dir_all(&out_dir) {
        task.status = TaskStatus::Failed;
        return TaskOutcome::Failed {
            error: format!("create {}: {err}", out_dir.display()),
        };
    }

    let started = Instant::now();
    let mut backoff = Backoff::new(cfg.max_attempts);
    let mut corrupt_retry_used = false;
    loop {
        task.status = TaskStatus::Downloading;
        task.attempt_count = backoff.attempts() + 1;

        let archive = match fetcher.fetch_archive(&url, &out_dir) {
            Ok(handle) => handle,
            Err(FetchError::MissingDay) => {
                info!("[W{worker_id}] {symbol} {date} - not published (404)");
                task.status = TaskStatus::Committed;
                return TaskOutcome::Empty;
            }
            Err(FetchError::Permanent { status }) => {
                task.status = TaskStatus::Failed;
                return TaskOutcome::Failed {
                    error: format!("http error: {status}"),
                };
            }
            Err(FetchError::Transient(err)) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        "[W{worker_id}] {symbol} {date} - {err:#}; retry {}/{} in {:.1}s",
                        backoff.attempts(),
                        cfg.max_attempts,
                        delay.as_secs_f64()
                    );
                    std::thread::sleep(delay);
                    continue;
                }
                None => {
                    task.status = TaskStatus::Failed;
                    return TaskOutcome::Failed {
                        error: format!("{err:#} (after {} attempts)", backoff.attempts()),
                    };
                }
            },
        };
        info!(
            "[W{worker_id}] {symbol} {date} - downloaded {:.1} MB, converting",
            archive.bytes as f64 / 1e6
        );

        task.status = TaskStatus::Parsing;
        let mut writer =
            match DayFileWriter::create(&final_path, cfg.convert.batch_rows, cfg.convert.zstd_level)
            {
                Ok(w) => w,
                Err(err) => {
                    task.status = TaskStatus::Failed;
                    return TaskOutcome::Failed {
                        error: format!("{err:#}"),
                    };
                }
            };
        match convert::stream_archive(archive.path(), &mut writer, &cfg.convert) {
            Ok(stats) => {
                task.status = TaskStatus::Writing;
                let rows = writer.rows();
                match writer.commit() {
                    Ok(path) => {
                        let bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                        task.status = TaskStatus::Committed;
                        info!(
                            "[W{worker_id}] {symbol} {date} - committed {rows} rows ({} skipped) {:.1} MB in {:.1}s",
                            stats.skipped,
                            bytes as f64 / 1e6,
                            started.elapsed().as_secs_f64()
                        );
                        return TaskOutcome::Committed { rows, bytes };
                    }
                    Err(err) => {
                        task.status = TaskStatus::Failed;
                        return TaskOutcome::Failed {
                            error: format!("{err:#}"),
                        };
                    }
                }
            }
            Err(err) if err.downcast_ref::<CorruptArchiveError>().is_some() => {
                // One re-download for a broken container, then give up.
                if corrupt_retry_used {
                    task.status = TaskStatus::Failed;
                    return TaskOutcome::Failed {
                        error: format!("{err:#}"),
                    };
                }
                corrupt_retry_used = true;
                match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "[W{worker_id}] {symbol} {date} - {err:#}; re-downloading in {:.1}s",
                            delay.as_secs_f64()
                        );
                        std::thread::sleep(delay);
                        continue;
                    }
                    None => {
                        task.status = TaskStatus::Failed;
                        return TaskOutcome::Failed {
                            error: format!("{err:#}"),
                        };
                    }
                }
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                return TaskOutcome::Failed {
                    error: format!("{err:#}"),
                };
            }
        }
    }
}
