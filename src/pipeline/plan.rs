use chrono::NaiveDate;
use tracing::{info, warn};

use crate::source::{Feed, Layout};
use crate::util::time::date_range;

use super::{DownloadTask, TaskStatus};

/// Expand symbols x inclusive date range into day-tasks, ordered by date then
/// symbol. Dates before the feed's availability floor are clipped with a
/// warning; (symbol, date) pairs whose committed file already exists are
/// excluded unless `force` is set.
pub fn plan_orderbook_tasks(
    layout: &Layout,
    symbols: &[String],
    start: NaiveDate,
    end: NaiveDate,
    force: bool,
) -> anyhow::Result<Vec<DownloadTask>> {
    anyhow::ensure!(start <= end, "start date {start} is after end date {end}");

    let floor = Feed::Orderbook.availability_floor();
    let start = if start < floor {
        warn!("start date {start} predates order-book availability; clipping to {floor}");
        floor
    } else {
        start
    };
    if end < floor {
        warn!("requested range ends before order-book availability {floor}; nothing to do");
        return Ok(Vec::new());
    }

    let mut symbols: Vec<String> = symbols.iter().map(|s| s.trim().to_uppercase()).collect();
    symbols.sort();
    symbols.dedup();

    let mut tasks = Vec::new();
    let mut already = 0usize;
    for date in date_range(start, end) {
        for symbol in &symbols {
            if !force && layout.orderbook_parquet_path(symbol, date).exists() {
                already += 1;
                continue;
            }
            tasks.push(DownloadTask {
                symbol: symbol.clone(),
                date,
                attempt_count: 0,
                status: TaskStatus::Pending,
            });
        }
    }

    info!("planned {} tasks, {} already committed", tasks.len(), already);
    Ok(tasks)
}
