use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::util::time::date_str;

const ORDERBOOK_BASE: &str = "https://quote-saver.bycsi.com/orderbook/spot";
const TRADES_BASE: &str = "https://public.bybit.com/spot";
const KLINE_REST_BASE: &str = "https://api.bybit.com/v5/market/kline";

/// Historical feeds published by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    Orderbook,
    Trades,
    Klines,
}

impl Feed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::Orderbook => "orderbook",
            Feed::Trades => "trades",
            Feed::Klines => "klines",
        }
    }

    /// Earliest date for which the provider publishes archives of this feed.
    /// Requests before the floor are clipped by the planner, never sent.
    pub fn availability_floor(&self) -> NaiveDate {
        let (y, m, d) = match self {
            Feed::Orderbook => (2021, 11, 1),
            Feed::Trades => (2020, 3, 25),
            Feed::Klines => (2020, 1, 1),
        };
        NaiveDate::from_ymd_opt(y, m, d).expect("valid feed floor date")
    }
}

/// Kline market type (REST `category` parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MarketType {
    Spot,
    Linear,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Linear => "linear",
        }
    }
}

/// Daily 200-level order-book archive (one line-delimited JSON file in a ZIP).
pub fn orderbook_archive_url(symbol: &str, date: NaiveDate) -> String {
    format!(
        "{ORDERBOOK_BASE}/{symbol}/{}_{symbol}_ob200.data.zip",
        date_str(date)
    )
}

/// Daily tick-trade archive (gzipped CSV).
pub fn trades_archive_url(symbol: &str, date: NaiveDate) -> String {
    format!("{TRADES_BASE}/{symbol}/{symbol}_{}.csv.gz", date_str(date))
}

/// REST kline endpoint, newest-first pages of up to `limit` candles.
pub fn kline_rest_url(
    market: MarketType,
    symbol: &str,
    interval: &str,
    start_ms: i64,
    end_ms: i64,
    limit: u32,
) -> String {
    format!(
        "{KLINE_REST_BASE}?category={}&symbol={symbol}&interval={interval}&start={start_ms}&end={end_ms}&limit={limit}",
        market.as_str()
    )
}

/// On-disk layout rooted at the output directory:
/// raw archives under `raw/<kind>/<symbol>/`, committed columnar files under
/// `parquet/orderbook/<symbol>/`, candles under `klines/{spot|linear}/<symbol>/`.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn orderbook_parquet_dir(&self, symbol: &str) -> PathBuf {
        self.root.join("parquet").join("orderbook").join(symbol)
    }

    /// Final committed path for one (symbol, date). Existence of this file is
    /// the durable completion marker for the task.
    pub fn orderbook_parquet_path(&self, symbol: &str, date: NaiveDate) -> PathBuf {
        self.orderbook_parquet_dir(symbol)
            .join(format!("{}_{symbol}_ob200.parquet", date_str(date)))
    }

    pub fn raw_dir(&self, feed: Feed, symbol: &str) -> PathBuf {
        self.root.join("raw").join(feed.as_str()).join(symbol)
    }

    pub fn raw_trades_path(&self, symbol: &str, date: NaiveDate) -> PathBuf {
        self.raw_dir(Feed::Trades, symbol)
            .join(format!("{symbol}_{}.csv.gz", date_str(date)))
    }

    pub fn klines_dir(&self, market: MarketType, symbol: &str) -> PathBuf {
        self.root.join("klines").join(market.as_str()).join(symbol)
    }

    pub fn klines_path(
        &self,
        market: MarketType,
        symbol: &str,
        interval: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> PathBuf {
        self.klines_dir(market, symbol).join(format!(
            "{symbol}_{interval}_{}_{}.csv",
            date_str(start),
            date_str(end)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn orderbook_url_matches_provider_scheme() {
        assert_eq!(
            orderbook_archive_url("BTCUSDT", d(2025, 5, 1)),
            "https://quote-saver.bycsi.com/orderbook/spot/BTCUSDT/2025-05-01_BTCUSDT_ob200.data.zip"
        );
    }

    #[test]
    fn trades_url_matches_provider_scheme() {
        assert_eq!(
            trades_archive_url("ETHUSDT", d(2025, 1, 31)),
            "https://public.bybit.com/spot/ETHUSDT/ETHUSDT_2025-01-31.csv.gz"
        );
    }

    #[test]
    fn layout_partitions_by_symbol() {
        let layout = Layout::new("data");
        let path = layout.orderbook_parquet_path("BTCUSDT", d(2025, 5, 1));
        assert_eq!(
            path,
            PathBuf::from("data/parquet/orderbook/BTCUSDT/2025-05-01_BTCUSDT_ob200.parquet")
        );
    }
}
