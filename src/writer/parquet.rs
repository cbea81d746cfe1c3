use std::fs::{self, create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow::array::{Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tracing::warn;

const BUF_WRITER_CAPACITY_BYTES: usize = 128 * 1024;

/// Writes one day of normalized order-book records to a zstd Parquet file.
///
/// Rows accumulate in an Arrow batch builder and are flushed to a sibling
/// `*_inprogress.parquet` path. [`DayFileWriter::commit`] finishes the file,
/// syncs it, and atomically renames it to the final path; dropping the writer
/// without committing removes the temp file. The final path therefore either
/// does not exist or is complete.
pub struct DayFileWriter {
    writer: Option<ArrowWriter<BufWriter<File>>>,
    builder: RecordColumns,
    batch_rows: usize,
    rows: u64,
    final_path: PathBuf,
    inprogress_path: PathBuf,
    committed: bool,
}

impl DayFileWriter {
    pub fn create(final_path: &Path, batch_rows: usize, zstd_level: i32) -> anyhow::Result<Self> {
        let batch_rows = if batch_rows == 0 { 50_000 } else { batch_rows };
        let dir = final_path.parent().context("output path has no parent")?;
        create_dir_all(dir).with_context(|| format!("create output dir {}", dir.display()))?;

        let inprogress_path = inprogress_sibling(final_path)?;
        if inprogress_path.exists() {
            // Stale temp from an interrupted run; the final path is the only
            // completion marker, so this is safe to discard.
            warn!(
                "removing stale in-progress file: {}",
                inprogress_path.display()
            );
            fs::remove_file(&inprogress_path)
                .with_context(|| format!("remove stale {}", inprogress_path.display()))?;
        }
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&inprogress_path)
            .with_context(|| format!("open output file {}", inprogress_path.display()))?;

        let zstd = ZstdLevel::try_new(zstd_level)
            .or_else(|_| ZstdLevel::try_new(3))
            .context("invalid parquet zstd level")?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(zstd))
            .set_max_row_group_size(batch_rows)
            .build();
        let writer = ArrowWriter::try_new(
            BufWriter::with_capacity(BUF_WRITER_CAPACITY_BYTES, file),
            record_schema(),
            Some(props),
        )
        .context("create ArrowWriter")?;

        Ok(Self {
            writer: Some(writer),
            builder: RecordColumns::new(batch_rows),
            batch_rows,
            rows: 0,
            final_path: final_path.to_path_buf(),
            inprogress_path,
            committed: false,
        })
    }

    pub fn push(&mut self, rec: &crate::schema::OrderBookRecord) -> anyhow::Result<()> {
        self.builder.push(rec);
        self.rows += 1;
        if self.builder.len() >= self.batch_rows {
            self.flush_batch()?;
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn flush_batch(&mut self) -> anyhow::Result<()> {
        if self.builder.len() == 0 {
            return Ok(());
        }
        let batch = self.builder.finish().context("build RecordBatch")?;
        self.writer
            .as_mut()
            .context("writer already closed")?
            .write(&batch)
            .context("write RecordBatch")?;
        Ok(())
    }

    /// Flush the buffered remainder, finish the Parquet footer, sync, and
    /// atomically publish the file under the final path.
    pub fn commit(mut self) -> anyhow::Result<PathBuf> {
        self.flush_batch()?;
        let mut writer = self.writer.take().context("writer already closed")?;
        writer.finish().context("finish parquet file")?;
        let buf = writer.inner_mut();
        buf.flush().context("flush parquet buffer")?;
        buf.get_ref().sync_all().context("sync parquet file")?;
        drop(writer);

        fs::rename(&self.inprogress_path, &self.final_path).with_context(|| {
            format!(
                "rename {} -> {}",
                self.inprogress_path.display(),
                self.final_path.display()
            )
        })?;
        self.committed = true;
        Ok(self.final_path.clone())
    }
}

impl Drop for DayFileWriter {
    fn drop(&mut self) {
        if !self.committed {
            // Release the file handle before unlinking.
            drop(self.writer.take());
            let _ = fs::remove_file(&self.inprogress_path);
        }
    }
}

fn inprogress_sibling(final_path: &Path) -> anyhow::Result<PathBuf> {
    let stem = final_path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("output path has no file stem")?;
    Ok(final_path.with_file_name(format!("{stem}_inprogress.parquet")))
}

struct RecordColumns {
    ts: Int64Builder,
    cts: Int64Builder,
    kind: StringBuilder,
    u: Int64Builder,
    seq: Int64Builder,
    bids: StringBuilder,
    asks: StringBuilder,
    len: usize,
}

impl RecordColumns {
    fn new(capacity: usize) -> Self {
        Self {
            ts: Int64Builder::with_capacity(capacity),
            cts: Int64Builder::with_capacity(capacity),
            kind: StringBuilder::with_capacity(capacity, capacity * 8),
            u: Int64Builder::with_capacity(capacity),
            seq: Int64Builder::with_capacity(capacity),
            bids: StringBuilder::with_capacity(capacity, capacity * 64),
            asks: StringBuilder::with_capacity(capacity, capacity * 64),
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn push(&mut self, rec: &crate::schema::OrderBookRecord) {
        self.ts.append_value(rec.ts);
        self.cts.append_value(rec.cts);
        self.kind.append_value(rec.kind.as_str());
        self.u.append_value(rec.u);
        self.seq.append_value(rec.seq);
        self.bids.append_value(&rec.bids);
        self.asks.append_value(&rec.asks);
        self.len += 1;
    }

    fn finish(&mut self) -> anyhow::Result<RecordBatch> {
        let batch = RecordBatch::try_new(
            record_schema(),
            vec![
                Arc::new(self.ts.finish()),
                Arc::new(self.cts.finish()),
                Arc::new(self.kind.finish()),
                Arc::new(self.u.finish()),
                Arc::new(self.seq.finish()),
                Arc::new(self.bids.finish()),
                Arc::new(self.asks.finish()),
            ],
        )
        .context("RecordBatch::try_new")?;
        self.len = 0;
        Ok(batch)
    }
}

/// Fixed 7-column order-book schema, in column order.
pub fn record_schema() -> SchemaRef {
    static SCHEMA: std::sync::OnceLock<SchemaRef> = std::sync::OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(Schema::new(vec![
                Field::new("ts", DataType::Int64, false),
                Field::new("cts", DataType::Int64, false),
                Field::new("type", DataType::Utf8, false),
                Field::new("u", DataType::Int64, false),
                Field::new("seq", DataType::Int64, false),
                Field::new("bids", DataType::Utf8, false),
                Field::new("asks", DataType::Utf8, false),
            ]))
        })
        .clone()
}

/// Row count from the Parquet footer, without reading the data pages.
pub fn count_rows(path: &Path) -> anyhow::Result<u64> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).context("open parquet reader")?;
    let rows = builder.metadata().file_metadata().num_rows();
    Ok(rows.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{normalize_line, OrderBookRecord, RecordType};

    fn sample_record(seq: i64) -> OrderBookRecord {
        OrderBookRecord {
            ts: 1714521600000 + seq,
            cts: 1714521600000 + seq,
            kind: if seq == 0 {
                RecordType::Snapshot
            } else {
                RecordType::Delta
            },
            u: seq,
            seq,
            bids: r#"[["65000.1","0.5"]]"#.to_string(),
            asks: "[]".to_string(),
        }
    }

    #[test]
    fn commit_publishes_final_path_only() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let final_path = dir.path().join("2025-05-01_BTCUSDT_ob200.parquet");

        let mut w = DayFileWriter::create(&final_path, 4, 3)?;
        for seq in 0..10 {
            w.push(&sample_record(seq))?;
        }
        assert_eq!(w.rows(), 10);
        let committed = w.commit()?;

        assert_eq!(committed, final_path);
        assert!(final_path.exists());
        let stray: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .contains("_inprogress")
            })
            .collect();
        assert!(stray.is_empty(), "no temp file may survive a commit");
        assert_eq!(count_rows(&final_path)?, 10);
        Ok(())
    }

    #[test]
    fn drop_without_commit_leaves_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let final_path = dir.path().join("2025-05-01_BTCUSDT_ob200.parquet");
        {
            let mut w = DayFileWriter::create(&final_path, 4, 3)?;
            w.push(&sample_record(0))?;
            // Dropped before commit: simulated task failure.
        }
        assert!(!final_path.exists());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn empty_commit_yields_zero_row_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let final_path = dir.path().join("2025-05-01_BTCUSDT_ob200.parquet");
        let w = DayFileWriter::create(&final_path, 4, 3)?;
        w.commit()?;
        assert_eq!(count_rows(&final_path)?, 0);
        Ok(())
    }

    #[test]
    fn stale_inprogress_file_is_replaced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let final_path = dir.path().join("2025-05-01_BTCUSDT_ob200.parquet");
        let stale = dir
            .path()
            .join("2025-05-01_BTCUSDT_ob200_inprogress.parquet");
        std::fs::write(&stale, b"half a file")?;

        let mut w = DayFileWriter::create(&final_path, 4, 3)?;
        let line = r#"{"ts":1,"cts":2,"type":"snapshot","data":{"u":1,"seq":1,"b":[],"a":[]}}"#;
        w.push(&normalize_line(line)?)?;
        w.commit()?;
        assert!(final_path.exists());
        assert_eq!(count_rows(&final_path)?, 1);
        Ok(())
    }
}
