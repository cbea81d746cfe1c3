use std::path::Path;

use tracing::{debug, warn};

use crate::decode;
use crate::schema;
use crate::writer::DayFileWriter;

/// Only enforce the schema-error bound once this many lines have been seen,
/// so a short prefix of bad lines cannot abort a whole day by itself.
const ERROR_RATIO_MIN_LINES: u64 = 1_000;

#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    /// Rows buffered per Arrow batch / Parquet row group.
    pub batch_rows: usize,
    pub zstd_level: i32,
    /// Abort the conversion when more than this fraction of lines fails
    /// schema validation.
    pub max_error_ratio: f64,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            batch_rows: 50_000,
            zstd_level: 3,
            max_error_ratio: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertStats {
    /// Lines seen in the archive.
    pub lines: u64,
    /// Rows written (structurally valid lines).
    pub rows: u64,
    /// Lines skipped as unparseable or schema-invalid.
    pub skipped: u64,
}

/// Stream one daily ZIP archive through the normalizer into an open writer.
///
/// Records are written in source order. Individual bad lines are counted and
/// skipped; the stream aborts if the container is corrupt or the bad-line
/// ratio exceeds `max_error_ratio`. The caller decides whether to commit.
pub fn stream_archive(
    zip_path: &Path,
    writer: &mut DayFileWriter,
    opts: &ConvertOptions,
) -> anyhow::Result<ConvertStats> {
    let mut seen = 0u64;
    let mut skipped = 0u64;

    let lines = decode::for_each_line(zip_path, |line| {
        seen += 1;
        match schema::normalize_line(line) {
            Ok(rec) => writer.push(&rec)?,
            Err(err) => {
                skipped += 1;
                debug!("skip line {seen}: {err}");
                if seen >= ERROR_RATIO_MIN_LINES {
                    let ratio = skipped as f64 / seen as f64;
                    if ratio > opts.max_error_ratio {
                        anyhow::bail!(
                            "schema error rate {ratio:.3} exceeds bound {:.3} ({skipped}/{seen} lines)",
                            opts.max_error_ratio
                        );
                    }
                }
            }
        }
        Ok(())
    })?;

    if skipped > 0 {
        warn!(
            "archive {} had {skipped} unparseable lines out of {lines}",
            zip_path.display()
        );
    }

    Ok(ConvertStats {
        lines,
        rows: writer.rows(),
        skipped,
    })
}

/// Convert one daily ZIP archive into a committed Parquet file. Thin wrapper
/// over [`stream_archive`] that owns the writer and commits on success.
pub fn convert_archive(
    zip_path: &Path,
    final_path: &Path,
    opts: &ConvertOptions,
) -> anyhow::Result<ConvertStats> {
    let mut writer = DayFileWriter::create(final_path, opts.batch_rows, opts.zstd_level)?;
    let stats = stream_archive(zip_path, &mut writer, opts)?;
    writer.commit()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn ob_line(seq: i64, kind: &str) -> String {
        format!(
            r#"{{"ts":{ts},"cts":{ts},"type":"{kind}","data":{{"u":{seq},"seq":{seq},"b":[["65000.1","0.5"]],"a":[["65000.2","0.3"]]}}}}"#,
            ts = 1714521600000 + seq
        )
    }

    fn write_archive(dir: &Path, lines: &[String]) -> std::path::PathBuf {
        let zip_path = dir.join("2025-05-01_BTCUSDT_ob200.data.zip");
        let mut zw = zip::ZipWriter::new(std::fs::File::create(&zip_path).unwrap());
        zw.start_file("2025-05-01_BTCUSDT_ob200.data", SimpleFileOptions::default())
            .unwrap();
        for line in lines {
            writeln!(zw, "{line}").unwrap();
        }
        zw.finish().unwrap();
        zip_path
    }

    #[test]
    fn bad_lines_are_skipped_not_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut lines = vec![ob_line(0, "snapshot")];
        lines.push("{broken json".to_string());
        for seq in 1..5 {
            lines.push(ob_line(seq, "delta"));
        }
        let zip_path = write_archive(dir.path(), &lines);
        let final_path = dir.path().join("out.parquet");

        let stats = convert_archive(&zip_path, &final_path, &ConvertOptions::default())?;
        assert_eq!(stats.lines, 6);
        assert_eq!(stats.rows, 5);
        assert_eq!(stats.skipped, 1);
        assert_eq!(crate::writer::count_rows(&final_path)?, 5);
        Ok(())
    }

    #[test]
    fn excessive_error_rate_aborts_without_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        // Mostly garbage: ratio check kicks in after the minimum line count.
        let mut lines: Vec<String> = (0..ERROR_RATIO_MIN_LINES)
            .map(|i| format!("garbage line {i}"))
            .collect();
        lines.insert(0, ob_line(0, "snapshot"));
        let zip_path = write_archive(dir.path(), &lines);
        let final_path = dir.path().join("out.parquet");

        let err = convert_archive(&zip_path, &final_path, &ConvertOptions::default()).unwrap_err();
        assert!(err.to_string().contains("schema error rate"));
        assert!(!final_path.exists());
        assert_eq!(
            std::fs::read_dir(dir.path())?
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(".parquet"))
                .count(),
            0
        );
        Ok(())
    }

    #[test]
    fn corrupt_container_is_distinguishable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let zip_path = dir.path().join("broken.zip");
        std::fs::write(&zip_path, b"not a zip")?;
        let final_path = dir.path().join("out.parquet");

        let err = convert_archive(&zip_path, &final_path, &ConvertOptions::default()).unwrap_err();
        assert!(err
            .downcast_ref::<crate::decode::CorruptArchiveError>()
            .is_some());
        assert!(!final_path.exists());
        Ok(())
    }
}
