use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;
use zip::ZipArchive;

/// The archive container itself cannot be opened or decompressed. Distinct
/// from single-line parse failures, which are skipped by the caller.
#[derive(Debug, Error)]
#[error("corrupt archive: {0:#}")]
pub struct CorruptArchiveError(#[source] pub anyhow::Error);

fn corrupt(err: impl Into<anyhow::Error>) -> anyhow::Error {
    anyhow::Error::new(CorruptArchiveError(err.into()))
}

/// Stream the first entry of a daily ZIP archive line by line, calling `f`
/// for each line. Decompression is incremental: peak memory stays at a small
/// multiple of one line regardless of archive size.
///
/// Container failures come back as [`CorruptArchiveError`] (via downcast);
/// errors returned by `f` abort the stream and pass through unchanged.
/// Returns the number of lines seen.
pub fn for_each_line<F>(path: &Path, mut f: F) -> anyhow::Result<u64>
where
    F: FnMut(&str) -> anyhow::Result<()>,
{
    let file = File::open(path).map_err(corrupt)?;
    let mut archive = ZipArchive::new(file).map_err(corrupt)?;
    if archive.is_empty() {
        return Err(corrupt(anyhow::anyhow!("archive has no entries")));
    }
    let entry = archive.by_index(0).map_err(corrupt)?;
    let mut reader = BufReader::new(entry);

    let mut lines = 0u64;
    let mut buf = String::new();
    loop {
        buf.clear();
        // A mid-stream inflate error also means the container is broken.
        let n = reader.read_line(&mut buf).map_err(corrupt)?;
        if n == 0 {
            break;
        }
        let line = buf.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        lines += 1;
        f(line)?;
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_archive(lines: &[&str]) -> tempfile::NamedTempFile {
        let tmp = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        let mut zw = zip::ZipWriter::new(tmp.reopen().unwrap());
        zw.start_file("day.data", SimpleFileOptions::default())
            .unwrap();
        for line in lines {
            writeln!(zw, "{line}").unwrap();
        }
        zw.finish().unwrap();
        tmp
    }

    #[test]
    fn streams_every_line_in_order() {
        let tmp = write_archive(&["one", "two", "three"]);
        let mut seen = Vec::new();
        let lines = for_each_line(tmp.path(), |l| {
            seen.push(l.to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(lines, 3);
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[test]
    fn blank_lines_are_not_counted() {
        let tmp = write_archive(&["one", "", "two"]);
        let lines = for_each_line(tmp.path(), |_| Ok(())).unwrap();
        assert_eq!(lines, 2);
    }

    #[test]
    fn non_zip_payload_is_corrupt() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"this is not a zip file").unwrap();
        let err = for_each_line(tmp.path(), |_| Ok(())).unwrap_err();
        assert!(err.downcast_ref::<CorruptArchiveError>().is_some());
    }

    #[test]
    fn callback_error_aborts_and_passes_through() {
        let tmp = write_archive(&["one", "two"]);
        let err = for_each_line(tmp.path(), |_| anyhow::bail!("stop here")).unwrap_err();
        assert!(err.downcast_ref::<CorruptArchiveError>().is_none());
        assert_eq!(err.to_string(), "stop here");
    }
}
