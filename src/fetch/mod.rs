use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tempfile::NamedTempFile;
use thiserror::Error;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Fetch failures, classified for the retry policy.
#[derive(Debug, Error)]
pub enum FetchError {
    /// 404: the provider has not published this day. Not a failure.
    #[error("no archive published for this day")]
    MissingDay,
    /// Any other 4xx: retrying cannot help.
    #[error("permanent http error: {status}")]
    Permanent { status: StatusCode },
    /// Timeouts, connection errors, 5xx, short reads: worth retrying.
    #[error("transient fetch error: {0:#}")]
    Transient(#[source] anyhow::Error),
}

/// A downloaded daily archive. The temp file is removed on drop unless the
/// caller persists it.
pub struct ArchiveHandle {
    pub url: String,
    pub file: NamedTempFile,
    pub bytes: u64,
}

impl ArchiveHandle {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }

    /// Download `url` into a temp file under `scratch_dir`, verifying the
    /// advertised content length when the server sends one.
    pub fn fetch_archive(&self, url: &str, scratch_dir: &Path) -> Result<ArchiveHandle, FetchError> {
        let mut resp = self.client.get(url).send().map_err(classify_reqwest)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::MissingDay);
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(anyhow::anyhow!(
                "http error: {status}"
            )));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent { status });
        }

        let expected = resp.content_length();
        let mut file = tempfile::Builder::new()
            .prefix("fetch_")
            .suffix(".part")
            .tempfile_in(scratch_dir)
            .map_err(|e| FetchError::Transient(anyhow::Error::new(e).context("create temp file")))?;

        let bytes = io::copy(&mut resp, file.as_file_mut())
            .map_err(|e| FetchError::Transient(anyhow::Error::new(e).context("stream body")))?;

        if let Some(expected) = expected {
            if bytes != expected {
                return Err(FetchError::Transient(anyhow::anyhow!(
                    "incomplete download: {bytes}/{expected} bytes"
                )));
            }
        }

        Ok(ArchiveHandle {
            url: url.to_string(),
            file,
            bytes,
        })
    }

    /// Fetch `url` and parse the JSON body (REST endpoints).
    pub fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.client.get(url).send().map_err(classify_reqwest)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::MissingDay);
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(anyhow::anyhow!(
                "http error: {status}"
            )));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent { status });
        }
        resp.json()
            .map_err(|e| FetchError::Transient(anyhow::Error::new(e).context("decode json body")))
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    // Everything reqwest surfaces before we have a status line is a network
    // problem (DNS, connect, timeout, broken transfer): retryable.
    FetchError::Transient(anyhow::Error::new(err).context("http request"))
}

/// Explicit retry state: attempt count plus the delay before the next try.
/// Exponential, jittered, bounded at `max_attempts` total attempts.
#[derive(Debug)]
pub struct Backoff {
    attempts_made: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attempts made so far (0 before the first try).
    pub fn attempts(&self) -> u32 {
        self.attempts_made
    }

    /// Record a failed attempt. Returns the sleep before the next attempt, or
    /// `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts_made += 1;
        if self.attempts_made >= self.max_attempts {
            return None;
        }
        let exp = BACKOFF_BASE
            .saturating_mul(1u32 << (self.attempts_made - 1).min(16))
            .min(BACKOFF_CAP);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
        Some(exp + Duration::from_millis(jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_allows_max_attempts_minus_one_retries() {
        let mut b = Backoff::new(5);
        let mut delays = 0;
        while b.next_delay().is_some() {
            delays += 1;
        }
        assert_eq!(delays, 4);
        assert_eq!(b.attempts(), 5);
        // Once exhausted, it stays exhausted.
        assert!(b.next_delay().is_none());
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let mut b = Backoff::new(64);
        let mut prev_floor = Duration::ZERO;
        for i in 0..20 {
            let d = b.next_delay().unwrap();
            // Delay never exceeds cap + cap/2 jitter.
            assert!(d <= BACKOFF_CAP + BACKOFF_CAP / 2, "attempt {i}: {d:?}");
            let floor = BACKOFF_BASE
                .saturating_mul(1u32 << i.min(16))
                .min(BACKOFF_CAP);
            assert!(d >= floor);
            assert!(floor >= prev_floor);
            prev_floor = floor;
        }
    }

    #[test]
    fn single_attempt_budget_never_retries() {
        let mut b = Backoff::new(1);
        assert!(b.next_delay().is_none());
    }
}
