use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::config::DownloadSettings;
use crate::fetch::{RangeFetcher, RetryPolicy, SharedCounter};
use crate::progress::ProgressReporter;
use crate::{Error, Result};

/// One way of getting the resource onto disk. Strategies are tried in
/// order; a transport or validation failure moves on to the next one.
pub trait DownloadStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn run<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        reporter: Option<Arc<ProgressReporter>>,
    ) -> BoxFuture<'a, Result<()>>;
}

pub struct Downloader {
    strategies: Vec<Box<dyn DownloadStrategy>>,
    min_archive_bytes: u64,
}

impl Downloader {
    pub fn new(settings: &DownloadSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .build()
            .map_err(|e| Error::Transport {
                message: format!("http client init failed: {e}"),
            })?;

        let mut strategies: Vec<Box<dyn DownloadStrategy>> = Vec::new();
        if settings.prefer_aria2 {
            strategies.push(Box::new(Aria2Strategy {
                settings: settings.clone(),
            }));
        }
        strategies.push(Box::new(MultiStreamStrategy {
            client: client.clone(),
            settings: settings.clone(),
        }));
        strategies.push(Box::new(SingleStreamStrategy {
            client,
            settings: settings.clone(),
        }));

        Ok(Self {
            strategies,
            min_archive_bytes: settings.min_archive_bytes,
        })
    }

    /// Walks the strategy chain until one produces a destination that
    /// passes validation. Exhaustion surfaces the last error.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        reporter: Option<Arc<ProgressReporter>>,
    ) -> Result<PathBuf> {
        let mut last_err = Error::Transport {
            message: "no download strategy configured".to_string(),
        };

        for strategy in &self.strategies {
            debug!(
                event = "download.strategy_start",
                strategy = strategy.name(),
                "download.strategy_start"
            );
            match strategy.run(url, dest, reporter.clone()).await {
                Ok(()) => match validate_archive(dest, self.min_archive_bytes) {
                    Ok(()) => return Ok(dest.to_path_buf()),
                    Err(e) => {
                        warn!(
                            event = "download.validation_failed",
                            strategy = strategy.name(),
                            error = %e,
                            "download.validation_failed"
                        );
                        last_err = e;
                    }
                },
                Err(e) => {
                    warn!(
                        event = "download.strategy_failed",
                        strategy = strategy.name(),
                        error = %e,
                        "download.strategy_failed"
                    );
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }
}

fn retry_policy(settings: &DownloadSettings) -> RetryPolicy {
    RetryPolicy {
        max_retries: settings.max_retries,
        base_delay: Duration::from_millis(settings.base_delay_ms),
        max_delay: Duration::from_millis(settings.max_delay_ms),
        jitter: true,
    }
}

/// Splits `[0, total)` into per-worker inclusive byte ranges. The worker
/// count shrinks for small files so no chunk goes below the floor, and
/// the last range absorbs the remainder.
pub fn plan_ranges(total: u64, max_workers: u32, min_chunk_bytes: u64) -> Vec<(u64, u64)> {
    if total == 0 {
        return Vec::new();
    }
    let by_floor = (total / min_chunk_bytes.max(1)).max(1);
    let workers = by_floor.min(u64::from(max_workers.max(1)));
    let base = total / workers;

    let mut ranges = Vec::with_capacity(workers as usize);
    for i in 0..workers {
        let start = i * base;
        let end = if i == workers - 1 {
            total - 1
        } else {
            (i + 1) * base - 1
        };
        ranges.push((start, end));
    }
    ranges
}

struct MultiStreamStrategy {
    client: reqwest::Client,
    settings: DownloadSettings,
}

impl MultiStreamStrategy {
    async fn probe_size(&self, url: &str) -> Result<u64> {
        let response = self
            .client
            .head(url)
            .header("User-Agent", &self.settings.user_agent)
            .send()
            .await
            .map_err(|e| Error::Transport {
                message: format!("size probe failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport {
                message: format!("size probe http {status}"),
            });
        }

        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|len| *len > 0)
            .ok_or_else(|| Error::Transport {
                message: "resource size unknown".to_string(),
            })
    }
}

impl DownloadStrategy for MultiStreamStrategy {
    fn name(&self) -> &'static str {
        "multi-stream"
    }

    fn run<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        reporter: Option<Arc<ProgressReporter>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let total = self.probe_size(url).await?;
            if let Some(reporter) = &reporter {
                reporter.set_total(total);
            }

            // Pre-size the file so every worker can seek+write its own slice.
            let file = tokio::fs::File::create(dest).await?;
            file.set_len(total).await?;
            drop(file);

            let ranges = plan_ranges(total, self.settings.max_workers, self.settings.min_chunk_bytes);
            debug!(
                event = "download.plan",
                total,
                workers = ranges.len(),
                "download.plan"
            );

            let counter = Arc::new(SharedCounter::new(reporter.clone()));
            let fetcher = RangeFetcher::new(
                self.client.clone(),
                url.to_string(),
                self.settings.user_agent.clone(),
                retry_policy(&self.settings),
            );

            let mut workers = tokio::task::JoinSet::new();
            for (start, end) in ranges {
                let fetcher = fetcher.clone();
                let counter = counter.clone();
                let dest = dest.to_path_buf();
                workers.spawn(async move {
                    fetcher.fetch_range(&dest, start, end, &counter).await
                });
            }

            while let Some(joined) = workers.join_next().await {
                let outcome = match joined {
                    Ok(result) => result,
                    Err(e) => Err(Error::Transport {
                        message: format!("download worker panicked: {e}"),
                    }),
                };
                if let Err(e) = outcome {
                    // No sibling may still hold the destination open when a
                    // fallback strategy rewrites it.
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    return Err(e);
                }
            }

            let written = counter.current().await;
            if written != total {
                return Err(Error::Validation {
                    message: format!("short body: wrote {written} of {total} bytes"),
                });
            }

            if let Some(reporter) = &reporter {
                reporter.finish(total);
            }
            Ok(())
        })
    }
}

struct SingleStreamStrategy {
    client: reqwest::Client,
    settings: DownloadSettings,
}

impl SingleStreamStrategy {
    async fn attempt(
        &self,
        url: &str,
        dest: &Path,
        reporter: Option<&Arc<ProgressReporter>>,
    ) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .header("User-Agent", &self.settings.user_agent)
            .header("Accept-Encoding", "identity")
            .send()
            .await
            .map_err(|e| Error::Transport {
                message: format!("download request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport {
                message: format!("download http {status}"),
            });
        }

        let total = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let (Some(reporter), Some(total)) = (reporter, total) {
            reporter.set_total(total);
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| Error::Transport {
            message: format!("download body read failed: {e}"),
        })? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(reporter) = reporter {
                reporter.update(written);
            }
        }
        file.flush().await?;
        Ok(written)
    }
}

impl DownloadStrategy for SingleStreamStrategy {
    fn name(&self) -> &'static str {
        "single-stream"
    }

    fn run<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        reporter: Option<Arc<ProgressReporter>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let policy = retry_policy(&self.settings);
            let mut attempt = 0u32;
            let written = loop {
                match self.attempt(url, dest, reporter.as_ref()).await {
                    Ok(written) => break written,
                    Err(e) => {
                        if attempt >= policy.max_retries {
                            return Err(e);
                        }
                        let delay = policy.delay_for_attempt(attempt);
                        warn!(
                            event = "download.single_retry",
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "download.single_retry"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            };

            // Some mirrors gzip the body even when asked not to.
            let dest_owned = dest.to_path_buf();
            let inflated = tokio::task::spawn_blocking(move || maybe_inflate_gzip(&dest_owned))
                .await
                .map_err(|e| Error::Transport {
                    message: format!("inflate task panicked: {e}"),
                })??;
            if inflated {
                debug!(event = "download.inflated_gzip", "download.inflated_gzip");
            }

            if let Some(reporter) = &reporter {
                reporter.finish(written);
            }
            Ok(())
        })
    }
}

/// Inflates `path` in place when it carries the gzip magic. Returns
/// whether an inflation happened.
fn maybe_inflate_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    {
        let mut file = std::fs::File::open(path)?;
        if file.read(&mut magic)? < 2 || magic != [0x1f, 0x8b] {
            return Ok(false);
        }
    }

    let inflated_path = path.with_extension("inflated");
    {
        let file = std::fs::File::open(path)?;
        let mut decoder = flate2::read::MultiGzDecoder::new(std::io::BufReader::new(file));
        let mut out = std::io::BufWriter::new(std::fs::File::create(&inflated_path)?);
        if std::io::copy(&mut decoder, &mut out).is_err() {
            // Not actually gzip despite the magic; keep the original bytes.
            let _ = std::fs::remove_file(&inflated_path);
            return Ok(false);
        }
        use std::io::Write as _;
        out.flush()?;
    }
    std::fs::rename(&inflated_path, path)?;
    Ok(true)
}

struct Aria2Strategy {
    settings: DownloadSettings,
}

impl DownloadStrategy for Aria2Strategy {
    fn name(&self) -> &'static str {
        "aria2"
    }

    fn run<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        reporter: Option<Arc<ProgressReporter>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let dir = dest.parent().ok_or_else(|| Error::InvalidConfig {
                message: "download destination has no parent directory".to_string(),
            })?;
            let out = dest
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::NonUtf8Path {
                    path: dest.to_path_buf(),
                })?;

            let connections = self.settings.aria2_connections.to_string();
            let mut child = tokio::process::Command::new(&self.settings.aria2_binary)
                .arg(url)
                .arg("--dir")
                .arg(dir)
                .arg("--out")
                .arg(out)
                .arg("-x")
                .arg(&connections)
                .arg("-s")
                .arg(&connections)
                .arg("--min-split-size=1M")
                .arg("--file-allocation=none")
                .arg("--auto-file-renaming=false")
                .arg("--allow-overwrite=true")
                .arg(format!("--max-tries={}", self.settings.max_retries + 1))
                .arg("--summary-interval=1")
                .arg("--console-log-level=notice")
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| Error::Transport {
                    message: format!("aria2c spawn failed: {e}"),
                })?;

            if let Some(stdout) = child.stdout.take() {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let (Some(reporter), Some((current, total))) =
                        (reporter.as_ref(), parse_aria2_progress(&line))
                    {
                        reporter.set_total(total);
                        reporter.update(current);
                    }
                }
            }

            let status = child.wait().await.map_err(|e| Error::Transport {
                message: format!("aria2c wait failed: {e}"),
            })?;
            if !status.success() {
                return Err(Error::Transport {
                    message: format!("aria2c exited with {status}"),
                });
            }
            Ok(())
        })
    }
}

/// Pulls `(current, total)` bytes out of an aria2 summary line, e.g.
/// `[#2089b0 400MiB/33.2GiB(1%) CN:16 DL:115MiB ETA:4m51s]`.
pub fn parse_aria2_progress(line: &str) -> Option<(u64, u64)> {
    if !line.starts_with("[#") {
        return None;
    }
    for token in line.split_whitespace() {
        let Some(slash) = token.find('/') else {
            continue;
        };
        let current = parse_size_token(&token[..slash])?;
        let rest = &token[slash + 1..];
        let total_end = rest.find('(').unwrap_or(rest.len());
        let total = parse_size_token(&rest[..total_end])?;
        return Some((current, total));
    }
    None
}

fn parse_size_token(token: &str) -> Option<u64> {
    let digits_end = token
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    if digits_end == 0 {
        return None;
    }
    let value: f64 = token[..digits_end].parse().ok()?;
    let multiplier = match &token[digits_end..] {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

/// Post-download sanity gate: the destination must exist, be non-trivial,
/// not be an HTML error page, and open as a ZIP container.
pub fn validate_archive(path: &Path, min_bytes: u64) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|_| Error::Validation {
        message: "destination file missing".to_string(),
    })?;
    if metadata.len() < min_bytes {
        return Err(Error::Validation {
            message: format!("file too small ({} bytes)", metadata.len()),
        });
    }

    let mut head = vec![0u8; 512];
    let mut file = std::fs::File::open(path)?;
    let read = file.read(&mut head)?;
    head.truncate(read);
    if looks_like_html(&head) {
        return Err(Error::Validation {
            message: "body is an html error page, not an archive".to_string(),
        });
    }

    let file = std::fs::File::open(path)?;
    zip::ZipArchive::new(file).map_err(|e| Error::Validation {
        message: format!("not a valid zip archive: {e}"),
    })?;
    Ok(())
}

pub fn looks_like_html(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start().to_ascii_lowercase();
    trimmed.starts_with("<html") || trimmed.starts_with("<!doctype")
}
