use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::classify::{ExtractedFile, Selection, classify, is_sidecar, should_process};
use crate::config::Settings;
use crate::dispatch::{UploadDispatcher, UploadUnit};
use crate::download::Downloader;
use crate::extract::extract_archive;
use crate::progress::{Phase, ProgressReporter, ProgressSink};
use crate::store::{MessageRef, Store};
use crate::transcode::{MediaTool, SystemMediaTool, TranscodeOutcome, Transcoder};
use crate::Result;

/// One end-to-end download → extract → process → upload run.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub url: String,
    /// Destination identifier for uploads.
    pub chat_id: String,
    /// Parent under which the job's exclusive working directory is made.
    pub work_root: PathBuf,
    pub selection: Selection,
}

#[derive(Default)]
pub struct JobOptions<'a> {
    pub progress: Option<Arc<dyn ProgressSink>>,
    /// Overrides the external transcode processes; tests use a fake.
    pub media_tool: Option<&'a dyn MediaTool>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineStats {
    pub total_candidates: u64,
    pub uploaded: u64,
    pub compressed: u64,
    pub skipped: u64,
    pub download_ms: u64,
    pub extract_ms: u64,
    pub process_ms: u64,
}

impl PipelineStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_candidates == 0 {
            100.0
        } else {
            self.uploaded as f64 / self.total_candidates as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub stats: PipelineStats,
}

/// Share links often point at an HTML landing page; rewrite known hosts
/// to their direct-download form.
pub fn normalize_share_url(url: &str) -> String {
    if !url.contains("dropbox.com") {
        return url.to_string();
    }
    if url.contains("?dl=0") {
        url.replace("?dl=0", "?dl=1")
    } else if url.contains("&dl=0") {
        url.replace("&dl=0", "&dl=1")
    } else if url.contains("dl=1") {
        url.to_string()
    } else if url.contains('?') {
        format!("{url}&dl=1")
    } else {
        format!("{url}?dl=1")
    }
}

/// The job's exclusively-owned working directory; removed on every exit
/// path, success or failure.
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    fn create(root: &Path, job_id: &str) -> Result<Self> {
        let path = root.join(job_id);
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            debug!(
                event = "job.workdir_cleanup_failed",
                path = %self.path.display(),
                error = %e,
                "job.workdir_cleanup_failed"
            );
        }
    }
}

/// Running status display. Send/edit failures (including rate limits on
/// the text surface) are logged and swallowed; status is best-effort.
struct StatusMessage<'a> {
    store: &'a dyn Store,
    chat_id: &'a str,
    message: Option<MessageRef>,
}

impl<'a> StatusMessage<'a> {
    fn new(store: &'a dyn Store, chat_id: &'a str) -> Self {
        Self {
            store,
            chat_id,
            message: None,
        }
    }

    async fn set(&mut self, text: &str) {
        let result = match self.message {
            Some(message) => self.store.edit_text(self.chat_id, message, text).await,
            None => match self.store.send_text(self.chat_id, text).await {
                Ok(message) => {
                    self.message = Some(message);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            debug!(event = "status.update_failed", error = %e, "status.update_failed");
        }
    }
}

pub async fn run_job(store: &dyn Store, settings: &Settings, spec: JobSpec) -> Result<JobResult> {
    run_job_with(store, settings, spec, JobOptions::default()).await
}

pub async fn run_job_with(
    store: &dyn Store,
    settings: &Settings,
    spec: JobSpec,
    options: JobOptions<'_>,
) -> Result<JobResult> {
    settings.validate()?;

    let id = uuid::Uuid::new_v4().simple().to_string();
    let job_id = format!("job_{}", &id[..12]);
    let work = WorkDir::create(&spec.work_root, &job_id)?;

    debug!(
        event = "job.start",
        job_id,
        url = %spec.url,
        chat_id = %spec.chat_id,
        "job.start"
    );

    let mut status = StatusMessage::new(store, &spec.chat_id);
    status.set("Downloading archive...").await;

    let started = Instant::now();
    let result = run_pipeline(store, settings, &spec, work.path(), &options, &mut status).await;

    match &result {
        Ok(stats) => {
            debug!(
                event = "job.finish",
                job_id,
                duration_ms = started.elapsed().as_millis() as u64,
                uploaded = stats.uploaded,
                compressed = stats.compressed,
                skipped = stats.skipped,
                "job.finish"
            );
            status
                .set(&format!(
                    "Done! Uploaded {}/{} files ({} compressed, {} skipped, {:.1}% success).",
                    stats.uploaded,
                    stats.total_candidates,
                    stats.compressed,
                    stats.skipped,
                    stats.success_rate()
                ))
                .await;
        }
        Err(e) => {
            error!(event = "job.failed", job_id, error = %e, "job.failed");
            status.set(&format!("Error: {e}")).await;
        }
    }

    result.map(|stats| JobResult { job_id, stats })
}

async fn run_pipeline(
    store: &dyn Store,
    settings: &Settings,
    spec: &JobSpec,
    work_dir: &Path,
    options: &JobOptions<'_>,
    status: &mut StatusMessage<'_>,
) -> Result<PipelineStats> {
    let mut stats = PipelineStats::default();
    let min_interval = Duration::from_secs(settings.progress.min_interval_secs);

    let archive_path = work_dir.join("archive.zip");
    let extract_dir = work_dir.join("extracted");
    let artifacts_dir = work_dir.join("transcoded");
    tokio::fs::create_dir_all(&artifacts_dir).await?;

    let url = normalize_share_url(&spec.url);

    // Download: fatal on failure, no partial-job continuation.
    let phase_started = Instant::now();
    debug!(event = "phase.start", phase = "download", "phase.start");
    let downloader = Downloader::new(&settings.download)?;
    let reporter = options.progress.clone().map(|sink| {
        Arc::new(ProgressReporter::new(
            sink,
            Phase::Download,
            None,
            min_interval,
        ))
    });
    downloader.download(&url, &archive_path, reporter).await?;
    stats.download_ms = phase_started.elapsed().as_millis() as u64;
    debug!(
        event = "phase.finish",
        phase = "download",
        duration_ms = stats.download_ms,
        "phase.finish"
    );
    status.set("Downloaded. Extracting...").await;

    // Extract: corrupt input is fatal and not retried.
    let phase_started = Instant::now();
    debug!(event = "phase.start", phase = "extract", "phase.start");
    let reporter = options.progress.clone().map(|sink| {
        Arc::new(ProgressReporter::new(
            sink,
            Phase::Extract,
            None,
            min_interval,
        ))
    });
    let files = extract_archive(&archive_path, &extract_dir, reporter).await?;
    stats.extract_ms = phase_started.elapsed().as_millis() as u64;
    debug!(
        event = "phase.finish",
        phase = "extract",
        duration_ms = stats.extract_ms,
        files = files.len(),
        "phase.finish"
    );
    status.set("Extracted. Uploading...").await;

    let mut candidates = Vec::new();
    for path in files {
        if is_sidecar(&path) {
            continue;
        }
        let category = classify(&path);
        if !should_process(category, &spec.selection) {
            continue;
        }
        let size = tokio::fs::metadata(&path).await?.len();
        candidates.push(ExtractedFile {
            path,
            size,
            category,
        });
    }
    stats.total_candidates = candidates.len() as u64;

    // Process and upload; per-unit failures are isolated.
    let phase_started = Instant::now();
    debug!(
        event = "phase.start",
        phase = "upload",
        candidates = stats.total_candidates,
        "phase.start"
    );
    let system_tool = SystemMediaTool;
    let tool: &dyn MediaTool = options.media_tool.unwrap_or(&system_tool);
    let transcoder = Transcoder::new(&settings.transcode, tool, artifacts_dir);
    let mut dispatcher = UploadDispatcher::new(store, &spec.chat_id, &settings.upload);
    let reporter = options.progress.clone().map(|sink| {
        Arc::new(ProgressReporter::new(
            sink,
            Phase::Upload,
            Some(stats.total_candidates),
            min_interval,
        ))
    });

    let total = candidates.len();
    for (i, file) in candidates.iter().enumerate() {
        let outcome = prepare_unit(&transcoder, file).await;
        if outcome.skipped {
            stats.skipped += 1;
        } else {
            dispatcher
                .dispatch(
                    UploadUnit {
                        source: file.path.clone(),
                        upload_path: outcome.upload_path,
                        category: outcome.category,
                        compressed: outcome.compressed,
                    },
                    &mut stats,
                )
                .await?;
        }

        let resolved = i + 1;
        if let Some(reporter) = &reporter {
            reporter.update(resolved as u64);
        }
        if resolved % 5 == 0 {
            status.set(&format!("Uploading... {resolved}/{total}")).await;
        }
    }
    dispatcher.finish(&mut stats).await?;
    if let Some(reporter) = &reporter {
        reporter.finish(total as u64);
    }
    stats.process_ms = phase_started.elapsed().as_millis() as u64;
    debug!(
        event = "phase.finish",
        phase = "upload",
        duration_ms = stats.process_ms,
        uploaded = stats.uploaded,
        compressed = stats.compressed,
        skipped = stats.skipped,
        "phase.finish"
    );

    Ok(stats)
}

/// A broken unit never takes the job down: any error out of the
/// transcoder downgrades the file to an as-is upload.
async fn prepare_unit(transcoder: &Transcoder<'_>, file: &ExtractedFile) -> TranscodeOutcome {
    match transcoder.prepare(file).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(
                event = "transcode.unit_failed",
                path = %file.path.display(),
                error = %e,
                "transcode.unit_failed"
            );
            TranscodeOutcome {
                upload_path: file.path.clone(),
                category: file.category,
                compressed: false,
                skipped: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropbox_links_rewritten_to_direct_download() {
        assert_eq!(
            normalize_share_url("https://www.dropbox.com/s/abc/x.zip?dl=0"),
            "https://www.dropbox.com/s/abc/x.zip?dl=1"
        );
        assert_eq!(
            normalize_share_url("https://www.dropbox.com/s/abc/x.zip?rlkey=k&dl=0"),
            "https://www.dropbox.com/s/abc/x.zip?rlkey=k&dl=1"
        );
        assert_eq!(
            normalize_share_url("https://www.dropbox.com/s/abc/x.zip?dl=1"),
            "https://www.dropbox.com/s/abc/x.zip?dl=1"
        );
        assert_eq!(
            normalize_share_url("https://www.dropbox.com/s/abc/x.zip"),
            "https://www.dropbox.com/s/abc/x.zip?dl=1"
        );
        assert_eq!(
            normalize_share_url("https://www.dropbox.com/s/abc/x.zip?rlkey=k"),
            "https://www.dropbox.com/s/abc/x.zip?rlkey=k&dl=1"
        );
        assert_eq!(
            normalize_share_url("https://example.com/a.zip"),
            "https://example.com/a.zip"
        );
    }

    #[test]
    fn success_rate_handles_empty_jobs() {
        let stats = PipelineStats::default();
        assert_eq!(stats.success_rate(), 100.0);

        let stats = PipelineStats {
            total_candidates: 4,
            uploaded: 3,
            ..PipelineStats::default()
        };
        assert_eq!(stats.success_rate(), 75.0);
    }

    #[cfg(unix)]
    struct IdleTool;

    #[cfg(unix)]
    impl MediaTool for IdleTool {
        fn run<'a>(
            &'a self,
            _program: &'a str,
            _args: &'a [String],
        ) -> futures::future::BoxFuture<'a, crate::Result<crate::transcode::ToolOutput>> {
            Box::pin(async {
                Ok(crate::transcode::ToolOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            })
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unpreparable_file_uploads_as_is() {
        use std::os::unix::ffi::OsStrExt;

        let temp = tempfile::TempDir::new().unwrap();
        // A non-UTF-8 stem cannot be handed to the external tool.
        let name = std::ffi::OsStr::from_bytes(b"photo\xff.jpg");
        let path = temp.path().join(name);
        std::fs::write(&path, b"bytes").unwrap();
        let file = ExtractedFile {
            path: path.clone(),
            size: 5,
            category: crate::classify::Category::Image,
        };

        let settings = crate::config::TranscodeSettings::default();
        let tool = IdleTool;
        let transcoder = Transcoder::new(&settings, &tool, temp.path().to_path_buf());

        let outcome = prepare_unit(&transcoder, &file).await;
        assert_eq!(outcome.upload_path, path);
        assert_eq!(outcome.category, crate::classify::Category::Image);
        assert!(!outcome.compressed);
        assert!(!outcome.skipped);
    }

    #[test]
    fn workdir_removed_on_drop() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = {
            let work = WorkDir::create(temp.path(), "job_test").unwrap();
            std::fs::write(work.path().join("leftover.bin"), b"x").unwrap();
            work.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
