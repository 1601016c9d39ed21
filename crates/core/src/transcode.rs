use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::classify::{Category, ExtractedFile};
use crate::config::TranscodeSettings;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// External process seam for ImageMagick/ffmpeg, so policy logic is
/// testable without either binary installed.
pub trait MediaTool: Send + Sync {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> BoxFuture<'a, Result<ToolOutput>>;
}

pub struct SystemMediaTool;

impl MediaTool for SystemMediaTool {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> BoxFuture<'a, Result<ToolOutput>> {
        Box::pin(async move {
            let output = tokio::process::Command::new(program)
                .args(args)
                .output()
                .await
                .map_err(|e| Error::Transcode {
                    message: format!("{program} spawn failed: {e}"),
                })?;
            Ok(ToolOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// What the dispatcher should do with one prepared file.
#[derive(Debug, Clone)]
pub struct TranscodeOutcome {
    /// File to upload; equals the source when nothing was produced.
    pub upload_path: PathBuf,
    pub category: Category,
    /// A derived artifact was produced and chosen over the original.
    pub compressed: bool,
    /// Permanently dropped (video still over the ceiling after all passes).
    pub skipped: bool,
}

/// Category-specific size/quality policies. Every transform writes to a
/// fresh path under `artifacts_dir` and falls back to the original file
/// on failure; only the oversized-video case may skip a file outright.
pub struct Transcoder<'a> {
    settings: &'a TranscodeSettings,
    tool: &'a dyn MediaTool,
    artifacts_dir: PathBuf,
}

impl<'a> Transcoder<'a> {
    pub fn new(
        settings: &'a TranscodeSettings,
        tool: &'a dyn MediaTool,
        artifacts_dir: PathBuf,
    ) -> Self {
        Self {
            settings,
            tool,
            artifacts_dir,
        }
    }

    pub async fn prepare(&self, file: &ExtractedFile) -> Result<TranscodeOutcome> {
        match file.category {
            Category::Image => self.prepare_image(file).await,
            Category::Heif => self.prepare_heif(file).await,
            Category::Video => self.prepare_video(file).await,
            Category::Gif | Category::Document | Category::Other => Ok(passthrough(file)),
        }
    }

    async fn prepare_image(&self, file: &ExtractedFile) -> Result<TranscodeOutcome> {
        let recompressed = self.compress_image(&file.path, file.size).await?;
        let base = recompressed.clone().unwrap_or_else(|| file.path.clone());

        let downscaled = self.fix_oversized(&base).await?;
        if downscaled.is_some()
            && let Some(intermediate) = &recompressed
        {
            remove_artifact(intermediate);
        }

        let upload_path = downscaled.or(recompressed).unwrap_or_else(|| file.path.clone());
        let compressed = upload_path != file.path;
        Ok(TranscodeOutcome {
            upload_path,
            category: Category::Image,
            compressed,
            skipped: false,
        })
    }

    async fn prepare_heif(&self, file: &ExtractedFile) -> Result<TranscodeOutcome> {
        // Telegram cannot preview HEIF; always convert.
        let out = self.artifact_path("jpg");
        let args = vec![
            path_arg(&file.path)?,
            "-quality".to_string(),
            self.settings.jpeg_quality.to_string(),
            path_arg(&out)?,
        ];
        if !self.run_expecting_output(&self.settings.magick_binary, &args, &out).await {
            warn!(
                event = "transcode.heif_failed",
                path = %file.path.display(),
                "transcode.heif_failed"
            );
            return Ok(passthrough(file));
        }

        let downscaled = self.fix_oversized(&out).await?;
        if downscaled.is_some() {
            remove_artifact(&out);
        }
        Ok(TranscodeOutcome {
            upload_path: downscaled.unwrap_or(out),
            category: Category::Image,
            compressed: true,
            skipped: false,
        })
    }

    async fn prepare_video(&self, file: &ExtractedFile) -> Result<TranscodeOutcome> {
        if file.size <= self.settings.video_ceiling_bytes {
            return Ok(passthrough(file));
        }

        for crf in &self.settings.video_crf_passes {
            let out = self.artifact_path("mp4");
            let args = vec![
                "-y".to_string(),
                "-i".to_string(),
                path_arg(&file.path)?,
                "-c:v".to_string(),
                self.settings.video_codec.clone(),
                "-crf".to_string(),
                crf.to_string(),
                "-c:a".to_string(),
                "copy".to_string(),
                path_arg(&out)?,
            ];
            if !self.run_expecting_output(&self.settings.ffmpeg_binary, &args, &out).await {
                warn!(
                    event = "transcode.video_pass_failed",
                    path = %file.path.display(),
                    crf,
                    "transcode.video_pass_failed"
                );
                continue;
            }

            let out_size = tokio::fs::metadata(&out).await?.len();
            if out_size <= self.settings.video_ceiling_bytes {
                debug!(
                    event = "transcode.video_done",
                    path = %file.path.display(),
                    crf,
                    out_bytes = out_size,
                    "transcode.video_done"
                );
                return Ok(TranscodeOutcome {
                    upload_path: out,
                    category: Category::Video,
                    compressed: true,
                    skipped: false,
                });
            }
            remove_artifact(&out);
        }

        // Still over the ceiling after every pass; drop the file for good.
        warn!(
            event = "transcode.video_skipped",
            path = %file.path.display(),
            size = file.size,
            "transcode.video_skipped"
        );
        Ok(TranscodeOutcome {
            upload_path: file.path.clone(),
            category: Category::Video,
            compressed: false,
            skipped: true,
        })
    }

    /// Re-encodes an image (PNG below the cutoff, progressive JPEG above),
    /// flattening transparency onto white and keeping EXIF. Returns `None`
    /// when the original bytes should be used instead, either because the
    /// tool failed or because the result saved less than the keep ratio.
    async fn compress_image(&self, source: &Path, original_size: u64) -> Result<Option<PathBuf>> {
        let mut args = vec![
            path_arg(source)?,
            "-background".to_string(),
            "white".to_string(),
            "-alpha".to_string(),
            "remove".to_string(),
            "-alpha".to_string(),
            "off".to_string(),
        ];
        let out = if original_size < self.settings.png_max_bytes {
            self.artifact_path("png")
        } else {
            args.extend([
                "-quality".to_string(),
                self.settings.jpeg_quality.to_string(),
                "-interlace".to_string(),
                "JPEG".to_string(),
                "-sampling-factor".to_string(),
                "4:4:4".to_string(),
            ]);
            self.artifact_path("jpg")
        };
        args.push(path_arg(&out)?);

        if !self.run_expecting_output(&self.settings.magick_binary, &args, &out).await {
            warn!(
                event = "transcode.image_failed",
                path = %source.display(),
                "transcode.image_failed"
            );
            return Ok(None);
        }

        let out_size = tokio::fs::metadata(&out).await?.len();
        if out_size * 100 >= original_size * u64::from(self.settings.keep_ratio_percent) {
            // Compression must never regress size beyond the keep ratio.
            remove_artifact(&out);
            return Ok(None);
        }
        Ok(Some(out))
    }

    /// Downscales anything over the side-length or pixel-count limit,
    /// preserving aspect ratio. Runs after format conversion.
    async fn fix_oversized(&self, path: &Path) -> Result<Option<PathBuf>> {
        let Some((width, height)) = self.probe_dimensions(path).await else {
            return Ok(None);
        };

        let max_side = self.settings.max_side_px;
        let pixels = u64::from(width) * u64::from(height);
        if width <= max_side && height <= max_side && pixels <= self.settings.max_pixels {
            return Ok(None);
        }

        let long_side = width.max(height);
        let side_scale = f64::from(max_side) / f64::from(long_side);
        let pixel_scale = (self.settings.max_pixels as f64 / pixels as f64).sqrt();
        let scale = side_scale.min(pixel_scale).min(1.0);
        let new_width = ((f64::from(width) * scale) as u32).max(1);
        let new_height = ((f64::from(height) * scale) as u32).max(1);

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg")
            .to_string();
        let out = self.artifact_path(&ext);
        let args = vec![
            path_arg(path)?,
            "-resize".to_string(),
            format!("{new_width}x{new_height}"),
            path_arg(&out)?,
        ];
        if !self.run_expecting_output(&self.settings.magick_binary, &args, &out).await {
            warn!(
                event = "transcode.downscale_failed",
                path = %path.display(),
                "transcode.downscale_failed"
            );
            return Ok(None);
        }
        debug!(
            event = "transcode.downscaled",
            path = %path.display(),
            from = format!("{width}x{height}"),
            to = format!("{new_width}x{new_height}"),
            "transcode.downscaled"
        );
        Ok(Some(out))
    }

    async fn probe_dimensions(&self, path: &Path) -> Option<(u32, u32)> {
        let args = vec![
            "identify".to_string(),
            "-format".to_string(),
            "%w %h".to_string(),
            path_arg(path).ok()?,
        ];
        let output = self.tool.run(&self.settings.magick_binary, &args).await.ok()?;
        if !output.success {
            return None;
        }
        parse_dimensions(&output.stdout)
    }

    /// Runs the tool and checks the contract: exit zero plus a non-empty
    /// output file. Cleans up a bad output before reporting failure.
    async fn run_expecting_output(&self, program: &str, args: &[String], out: &Path) -> bool {
        match self.tool.run(program, args).await {
            Ok(output) if output.success => match std::fs::metadata(out) {
                Ok(meta) if meta.len() > 0 => true,
                _ => {
                    remove_artifact(out);
                    false
                }
            },
            Ok(output) => {
                debug!(
                    event = "transcode.tool_error",
                    program,
                    stderr = %output.stderr.trim(),
                    "transcode.tool_error"
                );
                remove_artifact(out);
                false
            }
            Err(e) => {
                debug!(event = "transcode.tool_error", program, error = %e, "transcode.tool_error");
                remove_artifact(out);
                false
            }
        }
    }

    fn artifact_path(&self, ext: &str) -> PathBuf {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.artifacts_dir.join(format!("t_{}.{ext}", &id[..12]))
    }
}

fn passthrough(file: &ExtractedFile) -> TranscodeOutcome {
    TranscodeOutcome {
        upload_path: file.path.clone(),
        category: file.category,
        compressed: false,
        skipped: false,
    }
}

fn remove_artifact(path: &Path) {
    let _ = std::fs::remove_file(path);
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| Error::NonUtf8Path {
            path: path.to_path_buf(),
        })
}

pub fn parse_dimensions(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.split_whitespace();
    let width = parts.next()?.parse().ok()?;
    let height = parts.next()?.parse().ok()?;
    Some((width, height))
}
