use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

/// Telegram caps an album at ten entries per sendMediaGroup call.
pub const ALBUM_HARD_MAX: u32 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub transcode: TranscodeSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub progress: ProgressSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Try the external aria2c strategy before the in-process ones.
    pub prefer_aria2: bool,
    pub aria2_binary: String,
    pub aria2_connections: u32,
    pub max_workers: u32,
    /// Chunk size floor; total size below this never fans out.
    pub min_chunk_bytes: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Anything smaller than this cannot be a real archive.
    pub min_archive_bytes: u64,
    pub user_agent: String,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            prefer_aria2: false,
            aria2_binary: "aria2c".to_string(),
            aria2_connections: 16,
            max_workers: 16,
            min_chunk_bytes: 1024 * 1024,
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 15_000,
            connect_timeout_ms: 10_000,
            min_archive_bytes: 64,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeSettings {
    pub magick_binary: String,
    pub ffmpeg_binary: String,
    /// Images below this re-encode as PNG, everything else as progressive JPEG.
    pub png_max_bytes: u64,
    pub jpeg_quality: u32,
    /// Re-encoded output must land below this percentage of the original
    /// size or the original bytes are uploaded verbatim.
    pub keep_ratio_percent: u32,
    pub max_side_px: u32,
    pub max_pixels: u64,
    /// Videos above this are re-encoded; Telegram rejects them otherwise.
    pub video_ceiling_bytes: u64,
    pub video_codec: String,
    /// Quality targets for the first and second re-encode pass.
    pub video_crf_passes: Vec<u32>,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            magick_binary: "magick".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            png_max_bytes: 500 * 1024,
            jpeg_quality: 92,
            keep_ratio_percent: 95,
            max_side_px: 10_000,
            max_pixels: 90_000_000,
            video_ceiling_bytes: 1995 * 1024 * 1024,
            video_codec: "libx265".to_string(),
            video_crf_passes: vec![28, 32],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    pub album_max: u32,
    /// Attempt cap for transient errors. Rate-limit waits never count.
    pub max_attempts: u32,
    pub album_flush_attempts: u32,
    pub retry_delay_ms: u64,
    pub caption_prefix: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            album_max: ALBUM_HARD_MAX,
            max_attempts: 30,
            album_flush_attempts: 5,
            retry_delay_ms: 1_000,
            caption_prefix: "Backup: ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSettings {
    pub min_interval_secs: u64,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            min_interval_secs: 4,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.download.max_workers == 0 {
            return Err(Error::InvalidConfig {
                message: "download.max_workers must be >= 1".to_string(),
            });
        }
        if self.download.min_chunk_bytes == 0 {
            return Err(Error::InvalidConfig {
                message: "download.min_chunk_bytes must be > 0".to_string(),
            });
        }
        if self.upload.album_max == 0 || self.upload.album_max > ALBUM_HARD_MAX {
            return Err(Error::InvalidConfig {
                message: format!("upload.album_max must be in 1..={ALBUM_HARD_MAX}"),
            });
        }
        if self.upload.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "upload.max_attempts must be >= 1".to_string(),
            });
        }
        if self.transcode.keep_ratio_percent == 0 || self.transcode.keep_ratio_percent > 100 {
            return Err(Error::InvalidConfig {
                message: "transcode.keep_ratio_percent must be in 1..=100".to_string(),
            });
        }
        if self.transcode.video_crf_passes.is_empty() {
            return Err(Error::InvalidConfig {
                message: "transcode.video_crf_passes must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
