pub mod classify;
pub mod config;
pub mod dispatch;
pub mod download;
mod error;
pub mod extract;
pub mod fetch;
pub mod job;
pub mod progress;
pub mod store;
pub mod transcode;

pub const APP_NAME: &str = "Arcferry";

pub use classify::{Category, ExtractedFile, Selection, classify, is_sidecar, should_process};
pub use config::{
    DownloadSettings, ProgressSettings, Settings, TranscodeSettings, UploadSettings,
};
pub use dispatch::{UploadDispatcher, UploadUnit};
pub use download::{DownloadStrategy, Downloader, validate_archive};
pub use error::{Error, Result};
pub use extract::extract_archive;
pub use fetch::{RangeFetcher, RetryPolicy, SharedCounter};
pub use job::{
    JobOptions, JobResult, JobSpec, PipelineStats, normalize_share_url, run_job, run_job_with,
};
pub use progress::{Phase, ProgressReporter, ProgressSink, ProgressUpdate, human_size};
pub use store::{
    AlbumPhoto, InMemoryStore, MessageRef, Store, StoreEvent, TelegramBotApiStore,
    TelegramBotApiStoreConfig,
};
pub use transcode::{MediaTool, SystemMediaTool, TranscodeOutcome, Transcoder};
