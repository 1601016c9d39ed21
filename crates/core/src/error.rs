use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("downloaded artifact failed validation: {message}")]
    Validation { message: String },

    #[error("archive extraction failed: {message}")]
    Extraction { message: String },

    #[error("transcode failed: {message}")]
    Transcode { message: String },

    #[error("upload rejected: {message}")]
    Upload { message: String },

    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}
