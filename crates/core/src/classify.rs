use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Processing category of an extracted file, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Image,
    Heif,
    Gif,
    Video,
    Document,
    Other,
}

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff"];
const HEIF_EXTS: &[&str] = &["heic", "heif"];
const GIF_EXTS: &[&str] = &["gif"];
const VIDEO_EXTS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm", "m4v", "3gp"];
const DOCUMENT_EXTS: &[&str] = &[
    "pdf", "txt", "md", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "csv", "epub",
];

pub fn classify(path: &Path) -> Category {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return Category::Other;
    };
    let ext = ext.to_ascii_lowercase();
    let ext = ext.as_str();
    if IMAGE_EXTS.contains(&ext) {
        Category::Image
    } else if HEIF_EXTS.contains(&ext) {
        Category::Heif
    } else if GIF_EXTS.contains(&ext) {
        Category::Gif
    } else if VIDEO_EXTS.contains(&ext) {
        Category::Video
    } else if DOCUMENT_EXTS.contains(&ext) {
        Category::Document
    } else {
        Category::Other
    }
}

/// Metadata sidecars are filtered out before classification and never
/// uploaded.
pub fn is_sidecar(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Media categories a job includes. Defaults to everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub photos: bool,
    pub videos: bool,
    pub gifs: bool,
    pub documents: bool,
    pub other: bool,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            photos: true,
            videos: true,
            gifs: true,
            documents: true,
            other: true,
        }
    }
}

/// Heif rides on the photo toggle and Gif on the gif toggle; `Other` is
/// anything outside the known tables.
pub fn should_process(category: Category, selection: &Selection) -> bool {
    match category {
        Category::Image | Category::Heif => selection.photos,
        Category::Gif => selection.gifs,
        Category::Video => selection.videos,
        Category::Document => selection.documents,
        Category::Other => selection.other,
    }
}

/// One file produced by extraction. Derived artifacts are always new
/// files; this record is never mutated after creation.
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    pub path: PathBuf,
    pub size: u64,
    pub category: Category,
}
