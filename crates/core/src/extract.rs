use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::progress::ProgressReporter;
use crate::{Error, Result};

/// Streams a ZIP container into `dest`, entry by entry, on a blocking
/// worker so the cooperative scheduler keeps servicing progress updates.
/// Progress is cumulative uncompressed bytes against the container's
/// declared total. Corrupt input is fatal and never retried.
pub async fn extract_archive(
    archive: &Path,
    dest: &Path,
    reporter: Option<Arc<ProgressReporter>>,
) -> Result<Vec<PathBuf>> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_sync(&archive, &dest, reporter))
        .await
        .map_err(|e| Error::Extraction {
            message: format!("extraction task panicked: {e}"),
        })?
}

fn extract_sync(
    archive: &Path,
    dest: &Path,
    reporter: Option<Arc<ProgressReporter>>,
) -> Result<Vec<PathBuf>> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| Error::Extraction {
        message: format!("cannot open archive: {e}"),
    })?;

    let mut total: u64 = 0;
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i).map_err(|e| Error::Extraction {
            message: format!("cannot read entry {i}: {e}"),
        })?;
        total += entry.size();
    }
    if let Some(reporter) = &reporter {
        reporter.set_total(total);
    }
    debug!(
        event = "extract.plan",
        entries = zip.len(),
        total_bytes = total,
        "extract.plan"
    );

    std::fs::create_dir_all(dest)?;

    let mut produced = Vec::new();
    let mut done: u64 = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| Error::Extraction {
            message: format!("cannot read entry {i}: {e}"),
        })?;

        let rel = entry.enclosed_name().ok_or_else(|| Error::Extraction {
            message: format!("entry {:?} escapes the destination", entry.name()),
        })?;
        let out_path = dest.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out).map_err(|e| Error::Extraction {
                message: format!("cannot extract {:?}: {e}", entry.name()),
            })?;
            produced.push(out_path);
        }

        done += entry.size();
        if let Some(reporter) = &reporter {
            reporter.update(done);
        }
    }

    if let Some(reporter) = &reporter {
        reporter.finish(done);
    }
    Ok(produced)
}
