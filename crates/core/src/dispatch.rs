use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classify::Category;
use crate::config::UploadSettings;
use crate::job::PipelineStats;
use crate::store::{AlbumPhoto, Store};
use crate::{Error, Result};

/// One processed file on its way to the remote store.
#[derive(Debug, Clone)]
pub struct UploadUnit {
    /// File produced by extraction.
    pub source: PathBuf,
    /// File actually uploaded; differs from `source` when transcoded.
    pub upload_path: PathBuf,
    pub category: Category,
    pub compressed: bool,
}

impl UploadUnit {
    fn is_album_eligible(&self) -> bool {
        matches!(self.category, Category::Image | Category::Heif)
    }
}

/// Sends processed files to the remote store. Consecutive eligible images
/// are deferred into an album of at most `album_max`; a non-image unit
/// forces a flush first, so the destination sees input order at batch
/// granularity. Rate-limit waits are honored exactly and retried without
/// a cap; any other transient error is capped at `max_attempts` before
/// the unit is permanently skipped. A unit failing never aborts the job.
pub struct UploadDispatcher<'a> {
    store: &'a dyn Store,
    chat_id: &'a str,
    settings: &'a UploadSettings,
    pending: Vec<UploadUnit>,
}

impl<'a> UploadDispatcher<'a> {
    pub fn new(store: &'a dyn Store, chat_id: &'a str, settings: &'a UploadSettings) -> Self {
        Self {
            store,
            chat_id,
            settings,
            pending: Vec::new(),
        }
    }

    pub async fn dispatch(&mut self, unit: UploadUnit, stats: &mut PipelineStats) -> Result<()> {
        if unit.is_album_eligible() {
            self.pending.push(unit);
            if self.pending.len() >= self.settings.album_max as usize {
                self.flush_album(stats).await;
            }
            return Ok(());
        }

        // Ordering: everything image queued so far goes out first.
        self.flush_album(stats).await;
        self.send_single(unit, stats).await;
        Ok(())
    }

    /// End of job: emit whatever album remainder is still pending.
    pub async fn finish(&mut self, stats: &mut PipelineStats) -> Result<()> {
        self.flush_album(stats).await;
        Ok(())
    }

    async fn send_single(&self, unit: UploadUnit, stats: &mut PipelineStats) {
        let caption = self.caption_for(&unit.source);
        let mut attempts = 0u32;
        let uploaded = loop {
            let result = match unit.category {
                Category::Video => {
                    self.store
                        .send_video(self.chat_id, &unit.upload_path, Some(&caption))
                        .await
                }
                Category::Image | Category::Heif => {
                    self.store
                        .send_photo(self.chat_id, &unit.upload_path, Some(&caption))
                        .await
                }
                Category::Gif | Category::Document | Category::Other => {
                    self.store
                        .send_document(self.chat_id, &unit.upload_path, Some(&caption))
                        .await
                }
            };
            match result {
                Ok(()) => break true,
                Err(Error::RateLimited { retry_after }) => {
                    // The remote told us exactly how long to back off.
                    info!(
                        event = "upload.rate_limited",
                        wait_secs = retry_after.as_secs(),
                        path = %unit.upload_path.display(),
                        "upload.rate_limited"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.settings.max_attempts {
                        warn!(
                            event = "upload.unit_skipped",
                            path = %unit.upload_path.display(),
                            attempts,
                            error = %e,
                            "upload.unit_skipped"
                        );
                        break false;
                    }
                    tokio::time::sleep(Duration::from_millis(self.settings.retry_delay_ms)).await;
                }
            }
        };

        if uploaded {
            stats.uploaded += 1;
            if unit.compressed {
                stats.compressed += 1;
            }
        } else {
            stats.skipped += 1;
        }
        self.cleanup_artifact(&unit);
    }

    async fn flush_album(&mut self, stats: &mut PipelineStats) {
        if self.pending.is_empty() {
            return;
        }

        let photos: Vec<AlbumPhoto> = self
            .pending
            .iter()
            .enumerate()
            .map(|(i, unit)| AlbumPhoto {
                path: unit.upload_path.clone(),
                // The first entry carries the caption for the whole group.
                caption: (i == 0).then(|| self.caption_for(&unit.source)),
            })
            .collect();

        let mut attempts = 0u32;
        let uploaded = loop {
            let result = if photos.len() == 1 {
                // Telegram requires at least two entries per group.
                self.store
                    .send_photo(self.chat_id, &photos[0].path, photos[0].caption.as_deref())
                    .await
            } else {
                self.store.send_media_group(self.chat_id, &photos).await
            };
            match result {
                Ok(()) => break true,
                Err(Error::RateLimited { retry_after }) => {
                    info!(
                        event = "upload.rate_limited",
                        wait_secs = retry_after.as_secs(),
                        batch = photos.len(),
                        "upload.rate_limited"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.settings.album_flush_attempts {
                        warn!(
                            event = "upload.batch_skipped",
                            batch = photos.len(),
                            attempts,
                            error = %e,
                            "upload.batch_skipped"
                        );
                        break false;
                    }
                    tokio::time::sleep(Duration::from_millis(self.settings.retry_delay_ms)).await;
                }
            }
        };

        for unit in self.pending.drain(..) {
            if uploaded {
                stats.uploaded += 1;
                if unit.compressed {
                    stats.compressed += 1;
                }
            } else {
                stats.skipped += 1;
            }
            // Inlined cleanup; `self` is mutably borrowed by the drain.
            if unit.upload_path != unit.source {
                debug!(
                    event = "upload.artifact_removed",
                    path = %unit.upload_path.display(),
                    "upload.artifact_removed"
                );
                let _ = std::fs::remove_file(&unit.upload_path);
            }
        }
    }

    fn cleanup_artifact(&self, unit: &UploadUnit) {
        if unit.upload_path != unit.source {
            debug!(
                event = "upload.artifact_removed",
                path = %unit.upload_path.display(),
                "upload.artifact_removed"
            );
            let _ = std::fs::remove_file(&unit.upload_path);
        }
    }

    fn caption_for(&self, source: &Path) -> String {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        format!("{}{name}", self.settings.caption_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoreEvent};

    fn unit(path: &str, category: Category) -> UploadUnit {
        UploadUnit {
            source: PathBuf::from(path),
            upload_path: PathBuf::from(path),
            category,
            compressed: false,
        }
    }

    #[tokio::test]
    async fn lone_image_sent_as_photo_not_group() {
        let store = InMemoryStore::new();
        let settings = UploadSettings::default();
        let mut stats = PipelineStats::default();
        let mut dispatcher = UploadDispatcher::new(&store, "chat", &settings);

        dispatcher
            .dispatch(unit("a.jpg", Category::Image), &mut stats)
            .await
            .unwrap();
        dispatcher.finish(&mut stats).await.unwrap();

        assert_eq!(store.events(), vec![StoreEvent::Photo(PathBuf::from("a.jpg"))]);
        assert_eq!(stats.uploaded, 1);
    }

    #[tokio::test]
    async fn caption_uses_source_filename() {
        let settings = UploadSettings::default();
        let store = InMemoryStore::new();
        let dispatcher = UploadDispatcher::new(&store, "chat", &settings);
        assert_eq!(
            dispatcher.caption_for(Path::new("/tmp/x/holiday.jpg")),
            "Backup: holiday.jpg"
        );
    }
}
