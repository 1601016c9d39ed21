mod support;

use arcferry_core::{DownloadSettings, Downloader, Error};
use support::{ServerMode, TestServer, zip_bytes};
use tempfile::TempDir;

fn fast_settings() -> DownloadSettings {
    DownloadSettings {
        max_retries: 1,
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_workers: 4,
        min_chunk_bytes: 16 * 1024,
        ..DownloadSettings::default()
    }
}

fn large_zip() -> Vec<u8> {
    // Seeded random payloads stay incompressible, so the archive body
    // spans multiple chunks and the planner fans out several workers.
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut entries = Vec::new();
    for i in 0..8u8 {
        let mut data = vec![0u8; 40_000];
        rng.fill(&mut data[..]);
        entries.push((format!("file{i}.bin"), data));
    }
    let borrowed: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(name, data)| (name.as_str(), data.as_slice()))
        .collect();
    zip_bytes(&borrowed)
}

#[tokio::test]
async fn multi_stream_download_is_byte_identical() {
    let body = large_zip();
    assert!(body.len() > 64 * 1024, "body must span several chunks");
    let server = TestServer::start(body.clone(), ServerMode::Full).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("archive.zip");
    let downloader = Downloader::new(&fast_settings()).unwrap();

    let result = downloader.download(&server.url, &dest, None).await.unwrap();
    assert_eq!(result, dest);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn failed_ranges_fall_back_to_single_stream() {
    let body = large_zip();
    let server = TestServer::start(body.clone(), ServerMode::NoRanges).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("archive.zip");
    let downloader = Downloader::new(&fast_settings()).unwrap();

    downloader.download(&server.url, &dest, None).await.unwrap();
    // The fallback re-downloads end-to-end and must match exactly.
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn failed_range_aborts_sibling_workers_before_fallback() {
    let body = large_zip();
    let server = TestServer::start(body.clone(), ServerMode::PoisonRanges).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("archive.zip");
    let downloader = Downloader::new(&fast_settings()).unwrap();

    downloader.download(&server.url, &dest, None).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), body);

    // The stalled range responses land well after the fallback finished;
    // no leftover worker may reopen the file and write into it.
    tokio::time::sleep(std::time::Duration::from_millis(700)).await;
    assert_eq!(
        std::fs::read(&dest).unwrap(),
        body,
        "destination modified after download completed"
    );
}

#[tokio::test]
async fn html_error_page_is_rejected_not_uploaded() {
    let page = format!("<html><body>{}</body></html>", "login required ".repeat(50));
    let server = TestServer::start(page.into_bytes(), ServerMode::Full).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("archive.zip");
    let downloader = Downloader::new(&fast_settings()).unwrap();

    let err = downloader.download(&server.url, &dest, None).await.unwrap_err();
    assert!(matches!(err, Error::Validation { .. }), "got {err:?}");
}

#[tokio::test]
async fn garbage_body_fails_validation() {
    let server = TestServer::start(vec![0xAB; 8192], ServerMode::Full).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("archive.zip");
    let downloader = Downloader::new(&fast_settings()).unwrap();

    let err = downloader.download(&server.url, &dest, None).await.unwrap_err();
    assert!(matches!(err, Error::Validation { .. }), "got {err:?}");
}
