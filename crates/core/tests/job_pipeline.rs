mod support;

use arcferry_core::{
    DownloadSettings, Error, InMemoryStore, JobSpec, Selection, Settings, StoreEvent, run_job,
};
use support::{ServerMode, TestServer, zip_bytes};
use tempfile::TempDir;

fn fast_settings() -> Settings {
    Settings {
        download: DownloadSettings {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 5,
            max_workers: 4,
            min_chunk_bytes: 16 * 1024,
            ..DownloadSettings::default()
        },
        ..Settings::default()
    }
}

fn document_archive() -> Vec<u8> {
    zip_bytes(&[
        ("doc1.pdf", b"one".as_slice()),
        ("doc2.pdf", b"two".as_slice()),
        ("doc3.pdf", b"three".as_slice()),
        ("doc4.pdf", b"four".as_slice()),
        ("doc5.pdf", b"five".as_slice()),
        ("doc1.pdf.json", br#"{"taken":"2019-01-01"}"#.as_slice()),
    ])
}

#[tokio::test]
async fn archive_of_documents_flows_end_to_end() {
    let server = TestServer::start(document_archive(), ServerMode::Full).await;
    let work_root = TempDir::new().unwrap();
    let store = InMemoryStore::new();

    let result = run_job(
        &store,
        &fast_settings(),
        JobSpec {
            url: server.url.clone(),
            chat_id: "chat".to_string(),
            work_root: work_root.path().to_path_buf(),
            selection: Selection::default(),
        },
    )
    .await
    .unwrap();

    assert_eq!(result.stats.total_candidates, 5);
    assert_eq!(result.stats.uploaded, 5);
    assert_eq!(result.stats.skipped, 0);
    assert_eq!(result.stats.compressed, 0);

    let events = store.events();
    assert_eq!(events[0], StoreEvent::Text("Downloading archive...".into()));
    assert_eq!(events[1], StoreEvent::EditText("Downloaded. Extracting...".into()));
    assert_eq!(events[2], StoreEvent::EditText("Extracted. Uploading...".into()));

    // Documents go out one by one, in archive order, sidecar excluded.
    let documents: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            StoreEvent::Document(path) => {
                Some(path.file_name().unwrap().to_str().unwrap().to_string())
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        documents,
        vec!["doc1.pdf", "doc2.pdf", "doc3.pdf", "doc4.pdf", "doc5.pdf"]
    );

    assert!(events.contains(&StoreEvent::EditText("Uploading... 5/5".into())));
    match events.last() {
        Some(StoreEvent::EditText(text)) => {
            assert!(text.starts_with("Done!"), "unexpected final status: {text}");
            assert!(text.contains("5/5"), "unexpected final status: {text}");
        }
        other => panic!("expected a final status edit, got {other:?}"),
    }

    // The job's working directory is gone whatever the outcome.
    assert!(std::fs::read_dir(work_root.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn selection_filters_categories_before_upload() {
    let server = TestServer::start(document_archive(), ServerMode::Full).await;
    let work_root = TempDir::new().unwrap();
    let store = InMemoryStore::new();

    let result = run_job(
        &store,
        &fast_settings(),
        JobSpec {
            url: server.url.clone(),
            chat_id: "chat".to_string(),
            work_root: work_root.path().to_path_buf(),
            selection: Selection {
                documents: false,
                ..Selection::default()
            },
        },
    )
    .await
    .unwrap();

    assert_eq!(result.stats.total_candidates, 0);
    assert_eq!(result.stats.uploaded, 0);
    let uploads = store
        .events()
        .iter()
        .filter(|e| matches!(e, StoreEvent::Document(_)))
        .count();
    assert_eq!(uploads, 0);
}

#[tokio::test]
async fn invalid_archive_fails_job_and_cleans_up() {
    let server = TestServer::start(vec![0xCD; 4096], ServerMode::Full).await;
    let work_root = TempDir::new().unwrap();
    let store = InMemoryStore::new();

    let err = run_job(
        &store,
        &fast_settings(),
        JobSpec {
            url: server.url.clone(),
            chat_id: "chat".to_string(),
            work_root: work_root.path().to_path_buf(),
            selection: Selection::default(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }), "got {err:?}");

    // Failure is reported to the chat and the work dir still removed.
    match store.events().last() {
        Some(StoreEvent::EditText(text)) => {
            assert!(text.starts_with("Error:"), "unexpected status: {text}")
        }
        other => panic!("expected an error status edit, got {other:?}"),
    }
    assert!(std::fs::read_dir(work_root.path()).unwrap().next().is_none());
}
