//! Integration tests for ArchiveManager caching and request coalescing.

mod common;

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use common::{
    MockFetcher, ZipBuilder, assert_progress_completes, photos_zip, progress_recorder,
};
use zipfetch::{
    ArchiveManager, ArchiveRegistry, CacheStore, Catalog, Config, DiskStore, Entry, Error,
    LoadState, MemoryStore,
};

const URI: &str = "https://example.com/photos.zip";

fn manager(fetcher: &Arc<MockFetcher>, store: Option<Arc<MemoryStore>>) -> ArchiveManager<MockFetcher> {
    let store = store.map(|s| s as Arc<dyn CacheStore>);
    ArchiveManager::new(URI, Arc::clone(fetcher), store, &Config::default())
}

fn photos_fetcher() -> (Arc<MockFetcher>, Vec<u8>, Vec<u8>) {
    let (archive, image, json) = photos_zip();
    (Arc::new(MockFetcher::with_archive(URI, archive)), image, json)
}

#[tokio::test]
async fn test_second_fetch_served_from_memory() {
    let (fetcher, image, json) = photos_fetcher();
    let manager = manager(&fetcher, None);
    assert_eq!(manager.state(), LoadState::Unloaded);

    let data = manager.fetch_entry_data("b.json").await.unwrap();
    assert_eq!(&data[..], &json[..]);
    assert_eq!(manager.state(), LoadState::Loaded);
    assert_eq!(fetcher.request_count(), 2);

    let again = manager.fetch_entry_data("b.json").await.unwrap();
    assert_eq!(again, data);
    assert_eq!(fetcher.request_count(), 2);

    let entry = manager.fetch_entry("a.jpg").await.unwrap();
    assert_eq!(entry.data.as_deref(), Some(&image[..]));
    assert_eq!(fetcher.request_count(), 3);
}

#[tokio::test]
async fn test_concurrent_catalog_loads_share_one_fetch() {
    let (fetcher, _, _) = photos_fetcher();
    fetcher.set_delay(Duration::from_millis(50));
    let manager = manager(&fetcher, None);

    let results = join_all((0..5).map(|_| manager.load_catalog())).await;
    let catalogs: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(fetcher.request_count(), 1);
    assert!(catalogs.iter().all(|c| Arc::ptr_eq(c, &catalogs[0])));
}

#[tokio::test]
async fn test_concurrent_entry_requests_share_one_fetch() {
    let (fetcher, _, json) = photos_fetcher();
    fetcher.set_delay(Duration::from_millis(20));
    let manager = manager(&fetcher, None);

    let results = join_all((0..8).map(|_| manager.fetch_entry_data("b.json"))).await;

    assert_eq!(fetcher.bounded_requests().len(), 1);
    for data in results {
        assert_eq!(&data.unwrap()[..], &json[..]);
    }
}

#[tokio::test]
async fn test_snapshot_skips_network() {
    let (fetcher, _, json) = photos_fetcher();
    let store = Arc::new(MemoryStore::new());

    let first = manager(&fetcher, Some(Arc::clone(&store)));
    first.fetch_entry_data("b.json").await.unwrap();
    // Catalog snapshot and one payload record
    assert_eq!(store.len(), 2);

    fetcher.reset_requests();
    let second = manager(&fetcher, Some(Arc::clone(&store)));
    let catalog = second.load_catalog().await.unwrap();
    assert_eq!(catalog.len(), 2);
    let data = second.fetch_entry_data("b.json").await.unwrap();
    assert_eq!(&data[..], &json[..]);
    assert_eq!(fetcher.request_count(), 0);
}

#[tokio::test]
async fn test_reload_catalog_bypasses_snapshot() {
    let (fetcher, _, _) = photos_fetcher();
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&fetcher, Some(Arc::clone(&store)));

    manager.load_catalog().await.unwrap();
    fetcher.reset_requests();

    manager.reload_catalog().await.unwrap();
    assert_eq!(fetcher.request_count(), 1);
    assert_eq!(manager.state(), LoadState::Loaded);
}

#[tokio::test]
async fn test_corrupted_durable_record_is_refetched() {
    let (fetcher, _, json) = photos_fetcher();
    let store = Arc::new(MemoryStore::new());
    store
        .put(URI, Some("b.json"), b"not a cache record")
        .await
        .unwrap();

    let manager = manager(&fetcher, Some(Arc::clone(&store)));
    let data = manager.fetch_entry_data("b.json").await.unwrap();
    assert_eq!(&data[..], &json[..]);
    assert_eq!(fetcher.bounded_requests().len(), 1);

    // The bad record was replaced by a good one
    let record = store.get(URI, Some("b.json")).await.unwrap().unwrap();
    let cached = Entry::decode(&record).unwrap();
    assert_eq!(cached.data.as_deref(), Some(&json[..]));
}

#[tokio::test]
async fn test_tampered_durable_payload_is_refetched() {
    let (fetcher, image, _) = photos_fetcher();
    let store = Arc::new(MemoryStore::new());

    let first = manager(&fetcher, Some(Arc::clone(&store)));
    let catalog = first.load_catalog().await.unwrap();
    let mut tampered = image.clone();
    tampered[0] ^= 0xFF;
    let record = catalog
        .get("a.jpg")
        .unwrap()
        .with_data(tampered.into())
        .encode();
    store.put(URI, Some("a.jpg"), &record).await.unwrap();

    fetcher.reset_requests();
    let second = manager(&fetcher, Some(Arc::clone(&store)));
    let data = second.fetch_entry_data("a.jpg").await.unwrap();
    assert_eq!(&data[..], &image[..]);
    assert_eq!(fetcher.bounded_requests().len(), 1);
}

#[tokio::test]
async fn test_failed_load_is_recorded_and_retried() {
    let (fetcher, _, _) = photos_fetcher();
    fetcher.ignore_ranges(true);
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&fetcher, Some(Arc::clone(&store)));

    let err = manager.load_catalog().await.unwrap_err();
    assert!(matches!(err, Error::RangeNotSupported(200)));
    assert_eq!(manager.state(), LoadState::Failed);
    assert!(matches!(manager.last_error(), Some(Error::RangeNotSupported(200))));
    assert!(manager.catalog().is_none());
    assert!(store.is_empty());

    fetcher.ignore_ranges(false);
    manager.load_catalog().await.unwrap();
    assert_eq!(manager.state(), LoadState::Loaded);
    assert!(manager.last_error().is_none());
}

#[tokio::test]
async fn test_missing_and_directory_entries() {
    let archive = ZipBuilder::new()
        .directory("docs/")
        .stored("docs/a.txt", b"alpha")
        .build();
    let fetcher = Arc::new(MockFetcher::with_archive(URI, archive));
    let manager = manager(&fetcher, None);

    let err = manager.fetch_entry_data("docs/missing.txt").await.unwrap_err();
    assert!(matches!(err, Error::EntryNotFound(ref p) if p == "docs/missing.txt"));

    let err = manager.fetch_entry_data("docs/").await.unwrap_err();
    assert!(matches!(err, Error::EntryIsDirectory(_)));

    // Neither error touched the catalog
    assert_eq!(manager.state(), LoadState::Loaded);
    assert_eq!(&manager.fetch_entry_data("docs/a.txt").await.unwrap()[..], b"alpha");
}

#[tokio::test]
async fn test_entry_failure_keeps_catalog_loaded() {
    let (mut archive, _, json) = photos_zip();
    archive[30 + 5 + 10] ^= 0xFF;
    let fetcher = Arc::new(MockFetcher::with_archive(URI, archive));
    let manager = manager(&fetcher, None);

    let err = manager.fetch_entry_data("a.jpg").await.unwrap_err();
    assert!(matches!(err, Error::IntegrityCheckFailed { .. }));
    assert_eq!(manager.state(), LoadState::Loaded);

    let data = manager.fetch_entry_data("b.json").await.unwrap();
    assert_eq!(&data[..], &json[..]);

    // Failures are not cached: the next request goes to the network again
    fetcher.reset_requests();
    assert!(manager.fetch_entry_data("a.jpg").await.is_err());
    assert_eq!(fetcher.bounded_requests().len(), 1);
}

#[tokio::test]
async fn test_clear_memory_cache_keeps_catalog() {
    let (fetcher, _, _) = photos_fetcher();
    let manager = manager(&fetcher, None);
    manager.fetch_entry_data("b.json").await.unwrap();

    manager.clear_memory_cache();
    assert_eq!(manager.state(), LoadState::Loaded);

    fetcher.reset_requests();
    manager.fetch_entry_data("b.json").await.unwrap();
    assert_eq!(fetcher.requests().len(), 1);
    assert_eq!(fetcher.bounded_requests().len(), 1);
}

#[tokio::test]
async fn test_clear_cache_resets_archive() {
    let (fetcher, _, _) = photos_fetcher();
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&fetcher, Some(Arc::clone(&store)));
    manager.fetch_entry_data("a.jpg").await.unwrap();
    assert!(!store.is_empty());

    manager.clear_cache().await.unwrap();
    assert_eq!(manager.state(), LoadState::Unloaded);
    assert!(manager.catalog().is_none());
    assert!(store.is_empty());

    fetcher.reset_requests();
    manager.fetch_entry_data("a.jpg").await.unwrap();
    assert_eq!(fetcher.request_count(), 2);
}

#[tokio::test]
async fn test_fetch_started_before_clear_is_not_cached() {
    let (fetcher, _, json) = photos_fetcher();
    let manager = manager(&fetcher, None);
    manager.load_catalog().await.unwrap();
    fetcher.set_delay(Duration::from_millis(100));

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.fetch_entry_data("b.json").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    manager.clear_memory_cache();

    let data = task.await.unwrap().unwrap();
    assert_eq!(&data[..], &json[..]);

    fetcher.set_delay(Duration::ZERO);
    fetcher.reset_requests();
    manager.fetch_entry_data("b.json").await.unwrap();
    assert_eq!(fetcher.bounded_requests().len(), 1);
}

#[tokio::test]
async fn test_cancelled_joiner_does_not_cancel_others() {
    let (fetcher, image, _) = photos_fetcher();
    let manager = manager(&fetcher, None);
    manager.load_catalog().await.unwrap();
    fetcher.reset_requests();
    fetcher.set_delay(Duration::from_millis(100));

    let spawn_fetch = |manager: ArchiveManager<MockFetcher>| {
        tokio::spawn(async move { manager.fetch_entry_data("a.jpg").await })
    };
    let first = spawn_fetch(manager.clone());
    let second = spawn_fetch(manager.clone());
    tokio::time::sleep(Duration::from_millis(30)).await;

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    let data = second.await.unwrap().unwrap();
    assert_eq!(&data[..], &image[..]);
    assert_eq!(fetcher.bounded_requests().len(), 1);
}

#[tokio::test]
async fn test_request_restarts_after_all_callers_cancel() {
    let (fetcher, image, _) = photos_fetcher();
    let manager = manager(&fetcher, None);
    manager.load_catalog().await.unwrap();
    fetcher.reset_requests();
    fetcher.set_delay(Duration::from_millis(100));

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.fetch_entry_data("a.jpg").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    task.abort();
    let _ = task.await;

    fetcher.set_delay(Duration::ZERO);
    let data = manager.fetch_entry_data("a.jpg").await.unwrap();
    assert_eq!(&data[..], &image[..]);
    assert_eq!(fetcher.bounded_requests().len(), 2);
}

#[tokio::test]
async fn test_memory_cache_disabled() {
    let (fetcher, _, _) = photos_fetcher();
    let config = Config {
        memory_cache: false,
        durable_cache: false,
        ..Config::default()
    };
    let manager = ArchiveManager::new(URI, Arc::clone(&fetcher), None, &config);

    manager.fetch_entry_data("b.json").await.unwrap();
    manager.fetch_entry_data("b.json").await.unwrap();
    assert_eq!(fetcher.bounded_requests().len(), 2);
}

#[tokio::test]
async fn test_registry_with_disk_store() {
    const OTHER: &str = "https://example.com/other.zip";

    let (archive, _, json) = photos_zip();
    let other = ZipBuilder::new().deflated("notes.txt", b"remote notes").build();
    let fetcher = Arc::new(MockFetcher::with_archive(URI, archive));
    fetcher.insert(OTHER, other);

    let dir = tempfile::tempdir().unwrap();
    let disk = Arc::new(DiskStore::with_base_dir(dir.path()).await.unwrap());
    let registry = ArchiveRegistry::new(
        Arc::clone(&fetcher),
        Some(Arc::clone(&disk) as Arc<dyn CacheStore>),
        Config::default(),
    );

    assert_eq!(&registry.fetch_entry_data(URI, "b.json").await.unwrap()[..], &json[..]);
    assert_eq!(
        &registry.fetch_entry_data(OTHER, "notes.txt").await.unwrap()[..],
        b"remote notes"
    );
    assert!(disk.record_path(URI, None).exists());
    assert!(disk.record_path(URI, Some("b.json")).exists());
    assert!(disk.record_path(OTHER, Some("notes.txt")).exists());

    // A fresh registry over the same directory needs no network
    fetcher.reset_requests();
    let reopened = ArchiveRegistry::new(
        Arc::clone(&fetcher),
        Some(Arc::clone(&disk) as Arc<dyn CacheStore>),
        Config::default(),
    );
    assert_eq!(reopened.load_catalog(OTHER).await.unwrap().len(), 1);
    reopened.fetch_entry_data(URI, "b.json").await.unwrap();
    assert_eq!(fetcher.request_count(), 0);

    reopened.clear_cache().await.unwrap();
    assert_eq!(reopened.manager(URI).state(), LoadState::Unloaded);
    assert!(!disk.record_path(URI, None).exists());
    assert!(!disk.record_path(OTHER, Some("notes.txt")).exists());
}

/// Store a snapshot of the photos catalog and return its bytes
async fn stored_snapshot(fetcher: &Arc<MockFetcher>, store: &Arc<MemoryStore>) -> Vec<u8> {
    manager(fetcher, Some(Arc::clone(store)))
        .load_catalog()
        .await
        .unwrap();
    store.get(URI, None).await.unwrap().unwrap().to_vec()
}

#[tokio::test]
async fn test_bit_flip_in_snapshot_is_reloaded() {
    let (fetcher, image, _) = photos_fetcher();
    let store = Arc::new(MemoryStore::new());
    let mut snapshot = stored_snapshot(&fetcher, &store).await;

    // Low bit of the crc field of "a.jpg", the first record
    snapshot[53] ^= 0x01;
    store.put(URI, None, &snapshot).await.unwrap();
    assert!(matches!(
        Catalog::decode(&snapshot),
        Err(Error::CacheCorrupted(_))
    ));

    fetcher.reset_requests();
    let manager = manager(&fetcher, Some(Arc::clone(&store)));
    for _ in 0..3 {
        let data = manager.fetch_entry_data("a.jpg").await.unwrap();
        assert_eq!(&data[..], &image[..]);
    }
    // Tail window plus one entry range
    assert_eq!(fetcher.request_count(), 2);

    let rewritten = store.get(URI, None).await.unwrap().unwrap();
    let catalog = Catalog::decode(&rewritten).unwrap();
    assert_eq!(catalog.get("a.jpg").unwrap().crc32, crc32fast::hash(&image));
}

#[tokio::test]
async fn test_snapshot_entry_past_archive_end_is_reloaded() {
    let (fetcher, image, _) = photos_fetcher();
    let store = Arc::new(MemoryStore::new());
    let mut snapshot = stored_snapshot(&fetcher, &store).await;

    // Offset of "a.jpg" near u64::MAX, with a trailer that still matches
    snapshot[27..35].copy_from_slice(&(u64::MAX - 100).to_le_bytes());
    let body = snapshot.len() - 4;
    let checksum = crc32fast::hash(&snapshot[..body]);
    snapshot[body..].copy_from_slice(&checksum.to_le_bytes());
    store.put(URI, None, &snapshot).await.unwrap();
    assert!(matches!(
        Catalog::decode(&snapshot),
        Err(Error::CacheCorrupted(_))
    ));

    fetcher.reset_requests();
    let manager = manager(&fetcher, Some(Arc::clone(&store)));
    let data = manager.fetch_entry_data("a.jpg").await.unwrap();
    assert_eq!(&data[..], &image[..]);
    assert_eq!(manager.catalog().unwrap().get("a.jpg").unwrap().offset, 0);
    assert_eq!(fetcher.request_count(), 2);
}

#[tokio::test]
async fn test_concurrent_reloads_share_one_fetch() {
    let (fetcher, _, _) = photos_fetcher();
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&fetcher, Some(Arc::clone(&store)));
    manager.load_catalog().await.unwrap();
    fetcher.reset_requests();
    fetcher.set_delay(Duration::from_millis(50));

    let results = join_all((0..3).map(|_| manager.reload_catalog())).await;
    assert_eq!(fetcher.request_count(), 1);
    let catalogs: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert!(catalogs.iter().all(|c| Arc::ptr_eq(c, &catalogs[0])));
    assert_eq!(manager.state(), LoadState::Loaded);
}

#[tokio::test]
async fn test_reload_joins_network_load_in_flight() {
    let (fetcher, _, _) = photos_fetcher();
    let manager = manager(&fetcher, None);
    fetcher.set_delay(Duration::from_millis(50));

    let (loaded, reloaded) = tokio::join!(manager.load_catalog(), manager.reload_catalog());
    assert!(Arc::ptr_eq(&loaded.unwrap(), &reloaded.unwrap()));
    assert_eq!(fetcher.request_count(), 1);
}

#[tokio::test]
async fn test_progress_increases_to_completion() {
    let (fetcher, image, _) = photos_fetcher();
    let manager = manager(&fetcher, None);

    let (progress, values) = progress_recorder(100);
    let data = manager
        .fetch_entry_data_with_progress("a.jpg", progress)
        .await
        .unwrap();
    assert_eq!(&data[..], &image[..]);

    let values = values.lock().clone();
    assert!(values.len() > 2, "{:?}", values);
    assert_progress_completes(&values);

    // A cached payload completes at once
    let (progress, values) = progress_recorder(100);
    manager
        .fetch_entry_data_with_progress("a.jpg", progress)
        .await
        .unwrap();
    assert_eq!(*values.lock(), vec![1.0]);
}

#[tokio::test]
async fn test_progress_reaches_every_coalesced_caller() {
    let (fetcher, image, _) = photos_fetcher();
    let manager = manager(&fetcher, None);
    manager.load_catalog().await.unwrap();
    fetcher.reset_requests();
    fetcher.set_delay(Duration::from_millis(50));

    let (first, first_values) = progress_recorder(100);
    let (second, second_values) = progress_recorder(100);
    let (a, b) = tokio::join!(
        manager.fetch_entry_data_with_progress("a.jpg", first),
        manager.fetch_entry_data_with_progress("a.jpg", second),
    );
    assert_eq!(&a.unwrap()[..], &image[..]);
    assert_eq!(&b.unwrap()[..], &image[..]);
    assert_eq!(fetcher.bounded_requests().len(), 1);

    for values in [first_values, second_values] {
        let values = values.lock().clone();
        assert!(values.len() > 2, "{:?}", values);
        assert_progress_completes(&values);
    }
}

#[tokio::test]
async fn test_failed_fetch_reports_no_completion() {
    let (fetcher, _, _) = photos_fetcher();
    let manager = manager(&fetcher, None);

    let (progress, values) = progress_recorder(100);
    let err = manager
        .fetch_entry_data_with_progress("missing.txt", progress)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EntryNotFound(_)));
    assert!(values.lock().is_empty());
}
