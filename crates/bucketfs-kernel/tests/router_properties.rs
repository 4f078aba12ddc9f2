//! End-to-end behavior of the router against an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use bucketfs_kernel::{
    FsError, MemoryStore, ObjectKind, ObjectPath, RemoteError, Router, RouterConfig, StoreOp,
};

fn p(s: &str) -> ObjectPath {
    ObjectPath::new(s).unwrap()
}

fn setup() -> (Arc<MemoryStore>, Router) {
    setup_with(RouterConfig::default())
}

fn setup_with(config: RouterConfig) -> (Arc<MemoryStore>, Router) {
    let store = Arc::new(MemoryStore::new());
    let router = Router::new(store.clone(), config);
    (store, router)
}

fn short_timeouts() -> RouterConfig {
    RouterConfig::default()
        .with_timeouts(Duration::from_millis(50), Duration::from_millis(150))
        .with_sweep_interval(Duration::from_millis(20))
}

/// Poll until `path` has no live worker, or panic after two seconds.
async fn wait_gone(router: &Router, path: &ObjectPath) {
    for _ in 0..200 {
        if !router.has_worker(path) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker for {path} still alive");
}

#[tokio::test]
async fn scenario_create_write_read_release() {
    let (store, router) = setup();
    let path = p("a/b.txt");

    router.create(&path).await.unwrap();
    assert_eq!(router.write(&path, b"hello".to_vec(), 0).await.unwrap(), 5);
    assert_eq!(router.read(&path, 5, 0).await.unwrap(), b"hello");
    router.release(&path).await.unwrap();

    assert_eq!(store.calls(StoreOp::Store), 1);
    assert_eq!(store.get("a/b.txt").unwrap(), b"hello");
    router.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_touch_spawns_one_worker() {
    let (store, router) = setup();
    store.insert("shared.bin", vec![0u8; 64]);
    let path = p("shared.bin");

    let mut tasks = Vec::new();
    for i in 0..32u64 {
        let router = router.clone();
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            router.write(&path, vec![1u8], i).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Every worker would materialize on its own.
    assert_eq!(store.calls(StoreOp::Fetch), 1);
    assert_eq!(router.stats().workers, 1);
    router.shutdown().await;
}

#[tokio::test]
async fn write_then_read_round_trip() {
    let (store, router) = setup();
    store.insert("doc.txt", b"0123456789".to_vec());
    let path = p("doc.txt");

    router.write(&path, b"abc".to_vec(), 4).await.unwrap();
    assert_eq!(router.read(&path, 100, 0).await.unwrap(), b"0123abc789");
    // Remote untouched until flushed.
    assert_eq!(store.get("doc.txt").unwrap(), b"0123456789");
    router.shutdown().await;
}

#[tokio::test]
async fn double_flush_uploads_once() {
    let (store, router) = setup();
    let path = p("f.txt");

    router.create(&path).await.unwrap();
    router.write(&path, b"data".to_vec(), 0).await.unwrap();
    assert!(router.flush(&path).await.unwrap());
    assert!(!router.flush(&path).await.unwrap());
    assert_eq!(store.calls(StoreOp::Store), 1);
    router.shutdown().await;
}

#[tokio::test]
async fn truncate_fetch_rules() {
    let (store, router) = setup();
    store.insert("zero", b"abcdef".to_vec());
    store.insert("some", b"abcdef".to_vec());

    router.truncate(&p("zero"), 0).await.unwrap();
    assert_eq!(store.calls(StoreOp::Fetch), 0);

    router.truncate(&p("some"), 3).await.unwrap();
    router.truncate(&p("some"), 2).await.unwrap();
    assert_eq!(store.calls(StoreOp::Fetch), 1);
    assert_eq!(router.read(&p("some"), 10, 0).await.unwrap(), b"ab");
    router.shutdown().await;
}

#[tokio::test]
async fn release_uploads_before_worker_leaves() {
    let (store, router) = setup();
    let path = p("out.txt");

    router.create(&path).await.unwrap();
    router.write(&path, b"final".to_vec(), 0).await.unwrap();
    router.release(&path).await.unwrap();

    // The release reply is sent after the upload.
    assert_eq!(store.get("out.txt").unwrap(), b"final");
    wait_gone(&router, &path).await;
    assert_eq!(store.get("out.txt").unwrap(), b"final");
    router.shutdown().await;
}

#[tokio::test]
async fn idle_clean_worker_terminates() {
    let (store, router) = setup_with(short_timeouts());
    store.insert("idle", b"x".to_vec());
    let path = p("idle");

    router.write(&path, b"y".to_vec(), 0).await.unwrap();
    router.flush(&path).await.unwrap();
    assert!(router.has_worker(&path));

    wait_gone(&router, &path).await;
    assert_eq!(store.calls(StoreOp::Store), 1);
    router.shutdown().await;
}

#[tokio::test]
async fn idle_dirty_worker_flushes_before_terminating() {
    let (store, router) = setup_with(short_timeouts());
    let path = p("dirty");

    router.create(&path).await.unwrap();
    router.write(&path, b"unsaved".to_vec(), 0).await.unwrap();

    wait_gone(&router, &path).await;
    assert_eq!(store.get("dirty").unwrap(), b"unsaved");
    // The final report is in the cache, so no remote lookup is needed.
    assert_eq!(router.access(&path).await.unwrap().size, 7);
    assert_eq!(store.calls(StoreOp::Head), 0);
    router.shutdown().await;
}

#[tokio::test]
async fn served_read_extends_idle_timeout() {
    let config = RouterConfig::default()
        .with_timeouts(Duration::from_millis(50), Duration::from_millis(400))
        .with_sweep_interval(Duration::from_millis(20));
    let (store, router) = setup_with(config);
    store.insert("open.txt", b"abc".to_vec());
    let read_path = p("open.txt");
    let write_path = p("closed.txt");

    router.read(&read_path, 3, 0).await.unwrap();
    router.create(&write_path).await.unwrap();

    // Past the closed timeout: only the worker without a read handle left.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!router.has_worker(&write_path));
    assert!(router.has_worker(&read_path));

    wait_gone(&router, &read_path).await;
    assert_eq!(store.calls(StoreOp::Store), 1);
    router.shutdown().await;
}

#[tokio::test]
async fn dropping_router_still_flushes_dirty_workers() {
    let (store, router) = setup();
    let path = p("d.txt");

    router.create(&path).await.unwrap();
    router.write(&path, b"precious".to_vec(), 0).await.unwrap();
    drop(router);

    for _ in 0..200 {
        if store.contains("d.txt") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.get("d.txt").unwrap(), b"precious");
    assert_eq!(store.calls(StoreOp::Store), 1);
}

#[tokio::test]
async fn live_worker_is_authoritative_for_metadata() {
    let (store, router) = setup();
    store.insert("dir/m.txt", b"abc".to_vec());
    let path = p("dir/m.txt");

    assert_eq!(router.access(&path).await.unwrap().size, 3);
    let listing = router.list_dir(&p("dir")).await.unwrap();
    assert_eq!(listing[0].size, 3);

    router.write(&path, vec![b'z'; 10], 3).await.unwrap();
    assert_eq!(router.access(&path).await.unwrap().size, 13);
    let listing = router.list_dir(&p("dir")).await.unwrap();
    assert_eq!(listing[0].size, 13);
    router.shutdown().await;
}

#[tokio::test]
async fn listing_shows_unuploaded_files() {
    let (store, router) = setup();
    store.insert("dir/old.txt", b"1".to_vec());

    router.create(&p("dir/new.txt")).await.unwrap();
    router.write(&p("dir/new.txt"), b"22".to_vec(), 0).await.unwrap();

    let names: Vec<(String, u64)> = router
        .list_dir(&p("dir"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.name, e.size))
        .collect();
    assert_eq!(names, vec![("new.txt".into(), 2), ("old.txt".into(), 1)]);
    router.shutdown().await;
}

#[tokio::test]
async fn ops_queued_behind_release_are_rerouted() {
    let (store, router) = setup();
    let path = p("bounce.txt");

    router.create(&path).await.unwrap();
    router.write(&path, b"one".to_vec(), 0).await.unwrap();
    let first = router.worker(&path).unwrap().id();

    // The write is queued behind the release and must land on a successor.
    let (released, written) = tokio::join!(
        router.release(&path),
        router.write(&path, b"two".to_vec(), 3),
    );
    released.unwrap();
    assert_eq!(written.unwrap(), 3);

    let second = router.worker(&path).unwrap().id();
    assert_ne!(first, second);
    assert_eq!(router.read(&path, 10, 0).await.unwrap(), b"onetwo");
    router.release(&path).await.unwrap();
    assert_eq!(store.get("bounce.txt").unwrap(), b"onetwo");
    router.shutdown().await;
}

#[tokio::test]
async fn unlink_through_live_worker() {
    let (store, router) = setup();
    store.insert("gone.txt", b"old".to_vec());
    let path = p("gone.txt");

    router.write(&path, b"new".to_vec(), 0).await.unwrap();
    router.unlink(&path).await.unwrap();

    assert!(!store.contains("gone.txt"));
    assert_eq!(store.calls(StoreOp::Store), 0);
    wait_gone(&router, &path).await;
    assert!(router.access(&path).await.unwrap_err().is_not_found());
    router.shutdown().await;
}

#[tokio::test]
async fn unlink_of_never_uploaded_file_succeeds() {
    let (store, router) = setup();
    let path = p("scratch.txt");

    router.create(&path).await.unwrap();
    router.unlink(&path).await.unwrap();
    assert_eq!(store.calls(StoreOp::Remove), 1);
    assert!(!store.contains("scratch.txt"));
    router.shutdown().await;
}

#[tokio::test]
async fn unlink_failure_is_not_retried() {
    let (store, router) = setup();
    store.insert("sticky", b"x".to_vec());
    store.fail_next(StoreOp::Remove, RemoteError::io("flaky"), 1);

    let err = router.unlink(&p("sticky")).await.unwrap_err();
    assert!(matches!(err, FsError::Remote(RemoteError::Io(_))));
    assert_eq!(store.calls(StoreOp::Remove), 1);
    assert!(store.contains("sticky"));
    router.shutdown().await;
}

#[tokio::test]
async fn transient_fetch_error_is_retried_once() {
    let (store, router) = setup();
    store.insert("r", b"retry".to_vec());
    store.fail_next(StoreOp::Fetch, RemoteError::io("reset"), 1);

    assert_eq!(router.read(&p("r"), 5, 0).await.unwrap(), b"retry");
    assert_eq!(store.calls(StoreOp::Fetch), 2);
    router.shutdown().await;
}

#[tokio::test]
async fn failed_release_upload_is_reported() {
    let (store, router) = setup();
    store.fail_next(StoreOp::Store, RemoteError::quota_exceeded("bucket full"), 1);
    let path = p("big");

    router.create(&path).await.unwrap();
    router.write(&path, b"payload".to_vec(), 0).await.unwrap();
    let err = router.release(&path).await.unwrap_err();
    assert_eq!(err.status(), -(libc::ENOSPC as i8));
    // Quota errors are not retried.
    assert_eq!(store.calls(StoreOp::Store), 1);
    wait_gone(&router, &path).await;
    router.shutdown().await;
}

#[tokio::test]
async fn mkdir_then_list_parent() {
    let (store, router) = setup();

    router.mkdir(&p("photos")).await.unwrap();
    assert_eq!(store.calls(StoreOp::CreateDir), 1);
    let root = router.list_dir(&ObjectPath::root()).await.unwrap();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].kind, ObjectKind::Directory);

    router.rmdir(&p("photos")).await.unwrap();
    assert!(router.list_dir(&ObjectPath::root()).await.unwrap().is_empty());
    assert!(router.access(&p("photos")).await.unwrap_err().is_not_found());
    router.shutdown().await;
}

#[tokio::test]
async fn metadata_expires_after_ttl() {
    let config = RouterConfig::default()
        .with_metadata_ttl(Duration::from_millis(30))
        .with_sweep_interval(Duration::from_millis(10));
    let (store, router) = setup_with(config);
    store.insert("t", b"1".to_vec());

    router.access(&p("t")).await.unwrap();
    router.access(&p("t")).await.unwrap();
    assert_eq!(store.calls(StoreOp::Head), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(router.stats().cached_metadata, 0);
    router.access(&p("t")).await.unwrap();
    assert_eq!(store.calls(StoreOp::Head), 2);
    router.shutdown().await;
}
