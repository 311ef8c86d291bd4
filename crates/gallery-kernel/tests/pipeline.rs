use std::{io::Cursor, path::Path, sync::Arc, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use gallery_db::{
    Database, LocalObjectStore, MemoryObjectStore, NewGroup, ObjectStorage, SharedObjectStorage,
    WorkerRegistry,
};
use gallery_kernel::{
    events::{store_notification, StoreEvent},
    relay::{NotificationRelay, Settlement, DEFAULT_MAX_DELIVERIES},
    upload::{UploadCredential, UploadError, UploadSigner},
    verify_signed_line, AuditConfig, GalleryConfig, GalleryKernel, KernelError,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;

const SECRET: &[u8] = b"pipeline-secret";

struct Harness {
    kernel: GalleryKernel,
    store: Arc<MemoryObjectStore>,
}

async fn kernel_over(
    db: Database,
    storage: SharedObjectStorage,
    max_deliveries: u32,
    config: GalleryConfig,
) -> GalleryKernel {
    db.put_group(NewGroup::with_id("g1")).await.unwrap();
    let relay = NotificationRelay::open(db.clone(), max_deliveries)
        .await
        .unwrap();
    GalleryKernel::new(db, storage, relay, config).unwrap()
}

async fn harness_with(max_deliveries: u32, config: GalleryConfig) -> Harness {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let kernel = kernel_over(db, store.clone(), max_deliveries, config).await;
    Harness { kernel, store }
}

async fn harness() -> Harness {
    harness_with(
        DEFAULT_MAX_DELIVERIES,
        GalleryConfig::with_secret(SECRET.to_vec()),
    )
    .await
}

async fn local_kernel(root: &Path) -> GalleryKernel {
    let db = Database::connect_file(&root.join("gallery.db")).await.unwrap();
    let store: SharedObjectStorage = Arc::new(LocalObjectStore::new(root.join("objects")));
    kernel_over(
        db,
        store,
        DEFAULT_MAX_DELIVERIES,
        GalleryConfig::with_secret(SECRET.to_vec()),
    )
    .await
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 200]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn query(credential: &UploadCredential) -> (i64, String) {
    let (_, query) = credential.url.split_once('?').unwrap();
    let mut expires = None;
    let mut signature = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("expires", value)) => expires = Some(value.parse().unwrap()),
            Some(("signature", value)) => signature = Some(value.to_string()),
            _ => {}
        }
    }
    (expires.unwrap(), signature.unwrap())
}

async fn upload(kernel: &GalleryKernel, credential: &UploadCredential, bytes: Vec<u8>) {
    let (expires, signature) = query(credential);
    kernel
        .accept_upload(&credential.bucket, &credential.key, expires, &signature, bytes)
        .await
        .unwrap();
}

#[tokio::test]
async fn upload_produces_proportional_thumbnail() {
    let Harness { kernel, store } = harness().await;
    let created = kernel
        .create_image("g1", br#"{"title":"dunes"}"#)
        .await
        .unwrap();
    let key = created.new_item.image_id.to_string();

    upload(&kernel, &created.credential, png(300, 200)).await;
    assert!(store.object_exists("images", &key).await.unwrap());

    let worker = kernel.derivation_worker();
    let (outcome, settlement) = worker.process_next().await.unwrap().unwrap();
    assert_eq!(settlement, Settlement::Acked);
    let written: Vec<_> = outcome.stored().collect();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].thumbnail_key, format!("{key}.jpeg"));

    let thumbnail = kernel
        .read_object("thumbnails", &format!("{key}.jpeg"))
        .await
        .unwrap();
    let decoded = image::load_from_memory(&thumbnail).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (150, 100));
}

#[tokio::test]
async fn duplicate_delivery_leaves_identical_bytes() {
    let Harness { kernel, store } = harness().await;
    let created = kernel.create_image("g1", b"{}").await.unwrap();
    let key = created.new_item.image_id.to_string();
    upload(&kernel, &created.credential, png(640, 480)).await;

    let delivery = kernel.relay().try_recv().await.unwrap().unwrap();
    let message = delivery.message().clone();
    delivery.ack().await.unwrap();

    let worker = kernel.derivation_worker();
    let first = worker.handle_message(&message).await;
    assert_eq!(first.failures().count(), 0);
    let first_bytes = store.get_object("thumbnails", &format!("{key}.jpeg")).await.unwrap();

    let second = worker.handle_message(&message).await;
    assert_eq!(second.failures().count(), 0);
    let second_bytes = store.get_object("thumbnails", &format!("{key}.jpeg")).await.unwrap();

    assert_eq!(first_bytes, second_bytes);
    assert_eq!(store.keys("thumbnails").len(), 1);
}

#[tokio::test]
async fn failing_event_does_not_block_its_sibling() {
    let Harness { kernel, store } = harness().await;
    let relay = kernel.relay().clone();

    store.put_object("images", "good", png(150, 150)).await.unwrap();
    store
        .put_object("images", "corrupt", b"not an image at all".to_vec())
        .await
        .unwrap();
    let body = store_notification(&[
        StoreEvent::object_created("images", "corrupt", 19),
        StoreEvent::object_created("images", "good", 1),
    ]);
    relay.publish(body.to_string()).await.unwrap();

    let worker = kernel.derivation_worker();
    let (outcome, settlement) = worker.process_next().await.unwrap().unwrap();
    assert_eq!(outcome.events.len(), 2);
    assert_eq!(outcome.stored().count(), 1);
    assert_eq!(outcome.failures().count(), 1);
    assert!(matches!(settlement, Settlement::Parked { .. }));

    assert!(store.object_exists("thumbnails", "good.jpeg").await.unwrap());
    assert!(!store.object_exists("thumbnails", "corrupt.jpeg").await.unwrap());
    assert_eq!(relay.dead_letters().await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_original_is_redelivered_then_parked() {
    let Harness { kernel, .. } =
        harness_with(2, GalleryConfig::with_secret(SECRET.to_vec())).await;
    let relay = kernel.relay().clone();
    relay
        .publish(store_notification(&[StoreEvent::object_created("images", "ghost", 1)]).to_string())
        .await
        .unwrap();

    let worker = kernel.derivation_worker();
    let (_, first) = worker.process_next().await.unwrap().unwrap();
    assert_eq!(first, Settlement::Requeued { next_attempt: 2 });
    let (outcome, second) = worker.process_next().await.unwrap().unwrap();
    assert_eq!(outcome.attempt, 2);
    assert!(matches!(second, Settlement::Parked { .. }));

    let dead = relay.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("ghost"));
}

#[tokio::test]
async fn rejected_uploads_store_and_publish_nothing() {
    let Harness { kernel, store } = harness().await;
    let created = kernel.create_image("g1", b"{}").await.unwrap();
    let credential = &created.credential;
    let (expires, signature) = query(credential);

    let tampered = kernel
        .accept_upload("images", &credential.key, expires + 60, &signature, png(8, 8))
        .await;
    assert!(matches!(
        tampered,
        Err(KernelError::Upload(UploadError::InvalidSignature))
    ));

    let other_key = kernel
        .accept_upload("images", "someone-else", expires, &signature, png(8, 8))
        .await;
    assert!(matches!(
        other_key,
        Err(KernelError::Upload(UploadError::InvalidSignature))
    ));

    let stale = UploadSigner::new(
        SECRET.to_vec(),
        "http://127.0.0.1:8080",
        "images",
        Duration::from_secs(300),
    )
    .unwrap()
    .issue_at(&credential.key, Utc::now() - ChronoDuration::hours(1))
    .unwrap();
    let (stale_expires, stale_signature) = query(&stale);
    let expired = kernel
        .accept_upload("images", &credential.key, stale_expires, &stale_signature, png(8, 8))
        .await;
    assert!(matches!(
        expired,
        Err(KernelError::Upload(UploadError::Expired(_)))
    ));

    let empty = kernel
        .accept_upload("images", &credential.key, expires, &signature, Vec::new())
        .await;
    assert!(matches!(empty, Err(KernelError::MalformedInput(_))));

    assert!(store.is_empty());
    assert!(kernel.relay().try_recv().await.unwrap().is_none());
}

#[tokio::test]
async fn listing_returns_newest_first() {
    let Harness { kernel, .. } = harness().await;
    let first = kernel.create_image("g1", br#"{"title":"a"}"#).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = kernel.create_image("g1", br#"{"title":"b"}"#).await.unwrap();

    let items = kernel.list_images("g1").await.unwrap();
    let ids: Vec<_> = items.iter().map(|item| item.image_id).collect();
    assert_eq!(
        ids,
        vec![second.new_item.image_id, first.new_item.image_id]
    );

    let groups = kernel.list_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, "g1");
}

#[tokio::test]
async fn connect_then_disconnect_leaves_nothing() {
    let Harness { kernel, .. } = harness().await;
    let registry = kernel.connections();

    let record = registry.on_connect("abc").await.unwrap();
    assert_eq!(record.id, "abc");
    assert!(registry.is_connected("abc").await.unwrap());

    registry.on_disconnect("abc").await.unwrap();
    assert!(!registry.is_connected("abc").await.unwrap());
    assert!(registry.list().await.unwrap().is_empty());

    registry.on_disconnect("never-seen").await.unwrap();
    assert!(matches!(
        registry.on_connect("  ").await,
        Err(KernelError::MalformedInput(_))
    ));
}

#[tokio::test]
async fn worker_drains_relay_and_exits_on_close() {
    let Harness { kernel, store } = harness().await;
    let created = kernel.create_image("g1", b"{}").await.unwrap();
    let key = created.new_item.image_id.to_string();
    upload(&kernel, &created.credential, png(300, 600)).await;

    let registry = WorkerRegistry::default();
    registry.spawn(Arc::new(kernel.derivation_worker()));
    kernel.relay().close();
    tokio::time::timeout(Duration::from_secs(10), registry.wait_all())
        .await
        .unwrap()
        .unwrap();

    let thumbnail = store
        .get_object("thumbnails", &format!("{key}.jpeg"))
        .await
        .unwrap();
    let decoded = image::load_from_memory(&thumbnail).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (150, 300));
}

#[tokio::test]
async fn audit_log_records_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("audit").join("gallery.jsonl");
    let config = GalleryConfig {
        audit: AuditConfig {
            enabled: true,
            log_path: log_path.clone(),
            hmac_key: Some(b"audit-key".to_vec()),
        },
        ..GalleryConfig::with_secret(SECRET.to_vec())
    };
    let Harness { kernel, .. } = harness_with(DEFAULT_MAX_DELIVERIES, config).await;

    let created = kernel.create_image("g1", b"{}").await.unwrap();
    upload(&kernel, &created.credential, png(64, 64)).await;
    kernel.derivation_worker().process_next().await.unwrap().unwrap();

    let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
    let kinds: Vec<String> = contents
        .lines()
        .map(|line| {
            assert!(verify_signed_line(line, b"audit-key").unwrap());
            let value: Value = serde_json::from_str(line).unwrap();
            value["type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["image_created", "upload_accepted", "thumbnail_stored"]);
}

#[tokio::test]
async fn undelivered_uploads_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (in_flight, queued) = {
        let kernel = local_kernel(dir.path()).await;
        let first = kernel.create_image("g1", b"{}").await.unwrap();
        upload(&kernel, &first.credential, png(300, 150)).await;
        let second = kernel.create_image("g1", b"{}").await.unwrap();
        upload(&kernel, &second.credential, png(150, 300)).await;

        // Claimed but never settled, as when the process dies mid-derivation.
        let delivery = kernel.relay().try_recv().await.unwrap().unwrap();
        std::mem::forget(delivery);
        (
            first.new_item.image_id.to_string(),
            second.new_item.image_id.to_string(),
        )
    };

    let kernel = local_kernel(dir.path()).await;
    assert_eq!(kernel.relay().pending().await.unwrap(), 2);

    let registry = WorkerRegistry::default();
    registry.spawn(Arc::new(kernel.derivation_worker()));
    kernel.relay().close();
    tokio::time::timeout(Duration::from_secs(10), registry.wait_all())
        .await
        .unwrap()
        .unwrap();

    for (key, expected) in [(in_flight, (150, 75)), (queued, (150, 300))] {
        let thumbnail = kernel
            .read_object("thumbnails", &format!("{key}.jpeg"))
            .await
            .unwrap();
        let decoded = image::load_from_memory(&thumbnail).unwrap();
        assert_eq!((decoded.width(), decoded.height()), expected);
    }
    assert_eq!(kernel.relay().pending().await.unwrap(), 0);
    assert!(kernel.relay().dead_letters().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_derivations_of_one_key_converge_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = local_kernel(dir.path()).await;
    let store = LocalObjectStore::new(dir.path().join("objects"));
    store.put_object("images", "photo", png(400, 300)).await.unwrap();

    let worker = kernel.derivation_worker();
    let event = StoreEvent::object_created("images", "photo", 1);
    worker.process_event(&event).await.unwrap();
    let single_run = store.get_object("thumbnails", "photo.jpeg").await.unwrap();
    store.delete_object("thumbnails", "photo.jpeg").await.unwrap();

    let (left, right) = tokio::join!(worker.process_event(&event), worker.process_event(&event));
    assert_eq!(left.unwrap().thumbnail_key, "photo.jpeg");
    assert_eq!(right.unwrap().thumbnail_key, "photo.jpeg");

    assert_eq!(
        store.get_object("thumbnails", "photo.jpeg").await.unwrap(),
        single_run
    );
    let mut entries = tokio::fs::read_dir(dir.path().join("objects").join("thumbnails"))
        .await
        .unwrap();
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(names, vec!["photo.jpeg".to_string()]);
}
