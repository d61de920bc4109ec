//! Coordinator behaviour across storage and in-process tab sync.

use orbit_sync::orbit_core::{Origin, ReplicatedDocument, YrsDocument};
use orbit_sync::{BroadcastBus, Coordinator, CoordinatorConfig, FileStorage, MemoryStorage, StorageAdapter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn stored_text(storage: &MemoryStorage, id: &str, name: &str) -> Option<String> {
    let blob = storage.load(id).await.unwrap()?;
    let doc = YrsDocument::new();
    doc.apply_delta(&blob, Origin::Storage).unwrap();
    Some(doc.text_content(name))
}

#[tokio::test]
async fn test_debounce_coalesces_rapid_writes() {
    init_logging();
    let storage = MemoryStorage::new();
    let config = CoordinatorConfig::new("debounced")
        .with_tab_bus(BroadcastBus::new(64))
        .with_storage(Arc::new(storage.clone()))
        .with_persist_debounce(Duration::from_millis(100));
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize().await.unwrap();

    coordinator.replace_text("a", "one").unwrap();
    coordinator.replace_text("b", "two").unwrap();
    coordinator.replace_text("c", "three").unwrap();
    assert!(coordinator.has_pending_persist());

    sleep(Duration::from_millis(50)).await;
    assert_eq!(storage.save_count(), 0, "no save before the debounce window elapses");

    sleep(Duration::from_millis(250)).await;
    assert_eq!(storage.save_count(), 1, "three writes coalesce into one save");
    assert_eq!(stored_text(&storage, "debounced", "a").await.as_deref(), Some("one"));
    assert_eq!(stored_text(&storage, "debounced", "b").await.as_deref(), Some("two"));
    assert_eq!(stored_text(&storage, "debounced", "c").await.as_deref(), Some("three"));
}

#[tokio::test]
async fn test_dispose_flushes_pending_save() {
    init_logging();
    let storage = MemoryStorage::new();
    let config = CoordinatorConfig::new("flush-on-dispose")
        .with_tab_bus(BroadcastBus::new(64))
        .with_storage(Arc::new(storage.clone()))
        .with_persist_debounce(Duration::from_secs(60));
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize().await.unwrap();

    coordinator.replace_text("body", "last words").unwrap();
    coordinator.dispose().await.unwrap();

    assert_eq!(storage.save_count(), 1);
    assert_eq!(
        stored_text(&storage, "flush-on-dispose", "body").await.as_deref(),
        Some("last words")
    );
}

#[tokio::test]
async fn test_load_does_not_trigger_save() {
    init_logging();
    let storage = MemoryStorage::new();
    let seed = YrsDocument::new();
    seed.replace_text("body", "persisted", Origin::Local).unwrap();
    storage.save("loaded", &seed.encode_full_state()).await.unwrap();
    assert_eq!(storage.save_count(), 1);

    let config = CoordinatorConfig::new("loaded")
        .with_tab_bus(BroadcastBus::new(64))
        .with_storage(Arc::new(storage.clone()))
        .with_persist_debounce(Duration::from_millis(20));
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize().await.unwrap();
    assert_eq!(coordinator.document().text_content("body"), "persisted");

    sleep(Duration::from_millis(100)).await;
    assert_eq!(storage.save_count(), 1);
    assert!(!coordinator.has_pending_persist());
}

#[tokio::test]
async fn test_file_storage_survives_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    {
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let config = CoordinatorConfig::new("journal")
            .with_tab_sync(false)
            .with_storage(Arc::new(storage));
        let coordinator = Coordinator::new(config).unwrap();
        coordinator.initialize().await.unwrap();
        coordinator.replace_text("entry", "Hello World").unwrap();
        coordinator.replace_text("entry", "Hello Orbit World").unwrap();
        coordinator.dispose().await.unwrap();
    }

    let storage = FileStorage::open(dir.path()).await.unwrap();
    let config = CoordinatorConfig::new("journal")
        .with_tab_sync(false)
        .with_storage(Arc::new(storage));
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.initialize().await.unwrap();
    assert_eq!(coordinator.document().text_content("entry"), "Hello Orbit World");
    coordinator.dispose().await.unwrap();
}

#[tokio::test]
async fn test_stores_are_isolated() {
    init_logging();
    let bus = BroadcastBus::new(64);
    let storage = MemoryStorage::new();
    let make = |id: &str| {
        CoordinatorConfig::new(id)
            .with_tab_bus(bus.clone())
            .with_storage(Arc::new(storage.clone()))
            .with_persist_debounce(Duration::from_millis(10))
    };
    let alpha = Coordinator::new(make("alpha")).unwrap();
    let beta = Coordinator::new(make("beta")).unwrap();
    alpha.initialize().await.unwrap();
    beta.initialize().await.unwrap();

    alpha.replace_text("body", "only alpha").unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(beta.document().text_content("body"), "");
    assert!(storage.contains("alpha").await);
    assert!(!storage.contains("beta").await);
}

#[tokio::test]
async fn test_tabs_converge_through_shared_bus() {
    init_logging();
    let bus = BroadcastBus::new(64);
    let config = || CoordinatorConfig::new("shared").with_tab_bus(bus.clone());
    let left = Coordinator::new(config()).unwrap();
    let right = Coordinator::new(config()).unwrap();
    left.initialize().await.unwrap();
    right.initialize().await.unwrap();

    left.replace_text("title", "from left").unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(right.document().text_content("title"), "from left");

    right.replace_text("title", "from right").unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(left.document().text_content("title"), "from right");
}

#[tokio::test]
async fn test_tab_sync_does_not_echo() {
    init_logging();
    let bus = BroadcastBus::new(64);
    let config = || CoordinatorConfig::new("echo").with_tab_bus(bus.clone());
    let writer = Coordinator::new(config()).unwrap();
    let reader = Coordinator::new(config()).unwrap();
    writer.initialize().await.unwrap();
    reader.initialize().await.unwrap();

    let writer_changes = Arc::new(AtomicUsize::new(0));
    let reader_changes = Arc::new(AtomicUsize::new(0));
    let w = writer_changes.clone();
    let _ws = writer
        .document()
        .on_change(move |_, _| {
            w.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let r = reader_changes.clone();
    let _rs = reader
        .document()
        .on_change(move |_, origin| {
            assert!(matches!(origin, Origin::Tab(_)));
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    writer.replace_text("body", "once").unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(writer_changes.load(Ordering::SeqCst), 1);
    assert_eq!(reader_changes.load(Ordering::SeqCst), 1);
    assert_eq!(reader.document().text_content("body"), "once");
}

#[tokio::test]
async fn test_disposed_tab_stops_receiving() {
    init_logging();
    let bus = BroadcastBus::new(64);
    let config = || CoordinatorConfig::new("closing").with_tab_bus(bus.clone());
    let open = Coordinator::new(config()).unwrap();
    let closed = Coordinator::new(config()).unwrap();
    open.initialize().await.unwrap();
    closed.initialize().await.unwrap();

    closed.dispose().await.unwrap();
    open.replace_text("body", "after close").unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(closed.document().text_content("body"), "");
    open.dispose().await.unwrap();
    assert!(!bus.has_topic("orbit-sync:closing"));
}
