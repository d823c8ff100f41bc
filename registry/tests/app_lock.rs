use registry::{
    lock::AppLock,
    paths::RegistryPaths,
    store::{memory::WATCH_CAPACITY, CoordStore, MemStore, StoreError},
    BeeId, Error, OwnerRecord,
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::Barrier;

const LOCK_KEY: &str = "beehive/apps/kv/__lock__";

fn setup() -> (Arc<MemStore>, AppLock) {
    let store = Arc::new(MemStore::new());
    let lock = AppLock::new(store.clone(), RegistryPaths::new("beehive"));
    (store, lock)
}

#[tokio::test]
async fn test_acquire_writes_holder_record() {
    let (store, lock) = setup();
    let bee = BeeId::new("h1", "kv", 7);

    lock.acquire(&bee).await.unwrap();
    let entry = store.get(LOCK_KEY, false).await.unwrap();
    let holder = OwnerRecord::decode(LOCK_KEY, entry.node.value()).unwrap();
    assert_eq!(holder, OwnerRecord::new("h1", 7));
    assert_eq!(entry.node.ttl, None);

    lock.release(&bee).await.unwrap();
    assert!(store.get(LOCK_KEY, false).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_second_acquire_waits_for_release() {
    let (_store, lock) = setup();
    let first = BeeId::new("h1", "kv", 1);
    let second = BeeId::new("h2", "kv", 2);

    lock.acquire(&first).await.unwrap();

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let lock = lock.clone();
        let second = second.clone();
        let acquired = acquired.clone();
        tokio::spawn(async move {
            lock.acquire(&second).await.unwrap();
            acquired.store(true, Ordering::SeqCst);
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!acquired.load(Ordering::SeqCst));

    lock.release(&first).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter never acquired the lock")
        .unwrap();
    assert!(acquired.load(Ordering::SeqCst));

    lock.release(&second).await.unwrap();
}

#[tokio::test]
async fn test_release_by_non_holder_fails_and_keeps_lock() {
    let (store, lock) = setup();
    let holder = BeeId::new("h1", "kv", 1);
    let intruder = BeeId::new("h1", "kv", 2);

    lock.acquire(&holder).await.unwrap();

    let err = lock.release(&intruder).await.unwrap_err();
    match err {
        Error::LockNotHeld { key, holder, caller } => {
            assert_eq!(key, LOCK_KEY);
            assert_eq!(holder, OwnerRecord::new("h1", 1));
            assert_eq!(caller, OwnerRecord::new("h1", 2));
        }
        other => panic!("unexpected error: {other}"),
    }

    let entry = store.get(LOCK_KEY, false).await.unwrap();
    assert_eq!(
        OwnerRecord::decode(LOCK_KEY, entry.node.value()).unwrap(),
        OwnerRecord::new("h1", 1)
    );
}

#[tokio::test]
async fn test_release_without_lock_is_store_error() {
    let (_store, lock) = setup();
    let err = lock.release(&BeeId::new("h1", "kv", 1)).await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::KeyNotFound { .. })), "{err}");
}

#[tokio::test]
async fn test_locks_are_per_application() {
    let (_store, lock) = setup();
    let a = BeeId::new("h1", "app-a", 1);
    let b = BeeId::new("h1", "app-b", 1);

    tokio::time::timeout(Duration::from_secs(1), async {
        lock.acquire(&a).await.unwrap();
        lock.acquire(&b).await.unwrap();
    })
    .await
    .expect("locks of different apps must not block each other");

    lock.release(&a).await.unwrap();
    lock.release(&b).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_store_is_recoverable() {
    let (store, lock) = setup();
    store.set_available(false);

    let err = lock.acquire(&BeeId::new("h1", "kv", 1)).await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Unavailable(_))), "{err}");
    assert!(!err.is_fatal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    const CONTENDERS: u64 = 8;
    const ROUNDS: usize = 5;

    let (_store, lock) = setup();
    let barrier = Arc::new(Barrier::new(CONTENDERS as usize));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for id in 0..CONTENDERS {
        let lock = lock.clone();
        let barrier = barrier.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        let entries = entries.clone();
        handles.push(tokio::spawn(async move {
            let bee = BeeId::new(format!("h{id}"), "kv", id);
            barrier.wait().await;
            for _ in 0..ROUNDS {
                lock.acquire(&bee).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                entries.fetch_add(1, Ordering::SeqCst);
                lock.release(&bee).await.unwrap();
            }
        }));
    }

    tokio::time::timeout(Duration::from_secs(30), futures::future::join_all(handles))
        .await
        .expect("contenders deadlocked")
        .into_iter()
        .for_each(|res| res.unwrap());

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(entries.load(Ordering::SeqCst), CONTENDERS as usize * ROUNDS);
}

async fn spawn_waiter(lock: &AppLock, bee: BeeId) -> tokio::task::JoinHandle<registry::Result<()>> {
    let lock = lock.clone();
    let waiter = tokio::spawn(async move { lock.acquire(&bee).await });
    // Let the waiter fail its create and park on the watch.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    waiter
}

#[tokio::test]
async fn test_waiter_survives_write_burst_on_other_app() {
    let (store, lock) = setup();
    let holder = BeeId::new("h1", "kv", 1);
    lock.acquire(&holder).await.unwrap();
    let waiter = spawn_waiter(&lock, BeeId::new("h2", "kv", 2)).await;

    for i in 0..WATCH_CAPACITY + 76 {
        store
            .set(&format!("beehive/apps/other/d/{i}"), "{}", None)
            .await
            .unwrap();
    }
    lock.release(&holder).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter never acquired the lock")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_waiter_retries_after_lagging_watch() {
    let (store, lock) = setup();
    let holder = BeeId::new("h1", "kv", 1);
    lock.acquire(&holder).await.unwrap();
    let waiter = spawn_waiter(&lock, BeeId::new("h2", "kv", 2)).await;

    // Rewrites of the held lock overflow the waiter's watch.
    let value = OwnerRecord::from(&holder).encode().unwrap();
    for _ in 0..WATCH_CAPACITY + 76 {
        store.set(LOCK_KEY, &value, None).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    lock.release(&holder).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter never acquired the lock")
        .unwrap()
        .unwrap();

    let entry = store.get(LOCK_KEY, false).await.unwrap();
    assert_eq!(
        OwnerRecord::decode(LOCK_KEY, entry.node.value()).unwrap(),
        OwnerRecord::new("h2", 2)
    );
}
