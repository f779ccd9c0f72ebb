//! Read-through behaviour across two tiers, using the in-process shared store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rampart_cache::{MemoryStore, ReadThrough, ReadThroughConfig, SharedStore};
use rampart_core::{CoreError, RequestContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u64,
    name: String,
}

fn user(id: u64) -> User {
    User {
        id,
        name: format!("user-{id}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cold_key_stampede_runs_loader_once() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(ReadThrough::<User>::new(
        ReadThroughConfig::default(),
        Some(store.clone()),
    ));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..200 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            let ctx = RequestContext::background();
            cache
                .get(&ctx, "user:42", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(user(42))
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), user(42));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.local().get("user:42"), Some(user(42)));

    let ctx = RequestContext::background();
    let (_, ttl) = store.get_with_ttl(&ctx, "user:42").await.unwrap().unwrap();
    assert!(ttl.unwrap() > Duration::from_secs(60));
}

#[tokio::test]
async fn test_missing_key_is_remembered() {
    let store = Arc::new(MemoryStore::new());
    let cache = ReadThrough::<User>::new(ReadThroughConfig::default(), Some(store.clone()));
    let ctx = RequestContext::background();
    let calls = AtomicUsize::new(0);
    let loader = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(CoreError::NotFound)
    };

    assert_eq!(cache.get(&ctx, "user:99", loader).await, Err(CoreError::NotFound));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.get(&ctx, "user:99", loader).await, Err(CoreError::NotFound));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let (_, ttl) = store
        .get_with_ttl(&ctx, "null:user:99")
        .await
        .unwrap()
        .expect("negative entry in L2");
    assert!(ttl.unwrap() <= Duration::from_secs(60));
}

#[tokio::test]
async fn test_negative_entry_is_shared_between_instances() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let a = ReadThrough::<User>::new(ReadThroughConfig::default(), Some(Arc::clone(&store)));
    let b = ReadThrough::<User>::new(ReadThroughConfig::default(), Some(Arc::clone(&store)));
    let ctx = RequestContext::background();

    let _ = a
        .get(&ctx, "user:999", || async { Err(CoreError::NotFound) })
        .await;
    let result = b
        .get(&ctx, "user:999", || async { Ok(user(999)) })
        .await;
    assert_eq!(result, Err(CoreError::NotFound));
}

#[tokio::test]
async fn test_successful_load_clears_negative_entry() {
    let store = Arc::new(MemoryStore::new());
    let cache = ReadThrough::<User>::new(ReadThroughConfig::default(), Some(store.clone()));
    let ctx = RequestContext::background();

    let _ = cache
        .get(&ctx, "user:7", || async { Err(CoreError::NotFound) })
        .await;
    cache.invalidate(&ctx, &["user:7"]).await;
    assert!(!store.exists(&ctx, "null:user:7").await.unwrap());

    let loaded = cache.get(&ctx, "user:7", || async { Ok(user(7)) }).await;
    assert_eq!(loaded, Ok(user(7)));
    assert!(!store.exists(&ctx, "null:user:7").await.unwrap());
}

#[tokio::test]
async fn test_second_instance_reads_through_shared_tier() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let a = ReadThrough::<User>::new(ReadThroughConfig::default(), Some(Arc::clone(&store)));
    let b = ReadThrough::<User>::new(ReadThroughConfig::default(), Some(Arc::clone(&store)));
    let ctx = RequestContext::background();

    a.get(&ctx, "user:1", || async { Ok(user(1)) }).await.unwrap();
    let from_b = b
        .get(&ctx, "user:1", || async { Err(CoreError::internal("should hit L2")) })
        .await;
    assert_eq!(from_b, Ok(user(1)));
}

/// Shared store whose single-key negative deletes are slow, holding a load
/// inside its write-back while other work runs.
struct SlowNegativeDeletes {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl SharedStore for SlowNegativeDeletes {
    async fn get(&self, ctx: &RequestContext, key: &str) -> rampart_cache::Result<Option<Vec<u8>>> {
        self.inner.get(ctx, key).await
    }

    async fn get_with_ttl(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> rampart_cache::Result<Option<(Vec<u8>, Option<Duration>)>> {
        self.inner.get_with_ttl(ctx, key).await
    }

    async fn set(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> rampart_cache::Result<()> {
        self.inner.set(ctx, key, value, ttl).await
    }

    async fn del(&self, ctx: &RequestContext, keys: &[String]) -> rampart_cache::Result<u64> {
        if let [only] = keys
            && only.starts_with("null:")
        {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.del(ctx, keys).await
    }

    async fn exists(&self, ctx: &RequestContext, key: &str) -> rampart_cache::Result<bool> {
        self.inner.exists(ctx, key).await
    }

    async fn incr(&self, ctx: &RequestContext, key: &str) -> rampart_cache::Result<i64> {
        self.inner.incr(ctx, key).await
    }

    async fn scan_delete(&self, ctx: &RequestContext, pattern: &str) -> rampart_cache::Result<u64> {
        self.inner.scan_delete(ctx, pattern).await
    }

    async fn set_unless_exists(
        &self,
        ctx: &RequestContext,
        guard: &str,
        marker: &str,
        value: &[u8],
        ttl: Duration,
    ) -> rampart_cache::Result<bool> {
        self.inner
            .set_unless_exists(ctx, guard, marker, value, ttl)
            .await
    }
}

#[tokio::test]
async fn test_invalidate_during_write_back_is_not_lost() {
    let store = Arc::new(SlowNegativeDeletes {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(100),
    });
    let cache = Arc::new(ReadThrough::<User>::new(
        ReadThroughConfig::default(),
        Some(store.clone()),
    ));

    let reader = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let ctx = RequestContext::background();
            cache.get(&ctx, "user:1", || async { Ok(user(1)) }).await
        })
    };

    // The reader has loaded and is stuck writing back when this lands.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let ctx = RequestContext::background();
    cache.invalidate(&ctx, &["user:1"]).await;

    assert_eq!(reader.await.unwrap(), Ok(user(1)));
    assert!(cache.local().get("user:1").is_none());
    assert!(!store.exists(&ctx, "user:1").await.unwrap());

    let renamed = User {
        id: 1,
        name: "renamed".into(),
    };
    let calls = AtomicUsize::new(0);
    let value = cache
        .get(&ctx, "user:1", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(renamed.clone())
        })
        .await;
    assert_eq!(value, Ok(renamed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unrelated_invalidations_keep_one_wave() {
    let cache = Arc::new(ReadThrough::<User>::new(
        ReadThroughConfig::default(),
        Some(Arc::new(MemoryStore::new())),
    ));
    let calls = Arc::new(AtomicUsize::new(0));

    let writer = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let ctx = RequestContext::background();
            for _ in 0..20 {
                cache.invalidate(&ctx, &["user:7"]).await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let mut handles = Vec::new();
    for _ in 0..200 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            let ctx = RequestContext::background();
            cache
                .get(&ctx, "user:42", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(user(42))
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(user(42)));
    }
    writer.await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_waiter_gives_up_at_its_own_deadline() {
    let cache = Arc::new(ReadThrough::<User>::local_only(ReadThroughConfig::default()));

    let leader = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let ctx = RequestContext::background();
            cache
                .get(&ctx, "user:5", || std::future::pending::<Result<User, CoreError>>())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let ctx = RequestContext::background().with_timeout(Duration::from_millis(50));
    let waited = tokio::time::timeout(
        Duration::from_secs(1),
        cache.get(&ctx, "user:5", || async { Ok(user(5)) }),
    )
    .await
    .expect("waiter must not outlive its deadline");
    assert_eq!(waited, Err(CoreError::Timeout));

    leader.abort();
}
