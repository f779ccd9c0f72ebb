//! Integration tests against a real Redis.
//!
//! Tests use testcontainers to spin up a Redis instance and are ignored by
//! default; run with `--ignored` where Docker is available.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rampart_cache::{RedisCache, RedisCacheConfig, ReadThrough, ReadThroughConfig, SharedStore, scripts};
use rampart_core::{CoreError, RequestContext};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{host_port}");
            (container, url)
        })
        .await;
    url.clone()
}

async fn connect() -> RedisCache {
    RedisCache::connect(RedisCacheConfig {
        url: get_redis_url().await,
        pool_size: Some(16),
        min_idle: 2,
        ..Default::default()
    })
    .await
    .expect("connect to redis")
}

fn unique(prefix: &str) -> String {
    format!("{prefix}:{}", uuid_like())
}

fn uuid_like() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_set_get_del() {
    let redis = connect().await;
    let ctx = RequestContext::background();
    let key = unique("k");

    redis
        .set(&ctx, &key, b"value", Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(redis.get(&ctx, &key).await.unwrap(), Some(b"value".to_vec()));

    let (_, ttl) = redis.get_with_ttl(&ctx, &key).await.unwrap().unwrap();
    assert!(ttl.unwrap() <= Duration::from_secs(60));

    assert_eq!(redis.del(&ctx, &[key.clone()]).await.unwrap(), 1);
    assert!(!redis.exists(&ctx, &key).await.unwrap());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_mset_mget_and_scan_delete() {
    let redis = connect().await;
    let ctx = RequestContext::background();
    let prefix = unique("batch");
    let entries: Vec<(String, Vec<u8>)> = (0..250)
        .map(|i| (format!("{prefix}:{i}"), i.to_string().into_bytes()))
        .collect();

    redis
        .mset(&ctx, &entries, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
    let values = redis.mget(&ctx, &keys[..3]).await.unwrap();
    assert_eq!(values[2], Some(b"2".to_vec()));

    let deleted = redis.scan_delete(&ctx, &format!("{prefix}:*")).await.unwrap();
    assert_eq!(deleted, 250);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_negative_script_respects_positive_entry() {
    let redis = connect().await;
    let ctx = RequestContext::background();
    let key = unique("user");
    let marker = format!("null:{key}");

    redis
        .set(&ctx, &key, b"present", Some(Duration::from_secs(60)))
        .await
        .unwrap();
    let written = SharedStore::set_unless_exists(&redis, &ctx, &key, &marker, b"1", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(!written);
    assert!(!redis.exists(&ctx, &marker).await.unwrap());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_sliding_window_script_admits_up_to_limit() {
    let redis = connect().await;
    let ctx = RequestContext::background();
    let key = unique("rl");
    let script = scripts::sliding_window();
    let window = Duration::from_secs(60).as_nanos().to_string();

    let mut admitted = 0;
    for i in 0..5 {
        let now = (1_000_000_000_000u128 + i).to_string();
        let ok: i64 = redis
            .run_script(&ctx, &script, &[key.as_str()], &[now, window.clone(), "3".into(), i.to_string()])
            .await
            .unwrap();
        admitted += ok;
    }
    assert_eq!(admitted, 3);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_stampede_over_redis() {
    let redis = connect().await;
    let shared: Arc<dyn SharedStore> = Arc::new(redis.clone());
    let cache = Arc::new(ReadThrough::<String>::new(ReadThroughConfig::default(), Some(shared)));
    let key = unique("user");
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..100 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let ctx = RequestContext::background();
            cache
                .get(&ctx, &key, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, CoreError>("ada".to_string())
                })
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "ada");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let ctx = RequestContext::background();
    assert!(redis.exists(&ctx, &key).await.unwrap());
    let stats = redis.pool_stats();
    assert!(stats.open >= 1);
    redis.close().await;
}
