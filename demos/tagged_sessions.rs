//! Demo: session fragments grouped by user tags, with stampede-protected
//! reads.
//!
//! Run with `cargo run --example tagged_sessions`.

use std::sync::Arc;
use std::time::Duration;

use tagcache::{
    CacheConfig, MemoryPool, RetryConfig, RetryStrategy, RetryingPool, TagAwareCache,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let pool = Arc::new(MemoryPool::new());
    let proxied = Arc::new(RetryingPool::new(
        pool.clone(),
        RetryConfig {
            timeout_ms: 250,
            max_retries: 4,
            strategy: RetryStrategy::FlatGeometricIntervals,
            factor: 2.0,
        },
    ));

    let config = CacheConfig {
        namespace: "demo".to_string(),
        default_lifetime: 3600,
        ..CacheConfig::default()
    };
    let mut cache = TagAwareCache::with_pool(proxied, config)?;

    // Render two fragments for user 42 and one for user 7, each tagged
    // with its owner so a logout can drop everything at once.
    for (key, owner, body) in [
        ("session.42.nav", "user.42", "nav for alice"),
        ("session.42.cart", "user.42", "3 items"),
        ("session.7.nav", "user.7", "nav for bob"),
    ] {
        let mut item = cache.get_item(key).await;
        if !item.is_hit() {
            item.set_value(body.as_bytes().to_vec());
            item.tag(owner).tag("sessions");
            cache.save(item).await;
            println!("rendered and cached {key}");
        }
    }

    // A deferred producer only runs at commit time, after the facade has
    // pinned the tag versions it will be stored under.
    let mut report = cache.get_item("report.weekly").await;
    if !report.is_hit() {
        report.tag("sessions");
        report.set_value_producer(|| {
            std::thread::sleep(Duration::from_millis(30));
            b"42 active sessions this week".to_vec()
        });
        cache.save(report).await;
    }
    let report = cache.get_item("report.weekly").await;
    println!(
        "report: {} (computed in {} ms)",
        String::from_utf8_lossy(report.value().unwrap_or_default()),
        report.metadata().ctime_ms
    );

    // Alice logs out: one call invalidates both of her fragments while
    // Bob's survives untouched.
    cache.invalidate_tags(&["user.42"]).await;
    println!(
        "after logout: alice nav hit = {}, bob nav hit = {}",
        cache.get_item("session.42.nav").await.is_hit(),
        cache.get_item("session.7.nav").await.is_hit()
    );

    // A cold key under concurrent demand: one task computes while the
    // others poll through the retry proxy and pick the value up.
    let writer_pool = pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        let mut writer = match TagAwareCache::with_pool(
            writer_pool,
            CacheConfig {
                namespace: "demo".to_string(),
                ..CacheConfig::default()
            },
        ) {
            Ok(writer) => writer,
            Err(_) => return,
        };
        let mut item = writer.get_item("leaderboard").await;
        item.set_value(b"1. alice 2. bob".to_vec());
        item.tag("sessions");
        writer.save(item).await;
    });

    let mut waiters = Vec::new();
    for n in 0..4 {
        let mut follower = TagAwareCache::with_pool(
            Arc::new(RetryingPool::new(
                pool.clone(),
                RetryConfig {
                    timeout_ms: 250,
                    ..RetryConfig::default()
                },
            )),
            CacheConfig {
                namespace: "demo".to_string(),
                ..CacheConfig::default()
            },
        )?;
        waiters.push(tokio::spawn(async move {
            let item = follower.get_item("leaderboard").await;
            (n, item.is_hit())
        }));
    }
    for waiter in waiters {
        let (n, hit) = waiter.await?;
        println!("waiter {n}: hit = {hit}");
    }

    println!("stats: {:?}", cache.stats());
    Ok(())
}
