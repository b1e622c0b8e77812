use std::time::Duration;

use futures::future::join_all;
use lazyloader_service::config::LoaderConfig;
use lazyloader_service::{LazyLoader, LoadError, LoadOptions, LoadPhase};
use lazyloader_test as test;

use crate::{TestLoader, setup_loader};

#[derive(Debug, Clone, PartialEq, Eq)]
struct User {
    id: String,
    name: String,
}

#[tokio::test]
async fn test_load_user() {
    test::setup();
    let loader = LazyLoader::new("users", LoaderConfig::default());
    loader.register_loader("user", |id: String| async move {
        Ok::<_, anyhow::Error>(User {
            id,
            name: "x".into(),
        })
    });

    let user = loader.load("u1", "user", LoadOptions::default()).await;
    assert_eq!(
        user,
        Ok(User {
            id: "u1".into(),
            name: "x".into(),
        })
    );

    assert!(loader.is_loaded("u1"));
    assert!(!loader.is_loading("u1"));
    assert_eq!(loader.get_error("u1"), None);

    let stats = loader.stats();
    assert_eq!(stats.total_items, 1);
    assert_eq!(stats.loaded_items, 1);
    assert_eq!(stats.loading_items, 0);
    assert_eq!(stats.cache_size, 1);

    let item = loader.get("u1").unwrap();
    assert_eq!(item.phase, LoadPhase::Loaded);
    assert_eq!(item.retry_count, 0);
    assert!(item.loaded_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_deduplication() {
    let loader = setup_loader(|_| {});
    let users = TestLoader::new().with_latency(Duration::from_millis(100));
    loader.register_loader("user", users.loader_fn());

    let loads = (0..5).map(|_| loader.load("u1", "user", LoadOptions::default()));
    let values = join_all(loads).await;

    assert_eq!(users.calls(), 1);
    for value in values {
        assert_eq!(value, Ok("u1#1".into()));
    }
    assert_eq!(loader.stats().total_items, 1);
}

#[tokio::test]
async fn test_cache_hit() {
    let loader = setup_loader(|_| {});
    let users = TestLoader::new();
    loader.register_loader("user", users.loader_fn());

    let first = loader.load("u1", "user", LoadOptions::default()).await;
    let second = loader.load("u1", "user", LoadOptions::default()).await;

    assert_eq!(first, Ok("u1#1".into()));
    assert_eq!(second, first);
    assert_eq!(users.calls(), 1);
    assert_eq!(loader.cache_stats().keys, ["user:u1"]);
}

#[tokio::test]
async fn test_custom_cache_key() {
    let loader = setup_loader(|_| {});
    let users = TestLoader::new();
    loader.register_loader("user", users.loader_fn());

    let options = LoadOptions::default().with_cache_key("current-user");
    let first = loader.load("u1", "user", options.clone()).await;
    assert_eq!(first, Ok("u1#1".into()));
    assert_eq!(loader.cache_stats().keys, ["current-user"]);

    // a different id cached under the same key is served from the cache
    let second = loader.load("u2", "user", options).await;
    assert_eq!(second, first);
    assert_eq!(users.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit() {
    let loader = setup_loader(|config| config.max_concurrent = 3);
    let users = TestLoader::new().with_latency(Duration::from_millis(50));
    loader.register_loader("user", users.loader_fn());

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let loader = loader.clone();
            tokio::spawn(async move {
                loader
                    .load(&format!("u{i}"), "user", LoadOptions::default())
                    .await
            })
        })
        .collect();

    // sample the stats while the loads are running
    let mut samples = 0;
    while loader.stats().total_items < 10 || loader.stats().loading_items > 0 {
        let stats = loader.stats();
        assert!(stats.active_loaders <= 3, "{stats:?}");
        assert!(users.in_flight() <= 3);
        samples += 1;
        tokio::time::sleep(Duration::from_millis(7)).await;
    }
    assert!(samples > 10);

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(users.calls(), 10);
    assert_eq!(users.max_in_flight(), 3);
    assert_eq!(loader.stats().active_loaders, 0);
}

#[tokio::test(start_paused = true)]
async fn test_queue_stats() {
    let loader = setup_loader(|config| config.max_concurrent = 2);
    let users = TestLoader::new().with_latency(Duration::from_millis(50));
    loader.register_loader("user", users.loader_fn());

    let handles: Vec<_> = ["u1", "u2", "u3", "u4"]
        .into_iter()
        .map(|id| {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(id, "user", LoadOptions::default()).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = loader.stats();
    assert_eq!(stats.total_items, 4);
    assert_eq!(stats.loading_items, 4);
    assert_eq!(stats.active_loaders, 2);
    assert_eq!(stats.queued_items, 2);
    assert_eq!(stats.loaded_items, 0);

    join_all(handles).await;
    let stats = loader.stats();
    assert_eq!(stats.loaded_items, 4);
    assert_eq!(stats.loading_items, 0);
    assert_eq!(stats.queued_items, 0);
    assert_eq!(stats.cache_size, 4);
}

#[tokio::test(start_paused = true)]
async fn test_priority_order() {
    let loader = setup_loader(|config| config.max_concurrent = 1);
    let users = TestLoader::new().with_latency(Duration::from_millis(10));
    loader.register_loader("user", users.loader_fn());

    let with_priority = |priority| LoadOptions::default().with_priority(priority);

    // the blocker takes the only slot, everything else is queued in this order
    let (blocker, low, mid, high, low2) = futures::join!(
        loader.load("blocker", "user", with_priority(0)),
        loader.load("low", "user", with_priority(1)),
        loader.load("mid", "user", with_priority(5)),
        loader.load("high", "user", with_priority(10)),
        loader.load("low2", "user", with_priority(1)),
    );

    for value in [blocker, low, mid, high, low2] {
        assert!(value.is_ok());
    }
    assert_eq!(
        users.call_order(),
        ["blocker", "high", "mid", "low", "low2"]
    );
}

#[tokio::test]
async fn test_no_loader() {
    let loader = setup_loader(|_| {});

    let value = loader.load("u1", "user", LoadOptions::default()).await;
    assert_eq!(value, Err(LoadError::NoLoaderRegistered("user".into())));
    assert_eq!(
        value.unwrap_err().to_string(),
        "no loader registered for type `user`"
    );

    assert!(!loader.is_loaded("u1"));
    assert_eq!(
        loader.get_error("u1"),
        Some(LoadError::NoLoaderRegistered("user".into()))
    );
    assert_eq!(loader.stats().error_items, 1);
}

#[tokio::test]
async fn test_replace_loader() {
    let loader = setup_loader(|_| {});
    let first = TestLoader::new();
    let second = TestLoader::new();

    loader.register_loader("user", first.loader_fn());
    assert_eq!(
        loader.load("u1", "user", LoadOptions::default()).await,
        Ok("u1#1".into())
    );

    loader.register_loader("user", second.loader_fn());
    assert_eq!(
        loader.load("u2", "user", LoadOptions::default()).await,
        Ok("u2#1".into())
    );

    assert_eq!(first.call_order(), ["u1"]);
    assert_eq!(second.call_order(), ["u2"]);
}

#[tokio::test(start_paused = true)]
async fn test_clear_while_loading() {
    let loader = setup_loader(|_| {});
    let users = TestLoader::new().with_latency(Duration::from_millis(100));
    loader.register_loader("user", users.loader_fn());

    let pending = tokio::spawn({
        let loader = loader.clone();
        async move { loader.load("u1", "user", LoadOptions::default()).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(loader.is_loading("u1"));

    assert!(loader.clear("u1"));
    assert!(!loader.clear("u1"));
    assert_eq!(
        pending.await.unwrap(),
        Err(LoadError::ItemNotFound("u1".into()))
    );
    assert!(loader.get("u1").is_none());

    // loading again starts over, and nothing of the first episode leaks into it
    let value = loader.load("u1", "user", LoadOptions::default()).await;
    assert_eq!(value, Ok("u1#2".into()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(loader.get("u1").unwrap().data.as_deref(), Some("u1#2"));
    assert_eq!(users.calls(), 2);
}

#[tokio::test]
async fn test_clear_loaded_item() {
    let loader = setup_loader(|_| {});
    let users = TestLoader::new();
    loader.register_loader("user", users.loader_fn());

    loader.load("u1", "user", LoadOptions::default()).await.unwrap();
    assert!(loader.clear("u1"));
    assert_eq!(loader.stats().cache_size, 0);

    let value = loader.load("u1", "user", LoadOptions::default()).await;
    assert_eq!(value, Ok("u1#2".into()));
}

#[tokio::test(start_paused = true)]
async fn test_clear_all() {
    let loader = setup_loader(|config| config.max_concurrent = 1);
    let users = TestLoader::new().with_latency(Duration::from_millis(100));
    loader.register_loader("user", users.loader_fn());

    loader.load("u1", "user", LoadOptions::default()).await.unwrap();
    let pending: Vec<_> = ["u2", "u3"]
        .into_iter()
        .map(|id| {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(id, "user", LoadOptions::default()).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(loader.stats().total_items, 3);

    loader.clear_all();
    for (handle, id) in pending.into_iter().zip(["u2", "u3"]) {
        assert_eq!(
            handle.await.unwrap(),
            Err(LoadError::ItemNotFound(id.into()))
        );
    }

    let stats = loader.stats();
    assert_eq!(stats.total_items, 0);
    assert_eq!(stats.cache_size, 0);
    assert!(loader.cache_stats().keys.is_empty());

    let value = loader.load("u1", "user", LoadOptions::default()).await;
    assert_eq!(value, Ok("u1#3".into()));
}
