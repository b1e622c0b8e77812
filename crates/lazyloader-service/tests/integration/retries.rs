use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lazyloader_service::{LoadError, LoadOptions, LoadPhase};

use crate::{TestError, TestLoader, setup_loader};

#[tokio::test(start_paused = true)]
async fn test_retry_success() {
    let loader = setup_loader(|config| config.retry_attempts = 3);
    let users = TestLoader::new().failing_first(2);
    loader.register_loader("user", users.loader_fn());

    let value = loader.load("u1", "user", LoadOptions::default()).await;
    assert_eq!(value, Ok("u1#3".into()));
    assert_eq!(users.calls(), 3);

    let item = loader.get("u1").unwrap();
    assert_eq!(item.retry_count, 2);
    assert_eq!(item.error, None);
    assert_eq!(item.phase, LoadPhase::Loaded);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion() {
    let loader = setup_loader(|_| {});
    let users = TestLoader::new().failing_always();
    loader.register_loader("user", users.loader_fn());

    let options = LoadOptions::default().with_retry_attempts(4);
    let value = loader.load("u1", "user", options).await;

    let last_error = LoadError::LoaderFailed(TestError(4).to_string());
    assert_eq!(value, Err(last_error.clone()));
    assert_eq!(users.calls(), 4);
    assert_eq!(loader.get_error("u1"), Some(last_error));

    let item = loader.get("u1").unwrap();
    assert_eq!(item.retry_count, 4);
    assert_eq!(item.phase, LoadPhase::Failed);
    assert!(!loader.is_loading("u1"));
    assert!(!loader.is_loaded("u1"));
}

#[tokio::test(start_paused = true)]
async fn test_single_attempt() {
    let loader = setup_loader(|config| config.retry_attempts = 0);
    let users = TestLoader::new().failing_always();
    loader.register_loader("user", users.loader_fn());

    let value = loader.load("u1", "user", LoadOptions::default()).await;
    assert_eq!(value, Err(LoadError::LoaderFailed("attempt 1 failed".into())));
    assert_eq!(users.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_flat_retry_delay() {
    let loader = setup_loader(|config| config.retry_delay = Duration::from_secs(1));

    let started = tokio::time::Instant::now();
    let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
    loader.register_loader("user", {
        let calls = Arc::clone(&calls);
        move |id: String| {
            let elapsed = started.elapsed();
            let mut calls = calls.lock().unwrap();
            calls.push(elapsed);
            let n = calls.len();
            async move {
                if n < 3 {
                    Err(TestError(n))
                } else {
                    Ok(id)
                }
            }
        }
    });

    let value = loader.load("u1", "user", LoadOptions::default()).await;
    assert_eq!(value, Ok("u1".into()));

    // every retry waits the same delay, there is no backoff
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 3);
    for gap in calls.windows(2).map(|pair| pair[1] - pair[0]) {
        assert!(gap >= Duration::from_secs(1), "{gap:?}");
        assert!(gap < Duration::from_millis(1100), "{gap:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_waiters_see_final_outcome() {
    let loader = setup_loader(|_| {});
    let users = TestLoader::new()
        .failing_first(2)
        .with_latency(Duration::from_millis(50));
    loader.register_loader("user", users.loader_fn());

    let first = tokio::spawn({
        let loader = loader.clone();
        async move { loader.load("u1", "user", LoadOptions::default()).await }
    });

    // attach while the first attempt is waiting for its retry
    tokio::time::sleep(Duration::from_millis(55)).await;
    let item = loader.get("u1").unwrap();
    assert_eq!(item.phase, LoadPhase::RetryPending);
    assert_eq!(item.error, Some(LoadError::LoaderFailed("attempt 1 failed".into())));
    assert!(loader.is_loading("u1"));

    let second = loader.load("u1", "user", LoadOptions::default()).await;
    assert_eq!(second, Ok("u1#3".into()));
    assert_eq!(first.await.unwrap(), second);
    assert_eq!(users.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_error_cleared_on_dispatch() {
    let loader = setup_loader(|config| config.retry_delay = Duration::from_millis(100));
    let users = TestLoader::new()
        .failing_first(1)
        .with_latency(Duration::from_millis(50));
    loader.register_loader("user", users.loader_fn());

    let pending = tokio::spawn({
        let loader = loader.clone();
        async move { loader.load("u1", "user", LoadOptions::default()).await }
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(loader.get_error("u1").is_some());

    // the second attempt was dispatched at 150ms and is still running
    tokio::time::sleep(Duration::from_millis(100)).await;
    let item = loader.get("u1").unwrap();
    assert_eq!(item.phase, LoadPhase::Dispatched);
    assert_eq!(item.error, None);
    assert_eq!(item.retry_count, 1);

    assert_eq!(pending.await.unwrap(), Ok("u1#2".into()));
}

#[tokio::test(start_paused = true)]
async fn test_timeout() {
    let loader = setup_loader(|config| {
        config.timeout = Duration::from_millis(100);
        config.retry_attempts = 2;
    });
    let users = TestLoader::new().hanging();
    loader.register_loader("user", users.loader_fn());

    let started = tokio::time::Instant::now();
    let value = loader.load("u1", "user", LoadOptions::default()).await;
    let elapsed = started.elapsed();

    assert_eq!(value, Err(LoadError::Timeout(Duration::from_millis(100))));
    assert_eq!(users.calls(), 2);
    // nothing is left running after the timeouts
    assert_eq!(users.in_flight(), 0);
    assert_eq!(loader.get("u1").unwrap().retry_count, 2);
    // two timeouts and a single retry delay
    assert!(elapsed >= Duration::from_millis(210), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_timeout_consumes_attempt() {
    let loader = setup_loader(|config| config.retry_attempts = 3);

    let calls = Arc::new(AtomicUsize::new(0));
    loader.register_loader("user", {
        let calls = Arc::clone(&calls);
        move |id: String| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    std::future::pending::<()>().await;
                }
                Ok::<_, TestError>(id)
            }
        }
    });

    let options = LoadOptions::default().with_timeout(Duration::from_millis(100));
    let value = loader.load("u1", "user", options).await;
    assert_eq!(value, Ok("u1".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(loader.get("u1").unwrap().retry_count, 1);
}
