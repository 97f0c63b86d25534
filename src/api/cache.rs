//! TTL cache with single-flight fetches.
//!
//! Control-plane lookups are repeated for every mount of the same
//! volume; the cache collapses concurrent fetches for one key into a
//! single request and serves the rest from the stored value until the
//! TTL lapses. The cache is owned by the [`super::ApiClient`] that
//! uses it, nothing here is process-global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ApiError;

struct Entry {
    value: serde_json::Value,
    deadline: Instant,
}

#[derive(Default)]
pub struct ApiCache {
    values: Mutex<HashMap<String, Entry>>,
    // One async mutex per key; holding it makes the fetch exclusive.
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ApiCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `key`, or run `fetch` to fill it.
    /// Concurrent callers for the same key wait for the first fetch
    /// instead of issuing their own.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<T, ApiError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        if let Some(value) = self.lookup(key)? {
            return Ok(value);
        }

        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;
            // Another caller may have fetched while we queued for the
            // lock.
            match self.lookup(key) {
                Ok(Some(value)) => Ok(value),
                Ok(None) => match fetch().await {
                    Ok(value) => self.store(key, &value, ttl).map(|()| value),
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            }
        };
        self.forget_key_lock(key, lock);
        result
    }

    fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ApiError> {
        let mut values = self.values.lock().unwrap();
        match values.get(key) {
            Some(entry) if entry.deadline > Instant::now() => {
                let value = serde_json::from_value(entry.value.clone())?;
                Ok(Some(value))
            }
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn store<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), ApiError> {
        let entry = Entry {
            value: serde_json::to_value(value)?,
            deadline: Instant::now() + ttl,
        };
        self.values.lock().unwrap().insert(key.to_string(), entry);
        Ok(())
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight.entry(key.to_string()).or_default().clone()
    }

    /// Drop the registry entry once the last flight for the key is
    /// done, so the map does not grow with every key ever fetched.
    fn forget_key_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(entry) = in_flight.get(key) {
            if Arc::strong_count(entry) == 1 {
                in_flight.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn serves_cached_value_within_ttl() {
        let cache = ApiCache::new();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let value: u64 = cache
                .get_or_fetch("k", Duration::from_secs(60), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refetches_after_expiry() {
        let cache = ApiCache::new();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..2 {
            let _: u64 = cache
                .get_or_fetch("k", Duration::ZERO, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = ApiCache::new();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let first: Result<u64, _> = cache
            .get_or_fetch("k", Duration::from_secs(60), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::Status { status: 500 })
            })
            .await;
        assert!(first.is_err());

        let second: u64 = cache
            .get_or_fetch("k", Duration::from_secs(60), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(second, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_fetches_collapse_into_one() {
        let cache = Arc::new(ApiCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k", Duration::from_secs(60), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(99u64)
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), 99);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn key_locks_are_forgotten_after_the_flight() {
        let cache = ApiCache::new();
        let _: u64 = cache
            .get_or_fetch("k", Duration::from_secs(60), || async { Ok(1) })
            .await
            .unwrap();
        assert!(cache.in_flight.lock().unwrap().is_empty());

        // Failed flights release their lock too.
        let failed: Result<u64, _> = cache
            .get_or_fetch("other", Duration::from_secs(60), || async {
                Err(ApiError::Status { status: 500 })
            })
            .await;
        assert!(failed.is_err());
        assert!(cache.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let cache = ApiCache::new();
        let a: u64 = cache
            .get_or_fetch("a", Duration::from_secs(60), || async { Ok(1) })
            .await
            .unwrap();
        let b: u64 = cache
            .get_or_fetch("b", Duration::from_secs(60), || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!((a, b), (1, 2));
    }
}
