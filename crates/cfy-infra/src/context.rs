use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::{Error, ProviderName, Result};

type Slot = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

/// Key/value cache shared by every driver instance of one provider.
///
/// Used to memoize expensive per-provider state such as an authenticated API
/// client. Each key owns its own cell: the map lock is only held long enough
/// to find or insert the cell, never across a factory call, so a slow factory
/// for one key does not hold up callers of another.
#[derive(Default)]
pub struct DriverClassContext {
    slots: Mutex<HashMap<String, Slot>>,
}

impl DriverClassContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Return the value stored under `key`, creating it with `factory` if absent.
    ///
    /// Concurrent callers for the same key wait for a single factory
    /// invocation and all observe the same `Arc`. A failed factory leaves the
    /// key empty, so the next caller tries again.
    pub async fn get_or_create<T, F, Fut>(&self, key: &str, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let slot = self.slot(key);
        let value = slot
            .get_or_try_init(|| async {
                let created = factory().await?;
                tracing::debug!(key, "driver context entry created");
                Ok::<_, Error>(Arc::new(created) as Arc<dyn Any + Send + Sync>)
            })
            .await?;

        value
            .clone()
            .downcast::<T>()
            .map_err(|_| Error::ContextType(key.to_string()))
    }

    /// Look up an already created value without creating it.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(key)
            .and_then(|slot| slot.get())
            .and_then(|value| value.clone().downcast::<T>().ok())
    }

    /// Number of keys holding a created value.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One [`DriverClassContext`] per provider, handed to drivers at construction.
#[derive(Default, Clone)]
pub struct DriverContexts {
    contexts: Arc<Mutex<HashMap<ProviderName, Arc<DriverClassContext>>>>,
}

impl DriverContexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// The context shared by all drivers of `provider`, seeded on first use.
    pub fn for_provider(&self, provider: ProviderName) -> Arc<DriverClassContext> {
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        contexts.entry(provider).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_construction() {
        let ctx = Arc::new(DriverClassContext::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let ctx = ctx.clone();
            let calls = calls.clone();
            tasks.spawn(async move {
                ctx.get_or_create("session", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(String::from("token-123"))
                })
                .await
                .unwrap()
            });
        }

        let mut values = Vec::new();
        while let Some(res) = tasks.join_next().await {
            values.push(res.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(values.len(), 32);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
        assert_eq!(ctx.len(), 1);
    }

    #[tokio::test]
    async fn slow_factory_does_not_block_other_keys() {
        let ctx = Arc::new(DriverClassContext::new());
        let release = Arc::new(tokio::sync::Notify::new());

        let slow = {
            let ctx = ctx.clone();
            let release = release.clone();
            tokio::spawn(async move {
                ctx.get_or_create("slow", || async move {
                    release.notified().await;
                    Ok(1u32)
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let fast = tokio::time::timeout(
            Duration::from_secs(5),
            ctx.get_or_create("fast", || async { Ok(2u32) }),
        )
        .await
        .expect("unrelated key must not wait")
        .unwrap();
        assert_eq!(*fast, 2);

        release.notify_one();
        assert_eq!(*slow.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_factory_is_retried() {
        let ctx = DriverClassContext::new();
        let err = ctx
            .get_or_create::<u32, _, _>("k", || async {
                Err(Error::Provisioning("auth rejected".into()))
            })
            .await;
        assert!(err.is_err());
        assert!(ctx.get::<u32>("k").is_none());

        let v = ctx.get_or_create("k", || async { Ok(7u32) }).await.unwrap();
        assert_eq!(*v, 7);
        assert_eq!(*ctx.get::<u32>("k").unwrap(), 7);
    }

    #[tokio::test]
    async fn type_mismatch_is_reported() {
        let ctx = DriverClassContext::new();
        ctx.get_or_create("k", || async { Ok(7u32) }).await.unwrap();
        let err = ctx
            .get_or_create("k", || async { Ok(String::new()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContextType(k) if k == "k"));
    }

    #[test]
    fn contexts_are_shared_per_provider() {
        let contexts = DriverContexts::new();
        let a = contexts.for_provider(ProviderName::Hetzner);
        let b = contexts.for_provider(ProviderName::Hetzner);
        let c = contexts.for_provider(ProviderName::Fly);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
