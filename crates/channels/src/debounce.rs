//! Coalesce rapid consecutive inbound messages into one turn.
//!
//! Items are grouped by a caller-supplied key. Each new item restarts the
//! key's window; when the window elapses the buffered items are flushed
//! together. Flushes for the same key run one at a time.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {futures::future::BoxFuture, tracing::debug};

/// Default coalescing window.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(1500);

type KeyFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type PredicateFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
pub type FlushFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Bucket<T> {
    items: Vec<T>,
    generation: u64,
}

struct Inner<T> {
    window: Duration,
    key_fn: KeyFn<T>,
    should_debounce: PredicateFn<T>,
    on_flush: FlushFn<T>,
    buckets: Mutex<HashMap<String, Bucket<T>>>,
    flush_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    closed: AtomicBool,
}

pub struct InboundDebouncer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for InboundDebouncer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> InboundDebouncer<T> {
    pub fn new(
        window: Duration,
        key_fn: impl Fn(&T) -> String + Send + Sync + 'static,
        should_debounce: impl Fn(&T) -> bool + Send + Sync + 'static,
        on_flush: FlushFn<T>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                window,
                key_fn: Box::new(key_fn),
                should_debounce: Box::new(should_debounce),
                on_flush,
                buckets: Mutex::new(HashMap::new()),
                flush_locks: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Queue an item. Must be called from within a Tokio runtime.
    ///
    /// Items the predicate rejects (or any item when the window is zero) are
    /// flushed right away, after whatever was already buffered for their key.
    pub fn enqueue(&self, item: T) {
        if self.inner.closed.load(Ordering::Acquire) {
            debug!("debouncer closed, dropping item");
            return;
        }
        let key = (self.inner.key_fn)(&item);

        if self.inner.window.is_zero() || !(self.inner.should_debounce)(&item) {
            let pending = self.take_bucket(&key);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Some(items) = pending {
                    flush(&inner, &key, items).await;
                }
                flush(&inner, &key, vec![item]).await;
            });
            return;
        }

        let generation = {
            let mut buckets = self
                .inner
                .buckets
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
                items: Vec::new(),
                generation: 0,
            });
            bucket.items.push(item);
            bucket.generation += 1;
            bucket.generation
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            let items = {
                let mut buckets = inner.buckets.lock().unwrap_or_else(|e| e.into_inner());
                match buckets.get(&key) {
                    Some(bucket) if bucket.generation == generation => {
                        buckets.remove(&key).map(|b| b.items)
                    },
                    _ => None,
                }
            };
            if let Some(items) = items {
                flush(&inner, &key, items).await;
            }
        });
    }

    /// Number of keys with buffered items.
    pub fn pending_keys(&self) -> usize {
        self.inner
            .buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Drop everything buffered and refuse further items.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner
            .buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn take_bucket(&self, key: &str) -> Option<Vec<T>> {
        self.inner
            .buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .map(|b| b.items)
            .filter(|items| !items.is_empty())
    }
}

async fn flush<T>(inner: &Arc<Inner<T>>, key: &str, items: Vec<T>) {
    if inner.closed.load(Ordering::Acquire) {
        return;
    }
    let lock = {
        let mut locks = inner.flush_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    };
    {
        let _guard = lock.lock().await;
        (inner.on_flush)(items).await;
    }
    let mut locks = inner.flush_locks.lock().unwrap_or_else(|e| e.into_inner());
    // Only the map and this task hold it: nobody else is waiting on the key.
    if Arc::strong_count(&lock) == 2 {
        locks.remove(key);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    type Flushed = Arc<Mutex<Vec<Vec<String>>>>;

    fn debouncer(window: Duration) -> (InboundDebouncer<String>, Flushed) {
        let flushed: Flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        let on_flush: FlushFn<String> = Arc::new(move |items| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(items);
            })
        });
        let d = InboundDebouncer::new(
            window,
            |s: &String| s.split(':').next().unwrap_or_default().to_string(),
            |s: &String| !s.ends_with('!'),
            on_flush,
        );
        (d, flushed)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_flushed_once() {
        let (d, flushed) = debouncer(Duration::from_millis(100));
        d.enqueue("a:1".into());
        d.enqueue("a:2".into());
        d.enqueue("a:3".into());
        assert_eq!(d.pending_keys(), 1);
        tokio::time::sleep(Duration::from_millis(250)).await;
        let got = flushed.lock().unwrap().clone();
        assert_eq!(got, vec![vec!["a:1", "a:2", "a:3"]]);
        assert_eq!(d.pending_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let (d, flushed) = debouncer(Duration::from_millis(100));
        d.enqueue("a:1".into());
        d.enqueue("b:1".into());
        tokio::time::sleep(Duration::from_millis(250)).await;
        let mut got = flushed.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec![vec!["a:1"], vec!["b:1"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn undebounced_item_flushes_pending_first() {
        let (d, flushed) = debouncer(Duration::from_millis(100));
        d.enqueue("a:1".into());
        d.enqueue("a:now!".into());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let got = flushed.lock().unwrap().clone();
        assert_eq!(got, vec![vec!["a:1"], vec!["a:now!"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_debouncer_drops_items() {
        let (d, flushed) = debouncer(Duration::from_millis(100));
        d.enqueue("a:1".into());
        d.close();
        d.enqueue("a:2".into());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(flushed.lock().unwrap().is_empty());
    }
}
