//! Request Coalescer (component G).
//!
//! A process-local map from `transformKey` to a shared result handle,
//! generalized from the reference gateway's broadcast-channel-based
//! `DeliveryRelay` (`cache/delivery_relay.rs`) -- the same
//! register/try-join/complete shape, adapted from coalescing raw blob
//! bytes to coalescing a cloneable transform outcome.

use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::ProxyError;
use crate::options::TransformOptions;

struct InFlight<T> {
    sender: broadcast::Sender<Result<T, String>>,
    started_at: Instant,
}

pub struct RequestCoalescer<T: Clone + Send + Sync + 'static> {
    max_inflight: usize,
    in_flight: RwLock<HashMap<String, InFlight<T>>>,
}

impl<T: Clone + Send + Sync + 'static> RequestCoalescer<T> {
    pub fn new(max_inflight: usize) -> Self {
        Self { max_inflight, in_flight: RwLock::new(HashMap::new()) }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// Runs `producer` if no equivalent transform is already underway for
    /// `key`, otherwise joins the in-flight one and returns a clone of
    /// its eventual result. At most one `producer` invocation is ever
    /// outstanding per key; the map entry is removed unconditionally
    /// once the producer settles, whether it succeeded or failed.
    pub async fn run_or_join<F, Fut>(&self, key: &str, producer: F) -> Result<T, ProxyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        if let Some(rx) = self.try_join(key).await {
            return Self::await_join(rx).await;
        }

        let Some(sender) = self.register(key).await else {
            // Lost the race to another registrant, or at capacity.
            if let Some(rx) = self.try_join(key).await {
                return Self::await_join(rx).await;
            }
            debug!(key, "coalescer at capacity, running uncoalesced");
            return producer().await;
        };

        let result = producer().await;
        self.complete(key, result.as_ref().map(T::clone).map_err(ToString::to_string)).await;
        result
    }

    async fn try_join(&self, key: &str) -> Option<broadcast::Receiver<Result<T, String>>> {
        let in_flight = self.in_flight.read().await;
        in_flight.get(key).map(|entry| entry.sender.subscribe())
    }

    async fn register(&self, key: &str) -> Option<broadcast::Sender<Result<T, String>>> {
        let mut in_flight = self.in_flight.write().await;
        if in_flight.contains_key(key) {
            return None;
        }
        if in_flight.len() >= self.max_inflight {
            return None;
        }
        let (sender, _) = broadcast::channel(1);
        in_flight.insert(key.to_string(), InFlight { sender: sender.clone(), started_at: Instant::now() });
        Some(sender)
    }

    async fn complete(&self, key: &str, result: Result<T, String>) {
        let mut in_flight = self.in_flight.write().await;
        if let Some(entry) = in_flight.remove(key) {
            debug!(
                key,
                waiting = entry.sender.receiver_count(),
                duration_ms = entry.started_at.elapsed().as_millis(),
                ok = result.is_ok(),
                "coalesced transform completed"
            );
            let _ = entry.sender.send(result);
        }
    }

    async fn await_join(mut rx: broadcast::Receiver<Result<T, String>>) -> Result<T, ProxyError> {
        match rx.recv().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(ProxyError::UpstreamTransformError { reason }),
            Err(_) => Err(ProxyError::UpstreamTransformError {
                reason: "coalesced producer dropped without a result".to_string(),
            }),
        }
    }
}

/// `transformKey = {originName}:{resolvedPath}:{canonical subset of
/// options}`, the canonical subset being `{width, height, derivative,
/// quality, compression, format, mode}`.
pub fn transform_key(origin_name: &str, resolved_path: &str, options: &TransformOptions) -> String {
    format!(
        "{}:{}:w={:?}:h={:?}:d={:?}:q={:?}:c={:?}:f={:?}:m={:?}",
        origin_name,
        resolved_path,
        options.width,
        options.height,
        options.derivative,
        options.quality,
        options.compression,
        options.format,
        options.mode,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_joiners_invoke_producer_once() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new(100));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coalescer
                    .run_or_join("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(42u32)
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_observed_by_all_joiners() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new(100));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let coalescer = Arc::clone(&coalescer);
            handles.push(tokio::spawn(async move {
                coalescer
                    .run_or_join("k", || async move {
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Err(ProxyError::UpstreamTransformError { reason: "boom".to_string() })
                    })
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn entry_is_removed_after_completion() {
        let coalescer = RequestCoalescer::<u32>::new(100);
        coalescer.run_or_join("k", || async { Ok(1u32) }).await.unwrap();
        assert_eq!(coalescer.in_flight_count().await, 0);
    }
}
