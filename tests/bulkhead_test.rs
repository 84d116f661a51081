//! Bulkhead Tests
//! Concurrency caps, bounded queueing and FIFO slot hand-off

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use venue_resilience::resilience::{Bulkhead, BulkheadConfig};
use venue_resilience::ExchangeError;

fn bulkhead(max_concurrent: usize, max_queue: Option<usize>) -> Arc<Bulkhead> {
    Arc::new(Bulkhead::new(BulkheadConfig {
        name: "orders".to_string(),
        max_concurrent,
        max_queue,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rejects_past_queue_bound() {
        let bulkhead = bulkhead(2, Some(1));
        let first = bulkhead.acquire().await.unwrap();
        let _second = bulkhead.acquire().await.unwrap();

        let queued = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        let metrics = bulkhead.metrics();
        assert_eq!(metrics.active, 2);
        assert_eq!(metrics.queued, 1);
        assert_eq!(metrics.available_permits, 0);

        let rejected = bulkhead.acquire().await.unwrap_err();
        assert_eq!(rejected.name, "orders");

        drop(first);
        queued.await.unwrap().unwrap();
        assert_eq!(bulkhead.metrics().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_slot_goes_to_oldest_waiter() {
        let bulkhead = bulkhead(1, None);
        let held = bulkhead.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for id in 0..3 {
            let (bulkhead, order) = (bulkhead.clone(), order.clone());
            waiters.push(tokio::spawn(async move {
                let _permit = bulkhead.acquire().await.unwrap();
                order.lock().unwrap().push(id);
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(bulkhead.metrics().queued, 3);

        drop(held);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(bulkhead.metrics().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_frees_queue_slot() {
        let bulkhead = bulkhead(1, Some(1));
        let _held = bulkhead.acquire().await.unwrap();

        assert!(timeout(Duration::from_millis(10), bulkhead.acquire()).await.is_err());
        assert_eq!(bulkhead.metrics().queued, 0);

        // Queue has room again, so this one waits instead of failing.
        assert!(timeout(Duration::from_millis(10), bulkhead.acquire()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_maps_rejection_into_exchange_error() {
        let bulkhead = bulkhead(1, Some(0));
        let _held = bulkhead.acquire().await.unwrap();

        let result: Result<(), ExchangeError> = bulkhead.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(ExchangeError::BulkheadFull(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_releases_slot_after_completion() {
        let bulkhead = bulkhead(1, Some(0));
        for i in 0..3u32 {
            let value: Result<u32, ExchangeError> = bulkhead.execute(|| async move { Ok(i) }).await;
            assert_eq!(value.unwrap(), i);
        }
        assert_eq!(bulkhead.metrics().active, 0);
        assert_eq!(bulkhead.metrics().available_permits, 1);
    }
}
