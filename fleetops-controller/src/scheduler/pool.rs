//! Bounded batch worker pool
//!
//! A batch is pushed into a channel sized to the batch and drained by exactly
//! one task per item, so a job never has more actions in flight than keys in
//! its current batch.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Runs `worker` over every item and waits for all of them
///
/// A panicking worker is logged; the items it did not reach are picked up by
/// the remaining workers.
pub async fn run_batch<T, F, Fut>(items: Vec<T>, worker: F)
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let count = items.len();
    if count == 0 {
        return;
    }

    let (tx, rx) = mpsc::channel(count);
    for item in items {
        if tx.send(item).await.is_err() {
            break;
        }
    }
    drop(tx);

    let rx = Arc::new(Mutex::new(rx));
    let worker = Arc::new(worker);
    let mut handles = Vec::with_capacity(count);

    for _ in 0..count {
        let rx = Arc::clone(&rx);
        let worker = Arc::clone(&worker);
        handles.push(tokio::spawn(async move {
            loop {
                let next = rx.lock().await.recv().await;
                let Some(item) = next else {
                    break;
                };
                worker(item).await;
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Batch worker panicked: {}", e);
        }
    }
}
