//! The pending queue: block indices that still need to be pulled.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Concurrent multiset of block indices not yet durably written.
///
/// Backed by a bounded channel whose receiver is shared by every
/// collector worker. Capacity equals the block count, so `put` never
/// waits: pending plus in-flight indices can never exceed the plan.
#[derive(Clone)]
pub struct PendingQueue {
    tx: mpsc::Sender<u64>,
    rx: Arc<Mutex<mpsc::Receiver<u64>>>,
}

impl PendingQueue {
    pub fn new(block_count: u64) -> Self {
        let capacity = usize::try_from(block_count).unwrap_or(usize::MAX).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        PendingQueue {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Adds an index: the initial fill, or a failed in-flight block
    /// coming back for another worker to claim.
    pub async fn put(&self, index: u64) {
        // Send only fails once every handle is gone, and we hold one.
        let _ = self.tx.send(index).await;
    }

    /// Takes the next index, waiting until one is available.
    ///
    /// Cancel-safe: dropping the future mid-wait never loses an index,
    /// so workers race this against the shutdown signal. `None` is only
    /// possible once every other handle has been dropped; callers treat
    /// it like a shutdown.
    pub async fn claim(&self) -> Option<u64> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn claims_come_back_out() {
        let queue = PendingQueue::new(4);
        for index in 0..4 {
            queue.put(index).await;
        }
        let mut seen = BTreeSet::new();
        for _ in 0..4 {
            seen.insert(queue.claim().await.unwrap());
        }
        assert_eq!(seen, BTreeSet::from([0, 1, 2, 3]));
    }

    #[tokio::test]
    async fn requeued_index_is_claimable_again() {
        let queue = PendingQueue::new(2);
        queue.put(0).await;
        queue.put(1).await;

        let first = queue.claim().await.unwrap();
        queue.put(first).await;

        let mut seen = vec![queue.claim().await.unwrap(), queue.claim().await.unwrap()];
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    }

    #[tokio::test]
    async fn claim_waits_for_work() {
        let queue = PendingQueue::new(8);
        tokio::select! {
            _ = queue.claim() => panic!("claimed from an empty queue"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        queue.put(7).await;
        assert_eq!(queue.claim().await, Some(7));
    }

    #[tokio::test]
    async fn concurrent_claimers_split_the_work() {
        let queue = PendingQueue::new(16);
        for index in 0..16 {
            queue.put(index).await;
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                for _ in 0..4 {
                    mine.push(queue.claim().await.unwrap());
                }
                mine
            }));
        }

        let mut all = BTreeSet::new();
        for task in tasks {
            for index in task.await.unwrap() {
                assert!(all.insert(index), "index claimed twice");
            }
        }
        assert_eq!(all.len(), 16);
    }
}
