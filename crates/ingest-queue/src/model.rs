//! An in-memory reference model of [`crate::queue::ContributionQueue`]'s
//! locking algorithm, used to exercise lock-disjointness and mutex-ownership
//! properties under concurrent workers without a live Postgres instance. It
//! implements the exact same mutex-then-select-then-update protocol, just
//! against a `tokio::sync::Mutex<Vec<Row>>` instead of SQL rows, so the same
//! interleavings a real connection pool would allow are reachable here too.

use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Row {
    id: i64,
    locking_worker: Option<String>,
    succeed: Option<bool>,
}

/// In-memory stand-in for the `contribfile_queue` + `mutex` tables, single
/// database. The `tokio::sync::Mutex` around `rows` stands in for the real
/// mutex *row*: critical sections that would be `acquire_mutex` /
/// `release_mutex` in [`crate::queue::ContributionQueue`] are modeled as
/// holding this lock for the duration of the select-then-update.
pub struct InMemoryQueue {
    rows: Mutex<Vec<Row>>,
    batch_size: AtomicI64,
    mutex_owner_changes: AtomicI64,
}

impl InMemoryQueue {
    pub fn new(row_count: usize) -> Self {
        let rows = (0..row_count as i64)
            .map(|id| Row {
                id,
                locking_worker: None,
                succeed: None,
            })
            .collect();
        Self {
            rows: Mutex::new(rows),
            batch_size: AtomicI64::new(1),
            mutex_owner_changes: AtomicI64::new(0),
        }
    }

    pub fn set_transaction_size(&self, batch_size: i64) {
        self.batch_size.store(batch_size, Ordering::SeqCst);
    }

    pub fn mutex_owner_changes(&self) -> i64 {
        self.mutex_owner_changes.load(Ordering::SeqCst)
    }

    /// Mirrors `ContributionQueue::lock_contribfiles`: select up to
    /// `batch_size` available ids, stamp them with `worker_id`, return the
    /// ids now owned by this worker.
    pub async fn lock_contribfiles(&self, worker_id: &str) -> Vec<i64> {
        let batch_size = self.batch_size.load(Ordering::SeqCst) as usize;
        let mut rows = self.rows.lock().await;
        self.mutex_owner_changes.fetch_add(1, Ordering::SeqCst);

        let ids: Vec<i64> = rows
            .iter()
            .filter(|r| r.locking_worker.is_none())
            .take(batch_size)
            .map(|r| r.id)
            .collect();

        for row in rows.iter_mut() {
            if ids.contains(&row.id) {
                row.locking_worker = Some(worker_id.to_string());
            }
        }
        drop(rows);
        self.mutex_owner_changes.fetch_add(1, Ordering::SeqCst);
        ids
    }

    pub async fn unlock_contribfiles(&self, worker_id: &str, success: bool) {
        let mut rows = self.rows.lock().await;
        for row in rows.iter_mut() {
            if row.locking_worker.as_deref() == Some(worker_id) {
                if success {
                    row.succeed = Some(true);
                } else {
                    row.locking_worker = None;
                }
            }
        }
    }

    pub async fn all_succeed(&self) -> bool {
        let rows = self.rows.lock().await;
        rows.iter().all(|r| r.succeed == Some(true))
    }

    pub async fn locking_worker_of(&self, id: i64) -> Option<String> {
        let rows = self.rows.lock().await;
        rows.iter().find(|r| r.id == id).and_then(|r| r.locking_worker.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn two_workers_lock_disjoint_batches() {
        let queue = InMemoryQueue::new(100);
        queue.set_transaction_size(10);

        let (a, b) = tokio::join!(queue.lock_contribfiles("worker-a"), queue.lock_contribfiles("worker-b"));

        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 10);

        let a_set: HashSet<_> = a.into_iter().collect();
        let b_set: HashSet<_> = b.into_iter().collect();
        assert!(a_set.is_disjoint(&b_set), "workers must not double-lock a row");
        assert_eq!(a_set.len() + b_set.len(), 20);
    }

    #[tokio::test]
    async fn unlock_success_is_reflected_in_all_succeed() {
        let queue = InMemoryQueue::new(5);
        queue.set_transaction_size(5);

        let locked = queue.lock_contribfiles("worker-a").await;
        assert_eq!(locked.len(), 5);
        assert!(!queue.all_succeed().await);

        queue.unlock_contribfiles("worker-a", true).await;
        assert!(queue.all_succeed().await);
    }

    #[tokio::test]
    async fn unlock_failure_releases_rows_for_relocking() {
        let queue = InMemoryQueue::new(3);
        queue.set_transaction_size(3);

        let locked = queue.lock_contribfiles("worker-a").await;
        assert_eq!(locked.len(), 3);

        queue.unlock_contribfiles("worker-a", false).await;
        for id in &locked {
            assert_eq!(queue.locking_worker_of(*id).await, None);
        }

        let relocked = queue.lock_contribfiles("worker-b").await;
        assert_eq!(relocked.len(), 3);
    }

    #[tokio::test]
    async fn no_rows_left_when_exhausted() {
        let queue = InMemoryQueue::new(2);
        queue.set_transaction_size(10);

        let locked = queue.lock_contribfiles("worker-a").await;
        assert_eq!(locked.len(), 2);
        queue.unlock_contribfiles("worker-a", true).await;

        let empty = queue.lock_contribfiles("worker-b").await;
        assert!(empty.is_empty());
        assert!(queue.all_succeed().await);
    }
}
