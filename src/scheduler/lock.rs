use std::sync::Mutex;

use uuid::Uuid;

/// Exclusive lock over the archive node. A single holder slot keyed by job
/// id: the three node-driving kinds are serialized by construction, not by
/// convention. Non-reentrant — a holder attempting to re-acquire is
/// refused like anyone else.
#[derive(Debug, Default)]
pub struct NodeLock {
    holder: Mutex<Option<Uuid>>,
}

impl NodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `job_id`. Returns false when any job (including
    /// `job_id` itself) already holds it.
    pub fn try_acquire(&self, job_id: Uuid) -> bool {
        let mut holder = self.holder.lock().expect("node lock poisoned");
        match *holder {
            Some(_) => false,
            None => {
                *holder = Some(job_id);
                true
            }
        }
    }

    /// Releases the lock if `job_id` holds it. Releasing a lock held by
    /// another job is a no-op: stale completions must not free a lock a
    /// newer job owns.
    pub fn release(&self, job_id: Uuid) -> bool {
        let mut holder = self.holder.lock().expect("node lock poisoned");
        if *holder == Some(job_id) {
            *holder = None;
            true
        } else {
            false
        }
    }

    pub fn holder(&self) -> Option<Uuid> {
        *self.holder.lock().expect("node lock poisoned")
    }

    pub fn is_free(&self) -> bool {
        self.holder().is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn exclusive_single_holder() {
        let lock = NodeLock::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(lock.try_acquire(a));
        assert!(!lock.try_acquire(b));
        assert_eq!(lock.holder(), Some(a));

        assert!(lock.release(a));
        assert!(lock.try_acquire(b));
    }

    #[test]
    fn non_reentrant() {
        let lock = NodeLock::new();
        let a = Uuid::new_v4();
        assert!(lock.try_acquire(a));
        assert!(!lock.try_acquire(a));
    }

    #[test]
    fn release_by_non_holder_is_refused() {
        let lock = NodeLock::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(lock.try_acquire(a));
        assert!(!lock.release(b));
        assert_eq!(lock.holder(), Some(a));
    }

    #[test]
    fn interleaved_acquisitions_grant_exactly_one() {
        let lock = Arc::new(NodeLock::new());
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || lock.try_acquire(Uuid::new_v4()))
            })
            .collect();

        let granted = handles.into_iter().map(|h| h.join().unwrap()).filter(|&g| g).count();
        assert_eq!(granted, 1);
        assert!(lock.holder().is_some());
    }
}
