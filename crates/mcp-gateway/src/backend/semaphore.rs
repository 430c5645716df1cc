//! Per-backend in-flight request cap with a fair FIFO wait queue.
//!
//! `release` transfers the slot directly to the queue head instead of
//! decrementing and letting waiters race for it, so completion order matches
//! arrival order. On disconnect the queue is drained by failing every waiter
//! and the active count resets to zero.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{GatewayError, GatewayResult};

#[derive(Default)]
struct SemState {
    active: usize,
    queue: VecDeque<oneshot::Sender<GatewayResult<()>>>,
}

/// FIFO bounded-concurrency gate.
pub struct InflightSemaphore {
    max: usize,
    state: Mutex<SemState>,
}

impl InflightSemaphore {
    /// Create a semaphore admitting up to `max` concurrent holders.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self { max: max.max(1), state: Mutex::new(SemState::default()) }
    }

    /// Acquire a slot, waiting in FIFO order when the cap is reached.
    ///
    /// Fails with a disconnect error if the semaphore is drained while
    /// waiting.
    pub async fn acquire(&self) -> GatewayResult<()> {
        let rx = {
            let mut state = self.state.lock().expect("semaphore lock poisoned");
            if state.active < self.max {
                state.active += 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            rx
        };

        match rx.await {
            Ok(result) => result,
            // Sender dropped without signalling: treat as drained.
            Err(_) => Err(GatewayError::Disconnected),
        }
    }

    /// Release a slot. When waiters are queued the slot transfers to the
    /// head directly and the active count is unchanged.
    pub fn release(&self) {
        let mut state = self.state.lock().expect("semaphore lock poisoned");
        // Skip waiters whose receiver is already gone (caller timed out).
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.send(Ok(())).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    /// Fail every queued waiter with a disconnect error and reset the
    /// active count to zero.
    pub fn drain_disconnected(&self) {
        let mut state = self.state.lock().expect("semaphore lock poisoned");
        state.active = 0;
        for waiter in state.queue.drain(..) {
            let _ = waiter.send(Err(GatewayError::Disconnected));
        }
    }

    /// Number of currently held slots.
    #[must_use]
    pub fn active(&self) -> usize {
        self.state.lock().expect("semaphore lock poisoned").active
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().expect("semaphore lock poisoned").queue.len()
    }
}

impl std::fmt::Debug for InflightSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightSemaphore")
            .field("max", &self.max)
            .field("active", &self.active())
            .field("waiting", &self.waiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_acquire_under_cap_is_immediate() {
        let sem = InflightSemaphore::new(2);
        sem.acquire().await.unwrap();
        sem.acquire().await.unwrap();
        assert_eq!(sem.active(), 2);
        assert_eq!(sem.waiting(), 0);
    }

    #[tokio::test]
    async fn test_active_never_exceeds_max() {
        let sem = Arc::new(InflightSemaphore::new(3));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let sem = Arc::clone(&sem);
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                sem.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                sem.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(sem.active(), 0);
    }

    #[tokio::test]
    async fn test_fifo_wakeup_order() {
        let sem = Arc::new(InflightSemaphore::new(1));
        sem.acquire().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let sem = Arc::clone(&sem);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                sem.acquire().await.unwrap();
                order.lock().unwrap().push(i);
                sem.release();
            }));
            // Let each task reach the queue before spawning the next.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(sem.waiting(), 5);
        sem.release();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_slot_transfer_keeps_active_count() {
        let sem = Arc::new(InflightSemaphore::new(1));
        sem.acquire().await.unwrap();

        let sem2 = Arc::clone(&sem);
        let waiter = tokio::spawn(async move { sem2.acquire().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(sem.waiting(), 1);

        // Release hands the slot over; active stays at 1 throughout.
        sem.release();
        waiter.await.unwrap().unwrap();
        assert_eq!(sem.active(), 1);
        assert_eq!(sem.waiting(), 0);
    }

    #[tokio::test]
    async fn test_drain_fails_waiters() {
        let sem = Arc::new(InflightSemaphore::new(1));
        sem.acquire().await.unwrap();

        let sem2 = Arc::clone(&sem);
        let waiter = tokio::spawn(async move { sem2.acquire().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        sem.drain_disconnected();
        assert!(matches!(waiter.await.unwrap(), Err(GatewayError::Disconnected)));
        assert_eq!(sem.active(), 0);
        assert_eq!(sem.waiting(), 0);
    }

    #[tokio::test]
    async fn test_release_skips_dead_waiters() {
        let sem = Arc::new(InflightSemaphore::new(1));
        sem.acquire().await.unwrap();

        // First waiter gives up before being signalled.
        let sem2 = Arc::clone(&sem);
        let abandoned = tokio::spawn(async move { sem2.acquire().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        abandoned.abort();
        let _ = abandoned.await;

        let sem3 = Arc::clone(&sem);
        let patient = tokio::spawn(async move { sem3.acquire().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        sem.release();
        patient.await.unwrap().unwrap();
        assert_eq!(sem.active(), 1);
    }
}
