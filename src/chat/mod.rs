//! Fair async mutex serializing turns against the parent agent.
//!
//! At most one streaming turn (user-initiated or injected sub-task
//! result) runs at a time. Fairness is strict FIFO with a handoff
//! discipline: `release` passes the lock directly to the head waiter in
//! the same step, so a caller that parked while the lock was held always
//! runs before anyone who arrives after the release. A plain mutex whose
//! unlock lets any waiter race would let a burst of injections starve
//! user turns (or vice versa).

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// The lock. Shared via `Arc`; the guard releases on drop.
pub struct ChatLock {
    state: Mutex<LockState>,
}

impl ChatLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take the lock, parking FIFO behind the current holder.
    pub async fn acquire(&self) -> ChatLockGuard<'_> {
        let rx = {
            let mut state = self.state.lock().expect("chat lock poisoned");
            if !state.locked {
                state.locked = true;
                return ChatLockGuard { lock: self };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        // Wake-up IS the handoff: the releaser left `locked` set for us.
        // An Err here means the releaser dropped mid-handoff, which cannot
        // happen while the process is healthy; owning the lock is still
        // the only sound interpretation.
        let _ = rx.await;
        ChatLockGuard { lock: self }
    }

    /// Take the lock only if free. Used by status reporting, not by turns.
    pub fn try_acquire(&self) -> Option<ChatLockGuard<'_>> {
        let mut state = self.state.lock().expect("chat lock poisoned");
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(ChatLockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().expect("chat lock poisoned").locked
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().expect("chat lock poisoned").waiters.len()
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("chat lock poisoned");
        // Hand off to the first waiter still listening; `locked` stays
        // true across the handoff so late arrivals queue behind it.
        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
            // Waiter's future was dropped before wake-up; skip it.
        }
        state.locked = false;
    }
}

impl Default for ChatLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard; dropping it releases or hands off the lock.
pub struct ChatLockGuard<'a> {
    lock: &'a ChatLock,
}

impl Drop for ChatLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn uncontended_acquire_is_immediate() {
        let lock = ChatLock::new();
        let guard = lock.acquire().await;
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn waiters_run_in_fifo_order() {
        let lock = Arc::new(ChatLock::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let first = lock.acquire().await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let lock = Arc::clone(&lock);
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                tx.send(i).unwrap();
            }));
            // Give each spawned task time to park before the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lock.waiting(), 5);

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        for expected in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn parked_waiter_beats_post_release_acquirer() {
        let lock = Arc::new(ChatLock::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let holder = lock.acquire().await;

        let waiter = {
            let lock = Arc::clone(&lock);
            let tx = tx.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
                tx.send("waiter").unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(holder);
        // The lock was handed to the parked waiter atomically; this
        // acquire queues behind it even though release already happened.
        let late = {
            let lock = Arc::clone(&lock);
            let tx = tx.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
                tx.send("late").unwrap();
            })
        };

        waiter.await.unwrap();
        late.await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "waiter");
        assert_eq!(rx.recv().await.unwrap(), "late");
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped() {
        let lock = Arc::new(ChatLock::new());
        let holder = lock.acquire().await;

        // Park a waiter, then drop its future before wake-up.
        let doomed = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        doomed.abort();
        let _ = doomed.await;

        drop(holder);
        // Lock must not be stuck on the dead waiter.
        let guard = tokio::time::timeout(Duration::from_secs(1), lock.acquire())
            .await
            .expect("lock leaked to a cancelled waiter");
        drop(guard);
    }

    #[tokio::test]
    async fn try_acquire_respects_holder() {
        let lock = ChatLock::new();
        let guard = lock.acquire().await;
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }
}
