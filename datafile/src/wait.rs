// Copyright 2024 Oxide Computer Company
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A condition variable that waiters share; each waiter checks its own
/// predicate after every wakeup.
#[derive(Debug, Default)]
pub struct WaitQueue {
    lock: Mutex<()>,
    cv: Condvar,
}

impl WaitQueue {
    pub fn new() -> WaitQueue {
        WaitQueue::default()
    }

    pub fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_all();
    }

    /// Block until `cond` holds or `timeout` passes.  Returns whether `cond`
    /// held when the wait ended.
    pub fn wait_timeout<F>(&self, timeout: Duration, mut cond: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let guard = self.lock.lock().unwrap();
        let (_guard, res) = self
            .cv
            .wait_timeout_while(guard, timeout, |_| !cond())
            .unwrap();
        !res.timed_out()
    }
}

/**
 * Cancellation for a blocked read.
 *
 * A reader registers the wait queue it is about to sleep on; `cancel` then
 * wakes every registered queue so the reader sees the flag promptly.
 */
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    queues: Mutex<Vec<Arc<WaitQueue>>>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let queues = self.queues.lock().unwrap().clone();
        for q in queues {
            q.wake_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn register(&self, q: &Arc<WaitQueue>) {
        self.queues.lock().unwrap().push(q.clone());
    }

    pub(crate) fn unregister(&self, q: &Arc<WaitQueue>) {
        let mut queues = self.queues.lock().unwrap();
        if let Some(i) = queues.iter().position(|x| Arc::ptr_eq(x, q)) {
            queues.swap_remove(i);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_times_out_without_wakeup() {
        let q = WaitQueue::new();
        let start = Instant::now();
        assert!(!q.wait_timeout(Duration::from_millis(20), || false));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_wakes_registered_waiter() {
        let q = Arc::new(WaitQueue::new());
        let token = Arc::new(CancelToken::new());
        token.register(&q);

        let t = {
            let q = q.clone();
            let token = token.clone();
            thread::spawn(move || {
                q.wait_timeout(Duration::from_secs(30), || token.is_cancelled())
            })
        };
        thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        token.cancel();
        assert!(t.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));

        token.unregister(&q);
        assert!(token.queues.lock().unwrap().is_empty());
    }
}
