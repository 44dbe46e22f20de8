//! Small async utilities.

use std::pin::pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Counts live handler contexts so close can await them.
#[derive(Clone, Default)]
pub(crate) struct WaitGroup {
    inner: Arc<WgInner>,
}

#[derive(Default)]
struct WgInner {
    count: Mutex<usize>,
    notify: Notify,
}

impl WaitGroup {
    /// Take a token; it is returned when the guard drops.
    pub fn guard(&self) -> WaitGroupGuard {
        *self.inner.count.lock() += 1;
        WaitGroupGuard { wg: self.clone() }
    }

    fn done(&self) {
        let mut count = self.inner.count.lock();
        *count -= 1;
        if *count == 0 {
            self.inner.notify.notify_waiters();
        }
    }

    /// Resolves once the count reaches zero (immediately if it already is).
    pub async fn wait(&self) {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            // Register before checking, so a final `done` cannot slip between
            // the check and the await.
            notified.as_mut().enable();
            if *self.inner.count.lock() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct WaitGroupGuard {
    wg: WaitGroup,
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        self.wg.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_when_empty() {
        let wg = WaitGroup::default();
        wg.wait().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_all_guards_drop() {
        let wg = WaitGroup::default();
        let g1 = wg.guard();
        let g2 = wg.guard();

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(g1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(g2);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait group release")
            .unwrap();
    }
}
