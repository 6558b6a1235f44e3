use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Shared on/off signal used as a lightweight circuit breaker between a
/// resource and its dependents.
///
/// `is_burned` is a lock-free read on the hot path. `activate` wakes every
/// waiter; `burn` while already burned is idempotent and wakes nobody.
/// Waiters re-check the state after waking, so spurious wakeups from the
/// underlying primitive are harmless.
#[derive(Debug, Default)]
pub struct Fuse {
    burned: AtomicBool,
    notify: Notify,
}

impl Fuse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_burned(&self) -> bool {
        self.burned.load(Ordering::Acquire)
    }

    /// Trip the fuse. Returns `true` if this call changed the state.
    pub fn burn(&self) -> bool {
        !self.burned.swap(true, Ordering::AcqRel)
    }

    /// Reset the fuse and wake every task blocked in
    /// [`wait_until_active`](Self::wait_until_active).
    pub fn activate(&self) {
        self.burned.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Block until the fuse is active (not burned).
    pub async fn wait_until_active(&self) {
        loop {
            // Register interest before the state check to avoid losing an
            // activate() that lands in between.
            let notified = self.notify.notified();
            if !self.is_burned() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn burn_is_idempotent() {
        let fuse = Fuse::new();
        assert!(!fuse.is_burned());
        assert!(fuse.burn());
        assert!(!fuse.burn());
        assert!(fuse.is_burned());
    }

    #[tokio::test]
    async fn activate_wakes_every_waiter() {
        let fuse = Arc::new(Fuse::new());
        fuse.burn();

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let fuse = fuse.clone();
            waiters.push(tokio::spawn(async move {
                fuse.wait_until_active().await;
            }));
        }
        // Let the waiters park first.
        tokio::time::sleep(Duration::from_millis(20)).await;

        fuse.activate();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter did not wake")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn active_fuse_does_not_block() {
        let fuse = Fuse::new();
        tokio::time::timeout(Duration::from_millis(50), fuse.wait_until_active())
            .await
            .expect("active fuse must not block");
    }
}
