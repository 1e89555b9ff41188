//! Process-wide shutdown signal.
//!
//! Created by the process supervisor before the runner exists and handed to
//! it at construction. Set at most once (never reset); observed either by
//! polling `is_set` or by awaiting `wait`.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns true if this call was the one that set it.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the signal has been set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close underneath us.
        let _ = rx.wait_for(|flag| *flag).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_unset() {
        assert!(!ShutdownSignal::new().is_set());
    }

    #[test]
    fn set_once_read_many() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();

        assert!(signal.set());
        assert!(!signal.set());
        assert!(observer.is_set());
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn wait_resolves_after_set() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();

        let waiter = tokio::spawn(async move { observer.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn subscribers_see_change() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();

        assert!(!*rx.borrow());
        signal.set();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
