use std::sync::Arc;
use tokio::sync::watch;

/// A broadcast "stop" signal cloned into every child task of a component.
///
/// Stopping is level triggered: subscribers that show up after `stop` still
/// observe the stopped state, so late spawned tasks cannot outlive their
/// owner.
#[derive(Debug, Clone)]
pub struct Offswitch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Offswitch {
    fn default() -> Self {
        Self::new()
    }
}

impl Offswitch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A child switch that stops when this one stops, without the parent
    /// stopping when the child does.
    pub fn child(&self) -> Offswitch {
        let child = Offswitch::new();
        let mut parent = self.tx.subscribe();
        let tx = Arc::clone(&child.tx);
        tokio::spawn(async move {
            if *parent.borrow() {
                let _ = tx.send(true);
                return;
            }
            while parent.changed().await.is_ok() {
                if *parent.borrow() {
                    let _ = tx.send(true);
                    return;
                }
            }
        });
        child
    }

    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the switch has been flipped. Cancellation safe, meant
    /// for `select!` arms.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // The sender lives inside self, getting here means the process is
        // tearing down anyway.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::Offswitch;
    use std::time::Duration;

    #[tokio::test]
    async fn should_observe_stop_after_the_fact() {
        let offswitch = Offswitch::new();
        offswitch.stop();
        assert!(offswitch.is_stopped());
        offswitch.stopped().await;
    }

    #[tokio::test]
    async fn should_wake_pending_waiters() {
        let offswitch = Offswitch::new();
        let waiter = offswitch.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        offswitch.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn should_propagate_to_children() {
        let parent = Offswitch::new();
        let child = parent.child();
        parent.stop();
        tokio::time::timeout(Duration::from_secs(1), child.stopped())
            .await
            .expect("child should stop");
    }

    #[tokio::test]
    async fn should_not_propagate_child_stop_to_parent() {
        let parent = Offswitch::new();
        let child = parent.child();
        child.stop();
        tokio::task::yield_now().await;
        assert!(!parent.is_stopped());
    }
}
