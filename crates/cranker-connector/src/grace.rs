//! Delayed cancellation for in-flight work during shutdown

use std::time::Duration;
use tokio::sync::watch;

/// Cancellation signal derived from a parent shutdown signal plus a grace
/// period.
///
/// Nothing is observable here while the parent is quiet. Once the parent
/// fires, in-flight work gets `grace` to drain before [`cancelled`]
/// resolves; the caller maps that into a grace-exceeded error.
///
/// [`cancelled`]: GraceToken::cancelled
#[derive(Clone)]
pub struct GraceToken {
    fired: watch::Receiver<bool>,
}

impl GraceToken {
    /// Derive a token that fires `grace` after `parent` does.
    ///
    /// A dropped parent sender counts as a fired parent.
    pub fn new(mut parent: watch::Receiver<bool>, grace: Duration) -> Self {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            // Stop early once every token clone is gone.
            tokio::select! {
                _ = tx.closed() => return,
                _ = signal_fired(&mut parent) => {}
            }
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            let _ = tx.send(true);
        });
        Self { fired: rx }
    }

    /// Resolves once the parent has fired and the grace period has elapsed.
    pub async fn cancelled(&self) {
        let mut rx = self.fired.clone();
        signal_fired(&mut rx).await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.fired.borrow()
    }
}

/// Wait until a watch-based signal turns true. A dropped sender counts as
/// the signal having fired.
pub(crate) async fn signal_fired(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::time::timeout;

    #[tokio::test]
    async fn quiet_while_parent_is_quiet() {
        let (_tx, rx) = watch::channel(false);
        let token = GraceToken::new(rx, Duration::from_millis(1));

        assert!(!token.is_cancelled());
        assert!(timeout(Duration::from_millis(50), token.cancelled())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn fires_grace_after_parent() {
        let (tx, rx) = watch::channel(false);
        let token = GraceToken::new(rx, Duration::from_millis(100));

        let started = Instant::now();
        tx.send(true).unwrap();

        // Not yet: the grace period is still running.
        assert!(timeout(Duration::from_millis(20), token.cancelled())
            .await
            .is_err());

        timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn parent_already_fired_still_waits_grace() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let started = Instant::now();
        let token = GraceToken::new(rx, Duration::from_millis(80));

        timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn dropped_parent_counts_as_fired() {
        let (tx, rx) = watch::channel(false);
        let token = GraceToken::new(rx, Duration::from_millis(10));
        drop(tx);

        timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn clones_observe_the_same_signal() {
        let (tx, rx) = watch::channel(false);
        let token = GraceToken::new(rx, Duration::from_millis(10));
        let clone = token.clone();

        tx.send(true).unwrap();
        timeout(Duration::from_secs(2), clone.cancelled())
            .await
            .unwrap();
        assert!(token.is_cancelled());
    }
}
