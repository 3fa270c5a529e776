// rust/runtime-core/src/shutdown.rs

use tokio::sync::watch;

/// Resolves once `true` is published on `rx` or its sender is dropped.
///
/// Background tasks select on this next to their work.
pub async fn requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolves_on_true() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { requested(&mut rx).await });

        tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        requested(&mut rx).await;
    }
}
