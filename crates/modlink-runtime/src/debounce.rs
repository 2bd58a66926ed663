use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

// ─── Debouncer ────────────────────────────────────────────────────────────

/// Collapses bursts of [`poke`](Debouncer::poke)s into one call of `flush`.
///
/// `flush` runs once no poke has arrived for `wait`, or `max_wait` after the
/// first poke of a burst, whichever comes first. Dropping the debouncer
/// flushes any burst still open, then stops the background task. `flush`
/// must not rely on the debouncer's owner still being alive.
pub struct Debouncer {
    poke_tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(wait: Duration, max_wait: Duration, flush: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (poke_tx, mut poke_rx) = mpsc::unbounded_channel::<()>();
        let max_wait = max_wait.max(wait);

        tokio::spawn(async move {
            while poke_rx.recv().await.is_some() {
                let started = Instant::now();
                let hard_deadline = started + max_wait;
                let mut deadline = (started + wait).min(hard_deadline);

                loop {
                    tokio::select! {
                        _ = sleep_until(deadline) => break,
                        poke = poke_rx.recv() => match poke {
                            Some(()) => deadline = (Instant::now() + wait).min(hard_deadline),
                            None => break,
                        },
                    }
                }

                flush();
            }
        });

        Self { poke_tx }
    }

    pub fn poke(&self) {
        let _ = self.poke_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(wait: u64, max_wait: u64) -> (Debouncer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let debouncer = Debouncer::spawn(
            Duration::from_millis(wait),
            Duration::from_millis(max_wait),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        (debouncer, count)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_flush() {
        let (debouncer, count) = counting(10, 50);
        for _ in 0..5 {
            debouncer.poke();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_bounds_a_continuous_burst() {
        let (debouncer, count) = counting(10, 50);
        // Pokes every 5ms never leave a 10ms quiet window.
        for _ in 0..30 {
            debouncer.poke();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // 150ms of pokes with a 50ms ceiling flushes at least twice.
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_flushes_an_open_burst() {
        let (debouncer, count) = counting(10, 50);
        debouncer.poke();
        drop(debouncer);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_an_idle_debouncer_does_not_flush() {
        let (debouncer, count) = counting(10, 50);
        drop(debouncer);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_flush_separately() {
        let (debouncer, count) = counting(10, 50);
        debouncer.poke();
        tokio::time::sleep(Duration::from_millis(30)).await;
        debouncer.poke();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
