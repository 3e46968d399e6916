use std::time::Duration;

use tokio::sync::watch;

use depeche_user::error::{Error, Result};

/// Exponential backoff with an elapsed-time cap. Only transient errors are
/// retried; everything else surfaces immediately.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub elapsed_cap: Duration,
}

/// Ingest-side policy: 500 ms doubling to 10 s, giving up after about a
/// minute of trying.
pub const INGEST_RETRY: RetryPolicy = RetryPolicy {
    initial: Duration::from_millis(500),
    max: Duration::from_secs(10),
    elapsed_cap: Duration::from_secs(60),
};

impl RetryPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        std::cmp::min(current * 2, self.max)
    }
}

/// Run `op`, retrying transient failures until the elapsed cap is reached.
/// Checks the shutdown channel between attempts so a terminating process
/// never sits out a backoff sleep.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    must_exit: &watch::Receiver<bool>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let started = tokio::time::Instant::now();
    let mut delay = policy.initial;
    let mut must_exit = must_exit.clone();

    loop {
        if *must_exit.borrow() {
            return Err(Error::Cancelled);
        }

        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        if started.elapsed() + delay > policy.elapsed_cap {
            return Err(err);
        }
        tracing::debug!(err = %err, delay_ms = delay.as_millis() as u64, "transient failure, backing off");

        tokio::select! {
            _ = tokio::time::sleep(delay) => (),
            _ = must_exit.changed() => return Err(Error::Cancelled),
        }
        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_up_to_max() {
        let p = INGEST_RETRY;
        let mut d = p.initial;
        let mut schedule = vec![d];
        for _ in 0..6 {
            d = p.next_delay(d);
            schedule.push(d);
        }
        assert_eq!(
            schedule
                .iter()
                .map(|d| d.as_millis() as u64)
                .collect::<Vec<_>>(),
            vec![500, 1000, 2000, 4000, 8000, 10000, 10000]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let (_tx, rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let out = retry(INGEST_RETRY, &rx, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("flaky"))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let (_tx, rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let out: Result<()> = retry(INGEST_RETRY, &rx, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::AuthFailed)
        })
        .await;
        assert!(matches!(out, Err(Error::AuthFailed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_backoff() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let out: Result<()> = retry(INGEST_RETRY, &rx, || async {
            Err(Error::transient("never"))
        })
        .await;
        assert!(matches!(out, Err(Error::Cancelled)));
    }
}
