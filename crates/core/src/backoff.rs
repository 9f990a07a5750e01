use std::future::Future;
use std::time::Duration;

use prometheus::Histogram;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retries an operation with randomized exponential backoff until it
/// succeeds or the run is cancelled. Retries are unbounded; the wait grows
/// by a random factor in [1.5, 2.5] per failure, capped at `max_wait`.
pub struct Backoff {
    wait: Duration,
    max_wait: Duration,
}

impl Backoff {
    pub fn new(wait: Duration, max_wait: Duration) -> Self {
        Self { wait, max_wait }
    }

    /// Runs `op` until it succeeds, returning its value. `None` means the
    /// run was cancelled first.
    pub async fn retry<T, E, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run(cancel, None, op).await
    }

    /// Like [`retry`](Self::retry), but charges the latency of the final
    /// successful attempt (and only that attempt) to `timer`.
    pub async fn retry_timed<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        timer: &Histogram,
        op: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run(cancel, Some(timer), op).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        timer: Option<&Histogram>,
        mut op: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut wait = self.wait;
        let mut start = Instant::now();
        let mut res = op().await;
        let mut attempt = 0u32;
        loop {
            match res {
                Ok(v) => {
                    if let Some(timer) = timer {
                        timer.observe(start.elapsed().as_secs_f64());
                    }
                    return Some(v);
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    wait = next_wait(wait, self.max_wait);
                    warn!(?wait, attempt, %err, "operation failed, pausing");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return None,
                    }
                    start = Instant::now();
                    res = op().await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Next backoff wait: sampled uniformly in [1.5w, 2.5w], capped at `max`,
/// rounded to whole seconds.
fn next_wait(wait: Duration, max: Duration) -> Duration {
    let sampled = rand_between_dur(wait.mul_f64(1.5), wait.mul_f64(2.5)).min(max);
    round_secs(sampled)
}

/// Uniform sample in [start, end), rounded to whole seconds.
pub(crate) fn rand_between_dur(start: Duration, end: Duration) -> Duration {
    if end <= start {
        return round_secs(start);
    }
    let sampled = start + Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0) * (end - start).as_secs_f64());
    round_secs(sampled)
}

/// Uniform sample in [start, end).
pub(crate) fn rand_between(start: u64, end: u64) -> u64 {
    if end <= start {
        return start;
    }
    rand::thread_rng().gen_range(start..end)
}

fn round_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs_f64().round() as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{next_wait, rand_between, Backoff};

    #[test]
    fn wait_growth_is_bounded() {
        let max = Duration::from_secs(8);
        // Whatever the failure sequence, successive waits never exceed the
        // cap and never shrink below the 1.5x floor (rounded down).
        let mut wait = Duration::from_secs(1);
        for _ in 0..20 {
            let next = next_wait(wait, max);
            assert!(next <= max, "wait {next:?} exceeds cap");
            let floor = Duration::from_secs((wait.as_secs_f64() * 1.5).floor() as u64).min(max);
            assert!(next >= floor, "wait {next:?} below floor {floor:?}");
            assert_eq!(next.subsec_nanos(), 0, "wait not whole seconds");
            wait = next;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let cancel = CancellationToken::new();
        let res = backoff
            .retry(&cancel, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 4 {
                        Err("transient")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(res, Some(4));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retries() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Option<()> = backoff
            .retry(&cancel, || async { Err::<(), _>("always fails") })
            .await;
        assert!(res.is_none());
    }

    #[test]
    fn rand_between_stays_in_range() {
        for _ in 0..100 {
            let v = rand_between(10, 20);
            assert!((10..20).contains(&v));
        }
        assert_eq!(rand_between(5, 5), 5);
    }
}
