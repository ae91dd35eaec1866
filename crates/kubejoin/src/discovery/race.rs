//! Race a set of candidate endpoints and keep the first success.
//!
//! One task per candidate retries its attempt on a fixed interval. The first
//! outcome to pass the commit gate wins; the gate is a compare-and-set on a
//! flag, and the winning outcome travels through a single-slot channel.
//! Everyone else sees the shared cancellation token at their next loop
//! boundary (or has their in-flight attempt dropped) and exits. The call
//! returns only after every worker has finished.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use kubejoin_common::JoinError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Timing of an endpoint race
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Wait between attempts against the same endpoint
    pub retry_interval: Duration,
    /// Overall wall-clock bound for the race
    pub timeout: Duration,
}

/// The committed result of a race
#[derive(Debug)]
pub struct RaceWinner<T> {
    pub endpoint: String,
    pub value: T,
    /// Attempts the winning endpoint needed
    pub attempts: u32,
    pub elapsed: Duration,
}

struct Committed<T> {
    endpoint: String,
    attempts: u32,
    result: Result<T, JoinError>,
}

/// One-shot commit gate shared by all workers and the timeout
struct Gate<T> {
    closed: AtomicBool,
    tx: mpsc::Sender<Committed<T>>,
    cancel: CancellationToken,
}

impl<T> Gate<T> {
    fn try_acquire(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Commit an outcome if nobody else has; returns whether it was taken
    fn commit(&self, committed: Committed<T>) -> bool {
        if !self.try_acquire() {
            return false;
        }
        // Capacity 1 and a single gate holder, so this cannot be full
        let _ = self.tx.try_send(committed);
        self.cancel.cancel();
        true
    }
}

/// Run `attempt` against every endpoint concurrently and return the first success.
///
/// Failures for which [`JoinError::aborts_discovery`] holds are committed
/// like a success and end the race with that error. Other failures are
/// logged and retried after `retry_interval`.
pub async fn race_endpoints<T, F, Fut>(
    endpoints: &[String],
    config: &RaceConfig,
    attempt: F,
) -> Result<RaceWinner<T>, JoinError>
where
    T: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, JoinError>> + Send + 'static,
{
    if endpoints.is_empty() {
        return Err(JoinError::Config("no discovery endpoints to race".into()));
    }

    let start = Instant::now();
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(1);
    let gate = Arc::new(Gate {
        closed: AtomicBool::new(false),
        tx,
        cancel: cancel.clone(),
    });
    let attempt = Arc::new(attempt);

    let workers: Vec<_> = endpoints
        .iter()
        .cloned()
        .map(|endpoint| {
            tokio::spawn(run_worker(
                endpoint,
                attempt.clone(),
                config.retry_interval,
                gate.clone(),
            ))
        })
        .collect();

    let committed = tokio::select! {
        committed = rx.recv() => committed,
        _ = tokio::time::sleep(config.timeout) => {
            if gate.try_acquire() {
                None
            } else {
                // A worker took the gate as the timer fired; its send is imminent
                rx.recv().await
            }
        }
    };

    cancel.cancel();
    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Discovery worker panicked");
        }
    }

    let elapsed = start.elapsed();
    match committed {
        Some(Committed {
            endpoint,
            attempts,
            result: Ok(value),
        }) => Ok(RaceWinner {
            endpoint,
            value,
            attempts,
            elapsed,
        }),
        Some(Committed {
            result: Err(e), ..
        }) => Err(e),
        None => {
            tracing::error!(
                timeout = ?config.timeout,
                endpoints = endpoints.len(),
                "Aborting discovery after timeout"
            );
            Err(JoinError::DiscoveryTimeout {
                timeout: config.timeout,
            })
        }
    }
}

async fn run_worker<T, F, Fut>(
    endpoint: String,
    attempt: Arc<F>,
    retry_interval: Duration,
    gate: Arc<Gate<T>>,
) where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, JoinError>>,
{
    let cancel = gate.cancel.clone();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        attempts += 1;
        tracing::debug!(endpoint = %endpoint, attempt = attempts, "Trying bootstrap endpoint");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = attempt(endpoint.clone()) => result,
        };

        match result {
            Ok(value) => {
                let won = gate.commit(Committed {
                    endpoint: endpoint.clone(),
                    attempts,
                    result: Ok(value),
                });
                if won {
                    tracing::info!(endpoint = %endpoint, attempt = attempts, "Bootstrap endpoint verified");
                } else {
                    tracing::debug!(endpoint = %endpoint, "Discarding late success");
                }
                break;
            }
            Err(e) if e.aborts_discovery() => {
                tracing::error!(endpoint = %endpoint, error = %e, "Fatal discovery failure");
                gate.commit(Committed {
                    endpoint: endpoint.clone(),
                    attempts,
                    result: Err(e),
                });
                break;
            }
            Err(e @ JoinError::IncompleteBundle(_)) => {
                tracing::error!(
                    endpoint = %endpoint,
                    attempt = attempts,
                    error = %e,
                    retry_in = ?retry_interval,
                    "Endpoint served an incomplete trust bundle"
                );
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    attempt = attempts,
                    error = %e,
                    retry_in = ?retry_interval,
                    "Bootstrap endpoint attempt failed"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.0.0.{}:9898", i + 1)).collect()
    }

    fn config(retry_ms: u64, timeout_ms: u64) -> RaceConfig {
        RaceConfig {
            retry_interval: Duration::from_millis(retry_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Counts attempts per endpoint
    #[derive(Clone, Default)]
    struct Attempts(Arc<Mutex<HashMap<String, u32>>>);

    impl Attempts {
        fn record(&self, endpoint: &str) -> u32 {
            let mut map = self.0.lock().unwrap();
            let count = map.entry(endpoint.to_string()).or_default();
            *count += 1;
            *count
        }

        fn total(&self) -> u32 {
            self.0.lock().unwrap().values().sum()
        }

        fn of(&self, endpoint: &str) -> u32 {
            self.0.lock().unwrap().get(endpoint).copied().unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn winner_on_third_attempt_stops_the_rest() {
        let candidates = endpoints(4);
        let winner = candidates[2].clone();
        let attempts = Attempts::default();

        let counter = attempts.clone();
        let target = winner.clone();
        let result = race_endpoints(&candidates, &config(20, 5_000), move |endpoint| {
            let counter = counter.clone();
            let target = target.clone();
            async move {
                let n = counter.record(&endpoint);
                if endpoint == target && n == 3 {
                    Ok(format!("bundle from {endpoint}"))
                } else {
                    Err(JoinError::discovery("connection refused"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.endpoint, winner);
        assert_eq!(result.value, format!("bundle from {winner}"));
        assert_eq!(result.attempts, 3);

        // Every worker has stopped: counts no longer move
        let total = attempts.total();
        assert!(total <= 4 * (3 + 1), "too many attempts: {total}");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.total(), total);
    }

    #[tokio::test]
    async fn all_failing_times_out_and_workers_terminate() {
        let candidates = endpoints(3);
        let attempts = Attempts::default();
        let live = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let in_flight = live.clone();
        let cfg = config(30, 200);
        let start = Instant::now();
        let err = race_endpoints(&candidates, &cfg, move |endpoint| {
            let counter = counter.clone();
            let in_flight = in_flight.clone();
            async move {
                in_flight.fetch_add(1, Ordering::SeqCst);
                counter.record(&endpoint);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Err::<(), _>(JoinError::discovery("no route to host"))
            }
        })
        .await
        .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, JoinError::DiscoveryTimeout { .. }));
        assert!(
            elapsed < cfg.timeout + cfg.retry_interval + Duration::from_millis(150),
            "took {elapsed:?}"
        );
        assert!(elapsed >= cfg.timeout);
        for endpoint in &candidates {
            assert!(attempts.of(endpoint) >= 1);
        }

        let total = attempts.total();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.total(), total);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hung_attempt_is_abandoned_on_timeout() {
        let candidates = endpoints(2);
        let cfg = config(10, 100);
        let start = Instant::now();

        let err = race_endpoints(&candidates, &cfg, |_endpoint| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, JoinError>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, JoinError::DiscoveryTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn fatal_failure_aborts_the_race() {
        let candidates = endpoints(3);
        let bad = candidates[0].clone();

        let start = Instant::now();
        let err = race_endpoints(&candidates, &config(10, 5_000), move |endpoint| {
            let bad = bad.clone();
            async move {
                if endpoint == bad {
                    Err::<(), _>(JoinError::certificate_io("read-only file system"))
                } else {
                    Err(JoinError::verification("signature mismatch"))
                }
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, JoinError::CertificateIo(_)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn incomplete_bundle_does_not_stop_a_healthy_endpoint() {
        let candidates = endpoints(2);
        let stale = candidates[0].clone();
        let healthy = candidates[1].clone();
        let attempts = Attempts::default();

        let counter = attempts.clone();
        let target = stale.clone();
        let result = race_endpoints(&candidates, &config(10, 5_000), move |endpoint| {
            let counter = counter.clone();
            let stale = target.clone();
            async move {
                counter.record(&endpoint);
                if endpoint == stale {
                    Err(JoinError::IncompleteBundle("stale node".into()))
                } else {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(endpoint)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.endpoint, healthy);
        assert_eq!(result.value, healthy);
        assert!(attempts.of(&stale) > 1, "stale endpoint should be retried");
    }

    #[tokio::test]
    async fn only_incomplete_bundles_end_in_timeout() {
        let candidates = endpoints(2);
        let err = race_endpoints(&candidates, &config(10, 150), |_endpoint| async {
            Err::<(), _>(JoinError::IncompleteBundle("no storage cluster CA key".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, JoinError::DiscoveryTimeout { .. }));
    }

    #[tokio::test]
    async fn exactly_one_of_many_simultaneous_successes_is_committed() {
        let candidates = endpoints(8);
        let successes = Arc::new(AtomicU32::new(0));

        let counter = successes.clone();
        let result = race_endpoints(&candidates, &config(10, 5_000), move |endpoint| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, JoinError>(endpoint)
            }
        })
        .await
        .unwrap();

        assert!(candidates.contains(&result.value));
        assert_eq!(result.endpoint, result.value);
        assert!(successes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_a_config_error() {
        let err = race_endpoints(&[], &config(10, 100), |_endpoint| async {
            Ok::<_, JoinError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, JoinError::Config(_)));
    }
}
