//! Bounded concurrent units and retried capability calls.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capabilities::{CapabilityError, CapabilityResult};
use crate::config::EngineConfig;
use crate::metrics::METRICS;

/// Run `unit` over `items` with at most `limit` in flight.
///
/// Returns one slot per item, in input order. A slot is `None` when the unit
/// was never started because `cancel` fired first, or when its task panicked.
/// Units already running when `cancel` fires finish normally. The call
/// returns only after every started unit has finished.
pub async fn run_bounded<I, T, F, Fut>(
    items: Vec<I>,
    limit: usize,
    cancel: &CancellationToken,
    unit: F,
) -> Vec<Option<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(usize, I) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let sem = Arc::clone(&sem);
        let cancel = cancel.clone();
        let fut = unit(index, item);
        tasks.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok()?;
            if cancel.is_cancelled() {
                debug!(unit = index, "not started, cancelled");
                return None;
            }
            Some(fut.await)
        }));
    }

    join_all(tasks)
        .await
        .into_iter()
        .enumerate()
        .map(|(index, joined)| match joined {
            Ok(slot) => slot,
            Err(e) => {
                warn!(unit = index, error = %e, "unit task aborted");
                None
            }
        })
        .collect()
}

/// Call a capability with the configured timeout, retrying transient
/// failures up to `max_attempts` with linear backoff.
///
/// A timeout counts as a failure of that attempt.
pub async fn call_with_retry<T, F, Fut>(
    label: &str,
    config: &EngineConfig,
    mut call: F,
) -> CapabilityResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CapabilityResult<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last = CapabilityError::Failed(format!("{label}: no attempt made"));
    for attempt in 1..=attempts {
        match tokio::time::timeout(config.call_timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => last = e,
            Err(_) => last = CapabilityError::Timeout(config.call_timeout),
        }
        if !last.is_transient() || attempt == attempts {
            break;
        }
        METRICS.inc_capability_retries();
        debug!(%label, attempt, error = %last, "retrying capability call");
        tokio::time::sleep(config.retry_backoff * attempt).await;
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_pool_never_exceeds_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let out = run_bounded((0..12).collect(), 3, &cancel, |_, n: u32| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                n * 2
            }
        })
        .await;
        assert_eq!(out.len(), 12);
        assert_eq!(out[5], Some(10));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancelled_units_are_not_started() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = run_bounded(vec![1, 2, 3], 2, &cancel, |_, n: i32| async move { n }).await;
        assert_eq!(out, vec![None, None, None]);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let cfg = EngineConfig::fast();
        let out = call_with_retry("test", &cfg, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CapabilityError::Unavailable("warming up".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_output_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let cfg = EngineConfig::fast();
        let out: CapabilityResult<()> = call_with_retry("test", &cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CapabilityError::InvalidOutput("garbage".into())) }
        })
        .await;
        assert!(matches!(out, Err(CapabilityError::InvalidOutput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let cfg = EngineConfig {
            call_timeout: Duration::from_millis(10),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let out: CapabilityResult<()> = call_with_retry("slow", &cfg, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(CapabilityError::Timeout(_))));
    }
}
