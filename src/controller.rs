//! Managed retryable background jobs.
//!
//! A controller is a named unit of async work that is retried with
//! exponential backoff until it succeeds, its name is replaced by a newer
//! update, or its linked cancellation token fires. The restore path schedules
//! identity allocation and the initial-global-identities wait on controllers
//! so that an endpoint deleted mid-restore tears its jobs down with it.

use crate::error::Result;
use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Future type returned by a controller body.
pub type ControllerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Parameters for scheduling a controller.
#[derive(Debug, Clone)]
pub struct ControllerParams {
    /// Logical group, used for logging only.
    pub group: &'static str,

    /// Token the controller's lifetime is linked to. The spawned job gets a
    /// child of this token, so cancelling it stops the job.
    pub cancel: CancellationToken,

    /// First retry delay.
    pub retry_base: Duration,

    /// Upper bound on the retry delay.
    pub retry_max: Duration,
}

impl ControllerParams {
    pub fn new(group: &'static str) -> Self {
        Self {
            group,
            cancel: CancellationToken::new(),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
        }
    }

    /// Link the controller to an external cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the retry backoff bounds.
    pub fn with_retry(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max;
        self
    }
}

struct ControllerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Registry of named background controllers.
#[derive(Default)]
pub struct ControllerManager {
    controllers: DashMap<String, ControllerHandle>,
}

impl ControllerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule (or replace) the named controller. The body runs until it
    /// returns `Ok`, with backoff-and-jitter sleeps between failed attempts;
    /// cancellation wins over both the body and the sleeps.
    pub fn update<F>(&self, name: impl Into<String>, params: ControllerParams, run: F)
    where
        F: Fn(CancellationToken) -> ControllerFuture + Send + Sync + 'static,
    {
        let name = name.into();
        let cancel = params.cancel.child_token();

        let job_cancel = cancel.clone();
        let job_name = name.clone();
        let group = params.group;
        let join = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if job_cancel.is_cancelled() {
                    debug!(controller = %job_name, group, "Controller cancelled");
                    return;
                }

                let body = run(job_cancel.clone());
                let result = tokio::select! {
                    _ = job_cancel.cancelled() => {
                        debug!(controller = %job_name, group, "Controller cancelled");
                        return;
                    }
                    result = body => result,
                };

                match result {
                    Ok(()) => {
                        debug!(controller = %job_name, group, "Controller run succeeded");
                        return;
                    }
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        let delay = retry_delay(params.retry_base, params.retry_max, attempt);
                        warn!(
                            controller = %job_name,
                            group,
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Controller run failed, retrying"
                        );
                        tokio::select! {
                            _ = job_cancel.cancelled() => {
                                debug!(controller = %job_name, group, "Controller cancelled");
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });

        if let Some(old) = self.controllers.insert(name, ControllerHandle { cancel, join }) {
            old.cancel.cancel();
        }
    }

    /// Cancel and forget the named controller.
    pub fn remove(&self, name: &str) {
        if let Some((_, handle)) = self.controllers.remove(name) {
            handle.cancel.cancel();
        }
    }

    /// Cancel and forget every controller.
    pub fn remove_all(&self) {
        let names: Vec<String> = self.controllers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove(&name);
        }
    }

    /// Whether a controller with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.controllers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

impl Drop for ControllerManager {
    fn drop(&mut self) {
        for entry in self.controllers.iter() {
            entry.value().cancel.cancel();
            entry.value().join.abort();
        }
    }
}

fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exp).min(max);
    let jitter_ceiling = (delay.as_millis() as u64 / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
    delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_controller_retries_until_success() {
        let manager = ControllerManager::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let params = ControllerParams::new("test").with_retry(
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        let attempts_in_job = attempts.clone();
        manager.update("flaky", params, move |_cancel| {
            let attempts = attempts_in_job.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(crate::error::Error::Identity("transient".into()));
                }
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
                Ok(())
            })
        });

        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("controller should eventually succeed")
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrying() {
        let manager = ControllerManager::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let params = ControllerParams::new("test")
            .with_cancel(cancel.clone())
            .with_retry(Duration::from_millis(10), Duration::from_millis(10));
        let attempts_in_job = attempts.clone();
        manager.update("doomed", params, move |_cancel| {
            let attempts = attempts_in_job.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::Error::Identity("always fails".into()))
            })
        });

        tokio::time::sleep(Duration::from_millis(25)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_cancel = attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn test_update_replaces_previous_controller() {
        let manager = ControllerManager::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<&'static str>();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));

        // First instance blocks forever unless cancelled.
        manager.update("ep-7", ControllerParams::new("test"), move |cancel| {
            Box::pin(async move {
                cancel.cancelled().await;
                Ok(())
            })
        });

        let tx2 = tx.clone();
        manager.update("ep-7", ControllerParams::new("test"), move |_cancel| {
            let tx = tx2.clone();
            Box::pin(async move {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send("second");
                }
                Ok(())
            })
        });

        let winner = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(winner, "second");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        for attempt in 1..40 {
            let delay = retry_delay(base, max, attempt);
            assert!(delay >= base);
            assert!(delay <= max + max / 2);
        }
    }
}
