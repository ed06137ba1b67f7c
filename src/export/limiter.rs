//! Bounded concurrency for binary relays
//!
//! At most `ceiling` tasks run at once. Submitting while saturated suspends
//! the submitter until a slot frees up, which in turn pauses the record
//! cursor feeding the limiter.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{ExportError, PipelineError, Result};

/// Runs submitted tasks with a fixed concurrency ceiling
pub struct TaskLimiter<T> {
    ceiling: usize,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<T>,
    finished: Vec<T>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl<T: Send + 'static> TaskLimiter<T> {
    /// Create a limiter; a ceiling of zero is treated as one
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            semaphore: Arc::new(Semaphore::new(ceiling)),
            tasks: JoinSet::new(),
            finished: Vec::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Submit a task, waiting for a free slot first
    pub async fn submit<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ExportError::Pipeline(PipelineError::Scheduler(e.to_string())))?;

        let in_flight = self.in_flight.clone();
        let peak = self.peak.clone();
        self.tasks.spawn(async move {
            let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(running, Ordering::SeqCst);
            let output = task.await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            output
        });

        self.reap();
        Ok(())
    }

    /// Wait for every submitted task and return all outputs
    pub async fn drain(mut self) -> Vec<T> {
        while let Some(joined) = self.tasks.join_next().await {
            self.collect(joined);
        }
        self.finished
    }

    /// Abort outstanding tasks
    pub async fn abort(mut self) -> Vec<T> {
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(output) = joined {
                self.finished.push(output);
            }
        }
        self.finished
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Tasks running right now
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of tasks observed running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.collect(joined);
        }
    }

    fn collect(&mut self, joined: std::result::Result<T, tokio::task::JoinError>) {
        match joined {
            Ok(output) => self.finished.push(output),
            Err(e) if e.is_panic() => tracing::error!(error = %e, "Relay task panicked"),
            Err(e) => tracing::debug!(error = %e, "Relay task cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_every_task() {
        let mut limiter = TaskLimiter::new(3);
        for i in 0..10u32 {
            limiter.submit(async move { i * 2 }).await.unwrap();
        }
        let mut outputs = limiter.drain().await;
        outputs.sort();
        assert_eq!(outputs, (0..10).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_never_exceeds_ceiling() {
        let mut limiter = TaskLimiter::new(4);
        for _ in 0..25 {
            limiter
                .submit(async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                })
                .await
                .unwrap();
            assert!(limiter.in_flight() <= 4);
        }
        let peak = limiter.peak_in_flight();
        limiter.drain().await;
        assert!(peak <= 4);
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_submit_suspends_when_saturated() {
        let mut limiter = TaskLimiter::new(1);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        limiter
            .submit(async move {
                let _ = release_rx.await;
            })
            .await
            .unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), limiter.submit(async {})).await;
        assert!(blocked.is_err());

        release_tx.send(()).unwrap();
        limiter.submit(async {}).await.unwrap();
        assert_eq!(limiter.drain().await.len(), 2);
    }

    #[tokio::test]
    async fn test_zero_ceiling_is_one() {
        let limiter: TaskLimiter<()> = TaskLimiter::new(0);
        assert_eq!(limiter.ceiling(), 1);
    }

    #[tokio::test]
    async fn test_panicking_relay_comes_back_as_failure() {
        use crate::export::relay::{BinaryRelay, RelayOutcome};
        use crate::export::request::{BinaryTask, LookupKey, LookupTarget};
        use crate::export::event::EventSender;
        use crate::export::sniffer::SignatureTable;
        use crate::testing::{MemorySink, MockBlobStore};

        let relay = BinaryRelay::new(
            Arc::new(MockBlobStore::new().panicking_on("p1")),
            Arc::new(MemorySink::new()),
            Arc::new(SignatureTable::builtin()),
            EventSender::detached(),
        );
        let task = BinaryTask {
            lookup: LookupKey {
                raw: "p1".to_string(),
                target: LookupTarget::Filename("p1".to_string()),
            },
            destination_prefix: String::new(),
        };

        let mut limiter = TaskLimiter::new(2);
        limiter
            .submit(async move { relay.relay(task).await })
            .await
            .unwrap();
        assert_eq!(
            limiter.drain().await,
            vec![RelayOutcome::Failed {
                key: "p1".to_string(),
                reason: "relay panicked".to_string(),
            }]
        );
    }
}
