use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::enrich::{Enricher, EnrichmentResult, Task};
use crate::retry::RetryPolicy;

/// Counts reported once every dispatched task has finished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: usize,
    pub completed: usize,
    /// Dispatched, but cancelled before reaching an outcome.
    pub interrupted: usize,
    /// Never dispatched because of cancellation.
    pub not_dispatched: usize,
}

enum Message<T> {
    Completed(usize, EnrichmentResult<T>),
    Interrupted(usize),
}

/// Largest accepted pool. Far above any useful API concurrency and well
/// below the semaphore's permit limit.
pub const MAX_POOL_SIZE: usize = 1024;

/// Fixed-size worker pool. Each worker runs one task through the retry
/// policy to completion before the next task is pulled.
pub struct Scheduler {
    pool_size: usize,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(pool_size: usize, cancel: CancellationToken) -> Self {
        Scheduler {
            pool_size: pool_size.clamp(1, MAX_POOL_SIZE),
            cancel,
        }
    }

    /// Run every task and call `on_result` once per completed task, in
    /// completion order. Returns after all dispatched tasks have finished.
    pub async fn run<E, I, F>(
        &self,
        tasks: I,
        enricher: Arc<E>,
        policy: Arc<RetryPolicy>,
        mut on_result: F,
    ) -> DispatchStats
    where
        E: Enricher,
        I: IntoIterator<Item = Task>,
        I::IntoIter: Send + 'static,
        F: FnMut(usize, EnrichmentResult<E::Output>),
    {
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        // Channel: workers send results, this loop merges them
        let (tx, mut rx) = mpsc::channel::<Message<E::Output>>(self.pool_size * 2);

        let dispatcher = tokio::spawn(dispatch(
            tasks.into_iter(),
            semaphore,
            enricher,
            policy,
            self.cancel.clone(),
            tx,
        ));

        let mut stats = DispatchStats::default();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Completed(index, result) => {
                    stats.completed += 1;
                    on_result(index, result);
                }
                Message::Interrupted(index) => {
                    debug!(index, "task interrupted by cancellation");
                    stats.interrupted += 1;
                }
            }
        }

        match dispatcher.await {
            Ok((dispatched, not_dispatched)) => {
                stats.dispatched = dispatched;
                stats.not_dispatched = not_dispatched;
            }
            Err(e) => warn!("dispatcher failed: {}", e),
        }

        let lost = stats
            .dispatched
            .saturating_sub(stats.completed + stats.interrupted);
        if lost > 0 {
            warn!(lost, "tasks ended without reporting a result");
        }
        if stats.not_dispatched > 0 {
            info!(
                not_dispatched = stats.not_dispatched,
                "cancelled before all tasks were dispatched"
            );
        }
        stats
    }
}

/// Pull tasks lazily: a permit is taken before the next task is read, so at
/// most `pool_size` tasks exist at once. Returns (dispatched, not_dispatched).
async fn dispatch<E, I>(
    mut tasks: I,
    semaphore: Arc<Semaphore>,
    enricher: Arc<E>,
    policy: Arc<RetryPolicy>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Message<E::Output>>,
) -> (usize, usize)
where
    E: Enricher,
    I: Iterator<Item = Task> + Send,
{
    let mut dispatched = 0usize;

    loop {
        let permit: OwnedSemaphorePermit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            p = Arc::clone(&semaphore).acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        if cancel.is_cancelled() {
            break;
        }
        let Some(task) = tasks.next() else {
            break;
        };

        let enricher = Arc::clone(&enricher);
        let policy = Arc::clone(&policy);
        let cancel = cancel.clone();
        let tx = tx.clone();
        dispatched += 1;

        tokio::spawn(async move {
            let _permit = permit;
            let msg = match policy
                .execute(enricher.as_ref(), task.index, &task.input, &cancel)
                .await
            {
                Some(result) => Message::Completed(task.index, result),
                None => Message::Interrupted(task.index),
            };
            let _ = tx.send(msg).await;
        });
    }

    // Remaining tasks are only counted once cancellation stopped the loop
    let not_dispatched = if cancel.is_cancelled() { tasks.count() } else { 0 };
    (dispatched, not_dispatched)
}

// ── Tests ──
