//! Bounded parallel executor with a per-unit watchdog.
//!
//! Work is fanned out over a [`JoinSet`] and gated by a [`Semaphore`] so that
//! at most `num_threads` units run at once. Each unit is blocking code and is
//! run via [`tokio::task::spawn_blocking`].
//!
//! The watchdog clock for a unit starts once it holds a permit. When the
//! limit passes, the unit's [`CancellationToken`] is cancelled and the
//! executor keeps waiting for the unit to return: interruption is
//! cooperative, so a unit that ignores its token simply runs to completion
//! while holding its permit. The unit's own result is reported either way.
//!
//! Dropping the future returned by [`TaskExecutor::submit_all`] cancels every
//! outstanding unit's token.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::ExecutorError;

/// Runs batches of blocking units with bounded parallelism
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    num_threads: usize,
    timeout: Duration,
}

impl TaskExecutor {
    /// `num_threads` is clamped to at least one
    pub fn new(num_threads: usize, timeout: Duration) -> Self {
        Self {
            num_threads: num_threads.max(1),
            timeout,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run every unit and return one result per unit, in submission order.
    ///
    /// Returns only after every unit has finished.
    pub async fn submit_all<T, E, F>(&self, units: Vec<F>) -> Vec<Result<T, ExecutorError<E>>>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        if units.is_empty() {
            return Vec::new();
        }

        let count = units.len();
        debug!(
            units = count,
            threads = self.num_threads,
            "Sharing execution across threads"
        );

        let sem = Arc::new(Semaphore::new(self.num_threads));
        let shutdown = CancellationToken::new();
        let _shutdown_guard = shutdown.clone().drop_guard();
        let mut join_set: JoinSet<(usize, Result<T, ExecutorError<E>>)> = JoinSet::new();

        for (index, unit) in units.into_iter().enumerate() {
            let sem = sem.clone();
            let token = shutdown.child_token();
            let limit = self.timeout;

            join_set.spawn(async move { (index, run_unit(index, unit, sem, token, limit).await) });
        }

        let mut slots: Vec<Option<Result<T, ExecutorError<E>>>> = (0..count).map(|_| None).collect();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!(error = %e, "Executor unit supervisor aborted"),
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(ExecutorError::Shutdown)))
            .collect()
    }
}

async fn run_unit<T, E, F>(
    index: usize,
    unit: F,
    sem: Arc<Semaphore>,
    token: CancellationToken,
    limit: Duration,
) -> Result<T, ExecutorError<E>>
where
    F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let _permit = tokio::select! {
        permit = sem.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Err(ExecutorError::Shutdown),
        },
        _ = token.cancelled() => return Err(ExecutorError::Shutdown),
    };

    let start = Instant::now();
    let worker_token = token.clone();
    let mut handle = tokio::task::spawn_blocking(move || unit(&worker_token));

    let joined = match tokio::time::timeout(limit, &mut handle).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!(
                unit = index,
                limit_ms = limit.as_millis() as u64,
                "Unit exceeded its time limit, interrupting"
            );
            token.cancel();
            handle.await
        }
    };

    debug!(unit = index, elapsed_ms = start.elapsed().as_millis() as u64, "Unit finished");

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExecutorError::Failed(e)),
        Err(e) if e.is_panic() => Err(ExecutorError::Panicked(panic_message(e.into_panic()))),
        Err(_) => Err(ExecutorError::Shutdown),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
