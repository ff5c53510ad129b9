//! Trailing-debounce request coalescer.
//!
//! Every call joins the current cycle and pushes the cycle's timer out by
//! `wait`. When the timer finally fires, the fetch runs once with the most
//! recent query and its outcome is handed to every caller that joined.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Failure seen by a caller of [`Coalescer::invoke`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoalesceError<E> {
    /// The shared fetch failed; every joiner gets the same error.
    #[error("{0}")]
    Fetch(E),
    /// The fetch was dropped (panicked or runtime shut down) before settling.
    #[error("request abandoned before it settled")]
    Abandoned,
}

type FetchFn<Q, T, E> = dyn Fn(Q) -> BoxFuture<'static, Result<T, E>> + Send + Sync;

/// Callers waiting on the next fire, plus the arguments it will use.
struct Cycle<Q, T, E> {
    generation: u64,
    latest: Q,
    joiners: Vec<oneshot::Sender<Result<T, E>>>,
    timer: JoinHandle<()>,
}

struct Slot<Q, T, E> {
    generation: u64,
    pending: Option<Cycle<Q, T, E>>,
}

struct Inner<Q, T, E> {
    fetch: Box<FetchFn<Q, T, E>>,
    wait: Duration,
    slot: Mutex<Slot<Q, T, E>>,
}

/// Collapses bursts of calls into one trailing call of `fetch`.
pub struct Coalescer<Q, T, E> {
    inner: Arc<Inner<Q, T, E>>,
}

impl<Q, T, E> Clone for Coalescer<Q, T, E> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<Q, T, E> Coalescer<Q, T, E>
where
    Q: Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new<F, Fut>(wait: Duration, fetch: F) -> Self
    where
        F: Fn(Q) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                fetch: Box::new(move |q| fetch(q).boxed()),
                wait,
                slot: Mutex::new(Slot { generation: 0, pending: None }),
            }),
        }
    }

    pub fn wait(&self) -> Duration { self.inner.wait }

    /// True while callers are waiting for a timer that has not fired yet.
    pub fn is_pending(&self) -> bool { self.inner.lock().pending.is_some() }

    /// Join the current cycle (or open a new one) and restart its timer.
    ///
    /// Registration happens before this returns; the returned future only
    /// waits for the settlement. Must be called inside a tokio runtime.
    pub fn invoke(&self, query: Q) -> impl Future<Output = Result<T, CoalesceError<E>>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.inner.wait;
        {
            let mut slot = self.inner.lock();
            slot.generation += 1;
            let generation = slot.generation;
            let timer = tokio::spawn({
                let inner = Arc::clone(&self.inner);
                async move {
                    tokio::time::sleep_until(deadline).await;
                    Inner::fire(inner, generation).await;
                }
            });
            match slot.pending.as_mut() {
                Some(cycle) => {
                    cycle.timer.abort();
                    cycle.timer = timer;
                    cycle.generation = generation;
                    cycle.latest = query;
                    cycle.joiners.push(tx);
                    counter!("coalesce_joined_total", 1);
                    debug!(generation, joiners = cycle.joiners.len(), "coalesce: joined pending cycle");
                }
                None => {
                    slot.pending = Some(Cycle { generation, latest: query, joiners: vec![tx], timer });
                    debug!(generation, "coalesce: new cycle");
                }
            }
        }
        async move {
            match rx.await {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(CoalesceError::Fetch(e)),
                Err(_) => Err(CoalesceError::Abandoned),
            }
        }
    }
}

impl<Q, T, E> Inner<Q, T, E>
where
    T: Clone,
    E: Clone,
{
    fn lock(&self) -> MutexGuard<'_, Slot<Q, T, E>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timer callback. Stale timers (superseded by a later call) do nothing.
    async fn fire(inner: Arc<Self>, generation: u64) {
        // Take the cycle out so calls arriving from here on open a fresh one.
        let cycle = {
            let mut slot = inner.lock();
            match slot.pending.as_ref() {
                Some(c) if c.generation == generation => slot.pending.take(),
                _ => None,
            }
        };
        let Some(cycle) = cycle else { return };
        let joiners = cycle.joiners.len();
        counter!("coalesce_fetch_total", 1);
        debug!(generation, joiners, "coalesce: firing");
        let outcome = (inner.fetch)(cycle.latest).await;
        for tx in cycle.joiners {
            // A joiner that stopped waiting is not an error.
            let _ = tx.send(outcome.clone());
        }
        debug!(generation, joiners, ok = outcome.is_ok(), "coalesce: settled");
    }
}
