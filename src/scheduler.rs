//! Coalescing, serializing, rate-limited execution of one handler.
//!
//! [`CoalescingScheduler`] runs its handler as a detached tokio task and
//! guarantees that:
//!
//! 1. at most one handler execution is in flight;
//! 2. two executions start at least `interval` apart;
//! 3. any number of [`register_change`](CoalescingScheduler::register_change)
//!    calls made before a run starts collapse into that single run.
//!
//! When a run finishes the scheduler re-evaluates itself, so a change
//! registered while the handler was running is picked up by exactly one
//! follow-up run. The reload pipeline uses it to bound reload frequency.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Handler = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;

#[derive(Default)]
struct State {
    last_start: Option<Instant>,
    change_requested_at: Option<Instant>,
    running: bool,
    stopped: bool,
    timer: Option<(u64, JoinHandle<()>)>,
    timer_seq: u64,
}

impl State {
    fn cancel_timer(&mut self) {
        if let Some((_, timer)) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    handler: Handler,
    interval: Duration,
    state: Mutex<State>,
    running_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct CoalescingScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CoalescingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingScheduler")
            .field("interval", &self.inner.interval)
            .finish_non_exhaustive()
    }
}

impl CoalescingScheduler {
    pub fn new<F, Fut>(interval: Duration, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move || Box::pin(handler()) as HandlerFuture);
        let (running_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                handler,
                interval,
                state: Mutex::new(State::default()),
                running_tx,
            }),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Request a handler run. Never blocks on the handler itself.
    pub fn register_change(&self) {
        let mut state = self.inner.lock();
        if state.change_requested_at.is_none() {
            state.change_requested_at = Some(Instant::now());
        }
        if state.running {
            // Re-evaluated when the current run completes.
            return;
        }
        Inner::evaluate(&self.inner, &mut state, true);
    }

    /// True while the handler is executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Stop scheduling new runs and wait for an in-flight run to finish.
    pub async fn stop(&self) {
        let mut running = self.inner.running_tx.subscribe();
        {
            let mut state = self.inner.lock();
            state.stopped = true;
            state.cancel_timer();
        }
        // The sender lives in `inner`, which we hold, so this cannot fail.
        let _ = running.wait_for(|r| !*r).await;
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether to run now, arm the timer, or do nothing. Must be
    /// called with the state lock held and no run in flight.
    fn evaluate(this: &Arc<Self>, state: &mut State, from_caller: bool) {
        if state.change_requested_at.is_none() || state.stopped {
            return;
        }
        if from_caller && state.timer.is_some() {
            // A pending timer already covers this change.
            return;
        }

        let now = Instant::now();
        if let Some(last) = state.last_start {
            let since = now.duration_since(last);
            if since < this.interval {
                let remaining = this.interval - since;
                state.cancel_timer();
                state.timer_seq += 1;
                let seq = state.timer_seq;
                let inner = Arc::clone(this);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(remaining).await;
                    let mut state = inner.lock();
                    // A timer re-armed while we waited for the lock owns the slot now.
                    if state.timer.as_ref().map(|(s, _)| *s) != Some(seq) {
                        return;
                    }
                    state.timer = None;
                    if !state.running {
                        Self::evaluate(&inner, &mut state, false);
                    }
                });
                state.timer = Some((seq, timer));
                return;
            }
        }

        state.cancel_timer();
        state.running = true;
        state.change_requested_at = None;
        state.last_start = Some(now);
        this.running_tx.send_replace(true);

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let run = (inner.handler)();
            // A panicking handler must not wedge the scheduler.
            let outcome = tokio::spawn(run).await;
            if let Err(e) = outcome {
                tracing::error!(error = %e, "scheduled handler failed");
            }

            let mut state = inner.lock();
            state.running = false;
            inner.running_tx.send_replace(false);
            Self::evaluate(&inner, &mut state, false);
        });
    }
}
