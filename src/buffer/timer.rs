//! Periodic Timer - Restartable scheduled callback
//!
//! Drives time-triggered flushes. The callback is awaited inside the timer
//! task, so a tick never overlaps the previous one: while a flush runs the
//! timer is effectively paused, and the next period starts counting once the
//! flush returns.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::Result;

/// Shortest period a timer accepts. Shorter periods are clamped up.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Callback invoked on every tick.
pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct TimerRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A restartable periodic callback running on the tokio runtime.
pub struct PeriodicTimer {
    name: &'static str,
    period: Mutex<Duration>,
    tick: TickFn,
    run: Mutex<Option<TimerRun>>,
}

impl PeriodicTimer {
    /// Create a stopped timer. The period is clamped to [`MIN_FLUSH_INTERVAL`].
    pub fn new(name: &'static str, period: Duration, tick: TickFn) -> Self {
        Self {
            name,
            period: Mutex::new(clamp_period(period)),
            tick,
            run: Mutex::new(None),
        }
    }

    /// Current period
    pub fn period(&self) -> Duration {
        *self.period.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the timer task is currently scheduled
    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Start ticking. A no-op when already running.
    ///
    /// Fails with `StashError::NoRuntime` outside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let mut run = self.run.lock()?;
        if run.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Ok(());
        }

        let period = self.period();
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_timer_loop(
            self.name,
            period,
            Arc::clone(&self.tick),
            cancel.clone(),
        ));

        debug!(timer = self.name, period_ms = period.as_millis() as u64, "Timer started");
        *run = Some(TimerRun { cancel, handle });
        Ok(())
    }

    /// Stop ticking. A tick already in progress runs to completion.
    pub fn stop(&self) {
        let run = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(run) = run {
            run.cancel.cancel();
            debug!(timer = self.name, "Timer stopped");
        }
    }

    /// Change the period and restart the timer if it was running.
    pub fn set_period(&self, period: Duration) -> Result<()> {
        let was_running = self.is_running();
        self.stop();
        *self.period.lock()? = clamp_period(period);

        info!(
            timer = self.name,
            period_ms = self.period().as_millis() as u64,
            "Timer period changed"
        );

        if was_running {
            self.start()?;
        }
        Ok(())
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build a tick that runs `tick` against `target` for as long as the
/// component is alive. Holding only a weak reference keeps the timer from
/// extending the lifetime of the component that owns it.
pub(crate) fn weak_tick<I, F, Fut>(target: &Arc<I>, tick: F) -> TickFn
where
    I: Send + Sync + 'static,
    F: Fn(Arc<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(target);
    Arc::new(move || match weak.upgrade() {
        Some(target) => tick(target).boxed(),
        None => futures::future::ready(()).boxed(),
    })
}

fn clamp_period(period: Duration) -> Duration {
    period.max(MIN_FLUSH_INTERVAL)
}

async fn run_timer_loop(
    name: &'static str,
    period: Duration,
    tick: TickFn,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    // An overrunning tick pushes the schedule back instead of bursting.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => (tick)().await,
        }
    }

    debug!(timer = name, "Timer loop exited");
}
