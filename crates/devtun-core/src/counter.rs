//! Idle-timeout debouncer for served sessions.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct CounterState {
    count: i64,
    /// Bumped every time the count drops to zero; a pending check only
    /// fires if the generation it captured is still current.
    generation: u64,
}

/// Counts live sessions and fires `on_timeout` once nothing has been
/// connected for the configured timeout.
///
/// A zero timeout disables the callback entirely.
#[derive(Clone)]
pub struct ConnectionCounter {
    state: Arc<Mutex<CounterState>>,
    timeout: Duration,
    on_timeout: TimeoutCallback,
}

impl ConnectionCounter {
    pub fn new(timeout: Duration, on_timeout: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(CounterState::default())),
            timeout,
            on_timeout: Arc::new(on_timeout),
        }
    }

    pub fn add(&self) {
        let mut state = self.lock();
        state.count += 1;
        debug!(count = state.count, "connection added");
    }

    /// Must be called from within a tokio runtime.
    pub fn dec(&self) {
        let generation = {
            let mut state = self.lock();
            state.count -= 1;
            debug!(count = state.count, "connection removed");
            if state.count > 0 || self.timeout.is_zero() {
                return;
            }
            state.generation += 1;
            state.generation
        };

        let state = self.state.clone();
        let timeout = self.timeout;
        let on_timeout = self.on_timeout.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let state = state.lock().unwrap_or_else(|e| e.into_inner());
                state.generation == generation && state.count <= 0
            };
            if expired {
                debug!(?timeout, "no connections within timeout");
                on_timeout();
            }
        });
    }

    pub fn count(&self) -> i64 {
        self.lock().count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
