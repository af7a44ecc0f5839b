//! Macro execution engine.

pub mod executor;
pub mod substitute;
pub mod verify;

pub use executor::MacroExecutor;
pub use substitute::AliasTable;

use std::time::Duration;
use tokio::sync::watch;

/// Macro-level timeout used when a macro declares none (or declares 0).
pub const DEFAULT_MACRO_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-step timeout used when a step carries no override.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// Polling interval for `find` / `find_by_path` / `wait_for_enabled`.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Engine-wide fallback timings. Documents may still override per macro
/// (`timeout`) and per step (`timeout_secs` / `retry_interval_ms`); these
/// apply where they don't.
#[derive(Debug, Clone, Copy)]
pub struct EngineDefaults {
    pub macro_timeout: Duration,
    pub step_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            macro_timeout: DEFAULT_MACRO_TIMEOUT,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Caller-side cancellation for a running invocation. Every executor wait
/// composes this with its own deadline; whichever fires first wins.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// The issuing half of a [`CancelToken`].
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> (CancelSource, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelSource { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. If the source is dropped
    /// without cancelling, this never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
