//! Per-request cancellation
//!
//! A [`CancellationController`] is a one-shot flag shared by the transport
//! (client disconnect), the delegate (explicit cancel) and whichever pipeline
//! phase is currently live. Each phase parks its own cancel action in the
//! controller's [`CancelSlot`]; the first `cancel()` fires it exactly once.
//!
//! ```text
//!   disconnect ─┐
//!   delegate   ─┼─> cancel() ──> flag = true ──> slot.take()() ──> watchdog
//!   shutdown   ─┘                                  (download | compute)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Action run once when a request is cancelled
pub type CancelAction = Box<dyn FnOnce() + Send + 'static>;

/// Holds at most one cancel action
#[derive(Default)]
pub struct CancelSlot {
    action: Option<CancelAction>,
}

impl CancelSlot {
    /// Put an action in the slot, returning the one it replaced
    pub fn replace(&mut self, action: CancelAction) -> Option<CancelAction> {
        self.action.replace(action)
    }

    /// Remove the action
    pub fn take(&mut self) -> Option<CancelAction> {
        self.action.take()
    }

    /// Whether an action is present
    pub fn is_armed(&self) -> bool {
        self.action.is_some()
    }
}

impl fmt::Debug for CancelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSlot")
            .field("armed", &self.is_armed())
            .finish()
    }
}

type EscalationHook = Arc<dyn Fn() + Send + Sync>;

/// Dead-man's switch for cancelled requests that fail to unwind.
///
/// After a cancel, a request that has not completed within
/// `warning_timeout` is logged; if it is still running `crash_timeout`
/// later the monitor escalates. With `terminate` set the escalation aborts
/// the process so a supervisor can restart it.
#[derive(Clone)]
pub struct CancellationMonitor {
    /// Delay before the warning
    pub warning_timeout: Duration,
    /// Additional delay, after the warning, before escalating
    pub crash_timeout: Duration,
    /// Abort the process on escalation
    pub terminate: bool,
    escalation: Option<EscalationHook>,
}

static GLOBAL_MONITOR: RwLock<Option<CancellationMonitor>> = RwLock::new(None);

impl CancellationMonitor {
    /// Create a monitor that aborts the process on escalation
    pub fn new(warning_timeout: Duration, crash_timeout: Duration) -> Self {
        Self {
            warning_timeout,
            crash_timeout,
            terminate: true,
            escalation: None,
        }
    }

    /// Only log on escalation
    pub fn log_only(mut self) -> Self {
        self.terminate = false;
        self
    }

    /// Replace the escalation with a custom hook
    pub fn with_escalation(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.escalation = Some(Arc::new(hook));
        self
    }

    /// Install the process-wide default monitor
    pub fn set_global(monitor: Option<CancellationMonitor>) {
        let mut global = GLOBAL_MONITOR.write().unwrap_or_else(|e| e.into_inner());
        *global = monitor;
    }

    /// The process-wide default monitor
    pub fn global() -> Option<CancellationMonitor> {
        GLOBAL_MONITOR
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn escalate(&self, label: &str) {
        if let Some(ref hook) = self.escalation {
            hook();
        } else if self.terminate {
            error!(request = label, "Cancelled request is stuck, terminating process");
            std::process::abort();
        }
    }
}

impl fmt::Debug for CancellationMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationMonitor")
            .field("warning_timeout", &self.warning_timeout)
            .field("crash_timeout", &self.crash_timeout)
            .field("terminate", &self.terminate)
            .field("custom_escalation", &self.escalation.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn mark(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait up to `timeout`; true if completion happened
    fn wait_for(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        let (done, _) = self
            .cond
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        *done
    }
}

struct Inner {
    label: String,
    cancelled: AtomicBool,
    slot: Mutex<CancelSlot>,
    token: CancellationToken,
    completion: Completion,
    monitor: Option<CancellationMonitor>,
}

/// Cancellation state of one request
#[derive(Clone)]
pub struct CancellationController {
    inner: Arc<Inner>,
}

impl CancellationController {
    /// Create a controller with the process-wide monitor
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_monitor(label, CancellationMonitor::global())
    }

    /// Create a controller with an explicit monitor
    pub fn with_monitor(label: impl Into<String>, monitor: Option<CancellationMonitor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                cancelled: AtomicBool::new(false),
                slot: Mutex::new(CancelSlot::default()),
                token: CancellationToken::new(),
                completion: Completion::default(),
                monitor,
            }),
        }
    }

    /// Request label used in logs
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Cancel the request.
    ///
    /// Idempotent and callable from any thread. Only the first call fires the
    /// registered action and arms the watchdog.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(request = %self.inner.label, "Cancelling request");
        self.inner.token.cancel();

        // Run outside the lock so the action may touch the controller.
        let action = self.lock_slot().take();
        if let Some(action) = action {
            action();
        }

        if let Some(ref monitor) = self.inner.monitor {
            if !self.is_completed() {
                self.spawn_watchdog(monitor.clone());
            }
        }
    }

    /// Whether `cancel()` has been called
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Park the cancel action of the phase that is now live.
    ///
    /// Replaces any previous action. If the request is already cancelled the
    /// action runs immediately on the calling thread.
    pub fn register(&self, action: CancelAction) {
        let run_now = {
            let mut slot = self.lock_slot();
            if self.is_cancelled() {
                Some(action)
            } else {
                slot.replace(action);
                None
            }
        };
        if let Some(action) = run_now {
            action();
        }
    }

    /// Drop the current phase action without running it
    pub fn clear(&self) {
        self.lock_slot().take();
    }

    /// Token that resolves when the request is cancelled
    pub fn token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Report that the request has finished unwinding
    pub fn mark_completed(&self) {
        self.inner.completion.mark();
    }

    /// Whether the request has finished
    pub fn is_completed(&self) -> bool {
        self.inner.completion.is_done()
    }

    fn lock_slot(&self) -> MutexGuard<'_, CancelSlot> {
        self.inner.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_watchdog(&self, monitor: CancellationMonitor) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("pictor-cancel-watchdog".to_string())
            .spawn(move || {
                if inner.completion.wait_for(monitor.warning_timeout) {
                    return;
                }
                warn!(
                    request = %inner.label,
                    timeout_ms = monitor.warning_timeout.as_millis() as u64,
                    "Cancelled request has not returned"
                );

                if inner.completion.wait_for(monitor.crash_timeout) {
                    return;
                }
                error!(
                    request = %inner.label,
                    timeout_ms = (monitor.warning_timeout + monitor.crash_timeout).as_millis() as u64,
                    "Cancelled request still has not returned"
                );
                monitor.escalate(&inner.label);
            });

        if let Err(e) = spawned {
            warn!("Failed to start cancellation watchdog: {}", e);
        }
    }
}

impl fmt::Debug for CancellationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationController")
            .field("label", &self.inner.label)
            .field("cancelled", &self.is_cancelled())
            .field("completed", &self.is_completed())
            .finish()
    }
}
