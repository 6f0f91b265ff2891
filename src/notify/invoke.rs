use std::any::Any;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use crossbeam_channel::RecvTimeoutError;

use crate::CallbackError;

/// Result of running user code under a budget.
#[derive(Debug)]
pub enum CallbackOutcome<T> {
    Completed(T),
    /// The budget ran out; the worker thread was abandoned and its result
    /// will be discarded
    TimedOut,
    Failed(CallbackError),
}

impl<T> CallbackOutcome<T> {
    pub fn map<U>(
        self,
        f: impl FnOnce(T) -> U,
    ) -> CallbackOutcome<U> {
        match self {
            CallbackOutcome::Completed(value) => CallbackOutcome::Completed(f(value)),
            CallbackOutcome::TimedOut => CallbackOutcome::TimedOut,
            CallbackOutcome::Failed(error) => CallbackOutcome::Failed(error),
        }
    }
}

/// Runs `f` on a dedicated thread and waits at most `budget` for it.
///
/// `None` waits for completion. Panics inside `f` become
/// [`CallbackOutcome::Failed`]. An abandoned worker keeps running, together
/// with anything moved into `f`, until the user code returns.
pub fn invoke_with_deadline<T, F>(
    label: &str,
    budget: Option<Duration>,
    f: F,
) -> CallbackOutcome<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CallbackError> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    let spawned = thread::Builder::new().name(label.to_string()).spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(f));
        // receiver is gone if we were abandoned
        let _ = tx.send(result);
    });
    if let Err(e) = spawned {
        return CallbackOutcome::Failed(CallbackError::Application(format!(
            "failed to spawn callback thread: {e}"
        )));
    }

    let received = match budget {
        Some(budget) => rx.recv_timeout(budget),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };

    match received {
        Ok(Ok(Ok(value))) => CallbackOutcome::Completed(value),
        Ok(Ok(Err(e))) => CallbackOutcome::Failed(e),
        Ok(Err(panic)) => CallbackOutcome::Failed(CallbackError::Application(format!(
            "callback panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(RecvTimeoutError::Timeout) => CallbackOutcome::TimedOut,
        Err(RecvTimeoutError::Disconnected) => {
            CallbackOutcome::Failed(CallbackError::Application("callback thread vanished".to_string()))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
