//! Process-exit interception.
//!
//! Code that wants to terminate the process calls [`exit`] instead of
//! `std::process::exit`. While at least one [`ExitInterception`] is
//! installed (a client waiting on its first connection attempt), the request
//! is captured. When the last interception is released, the first captured
//! code is replayed.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Replacement for `std::process::exit`, mainly for tests.
pub type ExitHandler = Arc<dyn Fn(i32) + Send + Sync>;

struct GuardState {
    holders: usize,
    pending: Option<i32>,
    handler: Option<ExitHandler>,
}

static STATE: Mutex<GuardState> = parking_lot::const_mutex(GuardState {
    holders: 0,
    pending: None,
    handler: None,
});

/// Terminate the process with `code`, unless interception is active.
pub fn exit(code: i32) {
    let handler = {
        let mut state = STATE.lock();
        if state.holders > 0 {
            debug!(code, "Exit requested during pending start, deferring");
            state.pending.get_or_insert(code);
            return;
        }
        state.handler.clone()
    };
    match handler {
        Some(handler) => handler(code),
        None => std::process::exit(code),
    }
}

/// Whether an exit requested now would be deferred.
pub fn is_intercepting() -> bool {
    STATE.lock().holders > 0
}

/// Install a handler that replaces `std::process::exit`. Returns the
/// previous handler. `None` restores real termination.
pub fn set_exit_handler(handler: Option<ExitHandler>) -> Option<ExitHandler> {
    std::mem::replace(&mut STATE.lock().handler, handler)
}

/// Guard that defers [`exit`] while alive.
#[must_use = "interception ends when the guard is dropped"]
pub struct ExitInterception {
    active: bool,
}

impl ExitInterception {
    pub fn install() -> Self {
        STATE.lock().holders += 1;
        Self { active: true }
    }

    /// Stop intercepting and replay a captured exit if this was the last
    /// guard. Dropping the guard does the same.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let replay = {
            let mut state = STATE.lock();
            state.holders = state.holders.saturating_sub(1);
            if state.holders == 0 {
                state.pending.take()
            } else {
                None
            }
        };
        if let Some(code) = replay {
            debug!(code, "Replaying deferred exit");
            exit(code);
        }
    }
}

impl Drop for ExitInterception {
    fn drop(&mut self) {
        self.release_inner();
    }
}
