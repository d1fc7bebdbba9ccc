//! Explicit settings passed down through constructors.
//!
//! There is no process-wide configuration. A [`Settings`] value is handed to
//! the outermost object and cloned into every layer below it. The logging sink is a [`tracing::Dispatch`];
//! each operation and background worker installs it as the thread-local
//! default while it runs, so the ordinary `tracing` macros reach the injected
//! sink and nothing else.

use std::time::Duration;

use tracing::Dispatch;

/// Default deadline for establishing the TCP connection and TLS session.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on how long `close()` waits for each background worker.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level configuration and shared service objects.
#[derive(Clone, Debug)]
pub struct Settings {
    dispatch: Dispatch,
    /// Deadline for `connect()`. `Duration::ZERO` means no deadline.
    pub connect_timeout: Duration,
    /// How long `close()` waits for a background worker before detaching it.
    pub close_timeout: Duration,
}

impl Default for Settings {
    /// Settings whose logger enables no level and writes nothing.
    fn default() -> Self {
        Self::with_dispatch(Dispatch::none())
    }
}

impl Settings {
    /// Settings that log to the given dispatcher.
    pub fn with_dispatch(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Settings that log to whatever dispatcher is current on the calling
    /// thread, usually the global subscriber installed by a binary.
    pub fn inherit() -> Self {
        Self::with_dispatch(tracing::dispatcher::get_default(Dispatch::clone))
    }

    /// Override the connect deadline.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the close deadline.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// The injected logging sink.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Run `f` with this configuration's logger as the thread's default.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}
