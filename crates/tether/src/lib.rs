#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::doc_markdown)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # Tether
//!
//! A registry for long-lived remote sessions that are expensive to
//! establish and must be shared across concurrent request handlers.
//!
//! Tether keeps the set of live sessions behind a single lock, issues
//! unique session ids, and runs a background janitor that closes sessions
//! left idle for longer than a configured timeout.
//!
//! ## Features
//!
//! - **Opaque ids**: collision-checked identifiers with a bounded retry budget
//! - **Idle eviction**: a janitor task sweeps stale sessions on a fixed interval
//! - **Bounded teardown**: every handle close runs under a timeout, outside the lock
//! - **Lazy channels**: an auxiliary sub-channel is opened on first use and reused
//! - **Explicit shutdown**: stops the janitor and closes every session exactly once
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether::{RegistryConfig, SessionRegistry};
//! use std::time::Duration;
//!
//! let config = RegistryConfig::default()
//!     .with_idle_timeout(Duration::from_secs(30 * 60))
//!     .with_sweep_interval(Duration::from_secs(60));
//! let registry = SessionRegistry::start(config)?;
//!
//! // The connection layer establishes the handle; the registry owns it.
//! let id = registry.create(connect("10.0.0.5").await?)?;
//!
//! if let Some(session) = registry.get(&id) {
//!     let mut handles = session.handles().await;
//!     handles.primary_mut()?.run("uptime").await?;
//!     drop(handles);
//!     session.touch();
//! }
//!
//! registry.remove(&id).await;
//! registry.shutdown().await;
//! ```

use std::time::Duration;

use thiserror::Error;

pub mod config;
pub mod handle;
pub mod id;
mod registry;
mod session;

pub use config::{ConfigLoadError, RegistryConfig};
pub use handle::{Connection, Handle, HandleError, NoChannel};
pub use id::{IdGenerator, SequentialGenerator, UuidGenerator};
pub use registry::{RegistryStats, SessionRegistry};
pub use session::{Session, SessionHandles, SessionInfo, format_idle};

// -----------------------------------------------------------------------------
// Error Types
// -----------------------------------------------------------------------------

/// Errors that can occur while managing sessions.
///
/// Lookups of unknown ids are routine and are reported through `Option` and
/// `bool` returns, not through this enum. [`NotFound`](Error::NotFound) exists
/// for helper APIs that must produce a `Result`.
///
/// # Recovery Strategies
///
/// | Error Variant | Recovery Strategy |
/// |--------------|-------------------|
/// | [`NotFound`](Error::NotFound) | Reconnect and call `create` again |
/// | [`RegistryExhausted`](Error::RegistryExhausted) | Retry later, alert an operator |
/// | [`CapacityReached`](Error::CapacityReached) | Remove idle sessions or retry later |
/// | [`HandleCloseFailed`](Error::HandleCloseFailed) | Log only, the session is already gone |
/// | [`CloseTimedOut`](Error::CloseTimedOut) | Log only, the session is already gone |
/// | [`SessionClosed`](Error::SessionClosed) | Reconnect and call `create` again |
/// | [`Channel`](Error::Channel) | Retry, or fall back to the primary handle |
/// | [`Configuration`](Error::Configuration) | Fix the registry configuration |
/// | [`ShutDown`](Error::ShutDown) | The process is tearing down, stop issuing work |
#[derive(Error, Debug)]
pub enum Error {
    /// No live session has the given id.
    ///
    /// The session was never created, was removed, or was evicted.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Every generated id collided with a live one.
    ///
    /// Practically unreachable with the default generator.
    #[error("registry exhausted: no free session id after {attempts} attempts")]
    RegistryExhausted {
        /// Number of ids tried before giving up.
        attempts: usize,
    },

    /// The configured session cap is reached.
    #[error("registry full: {max} live sessions")]
    CapacityReached {
        /// The configured maximum.
        max: usize,
    },

    /// Closing an underlying handle returned an error.
    #[error("failed to close {kind} for session {id}: {source}")]
    HandleCloseFailed {
        /// Session the handle belonged to.
        id: String,
        /// Kind of handle, as reported by [`Handle::kind`].
        kind: &'static str,
        /// Error reported by the handle.
        #[source]
        source: HandleError,
    },

    /// Closing an underlying handle did not finish in time.
    #[error("closing session {id} timed out after {timeout:?}")]
    CloseTimedOut {
        /// Session the handle belonged to.
        id: String,
        /// The close timeout that elapsed.
        timeout: Duration,
    },

    /// The session's handles have already been released.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Opening the auxiliary channel failed.
    #[error("channel error: {0}")]
    Channel(#[source] HandleError),

    /// Registry configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The registry has been shut down.
    #[error("registry is shut down")]
    ShutDown,
}

/// A specialized [`Result`] type for tether operations.
///
/// This type alias defaults to [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
