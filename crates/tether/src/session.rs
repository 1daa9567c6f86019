//! A single registry-managed session and the handles it owns.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::duration_ms;
use crate::handle::{Connection, Handle};
use crate::{Error, Result};

/// Handle slots. Both are `None` once the session is closed.
struct Slots<C: Connection> {
    primary: Option<C>,
    channel: Option<C::Channel>,
}

/// A live remote session: one primary connection, an optional lazily opened
/// channel, and the activity clock used for idle eviction.
pub struct Session<C: Connection> {
    id: String,
    label: Option<String>,
    created_at: Instant,
    last_active: Mutex<Instant>,
    slots: AsyncMutex<Slots<C>>,
    closed: AtomicBool,
    channel_open: AtomicBool,
    /// Set when a close gave up waiting for the handles; whoever releases
    /// the handles next closes them with this timeout.
    deferred_close: Mutex<Option<Duration>>,
}

impl<C: Connection> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("idle", &self.idle_duration())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C: Connection> Session<C> {
    pub(crate) fn new(id: String, label: Option<String>, primary: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            label,
            created_at: now,
            last_active: Mutex::new(now),
            slots: AsyncMutex::new(Slots {
                primary: Some(primary),
                channel: None,
            }),
            closed: AtomicBool::new(false),
            channel_open: AtomicBool::new(false),
            deferred_close: Mutex::new(None),
        }
    }

    /// Returns the session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the caller-supplied label, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Resets the idle clock.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
        debug!(session_id = %self.id, "Session touched");
    }

    /// Returns the time since the last [`touch`](Self::touch), or since
    /// creation if the session was never touched.
    pub fn idle_duration(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Returns the time since the session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the session's handles have been released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Locks the session's handles for exclusive use.
    ///
    /// Waits while another caller holds them. Does not touch the session.
    pub async fn handles(&self) -> SessionHandles<'_, C> {
        SessionHandles {
            session: self,
            slots: self.slots.lock().await,
        }
    }

    /// Returns a snapshot suitable for reporting.
    pub fn describe(&self) -> SessionInfo {
        let idle = self.idle_duration();
        SessionInfo {
            id: self.id.clone(),
            label: self.label.clone(),
            idle,
            idle_display: format_idle(idle),
            age: self.age(),
            channel_open: self.channel_open.load(Ordering::Acquire),
        }
    }

    /// Closes the channel, then the primary connection, bounding each step
    /// by `timeout`.
    ///
    /// Safe to call repeatedly. Only the registry closes sessions, after
    /// taking them out of its map.
    ///
    /// Waiting for a caller to release the handles counts as a step. If it
    /// times out the session is still marked closed and the report carries
    /// `CloseTimedOut`; the handles are then closed, with the same bound,
    /// as soon as that caller drops its [`SessionHandles`].
    pub(crate) async fn close_with(&self, timeout: Duration) -> CloseReport {
        let mut slots = match tokio::time::timeout(timeout, self.slots.lock()).await {
            Ok(slots) => slots,
            Err(_) => {
                self.closed.store(true, Ordering::Release);
                self.channel_open.store(false, Ordering::Release);
                *self.deferred_close.lock() = Some(timeout);
                // The holder may have let go after the timeout fired but
                // before the deferral was recorded.
                match self.slots.try_lock() {
                    Ok(slots) if self.deferred_close.lock().take().is_some() => slots,
                    _ => {
                        debug!(session_id = %self.id, "Session busy, handles close on release");
                        return CloseReport {
                            already_closed: false,
                            failures: vec![Error::CloseTimedOut {
                                id: self.id.clone(),
                                timeout,
                            }],
                        };
                    }
                }
            }
        };

        if slots.primary.is_none() && slots.channel.is_none() {
            return CloseReport {
                already_closed: true,
                failures: Vec::new(),
            };
        }

        self.closed.store(true, Ordering::Release);
        self.channel_open.store(false, Ordering::Release);

        let channel = slots.channel.take();
        let primary = slots.primary.take();
        let failures = close_handles(&self.id, channel, primary, timeout).await;

        debug!(
            session_id = %self.id,
            clean = failures.is_empty(),
            "Session handles released"
        );

        CloseReport {
            already_closed: false,
            failures,
        }
    }
}

/// Closes the channel, then the primary, collecting failures in that order.
async fn close_handles<C: Connection>(
    id: &str,
    channel: Option<C::Channel>,
    primary: Option<C>,
    timeout: Duration,
) -> Vec<Error> {
    let mut failures = Vec::new();
    if let Some(mut channel) = channel {
        if let Err(err) = close_bounded(id, &mut channel, timeout).await {
            failures.push(err);
        }
    }
    if let Some(mut primary) = primary {
        if let Err(err) = close_bounded(id, &mut primary, timeout).await {
            failures.push(err);
        }
    }
    failures
}

async fn close_bounded<H: Handle>(id: &str, handle: &mut H, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, handle.close()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(Error::HandleCloseFailed {
            id: id.to_string(),
            kind: handle.kind(),
            source,
        }),
        Err(_) => Err(Error::CloseTimedOut {
            id: id.to_string(),
            timeout,
        }),
    }
}

/// Exclusive access to a session's handles.
///
/// Holding this guard serializes all handle use for the session, including
/// the registry's close. Keep it only for the duration of one operation.
pub struct SessionHandles<'a, C: Connection> {
    session: &'a Session<C>,
    slots: AsyncMutexGuard<'a, Slots<C>>,
}

impl<C: Connection> SessionHandles<'_, C> {
    /// Returns the primary connection.
    ///
    /// # Errors
    /// Returns [`Error::SessionClosed`] if the session has been closed.
    pub fn primary(&self) -> Result<&C> {
        self.slots
            .primary
            .as_ref()
            .ok_or_else(|| Error::SessionClosed(self.session.id.clone()))
    }

    /// Returns the primary connection mutably.
    ///
    /// # Errors
    /// Returns [`Error::SessionClosed`] if the session has been closed.
    pub fn primary_mut(&mut self) -> Result<&mut C> {
        let session = self.session;
        self.slots
            .primary
            .as_mut()
            .ok_or_else(|| Error::SessionClosed(session.id.clone()))
    }

    /// Returns the auxiliary channel, opening it on first use.
    ///
    /// # Errors
    /// Returns [`Error::SessionClosed`] if the session has been closed, or
    /// [`Error::Channel`] if the connection could not open the channel.
    pub async fn channel(&mut self) -> Result<&mut C::Channel> {
        let session = self.session;
        let slots = &mut *self.slots;

        if slots.channel.is_none() {
            let primary = slots
                .primary
                .as_mut()
                .ok_or_else(|| Error::SessionClosed(session.id.clone()))?;
            let channel = primary.open_channel().await.map_err(Error::Channel)?;
            debug!(session_id = %session.id, kind = channel.kind(), "Session channel opened");
            slots.channel = Some(channel);
            session.channel_open.store(true, Ordering::Release);
        }

        slots
            .channel
            .as_mut()
            .ok_or_else(|| Error::SessionClosed(session.id.clone()))
    }

    /// Whether the auxiliary channel is currently open.
    pub fn has_channel(&self) -> bool {
        self.slots.channel.is_some()
    }

    /// Closes the auxiliary channel only. The next [`channel`](Self::channel)
    /// call opens a fresh one.
    ///
    /// # Errors
    /// Returns [`Error::HandleCloseFailed`] if the channel reported an error.
    /// The channel is discarded either way.
    pub async fn close_channel(&mut self) -> Result<()> {
        let Some(mut channel) = self.slots.channel.take() else {
            return Ok(());
        };
        self.session.channel_open.store(false, Ordering::Release);
        channel
            .close()
            .await
            .map_err(|source| Error::HandleCloseFailed {
                id: self.session.id.clone(),
                kind: channel.kind(),
                source,
            })
    }
}

impl<C: Connection> Drop for SessionHandles<'_, C> {
    fn drop(&mut self) {
        let Some(timeout) = self.session.deferred_close.lock().take() else {
            return;
        };
        let channel = self.slots.channel.take();
        let primary = self.slots.primary.take();
        self.session.channel_open.store(false, Ordering::Release);
        if channel.is_none() && primary.is_none() {
            return;
        }

        let id = self.session.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let failures = close_handles(&id, channel, primary, timeout).await;
                    for failure in &failures {
                        warn!(session_id = %id, error = %failure, "Deferred session close failed");
                    }
                    debug!(
                        session_id = %id,
                        clean = failures.is_empty(),
                        "Session handles released after busy close"
                    );
                });
            }
            Err(_) => {
                warn!(session_id = %id, "No runtime for deferred close, dropping handles");
            }
        }
    }
}

/// Outcome of closing a session.
#[derive(Debug, Default)]
pub(crate) struct CloseReport {
    /// The session had already been closed; nothing was done.
    pub(crate) already_closed: bool,
    /// Errors from individual handles, in close order.
    pub(crate) failures: Vec<Error>,
}

impl CloseReport {
    /// Whether every handle closed without error.
    pub(crate) fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session id.
    pub id: String,
    /// Caller-supplied label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Time since last activity.
    #[serde(rename = "idle_ms", with = "duration_ms")]
    pub idle: Duration,
    /// Idle time as a short string, e.g. `3m07s`.
    #[serde(rename = "idle")]
    pub idle_display: String,
    /// Time since creation.
    #[serde(rename = "age_ms", with = "duration_ms")]
    pub age: Duration,
    /// Whether the auxiliary channel is open.
    pub channel_open: bool,
}

/// Formats a duration as a compact string: `42s`, `3m07s`, `1h02m`.
pub fn format_idle(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
