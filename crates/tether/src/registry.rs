//! The session registry and its idle-eviction janitor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RegistryConfig;
use crate::handle::Connection;
use crate::id::{IdGenerator, UuidGenerator};
use crate::session::{Session, SessionInfo};
use crate::{Error, Result};

/// Why a session is being closed, for logs.
#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Removed,
    Evicted,
    Shutdown,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Removed => "removed",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Aggregate counters for a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live sessions.
    pub live: usize,
    /// Live sessions with an open auxiliary channel.
    pub with_channel: usize,
    /// Sessions created over the registry's lifetime.
    pub created_total: u64,
    /// Sessions evicted for idleness over the registry's lifetime.
    pub evicted_total: u64,
    /// Longest idle time among live sessions.
    pub max_idle: Duration,
}

/// The process-wide authority for live sessions.
///
/// All membership changes happen under one lock. Handle I/O never does:
/// sessions are taken out of the map first and closed afterwards, each close
/// bounded by [`RegistryConfig::close_timeout`].
pub struct SessionRegistry<C: Connection> {
    /// Live sessions indexed by id.
    sessions: Mutex<HashMap<String, Arc<Session<C>>>>,
    /// Configuration.
    config: RegistryConfig,
    /// Candidate id source.
    ids: Box<dyn IdGenerator>,
    /// Stops the janitor.
    cancel: CancellationToken,
    /// Janitor task handle (if started).
    janitor: Mutex<Option<JoinHandle<()>>>,
    /// Set once by `shutdown`, read under the sessions lock.
    shut_down: AtomicBool,
    created_total: AtomicU64,
    evicted_total: AtomicU64,
}

impl<C: Connection> SessionRegistry<C> {
    /// Creates a registry without a janitor.
    ///
    /// Idle sessions are only evicted when [`sweep`](Self::sweep) is called.
    /// Use [`start`](Self::start) for the usual self-sweeping registry.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the configuration is invalid.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        info!(
            idle_timeout_secs = config.idle_timeout.as_secs(),
            sweep_interval_secs = config.sweep_interval.as_secs(),
            max_sessions = ?config.max_sessions,
            "Session registry initialized"
        );
        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            ids: Box::new(UuidGenerator),
            cancel: CancellationToken::new(),
            janitor: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            created_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
        })
    }

    /// Creates a registry and starts its janitor.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the configuration is invalid.
    pub fn start(config: RegistryConfig) -> Result<Arc<Self>> {
        let registry = Arc::new(Self::new(config)?);
        registry.start_janitor();
        Ok(registry)
    }

    /// Replaces the id generator.
    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    /// Returns the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Locks the map, first dropping any session that was closed while
    /// still registered. A closed session is never reported as live.
    fn live_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session<C>>>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, session| !session.is_closed());
        sessions
    }

    /// Starts the background janitor.
    ///
    /// Does nothing if it is already running or the registry is shut down.
    /// Must be called from within a tokio runtime.
    pub fn start_janitor(self: &Arc<Self>) {
        let mut janitor = self.janitor.lock();
        if janitor.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let registry = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let cancel = self.cancel.clone();
        *janitor = Some(tokio::spawn(run_janitor(registry, interval, cancel)));

        debug!(
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Session janitor started"
        );
    }

    /// Registers an established connection and returns its new session id.
    ///
    /// # Errors
    ///
    /// See [`create_labeled`](Self::create_labeled).
    pub fn create(&self, primary: C) -> Result<String> {
        self.create_labeled(primary, None)
    }

    /// Registers an established connection with a descriptive label.
    ///
    /// On any error the registry is unchanged and the connection is closed
    /// in the background.
    ///
    /// # Errors
    ///
    /// - `Error::CapacityReached` if `max_sessions` live sessions exist.
    /// - `Error::RegistryExhausted` if every candidate id collided.
    /// - `Error::ShutDown` after [`shutdown`](Self::shutdown).
    pub fn create_labeled(&self, primary: C, label: Option<String>) -> Result<String> {
        let mut sessions = self.live_sessions();

        if self.shut_down.load(Ordering::Acquire) {
            drop(sessions);
            return Err(self.reject(primary, Error::ShutDown));
        }

        if let Some(max) = self.config.max_sessions {
            if sessions.len() >= max {
                warn!(
                    max,
                    current = sessions.len(),
                    label = ?label,
                    "Maximum sessions reached, rejecting session"
                );
                drop(sessions);
                return Err(self.reject(primary, Error::CapacityReached { max }));
            }
        }

        let Some(id) = self.fresh_id(&sessions) else {
            let attempts = self.config.max_id_attempts;
            error!(attempts, "No free session id, rejecting session");
            drop(sessions);
            return Err(self.reject(primary, Error::RegistryExhausted { attempts }));
        };

        sessions.insert(
            id.clone(),
            Arc::new(Session::new(id.clone(), label.clone(), primary)),
        );
        let total = sessions.len();
        drop(sessions);

        self.created_total.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id = %id,
            label = ?label,
            total_sessions = total,
            "Session created"
        );
        Ok(id)
    }

    /// Draws candidate ids until one is free.
    fn fresh_id(&self, sessions: &HashMap<String, Arc<Session<C>>>) -> Option<String> {
        for attempt in 1..=self.config.max_id_attempts {
            let id = self.ids.generate();
            if !sessions.contains_key(&id) {
                return Some(id);
            }
            debug!(session_id = %id, attempt, "Session id collision, regenerating");
        }
        None
    }

    /// Closes a connection the registry refused, off the caller's path.
    fn reject(&self, mut primary: C, err: Error) -> Error {
        let timeout = self.config.close_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match tokio::time::timeout(timeout, primary.close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(close_err)) => {
                            warn!(error = %close_err, "Failed to close rejected connection");
                        }
                        Err(_) => {
                            warn!(
                                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                                "Closing rejected connection timed out"
                            );
                        }
                    }
                });
            }
            Err(_) => {
                warn!(
                    kind = primary.kind(),
                    "No runtime to close rejected connection, dropping it"
                );
            }
        }
        err
    }

    /// Looks up a live session.
    ///
    /// Does not touch the session; callers touch it after doing useful work
    /// so that lookups alone never keep a session alive.
    pub fn get(&self, id: &str) -> Option<Arc<Session<C>>> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get(id).cloned()?;
        if session.is_closed() {
            sessions.remove(id);
            return None;
        }
        Some(session)
    }

    /// Like [`get`](Self::get), for callers that want a `Result`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no live session has this id.
    pub fn require(&self, id: &str) -> Result<Arc<Session<C>>> {
        self.get(id).ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Resets the idle clock of a session. Returns `false` if it is not live.
    pub fn touch(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Whether a live session has this id.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Returns the number of live sessions.
    pub fn len(&self) -> usize {
        self.live_sessions().len()
    }

    /// Whether there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.live_sessions().is_empty()
    }

    /// Removes and closes a session. Returns `false` if it was not live.
    ///
    /// Close errors are logged; the session is gone either way.
    pub async fn remove(&self, id: &str) -> bool {
        let (removed, remaining) = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(id);
            (removed, sessions.len())
        };

        let Some(session) = removed else {
            debug!(session_id = %id, "Remove requested for unknown session");
            return false;
        };

        info!(
            session_id = %id,
            duration_secs = session.age().as_secs(),
            remaining_sessions = remaining,
            "Session removed"
        );
        self.close_session(&session, CloseReason::Removed).await;
        true
    }

    /// Returns a snapshot of every live session.
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.live_sessions();
        sessions.values().map(|session| session.describe()).collect()
    }

    /// Returns aggregate counters.
    pub fn stats(&self) -> RegistryStats {
        let sessions = self.live_sessions();
        let mut stats = RegistryStats {
            live: sessions.len(),
            created_total: self.created_total.load(Ordering::Relaxed),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
            ..RegistryStats::default()
        };
        for session in sessions.values() {
            let info = session.describe();
            if info.channel_open {
                stats.with_channel += 1;
            }
            stats.max_idle = stats.max_idle.max(info.idle);
        }
        stats
    }

    /// Evicts every session idle longer than the configured timeout.
    ///
    /// Returns the number of sessions evicted. This is the janitor's step;
    /// registries built with [`new`](Self::new) call it themselves.
    pub async fn sweep(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let mut expired = Vec::new();
        let remaining = {
            let mut sessions = self.live_sessions();
            sessions.retain(|_, session| {
                if session.idle_duration() > timeout {
                    expired.push(Arc::clone(session));
                    false
                } else {
                    true
                }
            });
            sessions.len()
        };

        if expired.is_empty() {
            return 0;
        }

        for session in &expired {
            warn!(
                session_id = %session.id(),
                idle_secs = session.idle_duration().as_secs(),
                timeout_secs = timeout.as_secs(),
                "Session timed out due to inactivity"
            );
        }

        let evicted = expired.len();
        self.evicted_total
            .fetch_add(evicted as u64, Ordering::Relaxed);
        join_all(
            expired
                .iter()
                .map(|session| self.close_session(session, CloseReason::Evicted)),
        )
        .await;

        debug!(evicted, active_sessions = remaining, "Session sweep complete");
        evicted
    }

    /// Stops the janitor, then closes and removes every session.
    ///
    /// Returns the number of sessions closed. Later calls return 0, and
    /// `create` fails with `Error::ShutDown` from then on.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        let janitor = self.janitor.lock().take();
        if let Some(handle) = janitor {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "Session janitor ended abnormally");
                }
            }
        }

        let drained: Vec<Arc<Session<C>>> = {
            let mut sessions = self.sessions.lock();
            self.shut_down.store(true, Ordering::Release);
            sessions.drain().map(|(_, session)| session).collect()
        };

        let closed = drained.len();
        info!(session_count = closed, "Shutting down session registry");
        join_all(
            drained
                .iter()
                .map(|session| self.close_session(session, CloseReason::Shutdown)),
        )
        .await;

        closed
    }

    /// Closes a session that is already out of the map, logging failures.
    async fn close_session(&self, session: &Session<C>, reason: CloseReason) {
        let report = session.close_with(self.config.close_timeout).await;
        if report.already_closed {
            debug!(session_id = %session.id(), reason = reason.as_str(), "Session already closed");
            return;
        }
        if report.is_clean() {
            debug!(session_id = %session.id(), reason = reason.as_str(), "Session closed");
            return;
        }
        for failure in &report.failures {
            warn!(
                session_id = %session.id(),
                reason = reason.as_str(),
                error = %failure,
                "Session handle did not close cleanly"
            );
        }
    }
}

async fn run_janitor<C: Connection>(
    registry: Weak<SessionRegistry<C>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Session janitor stopping");
                break;
            }
            _ = ticker.tick() => {
                let Some(registry) = registry.upgrade() else {
                    debug!("Session registry dropped, janitor exiting");
                    break;
                };
                registry.sweep().await;
            }
        }
    }
}

impl<C: Connection> Drop for SessionRegistry<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.janitor.get_mut().take() {
            handle.abort();
        }
    }
}
