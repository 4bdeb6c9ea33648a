//! Session pool: bounded set of browser sessions leased one operation at a time.
//!
//! Sessions live in a fixed arena of `capacity` slots. A lease is an index
//! handle into that arena plus the capacity permit that backs it. A permit is
//! held for every slot that is not idle or empty (leased, opening, or being
//! replaced after a failure), so the number of live sessions never exceeds
//! the configured capacity.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webquery_core::{Error, Result};

use crate::capability::BrowserCapability;
use crate::types::*;

/// Pool sizing and lifetime settings.
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    pub capacity: usize,
    /// Idle sessions older than this are retired.
    pub idle_ttl: Duration,
    /// Bound on opening a replacement session in the background.
    pub open_timeout: Duration,
}

struct Session {
    id: SessionId,
    handle: BrowserHandle,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    leases: u64,
}

impl Session {
    fn new(handle: BrowserHandle) -> Self {
        Self {
            id: SessionId::new(),
            handle,
            last_used: Instant::now(),
            last_used_at: Utc::now(),
            leases: 0,
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
    }

    fn info(&self, health: SessionHealth) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            health,
            last_used: self.last_used_at,
            leases: self.leases,
        }
    }
}

enum SlotState {
    Empty,
    /// Reserved by an acquirer that is opening a new session.
    Opening,
    Idle(Session),
    Leased(Session),
    /// Failed session waiting for its background replacement.
    Unhealthy(SessionInfo),
}

struct Slot {
    generation: u64,
    state: SlotState,
}

struct PoolInner {
    capability: Arc<dyn BrowserCapability>,
    permits: Arc<Semaphore>,
    slots: Mutex<Vec<Slot>>,
    config: SessionPoolConfig,
}

/// Shared handle to the process-wide session pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

/// Exclusive, time-bounded use of one pooled session.
///
/// Must be handed back with [`SessionLease::release`]. A lease dropped
/// without release is reclaimed as unhealthy, since the state of its
/// session is unknown.
pub struct SessionLease {
    inner: Arc<PoolInner>,
    slot: usize,
    generation: u64,
    session_id: SessionId,
    handle: BrowserHandle,
    permit: Option<OwnedSemaphorePermit>,
    acquired_at: Instant,
}

impl SessionLease {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn handle(&self) -> &BrowserHandle {
        &self.handle
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Return the session. Unhealthy sessions are closed and replaced.
    pub fn release(mut self, healthy: bool) {
        if let Some(permit) = self.permit.take() {
            debug!(
                "Releasing session {} (healthy={}, held {:?})",
                self.session_id,
                healthy,
                self.acquired_at.elapsed()
            );
            self.inner.finish(self.slot, self.generation, healthy, permit);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            warn!(
                "Session {} lease dropped without release, reclaiming",
                self.session_id
            );
            self.inner.finish(self.slot, self.generation, false, permit);
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Resets a reserved slot if the acquirer is dropped mid-open.
struct OpeningGuard<'a> {
    inner: &'a PoolInner,
    slot: usize,
    armed: bool,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.inner.slots.lock();
            slots[self.slot].state = SlotState::Empty;
        }
    }
}

enum Claim {
    Reused(usize, u64, SessionId, BrowserHandle),
    Open(usize),
}

impl SessionPool {
    pub fn new(capability: Arc<dyn BrowserCapability>, config: SessionPoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                state: SlotState::Empty,
            })
            .collect();

        info!("SessionPool initialized: capacity={}", capacity);

        Self {
            inner: Arc::new(PoolInner {
                capability,
                permits: Arc::new(Semaphore::new(capacity)),
                slots: Mutex::new(slots),
                config: SessionPoolConfig { capacity, ..config },
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    /// Lease a healthy session, waiting at most `timeout` overall.
    pub async fn acquire(&self, timeout: Duration, cancel: &CancellationToken) -> Result<SessionLease> {
        let started = Instant::now();

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()) => match res {
                Err(_) => {
                    return Err(Error::PoolExhausted(format!(
                        "all {} sessions busy for {:?}",
                        self.capacity(),
                        timeout
                    )))
                }
                Ok(Err(_)) => return Err(Error::Internal("session pool is shut down".into())),
                Ok(Ok(permit)) => permit,
            },
        };

        self.retire_idle();

        match self.inner.claim()? {
            Claim::Reused(slot, generation, session_id, handle) => {
                debug!("Reusing session {} in slot {}", session_id, slot);
                Ok(SessionLease {
                    inner: self.inner.clone(),
                    slot,
                    generation,
                    session_id,
                    handle,
                    permit: Some(permit),
                    acquired_at: Instant::now(),
                })
            }
            Claim::Open(slot) => {
                let mut guard = OpeningGuard {
                    inner: self.inner.as_ref(),
                    slot,
                    armed: true,
                };
                let remaining = timeout.saturating_sub(started.elapsed());
                let handle = tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    res = tokio::time::timeout(remaining, self.inner.capability.open_session()) => match res {
                        Err(_) => return Err(Error::Timeout("opening browser session".into())),
                        Ok(Err(e)) => {
                            warn!("Failed to open browser session: {}", e);
                            return Err(e);
                        }
                        Ok(Ok(handle)) => handle,
                    },
                };

                let mut session = Session::new(handle.clone());
                session.leases = 1;
                let session_id = session.id.clone();
                let generation = {
                    let mut slots = self.inner.slots.lock();
                    let entry = &mut slots[slot];
                    entry.generation += 1;
                    entry.state = SlotState::Leased(session);
                    entry.generation
                };
                guard.armed = false;

                info!("Opened session {} in slot {}", session_id, slot);
                Ok(SessionLease {
                    inner: self.inner.clone(),
                    slot,
                    generation,
                    session_id,
                    handle,
                    permit: Some(permit),
                    acquired_at: Instant::now(),
                })
            }
        }
    }

    /// Close idle sessions unused for longer than the idle TTL. Returns how
    /// many were retired.
    pub fn retire_idle(&self) -> usize {
        let ttl = self.inner.config.idle_ttl;
        let retired: Vec<BrowserHandle> = {
            let mut slots = self.inner.slots.lock();
            let mut out = Vec::new();
            for slot in slots.iter_mut() {
                let stale = matches!(&slot.state, SlotState::Idle(s) if s.last_used.elapsed() >= ttl);
                if stale {
                    if let SlotState::Idle(session) = std::mem::replace(&mut slot.state, SlotState::Empty) {
                        debug!("Retiring idle session {}", session.id);
                        out.push(session.handle);
                    }
                }
            }
            out
        };

        let count = retired.len();
        if count > 0 {
            info!("Retired {} idle sessions", count);
            for handle in retired {
                self.inner.close_in_background(handle);
            }
        }
        count
    }

    /// Periodically retire idle sessions until the pool shuts down.
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.inner.permits.is_closed() {
                    break;
                }
                pool.retire_idle();
            }
        })
    }

    /// Refuse new leases and close every idle session. Leased sessions are
    /// closed as they come back.
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        let idle: Vec<BrowserHandle> = {
            let mut slots = self.inner.slots.lock();
            slots
                .iter_mut()
                .filter_map(|slot| match std::mem::replace(&mut slot.state, SlotState::Empty) {
                    SlotState::Idle(session) => Some(session.handle),
                    other => {
                        slot.state = other;
                        None
                    }
                })
                .collect()
        };
        info!("SessionPool shutting down, closing {} idle sessions", idle.len());
        for handle in idle {
            if let Err(e) = self.inner.capability.close(&handle).await {
                warn!("Failed to close session {}: {}", handle.remote_id, e);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.inner.slots.lock();
        let mut stats = PoolStats {
            capacity: slots.len(),
            idle: 0,
            leased: 0,
            unhealthy: 0,
            empty: 0,
            sessions: Vec::new(),
        };
        for slot in slots.iter() {
            match &slot.state {
                SlotState::Empty => stats.empty += 1,
                // An opening slot is a lease in progress.
                SlotState::Opening => stats.leased += 1,
                SlotState::Idle(s) => {
                    stats.idle += 1;
                    stats.sessions.push(s.info(SessionHealth::Idle));
                }
                SlotState::Leased(s) => {
                    stats.leased += 1;
                    stats.sessions.push(s.info(SessionHealth::Leased));
                }
                SlotState::Unhealthy(info) => {
                    stats.unhealthy += 1;
                    stats.sessions.push(info.clone());
                }
            }
        }
        stats
    }
}

impl PoolInner {
    /// Pick a slot for a permit holder: the most recently used idle session,
    /// else an empty slot reserved for opening.
    fn claim(&self) -> Result<Claim> {
        let mut slots = self.slots.lock();

        let mru = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match &slot.state {
                SlotState::Idle(s) => Some((i, s.last_used)),
                _ => None,
            })
            .max_by_key(|(_, last_used)| *last_used)
            .map(|(i, _)| i);

        if let Some(i) = mru {
            let slot = &mut slots[i];
            if let SlotState::Idle(mut session) = std::mem::replace(&mut slot.state, SlotState::Empty) {
                session.leases += 1;
                let claim = Claim::Reused(i, slot.generation, session.id.clone(), session.handle.clone());
                slot.state = SlotState::Leased(session);
                return Ok(claim);
            }
        }

        match slots.iter().position(|slot| matches!(slot.state, SlotState::Empty)) {
            Some(i) => {
                slots[i].state = SlotState::Opening;
                Ok(Claim::Open(i))
            }
            // A permit guarantees a free slot; reaching this means the
            // permit accounting is broken.
            None => Err(Error::Internal("session permit held but no free slot".into())),
        }
    }

    fn finish(self: &Arc<Self>, slot: usize, generation: u64, healthy: bool, permit: OwnedSemaphorePermit) {
        let shutting_down = self.permits.is_closed();
        let mut slots = self.slots.lock();
        let entry = &mut slots[slot];

        if entry.generation != generation || !matches!(entry.state, SlotState::Leased(_)) {
            warn!("Stale release for slot {} (generation {})", slot, generation);
            return;
        }

        let SlotState::Leased(mut session) = std::mem::replace(&mut entry.state, SlotState::Empty) else {
            return;
        };

        if healthy && !shutting_down {
            session.touch();
            entry.state = SlotState::Idle(session);
            return;
        }

        if healthy {
            drop(slots);
            self.close_in_background(session.handle);
            return;
        }

        entry.state = SlotState::Unhealthy(session.info(SessionHealth::Unhealthy));
        drop(slots);

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let inner = self.clone();
                rt.spawn(async move { inner.replace(slot, session, permit).await });
            }
            Err(_) => {
                warn!("No runtime to replace session {}, leaving slot empty", session.id);
                self.slots.lock()[slot].state = SlotState::Empty;
            }
        }
    }

    /// Close a failed session and open its replacement, holding the slot's
    /// permit until done.
    async fn replace(self: Arc<Self>, slot: usize, failed: Session, permit: OwnedSemaphorePermit) {
        let _permit = permit;

        if let Err(e) = self.capability.close(&failed.handle).await {
            debug!("Closing unhealthy session {} failed: {}", failed.id, e);
        }

        if self.permits.is_closed() {
            self.slots.lock()[slot].state = SlotState::Empty;
            return;
        }

        match tokio::time::timeout(self.config.open_timeout, self.capability.open_session()).await {
            Ok(Ok(handle)) => {
                let session = Session::new(handle);
                info!("Replaced unhealthy session {} with {}", failed.id, session.id);
                let mut slots = self.slots.lock();
                slots[slot].generation += 1;
                slots[slot].state = SlotState::Idle(session);
            }
            Ok(Err(e)) => {
                warn!("Replacement for session {} failed: {}", failed.id, e);
                self.slots.lock()[slot].state = SlotState::Empty;
            }
            Err(_) => {
                warn!("Replacement for session {} timed out", failed.id);
                self.slots.lock()[slot].state = SlotState::Empty;
            }
        }
    }

    fn close_in_background(&self, handle: BrowserHandle) {
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let capability = self.capability.clone();
            rt.spawn(async move {
                if let Err(e) = capability.close(&handle).await {
                    debug!("Closing session {} failed: {}", handle.remote_id, e);
                }
            });
        }
    }
}
