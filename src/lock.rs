//! Intervention lock (C4): the exclusive handle a Sentinel holds while it
//! drives the page directly. Preemption is strictly priority-ordered; TTL
//! expiry and disconnect both force-release.

use std::time::{Duration, Instant};

use tracing::info;

use crate::connection::ConnId;
use crate::error::{Error, Result};

/// Why a lock transitioned away from its previous owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Released,
    Preempted,
    TtlExpired,
    Disconnected,
}

impl ReleaseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::Preempted => "preempted",
            Self::TtlExpired => "ttl_expired",
            Self::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockState {
    pub owner: ConnId,
    pub owner_layer: String,
    pub priority: u8,
    pub acquired_at: Instant,
    pub ttl: Duration,
    pub reason: String,
}

impl LockState {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.acquired_at) >= self.ttl
    }
}

/// The single intervention lock. At most one [`LockState`] is held at a time.
#[derive(Default)]
pub struct InterventionLock {
    state: Option<LockState>,
}

impl InterventionLock {
    pub fn new() -> Self {
        Self { state: None }
    }

    pub fn state(&self) -> Option<&LockState> {
        self.state.as_ref()
    }

    pub fn is_held(&self) -> bool {
        self.state.is_some()
    }

    pub fn owner(&self) -> Option<ConnId> {
        self.state.as_ref().map(|s| s.owner)
    }

    /// Attempt to acquire the lock for `owner` at `priority`. Succeeds
    /// immediately if unlocked. If locked by X, succeeds only when
    /// `priority < X.priority` (strict — equal priorities never preempt).
    /// On success, returns the previous holder's conn id if one was
    /// preempted.
    pub fn hijack(
        &mut self,
        owner: ConnId,
        owner_layer: String,
        priority: u8,
        reason: String,
        ttl: Duration,
        now: Instant,
    ) -> Result<Option<ConnId>> {
        let preempted = match &self.state {
            None => None,
            Some(current) if priority < current.priority => {
                info!(
                    preempted = %current.owner_layer,
                    by = %owner_layer,
                    "lock preempted"
                );
                Some(current.owner)
            }
            Some(current) => {
                return Err(Error::Lock(format!(
                    "{} (priority {}) cannot preempt {} (priority {})",
                    owner_layer, priority, current.owner_layer, current.priority
                )));
            }
        };

        self.state = Some(LockState {
            owner,
            owner_layer,
            priority,
            acquired_at: now,
            ttl,
            reason,
        });

        Ok(preempted)
    }

    /// Release the lock. Only the current owner may release; any other
    /// caller gets an error (the executor should ignore/log, not panic).
    pub fn release(&mut self, requester: ConnId) -> Result<()> {
        match &self.state {
            Some(s) if s.owner == requester => {
                self.state = None;
                Ok(())
            }
            Some(_) => Err(Error::Lock("only the owner may release the lock".into())),
            None => Ok(()), // idempotent: releasing an unlocked lock is a no-op
        }
    }

    /// Force-release regardless of owner (TTL expiry or disconnect).
    pub fn force_release(&mut self, reason: ReleaseReason) -> Option<LockState> {
        if let Some(s) = &self.state {
            info!(owner = %s.owner_layer, reason = reason.as_str(), "lock force-released");
        }
        self.state.take()
    }

    /// Force-release if the current owner is `conn_id` (used on disconnect).
    pub fn force_release_if_owner(&mut self, conn_id: ConnId) -> bool {
        if self.owner() == Some(conn_id) {
            self.force_release(ReleaseReason::Disconnected);
            true
        } else {
            false
        }
    }

    /// Force-release if the TTL has expired, returning the prior state.
    pub fn reap_expired(&mut self, now: Instant) -> Option<LockState> {
        if self.state.as_ref().is_some_and(|s| s.is_expired(now)) {
            self.force_release(ReleaseReason::TtlExpired)
        } else {
            None
        }
    }
}
