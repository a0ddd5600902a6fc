//! Participant registry (C2): tracks the Intent client and registered
//! Sentinels, their declared layer/priority/selectors/capabilities, and
//! liveness via heartbeats.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::connection::{ConnId, ConnectionHandle};
use crate::messages::{Capability, ParticipantSummary, RegistrationParams};

/// Whether a connection is the mission's Intent client or a Sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantKind {
    Intent,
    Sentinel,
}

/// One registered connection.
#[derive(Clone)]
pub struct Participant {
    pub conn_id: ConnId,
    pub layer: String,
    pub kind: ParticipantKind,
    /// 1-10 meaningful; >10 is advisory-only (observer for entropy/context
    /// broadcasts, never part of a pre-check quorum). Intent participants
    /// carry priority 0 and are never quorum voters.
    pub priority: u8,
    pub selectors: HashSet<String>,
    pub capabilities: HashSet<Capability>,
    pub protocol_version: Option<String>,
    pub last_seen_at: Instant,
    pub handle: ConnectionHandle,
}

impl Participant {
    /// Sentinels with priority <= 10 participate in pre-check handshakes;
    /// higher-priority-number Sentinels are observers only (§9 open question,
    /// resolved in favor of the explicit standardization spec.md adopts).
    pub fn is_handshake_participant(&self) -> bool {
        self.kind == ParticipantKind::Sentinel && self.priority <= 10
    }

    /// Sentinels with priority <= 5 are "critical": their heartbeat is
    /// watched and their silence marks the whole system unhealthy.
    pub fn is_critical(&self) -> bool {
        self.kind == ParticipantKind::Sentinel && self.priority <= 5
    }
}

/// Error returned when registration is attempted on an already-used
/// connection id, which should never happen given one registry per socket.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnId),
}

/// Tracks all live participants for the mission.
pub struct ParticipantRegistry {
    participants: HashMap<ConnId, Participant>,
    heartbeat_timeout: Duration,
}

impl ParticipantRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            participants: HashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Register a new participant. `is_sentinel` distinguishes the lone
    /// Intent client from Sentinels; the registration's declared
    /// `is_sentinel` flag (see `messages::RegistrationParams`) drives this.
    pub fn register(
        &mut self,
        conn_id: ConnId,
        params: RegistrationParams,
        handle: ConnectionHandle,
        now: Instant,
    ) -> Result<&Participant, RegistryError> {
        if self.participants.contains_key(&conn_id) {
            return Err(RegistryError::AlreadyRegistered(conn_id));
        }

        let kind = if params.is_sentinel {
            ParticipantKind::Sentinel
        } else {
            ParticipantKind::Intent
        };

        let participant = Participant {
            conn_id,
            layer: params.layer,
            kind,
            priority: if kind == ParticipantKind::Sentinel {
                params.priority.max(1)
            } else {
                0
            },
            selectors: params.selectors.into_iter().collect(),
            capabilities: params.capabilities.into_iter().collect(),
            protocol_version: params.protocol_version,
            last_seen_at: now,
            handle,
        };

        info!(
            layer = %participant.layer,
            kind = ?participant.kind,
            priority = participant.priority,
            "participant registered"
        );

        self.participants.insert(conn_id, participant);
        Ok(self.participants.get(&conn_id).expect("just inserted"))
    }

    /// Refresh a participant's liveness timestamp.
    pub fn heartbeat(&mut self, conn_id: ConnId, now: Instant) {
        if let Some(p) = self.participants.get_mut(&conn_id) {
            p.last_seen_at = now;
        }
    }

    /// Remove a participant (disconnect). Returns the removed entry so
    /// callers (e.g. the lock) can check whether it owned anything.
    pub fn remove(&mut self, conn_id: ConnId) -> Option<Participant> {
        let removed = self.participants.remove(&conn_id);
        if let Some(ref p) = removed {
            warn!(layer = %p.layer, "participant disconnected");
        }
        removed
    }

    pub fn get(&self, conn_id: ConnId) -> Option<&Participant> {
        self.participants.get(&conn_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn intent(&self) -> Option<&Participant> {
        self.participants
            .values()
            .find(|p| p.kind == ParticipantKind::Intent)
    }

    pub fn sentinels(&self) -> impl Iterator<Item = &Participant> {
        self.participants
            .values()
            .filter(|p| p.kind == ParticipantKind::Sentinel)
    }

    /// Sentinels that participate in the pre-check handshake (priority <= 10).
    pub fn relevant_sentinels(&self) -> Vec<&Participant> {
        self.sentinels()
            .filter(|p| p.is_handshake_participant())
            .collect()
    }

    /// Union of all declared selectors across relevant Sentinels, used to
    /// build the pre-check's obstacle-scan context.
    pub fn relevant_selectors(&self) -> HashSet<String> {
        self.relevant_sentinels()
            .into_iter()
            .flat_map(|p| p.selectors.iter().cloned())
            .collect()
    }

    pub fn any_relevant_capability(&self, cap: Capability) -> bool {
        self.relevant_sentinels()
            .into_iter()
            .any(|p| p.capabilities.contains(&cap))
    }

    /// True when every critical Sentinel (priority <= 5) has heartbeat'd
    /// within the configured timeout. An absent critical Sentinel doesn't
    /// make the system unhealthy by itself — only silence after joining does.
    pub fn is_healthy(&self, now: Instant) -> bool {
        self.sentinels()
            .filter(|p| p.is_critical())
            .all(|p| now.duration_since(p.last_seen_at) <= self.heartbeat_timeout)
    }

    pub fn summaries(&self) -> Vec<ParticipantSummary> {
        self.participants
            .values()
            .map(|p| ParticipantSummary {
                layer: p.layer.clone(),
                is_sentinel: p.kind == ParticipantKind::Sentinel,
                priority: p.priority,
                capabilities: p.capabilities.iter().copied().collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle() -> ConnectionHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnectionHandle::new(1, tx)
    }

    fn reg(layer: &str, priority: u8, is_sentinel: bool) -> RegistrationParams {
        RegistrationParams {
            layer: layer.to_string(),
            priority,
            capabilities: vec![],
            selectors: vec![],
            protocol_version: None,
            auth_token: None,
            is_sentinel,
        }
    }

    #[test]
    fn register_then_disconnect_leaves_no_residue() {
        let mut registry = ParticipantRegistry::new(Duration::from_secs(5));
        let now = Instant::now();
        registry
            .register(1, reg("Janitor", 5, true), handle(), now)
            .unwrap();
        assert_eq!(registry.len(), 1);
        registry.remove(1);
        assert!(registry.is_empty());
    }

    #[test]
    fn double_registration_on_same_conn_rejected() {
        let mut registry = ParticipantRegistry::new(Duration::from_secs(5));
        let now = Instant::now();
        registry
            .register(1, reg("Janitor", 5, true), handle(), now)
            .unwrap();
        let err = registry.register(1, reg("Janitor", 5, true), handle(), now);
        assert!(matches!(err, Err(RegistryError::AlreadyRegistered(1))));
    }

    #[test]
    fn priority_above_ten_excluded_from_handshake() {
        let mut registry = ParticipantRegistry::new(Duration::from_secs(5));
        let now = Instant::now();
        registry
            .register(1, reg("Observer", 20, true), handle(), now)
            .unwrap();
        assert!(registry.relevant_sentinels().is_empty());
    }

    #[test]
    fn critical_sentinel_silence_marks_unhealthy() {
        let mut registry = ParticipantRegistry::new(Duration::from_millis(10));
        let t0 = Instant::now();
        registry
            .register(1, reg("Janitor", 3, true), handle(), t0)
            .unwrap();
        assert!(registry.is_healthy(t0));
        let later = t0 + Duration::from_millis(50);
        assert!(!registry.is_healthy(later));
    }

    #[test]
    fn non_critical_sentinel_silence_stays_healthy() {
        let mut registry = ParticipantRegistry::new(Duration::from_millis(10));
        let t0 = Instant::now();
        registry
            .register(1, reg("LowPrioritySentinel", 8, true), handle(), t0)
            .unwrap();
        let later = t0 + Duration::from_millis(50);
        assert!(registry.is_healthy(later));
    }
}
