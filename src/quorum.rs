//! Pre-check handshake / quorum engine (C5).
//!
//! One round is opened per queued command against every relevant Sentinel
//! (priority <= 10). A `hijack` vote from any Sentinel wins outright
//! regardless of other votes (veto supremacy). Otherwise the round closes
//! when every voter has replied, the sync budget elapses, or — once the
//! first reply lands and the configured quorum threshold is below 1.0 — the
//! shorter consensus timeout elapses. Confidence-weighted `clear` votes are
//! summed and compared against the threshold; a Sentinel that disconnects
//! mid-round is dropped from the voter set rather than counted as a `wait`.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::connection::ConnId;
use crate::messages::{
    BlockingElement, Capability, ElementRect, PreCheckParams, PreCheckResponse,
};
use crate::registry::ParticipantRegistry;

/// Abstraction over "broadcast this pre-check and collect the round's
/// outcome", so `queue.rs` can drive the per-command algorithm without
/// knowing about WebSocket frames, and so tests can stub it out.
#[async_trait]
pub trait QuorumTransport: Send + Sync {
    async fn run_round(
        &self,
        voters: Vec<ConnId>,
        params: PreCheckParams,
        config: &QuorumConfig,
    ) -> QuorumOutcome;
}

#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Sum of confidence-weighted `clear` votes (as a fraction of voters)
    /// required to proceed. 1.0 means unanimous.
    pub quorum_threshold: f64,
    /// Hard ceiling on how long a round may stay open at all.
    pub sync_budget: Duration,
    /// Once the first reply arrives, and threshold < 1.0, remaining
    /// stragglers get this much longer before being dropped from the tally.
    pub consensus_timeout: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            quorum_threshold: 1.0,
            sync_budget: Duration::from_secs(30),
            consensus_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuorumOutcome {
    Clear,
    Wait {
        retry_after_ms: u64,
        reason: Option<String>,
    },
    Hijacked {
        conn_id: ConnId,
        reason: String,
    },
    /// No Sentinel voted at all (empty voter set, or all disconnected).
    NoVoters,
}

/// One open pre-check round, tracked per in-flight command.
pub struct QuorumRound {
    voters: HashSet<ConnId>,
    votes: HashMap<ConnId, PreCheckResponse>,
    started_at: Instant,
    first_reply_at: Option<Instant>,
}

impl QuorumRound {
    pub fn new(voters: impl IntoIterator<Item = ConnId>, now: Instant) -> Self {
        Self {
            voters: voters.into_iter().collect(),
            votes: HashMap::new(),
            started_at: now,
            first_reply_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    /// Record a Sentinel's vote. Ignored if the Sentinel isn't a voter in
    /// this round, or has already voted (one vote per Sentinel).
    pub fn record_vote(&mut self, conn_id: ConnId, response: PreCheckResponse, now: Instant) {
        if !self.voters.contains(&conn_id) {
            debug!(conn_id, "vote from non-voter ignored");
            return;
        }
        if self.votes.contains_key(&conn_id) {
            debug!(conn_id, "duplicate vote ignored");
            return;
        }
        if self.first_reply_at.is_none() {
            self.first_reply_at = Some(now);
        }
        self.votes.insert(conn_id, response);
    }

    /// A voter disconnected mid-round: it neither clears nor vetoes, it
    /// simply stops counting towards quorum.
    pub fn record_disconnect(&mut self, conn_id: ConnId) {
        self.voters.remove(&conn_id);
        self.votes.remove(&conn_id);
    }

    /// A `hijack` vote, if any has landed, regardless of whether the round
    /// is otherwise complete. Veto supremacy: checked before completion.
    pub fn veto(&self) -> Option<(ConnId, String)> {
        self.votes.iter().find_map(|(conn_id, vote)| match vote {
            PreCheckResponse::Hijack { reason } => Some((*conn_id, reason.clone())),
            _ => None,
        })
    }

    /// A `wait` vote, if any has landed. Per §4.5 step 4, a single `wait`
    /// immediately ends the round as *not clear*, the same as a hijack veto
    /// — it does not wait for the rest of the voters to reply.
    fn first_wait(&self) -> Option<(u64, Option<String>)> {
        self.votes.values().find_map(|vote| match vote {
            PreCheckResponse::Wait { retry_after_ms, reason } => Some((*retry_after_ms, reason.clone())),
            _ => None,
        })
    }

    pub fn is_complete(&self, now: Instant, config: &QuorumConfig) -> bool {
        if self.veto().is_some() || self.first_wait().is_some() {
            return true;
        }
        if self.votes.len() >= self.voters.len() {
            return true;
        }
        if now.duration_since(self.started_at) >= config.sync_budget {
            return true;
        }
        if config.quorum_threshold < 1.0 {
            if let Some(first) = self.first_reply_at {
                if now.duration_since(first) >= config.consensus_timeout {
                    return true;
                }
            }
        }
        false
    }

    /// Tally the round. Veto always wins first, then a lone `wait` — per
    /// §4.5 step 4 neither waits on the rest of the quorum sum. Otherwise
    /// sum confidence of `clear` votes over the total voter count and
    /// compare to the threshold; stragglers (never voted) count as zero
    /// confidence.
    pub fn tally(&self, config: &QuorumConfig) -> QuorumOutcome {
        if let Some((conn_id, reason)) = self.veto() {
            return QuorumOutcome::Hijacked { conn_id, reason };
        }

        if self.voters.is_empty() {
            return QuorumOutcome::NoVoters;
        }

        if let Some((retry_after_ms, reason)) = self.first_wait() {
            return QuorumOutcome::Wait { retry_after_ms, reason };
        }

        let mut confidence_sum = 0.0;
        for conn_id in &self.voters {
            match self.votes.get(conn_id) {
                Some(PreCheckResponse::Clear { confidence }) => confidence_sum += confidence,
                Some(PreCheckResponse::Wait { .. }) => unreachable!("wait checked above"),
                Some(PreCheckResponse::Hijack { .. }) => unreachable!("veto checked above"),
                None => {} // straggler: zero confidence
            }
        }

        let quorum = confidence_sum / self.voters.len() as f64;
        if quorum >= config.quorum_threshold {
            QuorumOutcome::Clear
        } else {
            warn!(quorum, threshold = config.quorum_threshold, "quorum not reached");
            QuorumOutcome::Wait {
                retry_after_ms: 1000,
                reason: None,
            }
        }
    }
}

/// Build the `pre_check` broadcast payload, gating the expensive optional
/// fields behind capabilities declared by at least one relevant Sentinel.
#[allow(clippy::too_many_arguments)]
pub fn build_pre_check_params(
    registry: &ParticipantRegistry,
    command: String,
    selector: Option<String>,
    goal: Option<String>,
    url: Option<String>,
    blocking: Vec<BlockingElement>,
    target_rect: Option<ElementRect>,
    screenshot: Option<String>,
    page_text: Option<String>,
    a11y_snapshot: Option<Vec<crate::messages::A11yElement>>,
) -> PreCheckParams {
    let screenshot = screenshot.filter(|_| registry.any_relevant_capability(Capability::Vision));
    let page_text = page_text.filter(|_| registry.any_relevant_capability(Capability::PiiDetection));
    let a11y_snapshot =
        a11y_snapshot.filter(|_| registry.any_relevant_capability(Capability::Accessibility));

    PreCheckParams {
        url,
        command,
        selector,
        goal,
        blocking,
        target_rect,
        screenshot,
        page_text,
        a11y_snapshot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear(confidence: f64) -> PreCheckResponse {
        PreCheckResponse::Clear { confidence }
    }

    fn wait(ms: u64) -> PreCheckResponse {
        PreCheckResponse::Wait {
            retry_after_ms: ms,
            reason: Some("dom settling".into()),
        }
    }

    #[test]
    fn unanimous_clear_passes_default_threshold() {
        let now = Instant::now();
        let mut round = QuorumRound::new([1, 2], now);
        round.record_vote(1, clear(1.0), now);
        round.record_vote(2, clear(1.0), now);
        assert!(round.is_complete(now, &QuorumConfig::default()));
        assert_eq!(round.tally(&QuorumConfig::default()), QuorumOutcome::Clear);
    }

    #[test]
    fn single_wait_blocks_unanimous_threshold() {
        let now = Instant::now();
        let mut round = QuorumRound::new([1, 2], now);
        round.record_vote(1, clear(1.0), now);
        round.record_vote(2, wait(500), now);
        let outcome = round.tally(&QuorumConfig::default());
        assert!(matches!(outcome, QuorumOutcome::Wait { retry_after_ms: 500, .. }));
    }

    #[test]
    fn single_wait_ends_round_immediately_without_waiting_for_stragglers() {
        let now = Instant::now();
        let mut round = QuorumRound::new([1, 2], now);
        round.record_vote(1, wait(250), now);
        assert!(round.is_complete(now, &QuorumConfig::default()));
        let outcome = round.tally(&QuorumConfig::default());
        assert!(matches!(outcome, QuorumOutcome::Wait { retry_after_ms: 250, .. }));
    }

    #[test]
    fn veto_wins_regardless_of_other_votes() {
        let now = Instant::now();
        let mut round = QuorumRound::new([1, 2], now);
        round.record_vote(1, clear(1.0), now);
        round.record_vote(
            2,
            PreCheckResponse::Hijack {
                reason: "consent modal".into(),
            },
            now,
        );
        let outcome = round.tally(&QuorumConfig::default());
        assert_eq!(
            outcome,
            QuorumOutcome::Hijacked {
                conn_id: 2,
                reason: "consent modal".into()
            }
        );
    }

    #[test]
    fn disconnect_during_wait_is_not_counted_as_a_vote() {
        let now = Instant::now();
        let mut round = QuorumRound::new([1, 2], now);
        round.record_disconnect(2);
        assert!(round.is_complete(now, &QuorumConfig::default()));
        round.record_vote(1, clear(1.0), now);
        assert_eq!(round.tally(&QuorumConfig::default()), QuorumOutcome::Clear);
    }

    #[test]
    fn duplicate_vote_from_same_sentinel_is_ignored() {
        let now = Instant::now();
        let mut round = QuorumRound::new([1], now);
        round.record_vote(1, clear(1.0), now);
        round.record_vote(1, wait(9999), now);
        assert_eq!(round.tally(&QuorumConfig::default()), QuorumOutcome::Clear);
    }

    #[test]
    fn sync_budget_closes_round_even_with_stragglers() {
        let now = Instant::now();
        let config = QuorumConfig {
            sync_budget: Duration::from_millis(10),
            ..Default::default()
        };
        let round = QuorumRound::new([1, 2], now);
        let later = now + Duration::from_millis(20);
        assert!(round.is_complete(later, &config));
    }

    #[test]
    fn consensus_timeout_only_applies_below_unanimous_threshold() {
        let now = Instant::now();
        let config = QuorumConfig {
            quorum_threshold: 0.5,
            consensus_timeout: Duration::from_millis(10),
            sync_budget: Duration::from_secs(30),
            ..Default::default()
        };
        let mut round = QuorumRound::new([1, 2], now);
        round.record_vote(1, clear(1.0), now);
        let later = now + Duration::from_millis(20);
        assert!(round.is_complete(later, &config));
        assert_eq!(round.tally(&config), QuorumOutcome::Clear);
    }

    #[test]
    fn empty_voter_set_yields_no_voters() {
        let now = Instant::now();
        let round = QuorumRound::new([], now);
        assert!(round.is_empty());
        assert_eq!(round.tally(&QuorumConfig::default()), QuorumOutcome::NoVoters);
    }
}
