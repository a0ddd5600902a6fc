//! The Hub (wires C2-C9 together): frame dispatch by method name, the
//! single control loop driving the command queue, and the pre-check
//! round that bridges the executor's quorum wait to frames arriving on
//! arbitrary connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::HubConfig;
use crate::connection::{ConnId, ConnectionHandle};
use crate::driver::PageDriver;
use crate::error::{Error, Result};
use crate::lock::InterventionLock;
use crate::memory::MemoryStore;
use crate::messages::{
    self, methods, AccessibilityContext, ActionParams, ClearParams, CommandComplete, ContextUpdateParams,
    FinishParams, HealthStatus, HijackParams, JsonRpcNotification, PreCheckResponse, PulseParams, RawMessage,
    RegistrationParams, ResumeParams, SovereignUpdateParams, WaitParams,
};
use crate::queue::{self, Command, CommandQueue, ExecutorConfig};
use crate::quorum::{QuorumConfig, QuorumOutcome, QuorumRound, QuorumTransport};
use crate::registry::ParticipantRegistry;
use crate::resolver::Resolver;
use crate::telemetry::{MissionTrace, ReportRecord};

/// One in-flight pre-check broadcast, keyed by an id so replies (sent back
/// as `clear`/`wait`/`hijack` frames carrying the same id) can be routed to
/// the right round even if another broadcast starts concurrently. In
/// practice the executor never starts a second broadcast before the first
/// resolves (§5 invariant), but the id keeps stray/late replies harmless.
struct PendingPreCheck {
    id: String,
    round: QuorumRound,
}

/// Everything the control loop needs exclusive access to. Guarded by a
/// single mutex so enqueue, lock transitions, and pending-request
/// resolution are atomic, per §5.
pub struct HubState {
    pub registry: ParticipantRegistry,
    pub lock: InterventionLock,
    pub queue: CommandQueue,
    pub memory: MemoryStore,
    pub trace: MissionTrace,
    pending: Option<PendingPreCheck>,
    pub shutting_down: bool,
    /// Most recent accessibility context seen in a `context_update`, kept
    /// for the mission report's accessibility dashboard (§4.8).
    pub accessibility: Option<AccessibilityContext>,
}

pub struct Hub {
    pub config: HubConfig,
    pub state: Mutex<HubState>,
    pub driver: Arc<dyn PageDriver>,
    pub resolver: Resolver,
    pub started_at: Instant,
}

impl Hub {
    pub fn new(config: HubConfig, driver: Arc<dyn PageDriver>) -> Self {
        let mut memory = MemoryStore::new(config.memory_file.clone(), config.ghost_file.clone());
        if let Err(e) = memory.load() {
            warn!(error = %e, "failed to load memory files, starting fresh");
        }
        if let Err(e) = memory.learn_aura_from_trace(&config.trace_file) {
            warn!(error = %e, "failed to learn aura from previous trace");
        }

        let state = HubState {
            registry: ParticipantRegistry::new(config.heartbeat_timeout()),
            lock: InterventionLock::new(),
            queue: CommandQueue::new(),
            memory,
            trace: MissionTrace::new(config.trace_max_events),
            pending: None,
            shutting_down: false,
            accessibility: None,
        };

        let resolver = Resolver::new(config.shadow_dom.max_depth);

        Self {
            config,
            state: Mutex::new(state),
            driver,
            resolver,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn quorum_config(&self) -> QuorumConfig {
        QuorumConfig {
            quorum_threshold: self.config.quorum_threshold,
            sync_budget: self.config.sync_budget(),
            consensus_timeout: self.config.consensus_timeout(),
        }
    }

    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_pre_check_retries: self.config.max_pre_check_retries,
            predictive_wait_ms: self.config.aura.predictive_wait_ms,
            settle_delay_ms: self.config.settle_delay_ms,
            self_heal_retry_delay_ms: self.config.self_heal_retry_delay_ms,
            ghost_mode: self.config.ghost_mode,
            shadow_max_depth: self.config.shadow_dom.max_depth,
            screenshots_dir: self.config.screenshots_dir.clone(),
        }
    }

    /// Handle one incoming frame. `conn_id`/`handle` identify the socket it
    /// arrived on; registration is the only method valid before the
    /// connection has an entry in the registry.
    pub async fn dispatch(&self, conn_id: ConnId, handle: &ConnectionHandle, raw: RawMessage) {
        if !raw.method.starts_with(methods::NAMESPACE) {
            warn!(method = %raw.method, "dropping frame outside the protocol namespace");
            return;
        }

        let result = match raw.method.as_str() {
            methods::REGISTRATION => self.handle_registration(conn_id, handle, raw).await,
            methods::PULSE => self.handle_pulse(conn_id, raw).await,
            methods::CONTEXT_UPDATE => self.handle_context_update(conn_id, raw).await,
            methods::INTENT => self.handle_intent(conn_id, raw).await,
            methods::HIJACK => self.handle_hijack(conn_id, raw).await,
            methods::RESUME => self.handle_resume(conn_id, raw).await,
            methods::CLEAR => self.handle_pre_check_reply(conn_id, raw, true).await,
            methods::WAIT => self.handle_pre_check_reply(conn_id, raw, false).await,
            methods::ACTION => self.handle_action(conn_id, raw).await,
            methods::FINISH => self.handle_finish(conn_id, raw).await,
            other => {
                warn!(method = other, "unknown method, dropping frame");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(conn_id, error = %e, "frame handling failed");
        }
    }

    fn parse<T: DeserializeOwned>(raw: &RawMessage) -> Result<T> {
        serde_json::from_value(raw.params.clone())
            .map_err(|e| Error::Protocol(format!("bad params for {}: {}", raw.method, e)))
    }

    async fn handle_registration(
        &self,
        conn_id: ConnId,
        handle: &ConnectionHandle,
        raw: RawMessage,
    ) -> Result<()> {
        let params: RegistrationParams = Self::parse(&raw)?;
        let mut state = self.state.lock().await;
        state
            .registry
            .register(conn_id, params, handle.clone(), Instant::now())
            .map_err(|e| Error::Protocol(e.to_string()))?;
        Ok(())
    }

    async fn handle_pulse(&self, conn_id: ConnId, raw: RawMessage) -> Result<()> {
        let _: PulseParams = Self::parse(&raw)?;
        let mut state = self.state.lock().await;
        state.registry.heartbeat(conn_id, Instant::now());
        Ok(())
    }

    async fn handle_context_update(&self, _conn_id: ConnId, raw: RawMessage) -> Result<()> {
        let params: ContextUpdateParams = Self::parse(&raw)?;
        let accessibility = params
            .context
            .get("accessibility")
            .and_then(|v| serde_json::from_value::<AccessibilityContext>(v.clone()).ok());

        let mut state = self.state.lock().await;
        if let Some(a11y) = accessibility {
            state.accessibility = Some(a11y);
        }
        let notification = JsonRpcNotification::new(
            methods::SOVEREIGN_UPDATE,
            SovereignUpdateParams {
                context: params.context,
            },
        );
        for sentinel in state.registry.sentinels() {
            let _ = sentinel.handle.send_json(&notification);
        }
        Ok(())
    }

    async fn handle_intent(&self, _conn_id: ConnId, raw: RawMessage) -> Result<()> {
        let id = raw.id.clone().unwrap_or_default();
        let params: messages::IntentParams = Self::parse(&raw)?;
        let command = Command::from_intent(id, params)?;
        let mut state = self.state.lock().await;
        state.queue.push_back(command);
        Ok(())
    }

    async fn handle_hijack(&self, conn_id: ConnId, raw: RawMessage) -> Result<()> {
        let params: HijackParams = Self::parse(&raw)?;
        let mut state = self.state.lock().await;
        let (layer, priority) = {
            let p = state
                .registry
                .get(conn_id)
                .ok_or_else(|| Error::Protocol("hijack from unregistered connection".into()))?;
            (p.layer.clone(), p.priority)
        };

        match state.lock.hijack(
            conn_id,
            layer.clone(),
            priority,
            params.reason.clone(),
            self.config.lock_ttl(),
            Instant::now(),
        ) {
            Ok(preempted) => {
                if let Some(prev_owner) = preempted {
                    if let Some(p) = state.registry.get(prev_owner) {
                        let _ = p.handle.send_json(&JsonRpcNotification::new(
                            "starlight.preempted",
                            serde_json::json!({ "reason": "preempted" }),
                        ));
                    }
                }
                drop(state);

                let screenshot = if self.config.ghost_mode {
                    None
                } else {
                    self.driver
                        .screenshot()
                        .await
                        .ok()
                        .and_then(|png| crate::telemetry::save_screenshot(&self.config.screenshots_dir, "hijack", &png))
                        .map(|p| p.display().to_string())
                };

                let mut state = self.state.lock().await;
                let elapsed = self.elapsed_ms();
                state.trace.push(
                    elapsed,
                    false,
                    ReportRecord::Hijack {
                        layer,
                        reason: params.reason,
                        screenshot,
                    },
                );
                Ok(())
            }
            Err(e) => {
                warn!(conn_id, error = %e, "hijack rejected");
                Ok(())
            }
        }
    }

    async fn handle_resume(&self, conn_id: ConnId, raw: RawMessage) -> Result<()> {
        let params: ResumeParams = Self::parse(&raw)?;
        let mut state = self.state.lock().await;
        state.lock.release(conn_id)?;
        if params.re_check {
            // An internal settle step; represented as a checkpoint command
            // with no selector so the executor just sleeps and acks.
            let settle = Command {
                id: format!("internal-settle-{}", uuid::Uuid::new_v4()),
                verb: messages::CommandVerb::Checkpoint,
                url: None,
                selector: None,
                goal: None,
                text: None,
                value: None,
                key: None,
                files: Vec::new(),
                name: None,
                stability_hint_ms: Some(500),
                pre_check_retries: 0,
                predictive_wait: false,
                forced_proceed: false,
            };
            state.queue.push_front(settle);
        }
        Ok(())
    }

    async fn handle_pre_check_reply(&self, conn_id: ConnId, raw: RawMessage, clear: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(pending) = state.pending.as_mut() else {
            debug!(conn_id, "pre-check reply with no pending round, dropping");
            return Ok(());
        };
        if raw.id.as_deref() != Some(pending.id.as_str()) {
            debug!(conn_id, "pre-check reply for stale round id, dropping");
            return Ok(());
        }
        let response = if clear {
            let params: ClearParams = Self::parse(&raw)?;
            PreCheckResponse::Clear {
                confidence: params.confidence,
            }
        } else {
            let params: WaitParams = Self::parse(&raw)?;
            PreCheckResponse::Wait {
                retry_after_ms: params.retry_after_ms,
                reason: params.reason,
            }
        };
        pending.round.record_vote(conn_id, response, Instant::now());
        Ok(())
    }

    async fn handle_action(&self, conn_id: ConnId, raw: RawMessage) -> Result<()> {
        let params: ActionParams = Self::parse(&raw)?;
        let state = self.state.lock().await;
        if state.lock.owner() != Some(conn_id) {
            return Err(Error::Lock("action from non-owner rejected".into()));
        }
        drop(state);

        if let Some(selector) = params.selector.as_deref() {
            if is_obstacle_like(selector) {
                if let Err(e) = self.driver.sovereign_remediate(selector).await {
                    warn!(conn_id, error = %e, "sovereign remediation failed");
                }
            }
        }

        self.driver
            .execute_action(params.cmd, params.selector.as_deref(), params.text.as_deref())
            .await
    }

    async fn handle_finish(&self, _conn_id: ConnId, raw: RawMessage) -> Result<()> {
        let _: FinishParams = Self::parse(&raw)?;
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        Ok(())
    }

    /// Called by the server when a connection drops: releases any lock it
    /// held and removes it from the registry (§4.2).
    pub async fn on_disconnect(&self, conn_id: ConnId) {
        let mut state = self.state.lock().await;
        state.registry.remove(conn_id);
        state.lock.force_release_if_owner(conn_id);
        if let Some(pending) = state.pending.as_mut() {
            pending.round.record_disconnect(conn_id);
        }
    }

    pub async fn health(&self) -> HealthStatus {
        let state = self.state.lock().await;
        HealthStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            participants: state.registry.summaries(),
            queue_length: state.queue.len(),
            lock_held: state.lock.is_held(),
            auth_enabled: self.config.security.auth_token.is_some(),
            tls_enabled: self.config.security.ssl.key_path.is_some(),
            healthy: state.registry.is_healthy(Instant::now()),
        }
    }

    /// The control loop: pulls one command at a time and drives it through
    /// the full §4.3 algorithm. Exits once `shutting_down` is observed with
    /// an empty queue.
    pub async fn run_control_loop(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.shutting_down && state.queue.is_empty() {
                    break;
                }
                if state.lock.is_held()
                    || state.queue.is_processing()
                    || !state.registry.is_healthy(Instant::now())
                {
                    None
                } else {
                    let command = state.queue.pop_front();
                    if command.is_some() {
                        state.queue.begin_processing();
                    }
                    command
                }
            };

            match next {
                Some(command) => self.run_one_command(command).await,
                None => tokio::time::sleep(Duration::from_millis(25)).await,
            }
        }
    }

    async fn run_one_command(self: &Arc<Self>, mut command: Command) {
        let elapsed = self.elapsed_ms();
        let executor_config = self.executor_config();

        let candidates = self.driver.list_candidates().await.unwrap_or_default();
        let prepare_result = {
            let mut state = self.state.lock().await;
            queue::prepare(&mut command, &self.resolver, &state.memory, &candidates, elapsed, &executor_config)
        };

        let sleep_for = match prepare_result {
            Ok(d) => d,
            Err(e) => {
                self.finish_with_error(command, e).await;
                return;
            }
        };
        if !sleep_for.is_zero() {
            tokio::time::sleep(sleep_for).await;
        }

        loop {
            let outcome = self.run_pre_check_round(&mut command).await;
            match outcome {
                Ok(()) => break,
                Err(Error::Vetoed { retry_after_ms }) => {
                    if command.forced_proceed {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                }
                Err(e) => {
                    self.finish_with_error(command, e).await;
                    return;
                }
            }
        }

        let complete = {
            let mut state = self.state.lock().await;
            queue::execute(command, self.driver.as_ref(), &mut state.memory, &mut state.trace, elapsed, &executor_config).await
        };
        self.ack(complete).await;

        let mut state = self.state.lock().await;
        state.queue.end_processing();
    }

    /// Background housekeeping (§4.4/§4.7): reaps an intervention lock whose
    /// TTL has lapsed, and throttled-polls the driver for DOM settlement to
    /// drive `entropy_stream` broadcasts and aura instability learning.
    /// Runs for the lifetime of the process, one tick per
    /// `entropy_throttle_ms`.
    pub async fn run_housekeeping_loop(self: &Arc<Self>) {
        let interval = Duration::from_millis(self.config.entropy_throttle_ms.max(1));
        loop {
            tokio::time::sleep(interval).await;

            let settled = self.driver.is_dom_settled().await.unwrap_or(true);
            let elapsed = self.elapsed_ms();

            let mut state = self.state.lock().await;
            if state.shutting_down && state.queue.is_empty() {
                return;
            }

            if let Some(reaped) = state.lock.reap_expired(Instant::now()) {
                warn!(owner = %reaped.owner_layer, "intervention lock TTL expired, reaped");
            }

            if !settled {
                state.memory.mark_unstable(elapsed);
            }

            let notification = JsonRpcNotification::new(
                methods::ENTROPY_STREAM,
                messages::EntropyStreamParams { entropy: !settled },
            );
            for sentinel in state.registry.sentinels() {
                let _ = sentinel.handle.send_json(&notification);
            }
        }
    }

    async fn run_pre_check_round(&self, command: &mut Command) -> Result<()> {
        let quorum_config = self.quorum_config();
        let executor_config = self.executor_config();

        let round_voters = {
            let state = self.state.lock().await;
            queue::snapshot_round_voters(&state.registry)
        };

        if round_voters.voters.is_empty() {
            return Ok(());
        }

        let (scan, screenshot, page_text) =
            queue::gather_round_context(command, self.driver.as_ref(), &round_voters).await;
        let params = {
            let state = self.state.lock().await;
            queue::build_round_inputs(command, &state.registry, scan, screenshot, page_text)
        };

        let transport = HubQuorumTransport { hub: self };
        let outcome = transport.run_round(round_voters.voters, params, &quorum_config).await;
        queue::apply_quorum_outcome(command, outcome, &executor_config)
    }

    async fn finish_with_error(&self, command: Command, error: Error) {
        let elapsed = self.elapsed_ms();
        let mut state = self.state.lock().await;
        state.trace.push(
            elapsed,
            false,
            ReportRecord::Failure {
                verb: command.verb.to_string(),
                error: error.to_string(),
            },
        );
        state.queue.end_processing();
        drop(state);
        self.ack(CommandComplete {
            id: command.id,
            success: false,
            error: Some(error.to_string()),
            context: Default::default(),
        })
        .await;
    }

    async fn ack(&self, complete: CommandComplete) {
        let state = self.state.lock().await;
        if let Some(intent) = state.registry.intent() {
            let _ = intent.handle.send_json(&complete);
        }
    }
}

/// Closed set of obstacle classes that trigger always-on sovereign
/// remediation when a lock owner's action selector mentions one.
const OBSTACLE_HINTS: &[&str] = &["modal", "overlay", "close", "shadow"];

fn is_obstacle_like(selector: &str) -> bool {
    let lower = selector.to_ascii_lowercase();
    OBSTACLE_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Drives one pre-check round end-to-end: broadcasts, then polls the Hub's
/// shared state until the round completes (by reply, sync budget, or
/// consensus timeout), tallying at the end.
struct HubQuorumTransport<'a> {
    hub: &'a Hub,
}

#[async_trait]
impl QuorumTransport for HubQuorumTransport<'_> {
    async fn run_round(
        &self,
        voters: Vec<ConnId>,
        params: messages::PreCheckParams,
        config: &QuorumConfig,
    ) -> QuorumOutcome {
        let id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        {
            let mut state = self.hub.state.lock().await;
            let request = messages::JsonRpcRequest::new(methods::PRE_CHECK, params, id.clone());
            for conn_id in &voters {
                if let Some(p) = state.registry.get(*conn_id) {
                    let _ = p.handle.send_json(&request);
                }
            }
            state.pending = Some(PendingPreCheck {
                id: id.clone(),
                round: QuorumRound::new(voters, started),
            });
        }

        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut state = self.hub.state.lock().await;
            let now = Instant::now();
            let complete = state
                .pending
                .as_ref()
                .map(|p| p.round.is_complete(now, config))
                .unwrap_or(true);
            if complete {
                let pending = state.pending.take();
                drop(state);
                return pending
                    .map(|p| p.round.tally(config))
                    .unwrap_or(QuorumOutcome::NoVoters);
            }
        }
    }
}
