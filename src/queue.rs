//! Command queue & executor (C3): a single-consumer FIFO with a
//! `processing` flag guaranteeing at most one command in flight, and the
//! per-command algorithm that ties the resolver, memory, quorum, lock and
//! page driver together.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::driver::PageDriver;
use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::messages::{CommandComplete, CommandVerb, IntentParams};
use crate::quorum::{build_pre_check_params, QuorumOutcome};
use crate::registry::ParticipantRegistry;
use crate::resolver::Resolver;
use crate::telemetry::{save_screenshot, MissionTrace, ReportRecord};

/// A queued command, built from an Intent's `intent` frame.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: String,
    pub verb: CommandVerb,
    pub url: Option<String>,
    pub selector: Option<String>,
    pub goal: Option<String>,
    pub text: Option<String>,
    pub value: Option<String>,
    pub key: Option<String>,
    pub files: Vec<String>,
    pub name: Option<String>,
    pub stability_hint_ms: Option<u64>,
    pub pre_check_retries: u32,
    pub predictive_wait: bool,
    pub forced_proceed: bool,
}

impl Command {
    pub fn from_intent(id: String, params: IntentParams) -> Result<Self> {
        let verb = params
            .cmd
            .ok_or_else(|| Error::Protocol("intent missing cmd".into()))?;
        Ok(Self {
            id,
            verb,
            url: params.url,
            selector: params.selector,
            goal: params.goal,
            text: params.text,
            value: params.value,
            key: params.key,
            files: params.files,
            name: params.name,
            stability_hint_ms: params.stability_hint_ms,
            pre_check_retries: 0,
            predictive_wait: false,
            forced_proceed: false,
        })
    }

    fn ghost_key(&self) -> Option<String> {
        self.selector
            .as_ref()
            .map(|s| format!("{}:{}", self.verb, s))
    }

    fn memory_keys(&self) -> Option<(String, String)> {
        self.goal
            .as_ref()
            .map(|g| (format!("{}:{}", self.verb, g), g.clone()))
    }
}

/// Config knobs relevant to the executor (the remaining values in
/// `config::HubConfig` are consumed elsewhere).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_pre_check_retries: u32,
    pub predictive_wait_ms: u64,
    pub settle_delay_ms: u64,
    pub self_heal_retry_delay_ms: u64,
    pub ghost_mode: bool,
    pub shadow_max_depth: u32,
    pub screenshots_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_pre_check_retries: 3,
            predictive_wait_ms: 1500,
            settle_delay_ms: 500,
            self_heal_retry_delay_ms: 100,
            ghost_mode: false,
            shadow_max_depth: 5,
            screenshots_dir: PathBuf::from("screenshots"),
        }
    }
}

/// FIFO of pending commands, with the single-in-flight invariant enforced
/// by `processing`.
#[derive(Default)]
pub struct CommandQueue {
    commands: VecDeque<Command>,
    processing: bool,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    pub fn push_front(&mut self, command: Command) {
        self.commands.push_front(command);
    }

    pub fn pop_front(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn begin_processing(&mut self) {
        self.processing = true;
    }

    pub fn end_processing(&mut self) {
        self.processing = false;
    }
}

/// Outcome of one pass through the executor for a single command: either it
/// ran to completion (success or failure), or it must be re-enqueued (veto
/// back-off).
pub enum StepOutcome {
    Completed(CommandComplete),
    Requeue(Command),
}

/// Resolve `goal` to `selector` (step 1), raise the stability hint from
/// ghost memory (step 2), and decide whether an aura sleep is due (step 3).
/// Returns the amount of time the caller should sleep before the pre-check.
pub fn prepare(
    command: &mut Command,
    resolver: &Resolver,
    memory: &MemoryStore,
    candidates: &[crate::resolver::Candidate],
    elapsed_ms: u64,
    config: &ExecutorConfig,
) -> Result<Duration> {
    if command.selector.is_none() && command.goal.is_some() {
        let resolved = resolver.resolve(
            command.verb,
            command.selector.as_deref(),
            command.goal.as_deref(),
            candidates,
            &MemoryAdapter(memory, command.verb),
        );
        match resolved {
            Some(found) => command.selector = Some(found.selector),
            None => {
                return Err(Error::Resolution(
                    command.goal.clone().unwrap_or_default(),
                ))
            }
        }
    }

    if let Some(key) = command.ghost_key() {
        if let Some(observed) = memory.ghost_latency_ms(&key) {
            command.stability_hint_ms = Some(command.stability_hint_ms.unwrap_or(0).max(observed));
        }
    }

    let mut sleep = Duration::from_millis(0);
    if memory.is_historically_unstable(elapsed_ms) {
        command.predictive_wait = true;
        sleep = Duration::from_millis(config.predictive_wait_ms);
    }

    Ok(sleep)
}

/// Adapts `MemoryStore` to the resolver's `MemoryLookup` trait, trying the
/// command-prefixed key before the bare goal (§4.6).
struct MemoryAdapter<'a>(&'a MemoryStore, CommandVerb);

impl crate::resolver::MemoryLookup for MemoryAdapter<'_> {
    fn recall(&self, goal: &str) -> Option<&str> {
        let prefixed = format!("{}:{}", self.1, goal);
        self.0
            .recall_selector(&prefixed)
            .or_else(|| self.0.recall_selector(goal))
    }
}

/// Voter list plus the capability gates needed to decide which optional
/// pre-check fields are worth the cost of gathering, taken from a short
/// registry snapshot so callers don't hold the registry lock across the
/// driver probes or the (potentially multi-second) quorum wait itself.
pub struct RoundVoters {
    pub voters: Vec<crate::connection::ConnId>,
    /// Union of all relevant Sentinels' declared selectors — the obstacle
    /// scan's search set (§4.5 step 1).
    pub declared_selectors: std::collections::HashSet<String>,
    pub wants_vision: bool,
    pub wants_pii_detection: bool,
}

pub fn snapshot_round_voters(registry: &ParticipantRegistry) -> RoundVoters {
    use crate::messages::Capability;
    RoundVoters {
        voters: registry.relevant_sentinels().iter().map(|p| p.conn_id).collect(),
        declared_selectors: registry.relevant_selectors(),
        wants_vision: registry.any_relevant_capability(Capability::Vision),
        wants_pii_detection: registry.any_relevant_capability(Capability::PiiDetection),
    }
}

/// Gather the context a pre-check broadcast needs: the obstacle scan over
/// the declared-selector union and the target rect, plus a
/// screenshot/page text only when a relevant Sentinel actually declared a
/// use for them (§4.5 step 1).
pub async fn gather_round_context(
    command: &Command,
    driver: &dyn PageDriver,
    voters: &RoundVoters,
) -> (crate::driver::ObstacleScan, Option<String>, Option<String>) {
    let scan = driver
        .scan_obstacles(&voters.declared_selectors, command.selector.as_deref())
        .await
        .unwrap_or(crate::driver::ObstacleScan {
            blocking: Vec::new(),
            target_rect: None,
            url: String::new(),
            title: String::new(),
        });

    let screenshot = if voters.wants_vision {
        driver.screenshot().await.ok()
    } else {
        None
    };
    let page_text = if voters.wants_pii_detection {
        driver.page_text().await.ok()
    } else {
        None
    };

    (scan, screenshot, page_text)
}

/// Build the pre-check payload for `command` from a registry snapshot and
/// the driver context gathered via [`gather_round_context`].
pub fn build_round_inputs(
    command: &Command,
    registry: &ParticipantRegistry,
    scan: crate::driver::ObstacleScan,
    screenshot: Option<String>,
    page_text: Option<String>,
) -> crate::messages::PreCheckParams {
    build_pre_check_params(
        registry,
        command.verb.to_string(),
        command.selector.clone(),
        command.goal.clone(),
        command.url.clone().or(Some(scan.url).filter(|u| !u.is_empty())),
        scan.blocking,
        scan.target_rect,
        screenshot,
        page_text,
        None,
    )
}

/// Apply a completed quorum round's outcome to `command` (step 4's
/// retry/force-proceed accounting). Returns `Ok(())` when clear to
/// proceed, or `Err(Error::Vetoed)` describing the back-off the caller
/// should sleep before retrying.
pub fn apply_quorum_outcome(
    command: &mut Command,
    outcome: QuorumOutcome,
    executor_config: &ExecutorConfig,
) -> Result<()> {
    match outcome {
        QuorumOutcome::Clear | QuorumOutcome::NoVoters => Ok(()),
        QuorumOutcome::Hijacked { .. } => {
            // The hijack itself is handled by the caller (hub.rs) reacting to
            // the Sentinel's separate `hijack` frame; from the executor's
            // perspective this pre-check simply did not clear.
            Err(Error::Vetoed { retry_after_ms: 0 })
        }
        QuorumOutcome::Wait { retry_after_ms, .. } => {
            command.pre_check_retries += 1;
            if command.pre_check_retries > executor_config.max_pre_check_retries {
                warn!(id = %command.id, "forcing proceed after repeated vetoes");
                command.forced_proceed = true;
                Ok(())
            } else {
                Err(Error::Vetoed { retry_after_ms })
            }
        }
    }
}

/// Execute the command body (steps 5-9): screenshot, PageDriver call with
/// self-heal/retry, settle delay, memory writeback, trace + ack.
pub async fn execute(
    mut command: Command,
    driver: &dyn PageDriver,
    memory: &mut MemoryStore,
    trace: &mut MissionTrace,
    elapsed_ms: u64,
    config: &ExecutorConfig,
) -> CommandComplete {
    let started = Instant::now();

    let before_screenshot = if config.ghost_mode {
        None
    } else {
        driver
            .screenshot()
            .await
            .ok()
            .and_then(|png| save_screenshot(&config.screenshots_dir, "before", &png))
            .map(|p| p.display().to_string())
    };

    let selector = command.selector.clone().unwrap_or_default();
    let value = command.text.clone().or_else(|| command.value.clone());

    let mut self_healed = false;
    let mut result = if config.ghost_mode {
        Ok(())
    } else if command.verb == CommandVerb::Goto {
        driver.goto(command.url.as_deref().unwrap_or("about:blank")).await
    } else {
        driver
            .execute(command.verb.as_str(), &selector, value.as_deref(), command.key.as_deref(), &command.files)
            .await
    };

    // `goto` has no selector to self-heal against; a navigation failure is
    // not retried with a historical value the way an element lookup is.
    if result.is_err() && command.verb != CommandVerb::Goto {
        if let Some((prefixed, bare)) = command.memory_keys() {
            if let Some(historical) = memory
                .recall_selector(&prefixed)
                .or_else(|| memory.recall_selector(&bare))
            {
                if historical != selector {
                    let historical = historical.to_string();
                    self_healed = true;
                    result = driver
                        .execute(command.verb.as_str(), &historical, value.as_deref(), command.key.as_deref(), &command.files)
                        .await;
                    if result.is_ok() {
                        command.selector = Some(historical);
                    }
                }
            }
        }

        if result.is_err() {
            tokio::time::sleep(Duration::from_millis(config.self_heal_retry_delay_ms)).await;
            result = driver
                .execute(command.verb.as_str(), &selector, value.as_deref(), command.key.as_deref(), &command.files)
                .await;
        }
    }

    tokio::time::sleep(Duration::from_millis(config.settle_delay_ms)).await;
    let after_screenshot = if config.ghost_mode {
        None
    } else {
        driver
            .screenshot()
            .await
            .ok()
            .and_then(|png| save_screenshot(&config.screenshots_dir, "after", &png))
            .map(|p| p.display().to_string())
    };

    let duration_ms = started.elapsed().as_millis() as u64;

    if config.ghost_mode {
        if let Some(key) = command.ghost_key() {
            memory.observe_ghost_latency(key, duration_ms);
        }
    }

    let success = result.is_ok();
    if success {
        if let Some((prefixed, bare)) = command.memory_keys() {
            if let Some(sel) = &command.selector {
                memory.remember_selector(prefixed, sel.clone());
                memory.remember_selector(bare, sel.clone());
            }
        }
    }

    let error = result.as_ref().err().map(|e| e.to_string());
    if !success {
        info!(id = %command.id, error = ?error, "command failed");
    }

    trace.push(
        elapsed_ms,
        command.predictive_wait,
        ReportRecord::Command {
            verb: command.verb.to_string(),
            selector: command.selector.clone(),
            goal: command.goal.clone(),
            success,
            self_healed,
            forced_proceed: command.forced_proceed,
            predictive_wait: command.predictive_wait,
            duration_ms,
            error: error.clone(),
            before_screenshot,
            after_screenshot,
        },
    );

    CommandComplete {
        id: command.id,
        success,
        error,
        context: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(cmd: CommandVerb) -> IntentParams {
        IntentParams {
            cmd: Some(cmd),
            ..Default::default()
        }
    }

    #[test]
    fn fifo_ordering_is_preserved() {
        let mut queue = CommandQueue::new();
        queue.push_back(Command::from_intent("a".into(), intent(CommandVerb::Click)).unwrap());
        queue.push_back(Command::from_intent("b".into(), intent(CommandVerb::Click)).unwrap());
        assert_eq!(queue.pop_front().unwrap().id, "a");
        assert_eq!(queue.pop_front().unwrap().id, "b");
    }

    #[test]
    fn push_front_re_enqueues_at_head() {
        let mut queue = CommandQueue::new();
        queue.push_back(Command::from_intent("a".into(), intent(CommandVerb::Click)).unwrap());
        queue.push_front(Command::from_intent("retry".into(), intent(CommandVerb::Click)).unwrap());
        assert_eq!(queue.pop_front().unwrap().id, "retry");
    }

    #[test]
    fn missing_cmd_is_a_protocol_error() {
        let err = Command::from_intent("x".into(), IntentParams::default());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn ghost_mode_skips_side_effects_and_records_latency() {
        use crate::driver::NullDriver;
        let driver = NullDriver;
        let mut memory = MemoryStore::new(None, None);
        let mut trace = MissionTrace::new(10);
        let mut command = Command::from_intent("c1".into(), intent(CommandVerb::Click)).unwrap();
        command.selector = Some("#slow-button".into());
        let config = ExecutorConfig {
            ghost_mode: true,
            settle_delay_ms: 1,
            ..Default::default()
        };
        let complete = execute(command, &driver, &mut memory, &mut trace, 0, &config).await;
        assert!(complete.success);
        assert!(memory.ghost_latency_ms("click:#slow-button").is_some());
    }

    #[tokio::test]
    async fn successful_command_with_goal_writes_memory() {
        use crate::driver::NullDriver;
        let driver = NullDriver;
        let mut memory = MemoryStore::new(None, None);
        let mut trace = MissionTrace::new(10);
        let mut command = Command::from_intent("c1".into(), intent(CommandVerb::Click)).unwrap();
        command.selector = Some("#ok".into());
        command.goal = Some("Submit".into());
        let config = ExecutorConfig {
            settle_delay_ms: 1,
            ..Default::default()
        };
        let complete = execute(command, &driver, &mut memory, &mut trace, 0, &config).await;
        assert!(complete.success);
        assert_eq!(memory.recall_selector("Submit"), Some("#ok"));
    }

    struct ObstacleDriver;

    #[async_trait::async_trait]
    impl PageDriver for ObstacleDriver {
        async fn goto(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn scan_obstacles(
            &self,
            declared_selectors: &std::collections::HashSet<String>,
            _target_selector: Option<&str>,
        ) -> Result<crate::driver::ObstacleScan> {
            assert!(declared_selectors.contains("#cookie-modal"));
            Ok(crate::driver::ObstacleScan {
                blocking: vec![crate::messages::BlockingElement {
                    selector: "#cookie-modal".into(),
                    text: None,
                    element_type: None,
                    rect: None,
                    id: None,
                    class: None,
                    shadow_selector: None,
                }],
                target_rect: None,
                url: "https://example.com/checkout".into(),
                title: "Checkout".into(),
            })
        }
        async fn list_candidates(&self) -> Result<Vec<crate::resolver::Candidate>> {
            Ok(Vec::new())
        }
        async fn execute(
            &self,
            _verb: &str,
            _selector: &str,
            _value: Option<&str>,
            _key: Option<&str>,
            _files: &[String],
        ) -> Result<()> {
            Ok(())
        }
        async fn execute_action(
            &self,
            _cmd: crate::messages::ActionCommand,
            _selector: Option<&str>,
            _text: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
        async fn sovereign_remediate(&self, _selector_hint: &str) -> Result<()> {
            Ok(())
        }
        async fn screenshot(&self) -> Result<String> {
            Ok("ZmFrZS1wbmc=".into())
        }
        async fn page_text(&self) -> Result<String> {
            Ok("welcome back".into())
        }
        async fn is_dom_settled(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn gather_round_context_scans_obstacles_and_gates_optional_fields() {
        let driver = ObstacleDriver;
        let mut command = Command::from_intent("c1".into(), intent(CommandVerb::Click)).unwrap();
        command.selector = Some("#checkout".into());

        let declared_selectors: std::collections::HashSet<String> = ["#cookie-modal".to_string()].into();

        let voters = RoundVoters {
            voters: vec![1],
            declared_selectors: declared_selectors.clone(),
            wants_vision: true,
            wants_pii_detection: false,
        };
        let (scan, screenshot, page_text) = gather_round_context(&command, &driver, &voters).await;
        assert_eq!(scan.blocking.len(), 1);
        assert_eq!(scan.blocking[0].selector, "#cookie-modal");
        assert!(screenshot.is_some());
        assert!(page_text.is_none());

        let voters = RoundVoters {
            voters: vec![1],
            declared_selectors,
            wants_vision: false,
            wants_pii_detection: true,
        };
        let (_, screenshot, page_text) = gather_round_context(&command, &driver, &voters).await;
        assert!(screenshot.is_none());
        assert!(page_text.is_some());
    }
}
