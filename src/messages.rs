//! JSON-RPC 2.0 envelope and Starlight Protocol message types exchanged
//! between the Hub and its participants (one Intent, many Sentinels).
//!
//! The envelope types mirror the Starlight Rust SDK's wire format exactly,
//! since the Hub and SDK must agree byte-for-byte on the JSON shape.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Base JSON-RPC Types
// =============================================================================

/// JSON-RPC 2.0 version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request (used for both requests and id-bearing replies;
/// the Starlight wire format always threads an `id` so pre-check replies can
/// be correlated to the broadcast they answer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: String,
    pub method: String,
    pub params: T,
    pub id: String,
}

impl<T> JsonRpcRequest<T> {
    pub fn new(method: impl Into<String>, params: T, id: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.into(),
        }
    }
}

/// A JSON-RPC 2.0 error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Well-known JSON-RPC / Starlight close codes.
pub mod codes {
    /// Registration rejected: shared auth token missing or mismatched.
    pub const AUTH_REJECTED: i32 = 4001;
}

/// A JSON-RPC 2.0 notification (no id field) — used for one-way broadcasts
/// like `entropy_stream` and `sovereign_update` that expect no reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification<T> {
    pub jsonrpc: String,
    pub method: String,
    pub params: T,
}

impl<T> JsonRpcNotification<T> {
    pub fn new(method: impl Into<String>, params: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Raw incoming frame, parsed once at the edge before being matched into a
/// typed variant by method name. The control loop never touches this type.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub id: Option<String>,
}

// =============================================================================
// Starlight Protocol Method Names
// =============================================================================

/// Starlight Protocol method names, namespaced under a single fixed prefix.
pub mod methods {
    pub const NAMESPACE: &str = "starlight";

    pub const REGISTRATION: &str = "starlight.registration";
    pub const PULSE: &str = "starlight.pulse";
    pub const CONTEXT_UPDATE: &str = "starlight.context_update";
    pub const INTENT: &str = "starlight.intent";
    pub const HIJACK: &str = "starlight.hijack";
    pub const RESUME: &str = "starlight.resume";
    pub const CLEAR: &str = "starlight.clear";
    pub const WAIT: &str = "starlight.wait";
    pub const ACTION: &str = "starlight.action";
    pub const FINISH: &str = "starlight.finish";

    pub const PRE_CHECK: &str = "starlight.pre_check";
    pub const ENTROPY_STREAM: &str = "starlight.entropy_stream";
    pub const SOVEREIGN_UPDATE: &str = "starlight.sovereign_update";
}

// =============================================================================
// Closed vocabularies
// =============================================================================

/// Sentinel capability tags — a closed vocabulary per the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Vision,
    PiiDetection,
    Accessibility,
    StabilityMonitoring,
    Detection,
    Healing,
    FormFilling,
}

/// Command verbs — a closed vocabulary per the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandVerb {
    Goto,
    Click,
    Fill,
    Select,
    Check,
    Uncheck,
    Hover,
    Scroll,
    Press,
    Type,
    Upload,
    Checkpoint,
}

impl CommandVerb {
    /// Whether this verb belongs to the click-like resolver family
    /// (click, hover, scroll share the same candidate-matching order).
    pub fn is_click_like(self) -> bool {
        matches!(self, Self::Click | Self::Hover | Self::Scroll)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Goto => "goto",
            Self::Click => "click",
            Self::Fill => "fill",
            Self::Select => "select",
            Self::Check => "check",
            Self::Uncheck => "uncheck",
            Self::Hover => "hover",
            Self::Scroll => "scroll",
            Self::Press => "press",
            Self::Type => "type",
            Self::Upload => "upload",
            Self::Checkpoint => "checkpoint",
        }
    }
}

impl std::fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions a lock owner (hijacking Sentinel) may invoke on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCommand {
    Click,
    Fill,
    Hide,
    Remove,
    GetA11ySnapshot,
}

// =============================================================================
// Participant registration
// =============================================================================

/// Registration parameters for Sentinel -> Hub. Intent clients register
/// with `priority: 0` and no selectors/capabilities (see `registry.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationParams {
    pub layer: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default, rename = "authToken")]
    pub auth_token: Option<String>,
    /// Absent/false means this connection is the Intent client, not a Sentinel.
    #[serde(default)]
    pub is_sentinel: bool,
}

// =============================================================================
// Heartbeat / context
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseParams {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextUpdateParams {
    pub context: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SovereignUpdateParams {
    pub context: HashMap<String, serde_json::Value>,
}

/// One accessibility rule violation, as reported in a `context_update`'s
/// `accessibility` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessibilityViolation {
    pub rule: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub impact: Option<String>,
}

/// The `accessibility` field of a `context_update`, captured separately for
/// the HTML report's accessibility dashboard (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessibilityContext {
    pub score: f64,
    #[serde(default)]
    pub violations: Vec<AccessibilityViolation>,
}

impl AccessibilityContext {
    /// Bucket the raw 0.0-1.0 score into the report's four-tier label.
    pub fn bucket(&self) -> &'static str {
        match self.score {
            s if s >= 0.9 => "good",
            s if s >= 0.75 => "acceptable",
            s if s >= 0.5 => "needs-work",
            _ => "critical",
        }
    }
}

/// Throttled broadcast on DOM/network activity (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntropyStreamParams {
    pub entropy: bool,
}

// =============================================================================
// Intent commands
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntentParams {
    pub cmd: Option<CommandVerb>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "stabilityHint")]
    pub stability_hint_ms: Option<u64>,
}

/// Sent from Hub to Intent (not an RPC reply — a fire-and-forget event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandComplete {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

// =============================================================================
// Pre-check handshake
// =============================================================================

/// An obstacle element detected on the page, visibility-filtered, with
/// enough geometry for a Sentinel to reason about it without a screenshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingElement {
    pub selector: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub element_type: Option<String>,
    #[serde(default)]
    pub rect: Option<ElementRect>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    /// Present when the element lives under a shadow root; uses an
    /// implementation-specific shadow-piercing selector syntax.
    #[serde(default)]
    pub shadow_selector: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ElementRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A11yElement {
    pub role: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub violations: Vec<String>,
}

/// Pre-check parameters from Hub -> Sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PreCheckParams {
    #[serde(default)]
    pub url: Option<String>,
    pub command: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub blocking: Vec<BlockingElement>,
    #[serde(default, rename = "targetRect")]
    pub target_rect: Option<ElementRect>,
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub page_text: Option<String>,
    #[serde(default)]
    pub a11y_snapshot: Option<Vec<A11yElement>>,
}

/// Pre-check response types (Sentinel -> Hub, sent via `clear`/`wait`/`hijack`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response")]
pub enum PreCheckResponse {
    #[serde(rename = "clear")]
    Clear {
        #[serde(default = "default_confidence")]
        confidence: f64,
    },
    #[serde(rename = "wait")]
    Wait {
        #[serde(rename = "retryAfterMs")]
        retry_after_ms: u64,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "hijack")]
    Hijack { reason: String },
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearParams {
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitParams {
    #[serde(rename = "retryAfterMs")]
    pub retry_after_ms: u64,
    #[serde(default)]
    pub reason: Option<String>,
}

// =============================================================================
// Hijack / action / resume
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HijackParams {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionParams {
    pub cmd: ActionCommand,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeParams {
    #[serde(default = "default_true", rename = "re_check")]
    pub re_check: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishParams {
    #[serde(default)]
    pub reason: Option<String>,
}

// =============================================================================
// Health status
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSummary {
    pub layer: String,
    pub is_sentinel: bool,
    pub priority: u8,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub version: String,
    pub uptime_seconds: u64,
    pub participants: Vec<ParticipantSummary>,
    pub queue_length: usize,
    pub lock_held: bool,
    pub auth_enabled: bool,
    pub tls_enabled: bool,
    pub healthy: bool,
}
