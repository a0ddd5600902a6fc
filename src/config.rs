//! Hub configuration: a JSON file layered under CLI flags / env vars,
//! mirroring the layered builder-plus-environment-overrides shape of
//! `SentinelConfig`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowDomConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_shadow_max_depth")]
    pub max_depth: u32,
}

impl Default for ShadowDomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: default_shadow_max_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuraConfig {
    #[serde(default = "default_predictive_wait_ms")]
    pub predictive_wait_ms: u64,
}

impl Default for AuraConfig {
    fn default() -> Self {
        Self {
            predictive_wait_ms: default_predictive_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslConfig {
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub auth_token: Option<String>,
    #[serde(default)]
    pub ssl: SslConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChaosConfig {
    #[serde(default)]
    pub block_patterns: Vec<String>,
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub chaos: ChaosConfig,
}

fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    8080
}
fn default_heartbeat_timeout_ms() -> u64 {
    5000
}
fn default_mission_timeout_ms() -> u64 {
    180_000
}
fn default_lock_ttl_ms() -> u64 {
    5000
}
fn default_sync_budget_ms() -> u64 {
    30_000
}
fn default_consensus_timeout_ms() -> u64 {
    5000
}
fn default_quorum_threshold() -> f64 {
    1.0
}
fn default_max_pre_check_retries() -> u32 {
    3
}
fn default_entropy_throttle_ms() -> u64 {
    100
}
fn default_trace_max_events() -> usize {
    500
}
fn default_snapshot_max_bytes() -> usize {
    100_000
}
fn default_screenshot_max_age_ms() -> u64 {
    86_400_000
}
fn default_shadow_max_depth() -> u32 {
    5
}
fn default_predictive_wait_ms() -> u64 {
    1500
}
fn default_settle_delay_ms() -> u64 {
    500
}
fn default_self_heal_retry_delay_ms() -> u64 {
    100
}

/// The full recognized configuration surface (§6). Deserialized from a JSON
/// file and overridable per-field by CLI flags in [`Args`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub port: u16,
    pub heartbeat_timeout_ms: u64,
    pub mission_timeout_ms: u64,
    pub lock_ttl_ms: u64,
    pub sync_budget_ms: u64,
    pub consensus_timeout_ms: u64,
    pub quorum_threshold: f64,
    pub max_pre_check_retries: u32,
    pub entropy_throttle_ms: u64,
    pub trace_max_events: usize,
    pub snapshot_max_bytes: usize,
    pub enable_snapshots: bool,
    pub screenshot_max_age_ms: u64,
    pub shadow_dom: ShadowDomConfig,
    pub aura: AuraConfig,
    pub ghost_mode: bool,
    pub security: SecurityConfig,
    pub network: NetworkConfig,
    pub memory_file: Option<PathBuf>,
    pub ghost_file: Option<PathBuf>,
    pub trace_file: PathBuf,
    pub report_file: PathBuf,
    pub screenshots_dir: PathBuf,
    pub settle_delay_ms: u64,
    pub self_heal_retry_delay_ms: u64,
    pub shutdown_webhook_url: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            mission_timeout_ms: default_mission_timeout_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            sync_budget_ms: default_sync_budget_ms(),
            consensus_timeout_ms: default_consensus_timeout_ms(),
            quorum_threshold: default_quorum_threshold(),
            max_pre_check_retries: default_max_pre_check_retries(),
            entropy_throttle_ms: default_entropy_throttle_ms(),
            trace_max_events: default_trace_max_events(),
            snapshot_max_bytes: default_snapshot_max_bytes(),
            enable_snapshots: false,
            screenshot_max_age_ms: default_screenshot_max_age_ms(),
            shadow_dom: ShadowDomConfig::default(),
            aura: AuraConfig::default(),
            ghost_mode: false,
            security: SecurityConfig::default(),
            network: NetworkConfig::default(),
            memory_file: Some(PathBuf::from("starlight_memory.json")),
            ghost_file: Some(PathBuf::from("temporal_ghosting.json")),
            trace_file: PathBuf::from("mission_trace.json"),
            report_file: PathBuf::from("report.html"),
            screenshots_dir: PathBuf::from("screenshots"),
            settle_delay_ms: default_settle_delay_ms(),
            self_heal_retry_delay_ms: default_self_heal_retry_delay_ms(),
            shutdown_webhook_url: None,
        }
    }
}

impl HubConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.quorum_threshold) {
            return Err(Error::Config(format!(
                "quorumThreshold must be in [0,1], got {}",
                self.quorum_threshold
            )));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
    pub fn mission_timeout(&self) -> Duration {
        Duration::from_millis(self.mission_timeout_ms)
    }
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
    pub fn sync_budget(&self) -> Duration {
        Duration::from_millis(self.sync_budget_ms)
    }
    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout_ms)
    }
    pub fn screenshot_max_age(&self) -> Duration {
        Duration::from_millis(self.screenshot_max_age_ms)
    }
}

/// CLI entry point. A config file supplies the bulk of the surface in §6;
/// these flags cover the handful of things operators flip per-run.
#[derive(Debug, Parser)]
#[command(name = "starlight-hub", version, about = "Coordination Hub for the Starlight Protocol")]
pub struct Args {
    /// Path to a JSON config file (see HubConfig for the full schema).
    #[arg(long, env = "STARLIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long, env = "STARLIGHT_PORT")]
    pub port: Option<u16>,

    /// Run diagnostics without performing side-effecting page actions,
    /// building the ghost-latency table instead (§4.3).
    #[arg(long, env = "STARLIGHT_GHOST_MODE")]
    pub ghost_mode: bool,

    /// Shared secret Sentinels must present at registration.
    #[arg(long, env = "STARLIGHT_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Args {
    /// Build the effective config: file (if given) as the base, then CLI
    /// overrides layered on top.
    pub fn resolve(&self) -> Result<HubConfig> {
        let mut config = match &self.config {
            Some(path) => HubConfig::from_file(path)?,
            None => HubConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if self.ghost_mode {
            config.ghost_mode = true;
        }
        if let Some(token) = &self.auth_token {
            config.security.auth_token = Some(token.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_configuration_surface() {
        let config = HubConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.heartbeat_timeout_ms, 5000);
        assert_eq!(config.mission_timeout_ms, 180_000);
        assert_eq!(config.quorum_threshold, 1.0);
        assert_eq!(config.max_pre_check_retries, 3);
        assert!(config.shadow_dom.enabled);
        assert_eq!(config.shadow_dom.max_depth, 5);
        assert!(!config.ghost_mode);
    }

    #[test]
    fn rejects_out_of_range_quorum_threshold() {
        let mut config = HubConfig::default();
        config.quorum_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_round_trips_through_serde() {
        let config = HubConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: HubConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.port, config.port);
    }
}
