//! Lifecycle manager (C9): startup, the mission-wide watchdog, and
//! idempotent graceful shutdown.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::HubConfig;
use crate::error::Result;
use crate::hub::Hub;
use crate::telemetry::{cleanup_old_screenshots, render_html_report};

/// Where shutdown posts a success/failure notification, if configured.
/// Kept as a trait rather than a direct `reqwest` dependency so tests can
/// assert on what would have been sent without any network I/O.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn notify(&self, success: bool, reason: &str);
}

/// A sink that logs instead of making a network call — the default when no
/// webhook URL is configured, and what tests use.
pub struct LoggingWebhookSink;

#[async_trait]
impl WebhookSink for LoggingWebhookSink {
    async fn notify(&self, success: bool, reason: &str) {
        info!(success, reason, "shutdown webhook (logging sink, no URL configured)");
    }
}

pub struct Lifecycle {
    hub: Arc<Hub>,
    config: HubConfig,
    webhook: Arc<dyn WebhookSink>,
    shutdown_started: AtomicBool,
    shutdown_done: Notify,
}

impl Lifecycle {
    pub fn new(hub: Arc<Hub>, config: HubConfig, webhook: Arc<dyn WebhookSink>) -> Self {
        Self {
            hub,
            config,
            webhook,
            shutdown_started: AtomicBool::new(false),
            shutdown_done: Notify::new(),
        }
    }

    /// Bind the listener, run startup housekeeping, and spawn the control
    /// loop and mission watchdog. Returns once the server is ready to
    /// accept connections; callers should `axum::serve` the returned
    /// listener with `server::router`.
    pub async fn start(self: &Arc<Self>) -> Result<TcpListener> {
        if let Err(e) = cleanup_old_screenshots(&self.config.screenshots_dir, self.config.screenshot_max_age()) {
            warn!(error = %e, "screenshot cleanup failed");
        }

        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(crate::error::Error::Persistence)?;
        info!(addr, "listening");

        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            hub.run_control_loop().await;
        });

        let housekeeping_hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            housekeeping_hub.run_housekeeping_loop().await;
        });

        let lifecycle = Arc::clone(self);
        let mission_timeout = self.config.mission_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(mission_timeout).await;
            warn!("mission timeout elapsed, forcing shutdown");
            lifecycle.shutdown(Some("mission_timeout".to_string())).await;
        });

        Ok(listener)
    }

    /// Idempotent: a second call while shutdown is in progress (or after it
    /// completed) just waits for/returns once the first completes.
    pub async fn shutdown(self: &Arc<Self>, reason: Option<String>) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            self.shutdown_done.notified().await;
            return;
        }

        let reason = reason.unwrap_or_else(|| "requested".to_string());
        info!(reason = %reason, "shutdown starting");

        {
            let mut state = self.hub.state.lock().await;
            state.shutting_down = true;
        }

        // Give the in-flight command up to 5s to finish before we give up
        // waiting on it; if it's still running we record it as interrupted.
        let drained = tokio::time::timeout(Duration::from_secs(5), self.wait_for_drain()).await;
        if drained.is_err() {
            warn!("in-flight command did not finish within shutdown grace period");
            let mut state = self.hub.state.lock().await;
            let elapsed = self.hub.elapsed_ms();
            state.trace.push(
                elapsed,
                false,
                crate::telemetry::ReportRecord::Failure {
                    verb: "unknown".to_string(),
                    error: "interrupted by shutdown".to_string(),
                },
            );
        }

        // Let any late context_update/sovereign_update frames settle.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let success = self.persist_everything().await.is_ok();
        self.webhook.notify(success, &reason).await;

        self.shutdown_done.notify_waiters();
        info!("shutdown complete");
    }

    async fn wait_for_drain(&self) {
        loop {
            {
                let state = self.hub.state.lock().await;
                if !state.queue.is_processing() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn persist_everything(&self) -> Result<()> {
        let mut state = self.hub.state.lock().await;
        state.memory.flush()?;

        let trace_json = state.trace.to_json();
        std::fs::write(&self.config.trace_file, serde_json::to_string_pretty(&trace_json)?)?;

        let report = render_html_report("mission", &state.trace, state.accessibility.as_ref());
        std::fs::write(&self.config.report_file, report)?;

        info!(
            trace_file = %self.config.trace_file.display(),
            report_file = %self.config.report_file.display(),
            "mission artifacts written"
        );
        Ok(())
    }
}

/// Install SIGINT/SIGTERM handlers that trigger graceful shutdown.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NullDriver;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct RecordingWebhook {
        calls: StdMutex<Vec<(bool, String)>>,
    }

    #[async_trait]
    impl WebhookSink for RecordingWebhook {
        async fn notify(&self, success: bool, reason: &str) {
            self.calls.lock().unwrap().push((success, reason.to_string()));
        }
    }

    fn test_config(dir: &Path) -> HubConfig {
        let mut config = HubConfig::default();
        config.trace_file = dir.join("mission_trace.json");
        config.report_file = dir.join("report.html");
        config.memory_file = Some(dir.join("starlight_memory.json"));
        config.ghost_file = Some(dir.join("temporal_ghosting.json"));
        config.screenshots_dir = dir.join("screenshots");
        config
    }

    #[tokio::test]
    async fn shutdown_twice_behaves_as_once() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let hub = Arc::new(Hub::new(config.clone(), Arc::new(NullDriver)));
        let webhook = Arc::new(RecordingWebhook {
            calls: StdMutex::new(Vec::new()),
        });
        let lifecycle = Arc::new(Lifecycle::new(hub, config, webhook.clone()));

        let a = Arc::clone(&lifecycle);
        let b = Arc::clone(&lifecycle);
        tokio::join!(a.shutdown(None), b.shutdown(None));

        assert_eq!(webhook.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_writes_trace_and_report_files() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let hub = Arc::new(Hub::new(config.clone(), Arc::new(NullDriver)));
        let lifecycle = Arc::new(Lifecycle::new(hub, config.clone(), Arc::new(LoggingWebhookSink)));

        lifecycle.shutdown(None).await;

        assert!(config.trace_file.exists());
        assert!(config.report_file.exists());
    }
}
