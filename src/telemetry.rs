//! Telemetry & mission trace (C8): a bounded rolling log of everything the
//! Hub did during a mission, an HTML report renderer, and screenshot folder
//! upkeep.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::messages::AccessibilityContext;

/// One entry in the mission trace. Kept small and serializable so the
/// trace can be written out as `mission_trace.json` for a later mission's
/// aura learning (see `memory.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp_ms: u64,
    pub unstable: bool,
    pub record: ReportRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ReportRecord {
    Hijack {
        layer: String,
        reason: String,
        #[serde(default)]
        screenshot: Option<String>,
    },
    Command {
        verb: String,
        selector: Option<String>,
        goal: Option<String>,
        success: bool,
        self_healed: bool,
        forced_proceed: bool,
        predictive_wait: bool,
        duration_ms: u64,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        before_screenshot: Option<String>,
        #[serde(default)]
        after_screenshot: Option<String>,
    },
    Failure {
        verb: String,
        error: String,
    },
}

/// Aggregate counts over a mission, used both in the HTML report header and
/// exposed on `/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MissionStats {
    pub commands_executed: usize,
    pub commands_failed: usize,
    pub hijacks: usize,
    pub self_healed: usize,
    /// Sum of settle duration across self-healed commands, for the
    /// mean-time-to-recovery figure in the report's business-value block.
    pub self_heal_duration_ms: u64,
}

impl MissionStats {
    /// Success rate over all commands this mission attempted.
    pub fn success_rate(&self) -> f64 {
        if self.commands_executed == 0 {
            return 1.0;
        }
        let succeeded = self.commands_executed.saturating_sub(self.commands_failed);
        succeeded as f64 / self.commands_executed as f64
    }

    /// Average time a self-healed command took to settle, in milliseconds.
    pub fn mean_time_to_recovery_ms(&self) -> f64 {
        if self.self_healed == 0 {
            return 0.0;
        }
        self.self_heal_duration_ms as f64 / self.self_healed as f64
    }

    /// Estimated operator minutes saved this mission (self-heals plus
    /// hijacks the system absorbed without a human stepping in blind).
    pub fn saved_minutes(&self) -> f64 {
        self.self_healed as f64 * SAVED_MINUTES_PER_SELF_HEAL
            + self.hijacks as f64 * SAVED_MINUTES_PER_HIJACK
    }
}

/// Bounded rolling trace: oldest entries are dropped once `capacity` is
/// exceeded, so a long-running mission can't grow the trace without bound.
pub struct MissionTrace {
    entries: Vec<TraceEntry>,
    capacity: usize,
    stats: MissionStats,
}

impl MissionTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            stats: MissionStats::default(),
        }
    }

    pub fn push(&mut self, timestamp_ms: u64, unstable: bool, record: ReportRecord) {
        match &record {
            ReportRecord::Command {
                success,
                self_healed,
                duration_ms,
                ..
            } => {
                self.stats.commands_executed += 1;
                if !success {
                    self.stats.commands_failed += 1;
                }
                if *self_healed {
                    self.stats.self_healed += 1;
                    self.stats.self_heal_duration_ms += duration_ms;
                }
            }
            ReportRecord::Hijack { .. } => self.stats.hijacks += 1,
            ReportRecord::Failure { .. } => self.stats.commands_failed += 1,
        }

        self.entries.push(TraceEntry {
            timestamp_ms,
            unstable,
            record,
        });
        if self.entries.len() > self.capacity {
            let overflow = self.entries.len() - self.capacity;
            self.entries.drain(0..overflow);
        }
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn stats(&self) -> &MissionStats {
        &self.stats
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "entries": self.entries, "stats": self.stats })
    }
}

/// Decode a base64 PNG payload from the driver and write it to `dir` under
/// an epoch-ms prefixed name (§6's `screenshots/` convention). Returns the
/// path written, or `None` if the payload was empty (ghost mode, or a
/// driver that doesn't support screenshots).
pub fn save_screenshot(dir: &Path, label: &str, base64_png: &str) -> Option<PathBuf> {
    if base64_png.is_empty() {
        return None;
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(base64_png)
        .map_err(|e| warn!(error = %e, "screenshot payload was not valid base64"))
        .ok()?;
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(?dir, error = %e, "failed to create screenshots directory");
        return None;
    }
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let path = dir.join(format!("{epoch_ms}-{label}.png"));
    if let Err(e) = std::fs::write(&path, bytes) {
        warn!(?path, error = %e, "failed to write screenshot");
        return None;
    }
    Some(path)
}

/// Rough business-value estimate for the report: minutes saved by each
/// self-heal (an operator would otherwise have to fix a broken selector by
/// hand) and each hijack (a human would otherwise have had to intervene).
const SAVED_MINUTES_PER_SELF_HEAL: f64 = 2.0;
const SAVED_MINUTES_PER_HIJACK: f64 = 1.0;

/// Minimal HTML escaping: the five characters that matter inside text nodes
/// and double-quoted attributes.
fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn badge(label: &str) -> String {
    format!("<span class=\"badge badge-{0}\">{0}</span>", escape_html(label))
}

fn img_or_none(path: &Option<String>) -> String {
    match path {
        Some(p) => format!("<img src=\"{}\" loading=\"lazy\">", escape_html(p)),
        None => "<span class=\"none\">none</span>".to_string(),
    }
}

/// Render one per-command card: selector/goal, before/after screenshots,
/// and a badge row for FORCED/SELF-HEALED/AURA.
fn command_card(ts: u64, record_fields: CommandCardFields<'_>) -> String {
    let mut badges = String::new();
    if record_fields.forced_proceed {
        badges.push_str(&badge("FORCED"));
    }
    if record_fields.self_healed {
        badges.push_str(&badge("SELF-HEALED"));
    }
    if record_fields.predictive_wait {
        badges.push_str(&badge("AURA"));
    }
    if !record_fields.success {
        badges.push_str(&badge("FAILED"));
    }

    format!(
        "<div class=\"card command\">\n\
         <h3>t={ts}ms — {verb} {selector}</h3>\n\
         <p>goal: {goal} · {dur}ms</p>\n\
         <p>{badges}</p>\n\
         {error}\n\
         <div class=\"shots\"><div>before {before}</div><div>after {after}</div></div>\n\
         </div>\n",
        ts = ts,
        verb = escape_html(record_fields.verb),
        selector = escape_html(record_fields.selector.unwrap_or("-")),
        goal = escape_html(record_fields.goal.unwrap_or("-")),
        dur = record_fields.duration_ms,
        badges = badges,
        error = record_fields
            .error
            .map(|e| format!("<p class=\"error\">{}</p>", escape_html(e)))
            .unwrap_or_default(),
        before = img_or_none(&record_fields.before_screenshot.map(str::to_string)),
        after = img_or_none(&record_fields.after_screenshot.map(str::to_string)),
    )
}

struct CommandCardFields<'a> {
    verb: &'a str,
    selector: Option<&'a str>,
    goal: Option<&'a str>,
    success: bool,
    self_healed: bool,
    forced_proceed: bool,
    predictive_wait: bool,
    duration_ms: u64,
    error: Option<&'a str>,
    before_screenshot: Option<&'a str>,
    after_screenshot: Option<&'a str>,
}

/// Render a mission trace as a standalone HTML report: per-command cards,
/// hijack/failure cards, an accessibility dashboard, and a business-value
/// block (§4.8). Pure function of its inputs so it's trivially unit-testable
/// without a filesystem or driver.
pub fn render_html_report(
    mission_id: &str,
    trace: &MissionTrace,
    accessibility: Option<&AccessibilityContext>,
) -> String {
    let stats = trace.stats();
    let mut cards = String::new();
    for entry in trace.entries() {
        let card = match &entry.record {
            ReportRecord::Hijack {
                layer,
                reason,
                screenshot,
            } => format!(
                "<div class=\"card hijack\"><h3>t={}ms — HIJACK by {}</h3><p>{}</p>{}</div>\n",
                entry.timestamp_ms,
                escape_html(layer),
                escape_html(reason),
                img_or_none(screenshot),
            ),
            ReportRecord::Command {
                verb,
                selector,
                goal,
                success,
                self_healed,
                forced_proceed,
                predictive_wait,
                duration_ms,
                error,
                before_screenshot,
                after_screenshot,
            } => command_card(
                entry.timestamp_ms,
                CommandCardFields {
                    verb,
                    selector: selector.as_deref(),
                    goal: goal.as_deref(),
                    success: *success,
                    self_healed: *self_healed,
                    forced_proceed: *forced_proceed,
                    predictive_wait: *predictive_wait,
                    duration_ms: *duration_ms,
                    error: error.as_deref(),
                    before_screenshot: before_screenshot.as_deref(),
                    after_screenshot: after_screenshot.as_deref(),
                },
            ),
            ReportRecord::Failure { verb, error } => format!(
                "<div class=\"card failure\"><h3>t={}ms — FAILURE ({})</h3><p>{}</p></div>\n",
                entry.timestamp_ms,
                escape_html(verb),
                escape_html(error)
            ),
        };
        cards.push_str(&card);
    }

    let a11y_block = match accessibility {
        Some(a11y) => {
            let mut by_rule: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
            for v in &a11y.violations {
                *by_rule.entry(v.rule.as_str()).or_insert(0) += 1;
            }
            let mut rows = String::new();
            for (rule, count) in by_rule {
                rows.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td></tr>\n",
                    escape_html(rule),
                    count
                ));
            }
            format!(
                "<section class=\"a11y a11y-{bucket}\"><h2>Accessibility: {bucket} ({score:.2})</h2>\n\
                 <table border=\"1\"><thead><tr><th>rule</th><th>count</th></tr></thead><tbody>{rows}</tbody></table>\n\
                 </section>\n",
                bucket = a11y.bucket(),
                score = a11y.score,
                rows = rows,
            )
        }
        None => String::new(),
    };

    let business_value = format!(
        "<section class=\"business-value\"><h2>Business value</h2>\n\
         <p>success rate: {rate:.0}% · saved time: {saved:.1} min · interventions: {hijacks} \
         · mean time to recovery: {mttr:.0}ms</p></section>\n",
        rate = stats.success_rate() * 100.0,
        saved = stats.saved_minutes(),
        hijacks = stats.hijacks,
        mttr = stats.mean_time_to_recovery_ms(),
    );

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Mission {mission_id}</title>\n\
         <style>.badge{{display:inline-block;padding:2px 6px;margin-right:4px;border-radius:3px;\
         background:#eee;font-size:0.8em}}.card{{border:1px solid #ccc;padding:8px;margin:8px 0}}\
         .card.failure{{border-color:#c00}}.card.hijack{{border-color:#c90}}\
         .error{{color:#c00}}.shots img{{max-width:240px;margin-right:8px}}</style>\n\
         </head>\n\
         <body>\n<h1>Mission {mission_id}</h1>\n\
         <p>commands: {executed}, failed: {failed}, hijacks: {hijacks}, self-healed: {healed}</p>\n\
         {business_value}\
         {a11y_block}\
         <h2>Timeline</h2>\n{cards}</body></html>\n",
        mission_id = escape_html(mission_id),
        executed = stats.commands_executed,
        failed = stats.commands_failed,
        hijacks = stats.hijacks,
        healed = stats.self_healed,
        business_value = business_value,
        a11y_block = a11y_block,
        cards = cards,
    )
}

/// Delete screenshot files under `dir` older than `max_age`, run once at
/// Hub startup so a long-lived deployment doesn't accumulate disk usage
/// across missions.
pub fn cleanup_old_screenshots(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path: PathBuf = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if let Ok(age) = now.duration_since(modified) {
            if age > max_age {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(?path, error = %e, "failed to remove stale screenshot");
                    continue;
                }
                removed += 1;
            }
        }
    }
    if removed > 0 {
        info!(removed, "cleaned up stale screenshots");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(selector: &str, success: bool, self_healed: bool) -> ReportRecord {
        ReportRecord::Command {
            verb: "click".into(),
            selector: Some(selector.into()),
            goal: None,
            success,
            self_healed,
            forced_proceed: false,
            predictive_wait: false,
            duration_ms: 10,
            error: None,
            before_screenshot: None,
            after_screenshot: None,
        }
    }

    #[test]
    fn trace_capacity_drops_oldest_entries() {
        let mut trace = MissionTrace::new(2);
        trace.push(1, false, command("#a", true, false));
        trace.push(2, false, command("#b", true, false));
        trace.push(3, false, command("#c", true, false));
        assert_eq!(trace.entries().len(), 2);
        assert_eq!(trace.entries()[0].timestamp_ms, 2);
    }

    #[test]
    fn stats_count_failures_and_self_heals() {
        let mut trace = MissionTrace::new(10);
        trace.push(1, false, command("#x", false, true));
        assert_eq!(trace.stats().commands_failed, 1);
        assert_eq!(trace.stats().self_healed, 1);
        assert_eq!(trace.stats().mean_time_to_recovery_ms(), 10.0);
        assert!(trace.stats().saved_minutes() > 0.0);
    }

    #[test]
    fn html_report_escapes_untrusted_text() {
        let mut trace = MissionTrace::new(10);
        trace.push(
            1,
            false,
            ReportRecord::Hijack {
                layer: "<script>alert(1)</script>".into(),
                reason: "\"quoted\" & risky".into(),
                screenshot: None,
            },
        );
        let html = render_html_report("m-1", &trace, None);
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("&quot;quoted&quot;"));
    }

    #[test]
    fn html_report_includes_accessibility_dashboard() {
        let trace = MissionTrace::new(10);
        let a11y = AccessibilityContext {
            score: 0.6,
            violations: vec![crate::messages::AccessibilityViolation {
                rule: "color-contrast".into(),
                selector: Some("#a".into()),
                impact: Some("serious".into()),
            }],
        };
        let html = render_html_report("m-1", &trace, Some(&a11y));
        assert!(html.contains("needs-work"));
        assert!(html.contains("color-contrast"));
    }

    #[test]
    fn cleanup_on_missing_dir_is_a_noop() {
        let removed = cleanup_old_screenshots(Path::new("/nonexistent/path/xyz"), Duration::from_secs(1)).unwrap();
        assert_eq!(removed, 0);
    }
}
