//! The page driver boundary (C3 collaborator).
//!
//! The Hub never talks to a browser directly — spec.md treats the actual
//! page automation engine as an external collaborator the Hub orchestrates
//! around. `PageDriver` is the seam: a real deployment wires in whatever
//! drives the page (CDP, a headless browser pool, ...); tests and
//! `--dry-run`/ghost mode wire in [`NullDriver`].

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::{ActionCommand, ElementRect};
use crate::resolver::Candidate;

/// One obstacle found during a pre-check DOM scan.
#[derive(Debug, Clone)]
pub struct ObstacleScan {
    pub blocking: Vec<crate::messages::BlockingElement>,
    pub target_rect: Option<ElementRect>,
    pub url: String,
    pub title: String,
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate to a URL (the `goto` verb).
    async fn goto(&self, url: &str) -> Result<()>;

    /// Scan the page for visible obstacle elements matching the union of
    /// declared Sentinel selectors (`declared_selectors`), plus the target
    /// rect for `target_selector` (the command currently at the head of the
    /// queue), feeding the pre-check broadcast.
    async fn scan_obstacles(
        &self,
        declared_selectors: &HashSet<String>,
        target_selector: Option<&str>,
    ) -> Result<ObstacleScan>;

    /// List candidate elements for goal resolution.
    async fn list_candidates(&self) -> Result<Vec<Candidate>>;

    /// Execute a queued command verb against a resolved selector. `value`
    /// carries fill/type text or a select option; `key` carries a `press`
    /// keystroke; `files` carries `upload` paths. Verbs that ignore a given
    /// field simply receive an empty/`None` value for it.
    async fn execute(
        &self,
        verb: &str,
        selector: &str,
        value: Option<&str>,
        key: Option<&str>,
        files: &[String],
    ) -> Result<()>;

    /// Execute a lock owner's direct action command (hijack/action).
    async fn execute_action(&self, cmd: ActionCommand, selector: Option<&str>, text: Option<&str>) -> Result<()>;

    /// Always-on obstacle remediation: walk the page (including shadow
    /// roots) and hide elements matching the closed set of obstacle classes
    /// implied by `selector_hint`. Invoked by the Hub whenever a lock
    /// owner's action selector suggests one of those classes.
    async fn sovereign_remediate(&self, selector_hint: &str) -> Result<()>;

    /// Capture a screenshot, returned as a base64-encoded PNG.
    async fn screenshot(&self) -> Result<String>;

    /// Extract the page's visible text, fed into `pre_check` only when a
    /// relevant Sentinel declared the `pii-detection` capability.
    async fn page_text(&self) -> Result<String>;

    /// Whether the DOM is still mutating (drives entropy_stream).
    async fn is_dom_settled(&self) -> Result<bool>;
}

/// A driver that performs no real browser I/O. Used for unit/integration
/// tests and `--dry-run` ghost-mode runs where the Hub should exercise its
/// full control-flow logic without touching a page.
#[derive(Default)]
pub struct NullDriver;

#[async_trait]
impl PageDriver for NullDriver {
    async fn goto(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn scan_obstacles(
        &self,
        _declared_selectors: &HashSet<String>,
        _target_selector: Option<&str>,
    ) -> Result<ObstacleScan> {
        Ok(ObstacleScan {
            blocking: Vec::new(),
            target_rect: None,
            url: "about:blank".to_string(),
            title: String::new(),
        })
    }

    async fn list_candidates(&self) -> Result<Vec<Candidate>> {
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
        _cmd: ActionCommand,
        _selector: Option<&str>,
        _text: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    async fn screenshot(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn page_text(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn sovereign_remediate(&self, _selector_hint: &str) -> Result<()> {
        Ok(())
    }

    async fn is_dom_settled(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_driver_never_fails() {
        let driver = NullDriver;
        driver.goto("https://example.com").await.unwrap();
        assert!(driver.list_candidates().await.unwrap().is_empty());
        assert!(driver.is_dom_settled().await.unwrap());
    }
}
