//! Semantic goal -> selector resolution (C6).
//!
//! A command may arrive with an explicit `selector` (used as-is) or a
//! natural-language `goal` that must be resolved against a live page
//! snapshot of candidate elements. Resolution tries, in order: exact
//! selector, learned memory (tagged `selfHealed`), then a family-specific
//! candidate match (click-like vs fill/upload vs select vs check/uncheck),
//! optionally piercing shadow roots up to a configured depth. Failure to
//! resolve yields no selector at all — the caller surfaces `Error::Resolution`.

use std::collections::HashMap;

use tracing::debug;

use crate::messages::CommandVerb;

/// One resolvable element observed on the page, as reported by the
/// driver's DOM scan.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub selector: String,
    pub tag: String,
    pub role: Option<String>,
    pub text: Option<String>,
    pub placeholder: Option<String>,
    pub label: Option<String>,
    pub name_attr: Option<String>,
    pub shadow_selector: Option<String>,
    pub shadow_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSelector {
    pub selector: String,
    pub self_healed: bool,
    pub shadow_pierced: bool,
}

/// Learned goal -> selector associations, keyed by the literal goal string.
/// Owned by `memory.rs`; the resolver only reads through this trait so it
/// doesn't need to know about persistence.
pub trait MemoryLookup {
    fn recall(&self, goal: &str) -> Option<&str>;
}

impl MemoryLookup for HashMap<String, String> {
    fn recall(&self, goal: &str) -> Option<&str> {
        self.get(goal).map(String::as_str)
    }
}

pub struct Resolver {
    max_shadow_depth: u32,
}

impl Resolver {
    pub fn new(max_shadow_depth: u32) -> Self {
        Self { max_shadow_depth }
    }

    /// Resolve a command's target. An explicit selector always wins.
    /// Otherwise a goal is matched against `candidates` using the verb's
    /// candidate family, falling back to learned memory.
    pub fn resolve(
        &self,
        verb: CommandVerb,
        explicit_selector: Option<&str>,
        goal: Option<&str>,
        candidates: &[Candidate],
        memory: &dyn MemoryLookup,
    ) -> Option<ResolvedSelector> {
        if let Some(selector) = explicit_selector {
            return Some(ResolvedSelector {
                selector: selector.to_string(),
                self_healed: false,
                shadow_pierced: false,
            });
        }

        let goal = goal?;

        if let Some(found) = self.match_candidate(verb, goal, candidates) {
            return Some(found);
        }

        if let Some(remembered) = memory.recall(goal) {
            debug!(goal, selector = remembered, "resolved via memory fallback");
            return Some(ResolvedSelector {
                selector: remembered.to_string(),
                self_healed: true,
                shadow_pierced: false,
            });
        }

        None
    }

    fn match_candidate(
        &self,
        verb: CommandVerb,
        goal: &str,
        candidates: &[Candidate],
    ) -> Option<ResolvedSelector> {
        let goal_lower = goal.to_lowercase();

        let scored = candidates.iter().filter(|c| {
            if c.shadow_selector.is_some() && c.shadow_depth > self.max_shadow_depth {
                return false;
            }
            family_matches(verb, c)
        });

        let best = if verb.is_click_like() {
            scored.max_by_key(|c| click_like_score(&goal_lower, c))
        } else {
            scored.max_by_key(|c| field_score(&goal_lower, c))
        };

        let best = best.filter(|c| {
            if verb.is_click_like() {
                click_like_score(&goal_lower, c) > 0
            } else {
                field_score(&goal_lower, c) > 0
            }
        })?;

        Some(ResolvedSelector {
            selector: best
                .shadow_selector
                .clone()
                .unwrap_or_else(|| best.selector.clone()),
            self_healed: false,
            shadow_pierced: best.shadow_selector.is_some(),
        })
    }
}

fn family_matches(verb: CommandVerb, c: &Candidate) -> bool {
    match verb {
        CommandVerb::Click | CommandVerb::Hover | CommandVerb::Scroll => {
            matches!(c.tag.as_str(), "button" | "a" | "input" | "div" | "span")
                || matches!(c.role.as_deref(), Some("button") | Some("link"))
        }
        CommandVerb::Fill | CommandVerb::Upload | CommandVerb::Type => {
            matches!(c.tag.as_str(), "input" | "textarea")
        }
        CommandVerb::Select => c.tag == "select",
        CommandVerb::Check | CommandVerb::Uncheck => {
            c.tag == "input" && matches!(c.role.as_deref(), Some("checkbox") | Some("radio"))
        }
        CommandVerb::Goto | CommandVerb::Press | CommandVerb::Checkpoint => false,
    }
}

fn click_like_score(goal_lower: &str, c: &Candidate) -> i32 {
    let mut score = 0;
    if let Some(text) = &c.text {
        if text.to_lowercase() == *goal_lower {
            score += 100;
        } else if text.to_lowercase().contains(goal_lower) {
            score += 40;
        }
    }
    if let Some(role) = &c.role {
        if goal_lower.contains(role.as_str()) {
            score += 5;
        }
    }
    score
}

fn field_score(goal_lower: &str, c: &Candidate) -> i32 {
    let mut score = 0;
    for field in [&c.label, &c.placeholder, &c.name_attr] {
        if let Some(value) = field {
            let value_lower = value.to_lowercase();
            if value_lower == *goal_lower {
                score += 100;
            } else if value_lower.contains(goal_lower) || goal_lower.contains(&value_lower) {
                score += 40;
            }
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(selector: &str, tag: &str) -> Candidate {
        Candidate {
            selector: selector.to_string(),
            tag: tag.to_string(),
            role: None,
            text: None,
            placeholder: None,
            label: None,
            name_attr: None,
            shadow_selector: None,
            shadow_depth: 0,
        }
    }

    #[test]
    fn explicit_selector_always_wins() {
        let resolver = Resolver::new(3);
        let memory = HashMap::new();
        let result = resolver.resolve(
            CommandVerb::Click,
            Some("#submit"),
            Some("Submit the form"),
            &[],
            &memory,
        );
        assert_eq!(result.unwrap().selector, "#submit");
    }

    #[test]
    fn click_like_matches_on_button_text() {
        let resolver = Resolver::new(3);
        let memory = HashMap::new();
        let candidates = vec![Candidate {
            text: Some("Accept Cookies".into()),
            ..candidate("button.cookie-accept", "button")
        }];
        let result = resolver
            .resolve(
                CommandVerb::Click,
                None,
                Some("Accept Cookies"),
                &candidates,
                &memory,
            )
            .unwrap();
        assert_eq!(result.selector, "button.cookie-accept");
        assert!(!result.self_healed);
        assert!(!result.shadow_pierced);
    }

    #[test]
    fn fill_matches_on_label() {
        let resolver = Resolver::new(3);
        let memory = HashMap::new();
        let candidates = vec![Candidate {
            label: Some("Email address".into()),
            ..candidate("#email", "input")
        }];
        let result = resolver
            .resolve(CommandVerb::Fill, None, Some("Email address"), &candidates, &memory)
            .unwrap();
        assert_eq!(result.selector, "#email");
    }

    #[test]
    fn falls_back_to_memory_when_no_live_candidate_matches() {
        let resolver = Resolver::new(3);
        let mut memory = HashMap::new();
        memory.insert("Accept Cookies".to_string(), "#legacy-accept".to_string());
        let result = resolver
            .resolve(CommandVerb::Click, None, Some("Accept Cookies"), &[], &memory)
            .unwrap();
        assert_eq!(result.selector, "#legacy-accept");
        assert!(result.self_healed);
    }

    #[test]
    fn no_match_and_no_memory_yields_none() {
        let resolver = Resolver::new(3);
        let memory = HashMap::new();
        let result = resolver.resolve(CommandVerb::Click, None, Some("Nonexistent"), &[], &memory);
        assert!(result.is_none());
    }

    #[test]
    fn shadow_candidate_beyond_depth_is_excluded() {
        let resolver = Resolver::new(1);
        let memory = HashMap::new();
        let candidates = vec![Candidate {
            text: Some("Submit".into()),
            shadow_selector: Some("deep-shadow >>> button".into()),
            shadow_depth: 5,
            ..candidate("button", "button")
        }];
        let result = resolver.resolve(CommandVerb::Click, None, Some("Submit"), &candidates, &memory);
        assert!(result.is_none());
    }

    #[test]
    fn shadow_candidate_within_depth_is_tagged_pierced() {
        let resolver = Resolver::new(3);
        let memory = HashMap::new();
        let candidates = vec![Candidate {
            text: Some("Submit".into()),
            shadow_selector: Some("deep-shadow >>> button".into()),
            shadow_depth: 2,
            ..candidate("button", "button")
        }];
        let result = resolver
            .resolve(CommandVerb::Click, None, Some("Submit"), &candidates, &memory)
            .unwrap();
        assert!(result.shadow_pierced);
        assert_eq!(result.selector, "deep-shadow >>> button");
    }
}
