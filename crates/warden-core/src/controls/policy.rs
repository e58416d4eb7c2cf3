//! Policy gate: pre-call authorization over call metadata.
//!
//! Rules match on tool-name patterns, destination host patterns, and action
//! prefixes. The most specific matching rule wins (tool specificity, then
//! destination, then action-prefix length, then strictness, then earliest
//! index). An empty selector list matches everything for that dimension.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a matched rule does to the call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
    RequireApproval,
}

impl PolicyAction {
    /// Strictness used as a tie-breaker: deny > require_approval > allow.
    fn strictness(self) -> u8 {
        match self {
            PolicyAction::Deny => 2,
            PolicyAction::RequireApproval => 1,
            PolicyAction::Allow => 0,
        }
    }
}

/// Whether non-allow verdicts are enforced or only reported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Enforce,
    /// Emit the policy event but admit the call anyway.
    DryRun,
}

/// One policy rule.
///
/// Tool patterns: `*` (any), `prefix*`, or exact. Destination patterns:
/// `*` (any), `*.suffix`, or exact host, case-insensitive. Action prefixes
/// match by `starts_with`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRule {
    pub id: String,
    pub action: PolicyAction,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub action_prefixes: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, action: PolicyAction) -> Self {
        Self {
            id: id.into(),
            action,
            tools: Vec::new(),
            destinations: Vec::new(),
            action_prefixes: Vec::new(),
            reason: None,
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_destinations<I, S>(mut self, destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destinations = destinations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_action_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.action_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// The reason surfaced in errors and events when this rule fires.
    pub fn effective_reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("policy blocked tool call")
    }
}

/// Approval request handed to an [`ApprovalHandler`] when a matched rule's
/// action is `require_approval`.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub rule_id: String,
    pub tool_name: String,
    pub run_key: String,
    pub destination: Option<String>,
    pub action: Option<String>,
    pub reason: String,
    pub args: Value,
}

/// Decides `require_approval` verdicts. Without a configured handler such
/// verdicts are treated as denials.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> bool;
}

/// Strip the scheme and path from a destination, leaving the host (with
/// port, if present): `https://api.example.com/v1` -> `api.example.com`.
pub(crate) fn normalize_destination(destination: &str) -> String {
    let rest = match destination.split_once("://") {
        Some((_, rest)) => rest,
        None => destination,
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    host.to_string()
}

/// Tool patterns: `*`, `prefix*`, exact.
pub(crate) fn tool_pattern_matches(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return tool_name.starts_with(prefix);
    }
    tool_name == pattern
}

fn tool_pattern_specificity(pattern: &str) -> i32 {
    if pattern == "*" {
        0
    } else if pattern.ends_with('*') {
        1
    } else {
        2
    }
}

/// Host patterns: `*`, `*.suffix`, exact, case-insensitive.
pub(crate) fn host_pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", suffix.to_ascii_lowercase()));
    }
    host.eq_ignore_ascii_case(pattern)
}

fn host_pattern_specificity(pattern: &str) -> i32 {
    if pattern == "*" {
        0
    } else if pattern.starts_with("*.") {
        1
    } else {
        2
    }
}

/// Per-rule match rank; compared lexicographically, higher wins, with the
/// earliest rule winning full ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MatchRank {
    tool_specificity: i32,
    destination_specificity: i32,
    action_prefix_len: i32,
    strictness: u8,
}

fn rank_rule(
    rule: &PolicyRule,
    tool_name: &str,
    destination: Option<&str>,
    action: Option<&str>,
) -> Option<MatchRank> {
    let tool_specificity = if rule.tools.is_empty() {
        -1
    } else {
        rule.tools
            .iter()
            .filter(|p| tool_pattern_matches(p, tool_name))
            .map(|p| tool_pattern_specificity(p))
            .max()?
    };

    let destination_specificity = if rule.destinations.is_empty() {
        -1
    } else {
        let host = destination?;
        rule.destinations
            .iter()
            .filter(|p| host_pattern_matches(p, host))
            .map(|p| host_pattern_specificity(p))
            .max()?
    };

    let action_prefix_len = if rule.action_prefixes.is_empty() {
        -1
    } else {
        let action = action?;
        rule.action_prefixes
            .iter()
            .filter(|p| action.starts_with(p.as_str()))
            .map(|p| p.len() as i32)
            .max()?
    };

    Some(MatchRank {
        tool_specificity,
        destination_specificity,
        action_prefix_len,
        strictness: rule.action.strictness(),
    })
}

/// Find the winning rule for the given call metadata, if any matches.
pub(crate) fn match_rule<'r>(
    rules: &'r [PolicyRule],
    tool_name: &str,
    destination: Option<&str>,
    action: Option<&str>,
) -> Option<&'r PolicyRule> {
    let mut best: Option<(&PolicyRule, MatchRank)> = None;

    for rule in rules {
        let Some(rank) = rank_rule(rule, tool_name, destination, action) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some((_, best_rank)) => {
                (
                    rank.tool_specificity,
                    rank.destination_specificity,
                    rank.action_prefix_len,
                    rank.strictness,
                ) > (
                    best_rank.tool_specificity,
                    best_rank.destination_specificity,
                    best_rank.action_prefix_len,
                    best_rank.strictness,
                )
            }
        };
        if better {
            best = Some((rule, rank));
        }
    }

    best.map(|(rule, _)| rule)
}
