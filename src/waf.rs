//! WAF gate
//!
//! Ordered, first-match-wins rule evaluation over the request line,
//! selected headers and a bounded body prefix. A matching rule either
//! blocks the request (generic 403, rule id logged only) or annotates it
//! and lets it pass. The compiled rule set is immutable behind an
//! `ArcSwap`, so it can be replaced at runtime without dropping in-flight
//! connections: requests already evaluating keep the snapshot they loaded.
//!
//! The built-in pack covers the classic injection families (SQLi, XSS,
//! path traversal, command injection); operator rules from the config are
//! appended after it and inherit the same ordering semantics.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::HeaderMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::WafConfig;

/// Severity attached to a rule, for log triage only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn parse(s: &str) -> Self {
        match s {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "critical" => Severity::Critical,
            _ => Severity::High,
        }
    }
}

/// Action taken when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Block,
    LogOnly,
}

/// Verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WafOutcome {
    /// No rule matched
    Pass,
    /// A blocking rule matched; the request must not reach the dispatcher
    Block { rule_id: String, severity: Severity },
    /// A log-only rule matched; annotate and forward
    LogOnly { rule_id: String, severity: Severity },
}

/// Request view handed to the gate. Body is already capped to the
/// configured scan budget.
pub struct WafRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a [u8]>,
}

#[derive(Debug)]
struct CompiledRule {
    id: String,
    pattern: Regex,
    action: RuleAction,
    severity: Severity,
}

#[derive(Debug, Default)]
struct RuleSet {
    enabled: bool,
    rules: Vec<CompiledRule>,
    max_body_scan_bytes: usize,
}

/// Built-in rule pack, evaluated ahead of operator rules. Order matters:
/// evaluation stops at the first blocking match.
const BUILTIN_RULES: &[(&str, &str, RuleAction, Severity)] = &[
    (
        "traversal-dotdot",
        r"(?i)(\.\./|\.\.\\|%2e%2e[%/\\]|%252e%252e)",
        RuleAction::Block,
        Severity::High,
    ),
    (
        "traversal-null-byte",
        r"(?i)(\x00|%00)",
        RuleAction::Block,
        Severity::High,
    ),
    (
        "sqli-union-select",
        r"(?i)\b(union\s+select|select\s+.+\s+from|insert\s+into|drop\s+(table|database))\b",
        RuleAction::Block,
        Severity::High,
    ),
    (
        "sqli-tautology",
        r#"(?i)('|")\s*(or|and)\s+('|")?\d+('|")?\s*=\s*('|")?\d+|\bor\s+1\s*=\s*1"#,
        RuleAction::Block,
        Severity::High,
    ),
    (
        "sqli-time-based",
        r"(?i)\b(sleep|benchmark|waitfor\s+delay)\s*\(",
        RuleAction::Block,
        Severity::High,
    ),
    (
        "xss-script-tag",
        r"(?i)<\s*/?\s*script[^>]*>",
        RuleAction::Block,
        Severity::Medium,
    ),
    (
        "xss-event-handler",
        r"(?i)\bon(error|load|click|mouseover|focus)\s*=",
        RuleAction::Block,
        Severity::Medium,
    ),
    (
        "xss-javascript-uri",
        r"(?i)\bjavascript\s*:",
        RuleAction::Block,
        Severity::Medium,
    ),
    (
        "cmd-injection",
        r"(?i)(;|\||`|&&|\|\|)\s*(ls|cat|id|whoami|nc|curl|wget|bash|sh|powershell)\b",
        RuleAction::Block,
        Severity::Critical,
    ),
    (
        "cmd-substitution",
        r"\$\([^)]*\)|`[^`]+`",
        RuleAction::Block,
        Severity::Critical,
    ),
    (
        "scanner-probe",
        r"(?i)(sqlmap|nikto|nessus|acunetix|dirbuster)",
        RuleAction::LogOnly,
        Severity::Low,
    ),
];

impl RuleSet {
    fn compile(config: &WafConfig) -> Self {
        let mut rules = Vec::new();

        if config.builtin_rules {
            for (id, pattern, action, severity) in BUILTIN_RULES {
                match Regex::new(pattern) {
                    Ok(re) => rules.push(CompiledRule {
                        id: (*id).to_string(),
                        pattern: re,
                        action: *action,
                        severity: *severity,
                    }),
                    Err(e) => warn!(rule = id, error = %e, "built-in rule failed to compile"),
                }
            }
        }

        for rule in &config.rules {
            match Regex::new(&rule.pattern) {
                Ok(re) => rules.push(CompiledRule {
                    id: rule.id.clone(),
                    pattern: re,
                    action: if rule.action == "log" {
                        RuleAction::LogOnly
                    } else {
                        RuleAction::Block
                    },
                    severity: Severity::parse(&rule.severity),
                }),
                Err(e) => warn!(rule = %rule.id, error = %e, "skipping invalid operator rule"),
            }
        }

        Self {
            enabled: config.enabled,
            rules,
            max_body_scan_bytes: config.max_body_scan_bytes,
        }
    }
}

/// The gate. Holds the active rule set snapshot.
pub struct WafGate {
    rules: ArcSwap<RuleSet>,
}

impl WafGate {
    pub fn new(config: &WafConfig) -> Self {
        Self {
            rules: ArcSwap::from_pointee(RuleSet::compile(config)),
        }
    }

    /// Swap in a recompiled rule set; in-flight evaluations keep their
    /// snapshot.
    pub fn install(&self, config: &WafConfig) {
        self.rules.store(Arc::new(RuleSet::compile(config)));
    }

    /// Evaluate a request. Logging-only matches are logged here; the first
    /// blocking match wins and ends evaluation.
    pub fn evaluate(&self, req: &WafRequest<'_>) -> WafOutcome {
        let rules = self.rules.load();
        if !rules.enabled {
            return WafOutcome::Pass;
        }

        let target = if req.query.is_empty() {
            req.path.to_string()
        } else {
            format!("{}?{}", req.path, req.query)
        };

        let mut log_only: Option<(&CompiledRule, &'static str)> = None;

        for rule in &rules.rules {
            let mut hit: Option<&'static str> = None;

            if rule.pattern.is_match(&target) {
                hit = Some("request-line");
            } else {
                for name in ["user-agent", "referer", "cookie", "x-forwarded-for"] {
                    if let Some(value) = req.headers.get(name) {
                        if let Ok(v) = value.to_str() {
                            if rule.pattern.is_match(v) {
                                hit = Some("header");
                                break;
                            }
                        }
                    }
                }
            }

            if hit.is_none() {
                if let Some(body) = req.body {
                    let slice = &body[..body.len().min(rules.max_body_scan_bytes)];
                    if let Ok(text) = std::str::from_utf8(slice) {
                        if rule.pattern.is_match(text) {
                            hit = Some("body");
                        }
                    }
                }
            }

            if let Some(location) = hit {
                match rule.action {
                    RuleAction::Block => {
                        warn!(
                            rule = %rule.id,
                            severity = ?rule.severity,
                            location,
                            method = req.method,
                            path = req.path,
                            "request blocked"
                        );
                        return WafOutcome::Block {
                            rule_id: rule.id.clone(),
                            severity: rule.severity,
                        };
                    }
                    RuleAction::LogOnly => {
                        // Remember the first log-only match but keep
                        // scanning: a later blocking rule still wins.
                        if log_only.is_none() {
                            log_only = Some((rule, location));
                        }
                    }
                }
            }
        }

        if let Some((rule, location)) = log_only {
            debug!(rule = %rule.id, location, path = req.path, "log-only rule matched");
            return WafOutcome::LogOnly {
                rule_id: rule.id.clone(),
                severity: rule.severity,
            };
        }

        WafOutcome::Pass
    }
}
