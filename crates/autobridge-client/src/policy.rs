//! Per-action policies, built from settings.
//!
//! - [`CompletionPolicy`]: which actions settle on a completion event
//! - [`EchoPolicy`]: how a response's echoed action is validated
//! - [`CoalescePolicy`]: which requests may share one wire round trip

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use autobridge_settings::{BridgeSettings, CompletionRule};
use serde_json::Value;

/// Actions that finish with a completion event.
#[derive(Clone, Debug, Default)]
pub struct CompletionPolicy {
    rules: Arc<HashMap<String, CompletionRule>>,
    default_event_timeout: Duration,
}

impl CompletionPolicy {
    /// Build from explicit rules.
    pub fn new(
        rules: impl IntoIterator<Item = CompletionRule>,
        default_event_timeout: Duration,
    ) -> Self {
        let rules = rules.into_iter().map(|r| (r.action.clone(), r)).collect();
        Self {
            rules: Arc::new(rules),
            default_event_timeout,
        }
    }

    /// Build from settings.
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self::new(
            settings.completion.event_actions.iter().cloned(),
            Duration::from_millis(settings.timeouts.event_timeout_ms),
        )
    }

    /// Whether `action` waits for a completion event.
    pub fn requires_event(&self, action: &str) -> bool {
        self.rules.contains_key(action)
    }

    /// How long to wait for the completion event of `action`.
    pub fn event_timeout(&self, action: &str) -> Duration {
        self.rules
            .get(action)
            .and_then(|r| r.event_timeout_ms)
            .map_or(self.default_event_timeout, Duration::from_millis)
    }

    /// Whether an initial result already carries the done marker.
    pub fn is_done(&self, action: &str, result: Option<&Value>) -> bool {
        let Some(rule) = self.rules.get(action) else {
            return false;
        };
        result
            .and_then(|r| r.get(&rule.done_field))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Result of comparing an echoed action with the requested one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EchoVerdict {
    /// The response did not echo an action.
    NoEcho,
    /// Prefix match in either direction.
    Match,
    /// The echo looks like a resource path.
    PathExempt,
    /// The requested action is allowed to echo a sub-action.
    ConsolidatedExempt,
    /// Anything else.
    Mismatch,
}

impl EchoVerdict {
    /// Whether the response can be delivered unchanged.
    pub fn is_accepted(self) -> bool {
        self != Self::Mismatch
    }
}

/// Action-echo validation.
#[derive(Clone, Debug, Default)]
pub struct EchoPolicy {
    consolidated: Arc<HashSet<String>>,
    path_prefixes: Arc<Vec<String>>,
}

impl EchoPolicy {
    /// Build from an allow-list and path prefixes.
    pub fn new(
        consolidated: impl IntoIterator<Item = String>,
        path_prefixes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            consolidated: Arc::new(
                consolidated
                    .into_iter()
                    .map(|a| a.to_lowercase())
                    .collect(),
            ),
            path_prefixes: Arc::new(
                path_prefixes
                    .into_iter()
                    .filter(|p| !p.is_empty())
                    .collect(),
            ),
        }
    }

    /// Build from settings.
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self::new(
            settings.echo.consolidated_actions.iter().cloned(),
            settings.echo.path_prefixes.iter().cloned(),
        )
    }

    /// Compare `echoed` with the `expected` action.
    pub fn check(&self, expected: &str, echoed: Option<&str>) -> EchoVerdict {
        let Some(echoed) = echoed.map(str::trim).filter(|e| !e.is_empty()) else {
            return EchoVerdict::NoEcho;
        };
        let expected_lc = expected.trim().to_lowercase();
        let echoed_lc = echoed.to_lowercase();

        if echoed_lc.starts_with(&expected_lc) || expected_lc.starts_with(&echoed_lc) {
            EchoVerdict::Match
        } else if self.path_prefixes.iter().any(|p| echoed.starts_with(p.as_str())) {
            EchoVerdict::PathExempt
        } else if self.consolidated.contains(&expected_lc) {
            EchoVerdict::ConsolidatedExempt
        } else {
            EchoVerdict::Mismatch
        }
    }
}

/// Request coalescing.
#[derive(Clone, Debug, Default)]
pub struct CoalescePolicy {
    actions: Arc<HashSet<String>>,
}

impl CoalescePolicy {
    /// Build from the eligible action names.
    pub fn new(actions: impl IntoIterator<Item = String>) -> Self {
        Self {
            actions: Arc::new(actions.into_iter().collect()),
        }
    }

    /// Build from settings.
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self::new(settings.coalesce.actions.iter().cloned())
    }

    /// Key for `action` and `payload`, or `None` if the action is not eligible.
    ///
    /// Object keys are sorted so payloads that differ only in key order
    /// share a key.
    pub fn key(&self, action: &str, payload: &Value) -> Option<String> {
        if !self.actions.contains(action) {
            return None;
        }
        let mut key = String::with_capacity(action.len() + 64);
        key.push_str(action);
        key.push(':');
        write_canonical(payload, &mut key);
        Some(key)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
