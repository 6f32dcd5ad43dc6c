//! Settings types.
//!
//! Every struct is `#[serde(default)]`, so a settings file only needs the keys
//! it overrides.

use autobridge_core::version::FeatureGate;
use serde::{Deserialize, Serialize};

/// Root settings for one bridge instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// Master switch; a disabled bridge refuses every request.
    pub enabled: bool,
    /// Peer host.
    pub host: String,
    /// Peer ports, tried in order.
    pub ports: Vec<u16>,
    /// WebSocket sub-protocols offered on connect.
    pub protocols: Vec<String>,
    /// Shared-secret capability token; `None` disables the check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability_token: Option<String>,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
    /// Connect, handshake and request deadlines.
    pub timeouts: TimeoutSettings,
    /// Liveness heartbeat.
    pub heartbeat: HeartbeatSettings,
    /// Concurrency and frame-size limits.
    pub limits: LimitSettings,
    /// Actions that finish with a completion event.
    pub completion: CompletionSettings,
    /// Action-echo validation exemptions.
    pub echo: EchoSettings,
    /// Request coalescing.
    pub coalesce: CoalesceSettings,
    /// Peer version compatibility.
    pub version: VersionSettings,
    /// Launching the peer when it cannot be reached.
    pub auto_launch: AutoLaunchSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            ports: vec![8090, 8091],
            protocols: vec!["mcp-automation".to_string()],
            capability_token: None,
            log_level: "warn".to_string(),
            timeouts: TimeoutSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            limits: LimitSettings::default(),
            completion: CompletionSettings::default(),
            echo: EchoSettings::default(),
            coalesce: CoalesceSettings::default(),
            version: VersionSettings::default(),
            auto_launch: AutoLaunchSettings::default(),
        }
    }
}

/// Deadlines, all in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    /// Opening the transport.
    pub connect_timeout_ms: u64,
    /// Hello/ack exchange.
    pub handshake_timeout_ms: u64,
    /// Pause between transport open and sending hello.
    pub hello_delay_ms: u64,
    /// Default per-request deadline.
    pub request_timeout_ms: u64,
    /// Default wait for a completion event after the initial response.
    pub event_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            hello_delay_ms: 50,
            request_timeout_ms: 30_000,
            event_timeout_ms: 120_000,
        }
    }
}

/// Heartbeat settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Ping interval; `0` disables the heartbeat.
    pub interval_ms: u64,
    /// Silence after which connections are closed.
    pub timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 90_000,
        }
    }
}

/// Concurrency and size limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Requests allowed on the wire at once.
    pub max_pending_requests: usize,
    /// Requests allowed to wait for a free slot.
    pub max_queued_requests: usize,
    /// Inbound frames above this size are dropped.
    pub max_inbound_frame_bytes: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_pending_requests: 25,
            max_queued_requests: 100,
            max_inbound_frame_bytes: 5 * 1024 * 1024, // 5 MB
        }
    }
}

/// One action that settles on a completion event rather than its first response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRule {
    /// Action name (exact match).
    pub action: String,
    /// Boolean result field that marks the work as already finished.
    #[serde(default = "default_done_field")]
    pub done_field: String,
    /// Overrides the default event timeout for this action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_timeout_ms: Option<u64>,
}

fn default_done_field() -> String {
    "done".to_string()
}

impl CompletionRule {
    /// Rule with the given done field and the default event timeout.
    pub fn new(action: impl Into<String>, done_field: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            done_field: done_field.into(),
            event_timeout_ms: None,
        }
    }
}

/// Completion-event table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionSettings {
    /// Actions that wait for a completion event.
    pub event_actions: Vec<CompletionRule>,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            event_actions: vec![
                CompletionRule::new("save_asset", "saved"),
                CompletionRule::new("save_all", "saved"),
                CompletionRule::new("save_level", "saved"),
                CompletionRule::new("build_lighting", "done"),
            ],
        }
    }
}

/// Action-echo exemptions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EchoSettings {
    /// Actions known to echo a different sub-action.
    pub consolidated_actions: Vec<String>,
    /// Echo values starting with any of these are treated as resource paths.
    pub path_prefixes: Vec<String>,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            consolidated_actions: [
                "manage_asset",
                "manage_blueprint",
                "control_actor",
                "control_editor",
                "manage_level",
                "system_control",
                "inspect",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            path_prefixes: vec!["/".to_string()],
        }
    }
}

/// Coalescing settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoalesceSettings {
    /// Side-effect-free actions whose identical in-flight calls share one request.
    pub actions: Vec<String>,
}

impl Default for CoalesceSettings {
    fn default() -> Self {
        Self {
            actions: [
                "list_assets",
                "get_asset",
                "get_actors",
                "get_level_info",
                "get_project_settings",
                "get_editor_state",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Peer version expectations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionSettings {
    /// Oldest peer version considered fully supported.
    pub minimum_peer_version: String,
    /// Features that need a newer peer.
    pub feature_gates: Vec<FeatureGate>,
}

impl Default for VersionSettings {
    fn default() -> Self {
        Self {
            minimum_peer_version: "0.5.0".to_string(),
            feature_gates: vec![
                FeatureGate::new("sequencer", "0.5.0"),
                FeatureGate::new("material_authoring", "0.5.0"),
                FeatureGate::new("python_execution", "0.6.0"),
            ],
        }
    }
}

/// How the peer process is launched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Full editor.
    #[default]
    Editor,
    /// Standalone game.
    Game,
}

/// Auto-launch settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoLaunchSettings {
    /// Whether a failed lazy connect may launch the peer.
    pub enabled: bool,
    /// Project to open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    /// Peer executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor_path: Option<String>,
    /// Launch mode.
    pub mode: LaunchMode,
    /// Extra command-line arguments.
    pub additional_args: Vec<String>,
    /// Leave the peer running when the bridge exits.
    pub detached: bool,
    /// How long to wait for the launched peer to accept a connection.
    pub timeout_ms: u64,
    /// Readiness poll interval.
    pub poll_interval_ms: u64,
}

impl Default for AutoLaunchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            project_path: None,
            editor_path: None,
            mode: LaunchMode::Editor,
            additional_args: Vec::new(),
            detached: true,
            timeout_ms: 180_000,
            poll_interval_ms: 2_000,
        }
    }
}
