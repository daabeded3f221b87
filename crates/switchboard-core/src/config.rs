//! Switchboard configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup; a
//! missing file means defaults, a malformed file is an error.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub gateway: GatewayConfig,
    pub registry: RegistryConfig,
    pub guard: GuardConfig,
    pub router: RouterConfig,
    pub handoff: HandoffConfig,
    pub policy: PolicyConfig,
    pub workflows: WorkflowsConfig,
    pub reasoning: ReasoningConfig,
}

/// Gateway configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: BindMode,
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 18789,
            bind: BindMode::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// Bind mode for the gateway
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    #[default]
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
            _ => BindMode::Lan,
        }
    }
}

/// Authentication configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Authentication mode
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Token,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often agents are expected to heartbeat.
    pub heartbeat_interval_secs: u64,
    /// An agent is expired after this many missed intervals.
    pub expiry_multiplier: u32,
    /// How often the background sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            expiry_multiplier: 3,
            sweep_interval_secs: 5,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(
            self.heartbeat_interval_secs
                .saturating_mul(u64::from(self.expiry_multiplier)),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Trailing window for per-tool call counting.
    pub window_secs: u64,
    /// Calls allowed inside the window; the next one is blocked.
    pub threshold: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window_secs: 30,
            threshold: 5,
        }
    }
}

impl GuardConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Agent every new session is bound to.
    pub entry_agent: String,
    /// Time an agent keeps running after its client disconnects.
    pub detach_grace_ms: u64,
    /// Budget for an agent to accept a session handshake.
    pub connect_timeout_ms: u64,
    /// Recent transcript lines kept for decision prompts.
    pub context_window: usize,
    /// Re-route to the entry agent when the bound agent drops.
    pub fallback_to_entry: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            entry_agent: "triage".to_string(),
            detach_grace_ms: 3_000,
            connect_timeout_ms: 5_000,
            context_window: 8,
            fallback_to_entry: true,
        }
    }
}

impl RouterConfig {
    pub fn detach_grace(&self) -> Duration {
        Duration::from_millis(self.detach_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// A tool whose result transfers the session to `target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandoffToolConfig {
    pub name: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    pub tools: Vec<HandoffToolConfig>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        let tool = |target: &str| HandoffToolConfig {
            name: format!("transfer_to_{}", target),
            target: target.to_string(),
        };
        Self {
            tools: vec![tool("triage"), tool("idv"), tool("banking"), tool("disputes")],
        }
    }
}

/// Router-side rule: when `from` reports `tool` with a truthy `outcome_field`,
/// move the session on to `to` without waiting for `from` to ask.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoRouteConfig {
    pub from: String,
    pub tool: String,
    #[serde(default = "default_outcome_field")]
    pub outcome_field: String,
    pub to: String,
}

fn default_outcome_field() -> String {
    "verified".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub auto_routes: Vec<AutoRouteConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_routes: vec![AutoRouteConfig {
                from: "idv".to_string(),
                tool: "perform_idv_check".to_string(),
                outcome_field: default_outcome_field(),
                to: "banking".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowsConfig {
    /// Directory of `*.toml` workflow definitions. Unset means no workflows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub enabled: bool,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub max_tokens: u32,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "claude-haiku-4-5-20251001".to_string(),
            api_url: None,
            max_tokens: 512,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl SwitchboardConfig {
    /// Load config from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                tracing::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Render the effective config as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = SwitchboardConfig::default();
        assert_eq!(c.gateway.port, 18789);
        assert_eq!(c.registry.heartbeat_timeout(), Duration::from_secs(45));
        assert_eq!(c.guard.threshold, 5);
        assert_eq!(c.guard.window(), Duration::from_secs(30));
        assert_eq!(c.router.entry_agent, "triage");
        assert_eq!(c.handoff.tools.len(), 4);
        assert_eq!(c.policy.auto_routes[0].to, "banking");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let c = SwitchboardConfig::from_toml_str(
            r#"
            [guard]
            threshold = 2

            [router]
            entry_agent = "greeter"
            "#,
        )
        .unwrap();
        assert_eq!(c.guard.threshold, 2);
        assert_eq!(c.guard.window_secs, 30);
        assert_eq!(c.router.entry_agent, "greeter");
        assert_eq!(c.router.detach_grace_ms, 3_000);
    }

    #[test]
    fn declared_tables_replace_defaults() {
        let c = SwitchboardConfig::from_toml_str(
            r#"
            [[handoff.tools]]
            name = "escalate"
            target = "supervisor"

            [[policy.auto_routes]]
            from = "kyc"
            tool = "kyc_check"
            to = "onboarding"
            "#,
        )
        .unwrap();
        assert_eq!(c.handoff.tools.len(), 1);
        assert_eq!(c.handoff.tools[0].target, "supervisor");
        assert_eq!(c.policy.auto_routes[0].outcome_field, "verified");
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let err = SwitchboardConfig::from_toml_str("[guard\nthreshold = ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = SwitchboardConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(c.gateway.port, 18789);
    }

    #[test]
    fn config_renders_back_to_toml() {
        let text = SwitchboardConfig::default().to_toml().unwrap();
        let back = SwitchboardConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.router.entry_agent, "triage");
        assert_eq!(back.handoff.tools.len(), 4);
    }

    #[test]
    fn heartbeat_timeout_saturates() {
        let registry = RegistryConfig {
            heartbeat_interval_secs: u64::MAX,
            expiry_multiplier: 4,
            ..RegistryConfig::default()
        };
        assert_eq!(registry.heartbeat_timeout(), Duration::from_secs(u64::MAX));
    }
}
