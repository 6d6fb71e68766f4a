use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8420;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Upper bound on a streaming turn's tool-calling loop (§4.6 "loops until
/// the model yields no function call" — this is the escape hatch against a
/// misbehaving provider/tool pair that never stops calling).
pub const DEFAULT_MAX_TOOL_ITERATIONS: u32 = 25;
/// Session-name inference subagent deadline ("on the order of one minute").
pub const DEFAULT_NAME_INFERENCE_DEADLINE_SECS: u64 = 60;
pub const DEFAULT_SSE_HEARTBEAT_SECS: u64 = 20;

/// Top-level config (convo.toml + CONVO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Default for ConvoConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_sse_heartbeat")]
    pub sse_heartbeat_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            sse_heartbeat_secs: DEFAULT_SSE_HEARTBEAT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            blob_dir: default_blob_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default = "default_name_inference_deadline")]
    pub name_inference_deadline_secs: u64,
    /// Model identifier used when a request omits one. The core has no
    /// provider registry of its own (§1 non-goal); this is just the label
    /// passed through to whatever `LlmProvider` the binary was wired with.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            name_inference_deadline_secs: DEFAULT_NAME_INFERENCE_DEADLINE_SECS,
            default_model: default_model(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_sse_heartbeat() -> u64 {
    DEFAULT_SSE_HEARTBEAT_SECS
}
fn default_max_tool_iterations() -> u32 {
    DEFAULT_MAX_TOOL_ITERATIONS
}
fn default_name_inference_deadline() -> u64 {
    DEFAULT_NAME_INFERENCE_DEADLINE_SECS
}
fn default_model() -> String {
    "stub-echo".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convo/convo.db", home)
}
fn default_blob_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convo/blobs", home)
}

impl ConvoConfig {
    /// Load config from a TOML file with CONVO_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConvoConfig = Figment::from(figment::providers::Serialized::defaults(
            ConvoConfig::default(),
        ))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("CONVO_").split("_"))
        .extract()
        .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convo/convo.toml", home)
}
