use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_LINE_CHANNEL_SECRET: &str = "LINE_CHANNEL_SECRET";
pub const ENV_LINE_CHANNEL_TOKEN: &str = "LINE_CHANNEL_TOKEN";
pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_GEMINI_MODEL: &str = "GEMINI_MODEL";
pub const ENV_PROMPTS: &str = "PROMPTS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub line: Line,
    #[serde(default)]
    pub gemini: Gemini,
    pub store: Store,
    #[serde(default)]
    pub relay: Relay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_wait_margin_ms")]
    pub wait_margin_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    #[serde(default)]
    pub channel_secret: String,
    #[serde(default)]
    pub channel_token: String,
    #[serde(default = "default_line_api_base")]
    pub api_base: String,
    #[serde(default = "default_line_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Line {
    fn default() -> Self {
        Self {
            channel_secret: String::new(),
            channel_token: String::new(),
            api_base: default_line_api_base(),
            timeout_ms: default_line_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gemini {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_api_base")]
    pub api_base: String,
    #[serde(default = "default_gemini_timeout_ms")]
    pub timeout_ms: u64,
    /// Conversation turns sent ahead of every question.
    #[serde(default = "default_prompts")]
    pub prompts: Vec<Prompt>,
}

impl Default for Gemini {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_gemini_model(),
            api_base: default_gemini_api_base(),
            timeout_ms: default_gemini_timeout_ms(),
            prompts: default_prompts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prompt {
    #[serde(alias = "Role")]
    pub role: String,
    #[serde(alias = "Text")]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    #[serde(default = "default_command_marker")]
    pub command_marker: String,
    #[serde(default = "default_generation_margin_ms")]
    pub generation_margin_ms: u64,
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            command_marker: default_command_marker(),
            generation_margin_ms: default_generation_margin_ms(),
        }
    }
}

fn default_webhook_path() -> String {
    "/callback".to_string()
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_wait_margin_ms() -> u64 {
    100
}

fn default_line_api_base() -> String {
    "https://api.line.me".to_string()
}

fn default_line_timeout_ms() -> u64 {
    10_000
}

fn default_gemini_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_gemini_api_base() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_gemini_timeout_ms() -> u64 {
    120_000
}

fn default_prompts() -> Vec<Prompt> {
    vec![
        Prompt {
            role: "user".to_string(),
            text: "You are an assistant.".to_string(),
        },
        Prompt {
            role: "model".to_string(),
            text: "What can I do for you?".to_string(),
        },
    ]
}

fn default_command_marker() -> String {
    "/".to_string()
}

fn default_generation_margin_ms() -> u64 {
    1_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

/// Same as [`load_and_validate`] with an explicit environment lookup.
pub fn load_with_env<F>(path: &str, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut instance =
        serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;
    drop_empty_sections(&mut instance);

    let mut cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    apply_env_overrides(&mut cfg, env)?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

/// A section written as a bare key (`gemini:`) parses as null; treat it as
/// absent so its serde defaults apply.
fn drop_empty_sections(instance: &mut serde_json::Value) {
    if let Some(sections) = instance.as_object_mut() {
        sections.retain(|_, v| !v.is_null());
    }
}

/// Secrets and model selection may come from the environment instead of the
/// file; a non-empty variable wins over the file value.
pub fn apply_env_overrides<F>(cfg: &mut Config, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = lookup(ENV_LINE_CHANNEL_SECRET) {
        cfg.line.channel_secret = v;
    }
    if let Some(v) = lookup(ENV_LINE_CHANNEL_TOKEN) {
        cfg.line.channel_token = v;
    }
    if let Some(v) = lookup(ENV_GEMINI_API_KEY) {
        cfg.gemini.api_key = v;
    }
    if let Some(v) = lookup(ENV_GEMINI_MODEL) {
        cfg.gemini.model = v;
    }
    if let Some(v) = lookup(ENV_PROMPTS) {
        cfg.gemini.prompts = serde_json::from_str(&v)
            .map_err(|e| ConfigError::Parse(format!("{ENV_PROMPTS}: {e}")))?;
    }
    Ok(())
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    for (value, field, env) in [
        (
            &cfg.line.channel_secret,
            "line.channel_secret",
            ENV_LINE_CHANNEL_SECRET,
        ),
        (
            &cfg.line.channel_token,
            "line.channel_token",
            ENV_LINE_CHANNEL_TOKEN,
        ),
        (&cfg.gemini.api_key, "gemini.api_key", ENV_GEMINI_API_KEY),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{field} is required (or set {env})"
            )));
        }
    }
    if cfg.gemini.model.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "gemini.model must not be empty".to_string(),
        ));
    }
    if let Some(p) = cfg
        .gemini
        .prompts
        .iter()
        .find(|p| p.role != "user" && p.role != "model")
    {
        return Err(ConfigError::UnsupportedConfig(format!(
            "gemini.prompts role={} is not supported; supported: user, model",
            p.role
        )));
    }
    if !cfg.server.webhook_path.starts_with('/') {
        return Err(ConfigError::UnsupportedConfig(
            "server.webhook_path must start with /".to_string(),
        ));
    }
    if cfg.server.wait_margin_ms >= cfg.server.request_timeout_ms {
        return Err(ConfigError::UnsupportedConfig(
            "server.wait_margin_ms must be below server.request_timeout_ms".to_string(),
        ));
    }
    if cfg.relay.generation_margin_ms >= cfg.server.request_timeout_ms {
        return Err(ConfigError::UnsupportedConfig(
            "relay.generation_margin_ms must be below server.request_timeout_ms".to_string(),
        ));
    }
    if cfg.relay.command_marker.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "relay.command_marker must not be empty".to_string(),
        ));
    }
    Ok(())
}
