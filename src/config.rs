//! Typed configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then the
//! process environment (after `.env` has been loaded with `dotenvy`). Nothing
//! outside this module reads environment variables for configuration.

use crate::util::parse_flag;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_FEISHU_API_BASE: &str = "https://open.feishu.cn/open-apis";
pub const DEFAULT_GATEWAY_URL: &str = "http://localhost:18789";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub feishu: FeishuConfig,
    pub server: ServerConfig,
    pub ai: AiConfig,
    pub agent_gateway: AgentGatewayConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    /// `development`, `staging` or `production`; diagnostics routes are
    /// refused in production.
    pub env: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeishuConfig {
    pub app_id: String,
    pub app_secret: String,
    pub encrypt_key: String,
    pub verification_token: String,
    pub bot_open_id: String,
    pub target_chat_id: String,
    pub api_base: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Honour `X-Forwarded-For` / `X-Real-IP` when deriving the client IP.
    pub trust_forwarded_headers: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AiConfig {
    pub provider: String,
    pub api_key: String,
    pub api_base: String,
    pub model_name: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentGatewayConfig {
    pub enabled: bool,
    pub gateway_url: String,
    pub token: String,
    pub agent_id: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_event_verification: bool,
    pub rate_limit_per_minute: u32,
    pub enable_ip_whitelist: bool,
    pub ip_whitelist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            feishu: FeishuConfig {
                api_base: DEFAULT_FEISHU_API_BASE.into(),
                ..FeishuConfig::default()
            },
            server: ServerConfig::default(),
            ai: AiConfig::default(),
            agent_gateway: AgentGatewayConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "feishu-taskbot".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            env: "development".into(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            log_level: "info".into(),
            trust_forwarded_headers: false,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "deepseek".into(),
            api_key: String::new(),
            api_base: String::new(),
            model_name: String::new(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl Default for AgentGatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway_url: DEFAULT_GATEWAY_URL.into(),
            token: String::new(),
            agent_id: "main".into(),
            timeout_secs: 90,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_event_verification: true,
            rate_limit_per_minute: 30,
            enable_ip_whitelist: false,
            ip_whitelist: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.env.trim().eq_ignore_ascii_case("production")
    }
}

impl AiConfig {
    /// Fill in API base and model for known providers when left blank.
    fn apply_provider_preset(&mut self) {
        if !self.api_base.trim().is_empty() {
            return;
        }
        let preset = match self.provider.trim().to_ascii_lowercase().as_str() {
            "deepseek" => Some(("https://api.deepseek.com/v1", "deepseek-chat")),
            "minimax" => Some(("https://api.minimax.chat/v1", "abab5.5-chat")),
            "openai" => Some(("https://api.openai.com/v1", "gpt-3.5-turbo")),
            _ => None,
        };
        if let Some((base, model)) = preset {
            self.api_base = base.into();
            if self.model_name.trim().is_empty() {
                self.model_name = model.into();
            }
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

impl Config {
    /// Load configuration: defaults, then `path` (TOML) if given, then `.env`
    /// and the process environment. The second value holds warnings raised
    /// while loading, for the caller to log once tracing is up.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<String>)> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        let mut warnings = Vec::new();
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(err) if err.not_found() => {}
            Err(err) => warnings.push(format!("Ignoring unreadable .env file: {err}")),
        }
        warnings.extend(config.apply_env_from(|key| std::env::var(key).ok()));
        Ok((config, warnings))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Override fields from a key lookup (normally the process environment).
    /// Returns a warning per value that could not be used.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let string = |key: &str, slot: &mut String| {
            if let Some(value) = lookup(key) {
                *slot = value.trim().to_string();
            }
        };
        let flag = |key: &str, slot: &mut bool| {
            if let Some(value) = lookup(key) {
                *slot = parse_flag(&value);
            }
        };

        string("APP_NAME", &mut self.app.name);
        string("APP_VERSION", &mut self.app.version);
        string("APP_ENV", &mut self.app.env);

        string("FEISHU_APP_ID", &mut self.feishu.app_id);
        string("FEISHU_APP_SECRET", &mut self.feishu.app_secret);
        string("FEISHU_ENCRYPT_KEY", &mut self.feishu.encrypt_key);
        string("FEISHU_VERIFICATION_TOKEN", &mut self.feishu.verification_token);
        string("FEISHU_BOT_OPEN_ID", &mut self.feishu.bot_open_id);
        string("TARGET_CHAT_ID", &mut self.feishu.target_chat_id);
        string("FEISHU_API_BASE", &mut self.feishu.api_base);

        string("SERVER_HOST", &mut self.server.host);
        if let Some(port) = parse_number(&lookup, &mut warnings, "SERVER_PORT") {
            self.server.port = port;
        }
        string("LOG_LEVEL", &mut self.server.log_level);
        flag("TRUST_FORWARDED_HEADERS", &mut self.server.trust_forwarded_headers);

        string("AI_PROVIDER", &mut self.ai.provider);
        string("AI_API_KEY", &mut self.ai.api_key);
        string("AI_API_BASE", &mut self.ai.api_base);
        string("AI_MODEL_NAME", &mut self.ai.model_name);
        if let Some(timeout) = parse_number(&lookup, &mut warnings, "AI_TIMEOUT") {
            self.ai.timeout_secs = timeout;
        }
        if let Some(retries) = parse_number(&lookup, &mut warnings, "AI_MAX_RETRIES") {
            self.ai.max_retries = retries;
        }

        flag("OPENCLAW_ENABLED", &mut self.agent_gateway.enabled);
        string("OPENCLAW_GATEWAY_URL", &mut self.agent_gateway.gateway_url);
        string("OPENCLAW_TOKEN", &mut self.agent_gateway.token);
        string("OPENCLAW_AGENT_ID", &mut self.agent_gateway.agent_id);
        if let Some(timeout) = parse_number(&lookup, &mut warnings, "OPENCLAW_TIMEOUT") {
            self.agent_gateway.timeout_secs = timeout;
        }

        flag(
            "ENABLE_EVENT_VERIFICATION",
            &mut self.security.enable_event_verification,
        );
        if let Some(limit) = parse_number(&lookup, &mut warnings, "RATE_LIMIT_PER_MINUTE") {
            self.security.rate_limit_per_minute = limit;
        }
        flag("ENABLE_IP_WHITELIST", &mut self.security.enable_ip_whitelist);
        if let Some(list) = lookup("IP_WHITELIST") {
            self.security.ip_whitelist = list
                .split(',')
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }

        if self.feishu.api_base.trim().is_empty() {
            self.feishu.api_base = DEFAULT_FEISHU_API_BASE.into();
        }
        self.ai.apply_provider_preset();
        warnings
    }

    /// Human-readable list of configuration problems; empty when complete.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let missing = |value: &str| value.trim().is_empty();

        if missing(&self.feishu.app_id) {
            problems.push("FEISHU_APP_ID is not set (required)".to_string());
        }
        if missing(&self.feishu.app_secret) {
            problems.push("FEISHU_APP_SECRET is not set (required)".to_string());
        }
        if missing(&self.feishu.target_chat_id) {
            problems.push("TARGET_CHAT_ID is not set (required)".to_string());
        }
        if missing(&self.feishu.bot_open_id) {
            problems.push("FEISHU_BOT_OPEN_ID is not set (required)".to_string());
        }
        if !self.ai.has_api_key() {
            problems.push("AI_API_KEY is not set; AI replies will be unavailable".to_string());
        }
        if self.agent_gateway.enabled {
            if missing(&self.agent_gateway.token) {
                problems.push(
                    "OPENCLAW_TOKEN is not set (required by the agent gateway HTTP API)"
                        .to_string(),
                );
            }
            if missing(&self.agent_gateway.gateway_url) {
                problems.push("OPENCLAW_GATEWAY_URL is not set".to_string());
            }
        }

        problems
    }
}

fn parse_number<F, T>(lookup: &F, warnings: &mut Vec<String>, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warnings.push(format!("Ignoring non-numeric value for {key}: {raw:?}"));
            None
        }
    }
}
