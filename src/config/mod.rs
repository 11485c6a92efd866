pub mod validation;

use serde::{Deserialize, Deserializer, Serialize};

use crate::protocol::canonical::ModelInfo;
use crate::stream::{AssemblyMode, ReasoningGate};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// HTTP client settings shared by every upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Whole-request timeout in seconds, including the streamed body.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    /// `0` keeps idle connections forever.
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default)]
    pub http_use_env_proxy: bool,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

fn default_timeout() -> u64 {
    180
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}
fn default_retry_max_attempts() -> u32 {
    2
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            http_use_env_proxy: false,
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

/// Inline reasoning tag override.
///
/// A missing key keeps the dialect default, an explicit `null` disables tag
/// splitting, and a string selects the tag name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ReasoningTagSetting {
    #[default]
    DialectDefault,
    Disabled,
    Tag(String),
}

fn deserialize_reasoning_tag<'de, D>(deserializer: D) -> Result<ReasoningTagSetting, D::Error>
where
    D: Deserializer<'de>,
{
    // missing => DialectDefault (via serde default), explicit null => Disabled
    Ok(match Option::<String>::deserialize(deserializer)? {
        None => ReasoningTagSetting::Disabled,
        Some(tag) => ReasoningTagSetting::Tag(tag),
    })
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_write: f64,
    #[serde(default)]
    pub cache_read: f64,
}

/// Upstream service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamServiceConfig {
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub is_default: bool,
    /// Anthropic `anthropic-version` header.
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_reasoning_tag",
        skip_serializing_if = "is_dialect_default"
    )]
    pub reasoning_tag: ReasoningTagSetting,
    #[serde(default)]
    pub reasoning_gate: Option<ReasoningGate>,
    #[serde(default)]
    pub tool_call_mode: Option<AssemblyMode>,
    #[serde(default)]
    pub pricing: Option<PricingConfig>,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn is_dialect_default(setting: &ReasoningTagSetting) -> bool {
    *setting == ReasoningTagSetting::DialectDefault
}

impl UpstreamServiceConfig {
    /// Static model metadata, priced when the service configures prices.
    #[must_use]
    pub fn model_info(&self) -> ModelInfo {
        let pricing = self.pricing.unwrap_or_default();
        ModelInfo {
            id: self.model.clone(),
            input_price: pricing.input,
            output_price: pricing.output,
            cache_write_price: pricing.cache_write,
            cache_read_price: pricing.cache_read,
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    pub upstream_services: Vec<UpstreamServiceConfig>,
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl AppConfig {
    /// Look up a service by name, or pick the default (first when none is
    /// marked).
    #[must_use]
    pub fn service(&self, name: Option<&str>) -> Option<&UpstreamServiceConfig> {
        match name {
            Some(name) => self.upstream_services.iter().find(|svc| svc.name == name),
            None => self
                .upstream_services
                .iter()
                .find(|svc| svc.is_default)
                .or_else(|| self.upstream_services.first()),
        }
    }
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}
