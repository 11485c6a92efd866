use std::collections::HashSet;

use super::{AppConfig, ConfigError, PricingConfig, ReasoningTagSetting, UpstreamServiceConfig};
use crate::protocol::canonical::ProviderKind;

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_transport_config(config)?;
    validate_upstream_services(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_transport_config(config: &AppConfig) -> Result<(), ConfigError> {
    let transport = &config.transport;
    if transport.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "transport.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if transport.timeout == 0 {
        return Err(validation_err("transport.timeout must be greater than 0"));
    }
    if transport.connect_timeout == 0 {
        return Err(validation_err(
            "transport.connect_timeout must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_upstream_services(config: &AppConfig) -> Result<(), ConfigError> {
    if config.upstream_services.is_empty() {
        return Err(validation_err("upstream_services cannot be empty"));
    }

    let mut names = HashSet::new();
    for svc in &config.upstream_services {
        if svc.name.trim().is_empty() {
            return Err(validation_err("upstream service name cannot be empty"));
        }
        if !names.insert(svc.name.as_str()) {
            return Err(validation_err(format!(
                "Duplicate upstream service name '{}'",
                svc.name
            )));
        }
        validate_service(svc)?;
    }

    let defaults = config
        .upstream_services
        .iter()
        .filter(|svc| svc.is_default)
        .count();
    if defaults > 1 {
        return Err(validation_err(
            "At most one upstream service can be marked is_default",
        ));
    }

    Ok(())
}

fn validate_service(svc: &UpstreamServiceConfig) -> Result<(), ConfigError> {
    if !svc.base_url.starts_with("http://") && !svc.base_url.starts_with("https://") {
        return Err(validation_err(format!(
            "Service '{}': base_url must start with http:// or https://",
            svc.name
        )));
    }
    if svc.api_key.trim().is_empty() {
        return Err(validation_err(format!(
            "Service '{}': api_key cannot be empty",
            svc.name
        )));
    }
    if ProviderKind::from_config_name(&svc.provider).is_none() {
        return Err(validation_err(format!(
            "Service '{}': unknown provider '{}'. Must be one of: openai, anthropic, gemini",
            svc.name, svc.provider
        )));
    }
    if svc.model.trim().is_empty() {
        return Err(validation_err(format!(
            "Service '{}': model cannot be empty",
            svc.name
        )));
    }
    if svc.max_tokens == Some(0) {
        return Err(validation_err(format!(
            "Service '{}': max_tokens must be greater than 0 when set",
            svc.name
        )));
    }
    if let ReasoningTagSetting::Tag(tag) = &svc.reasoning_tag {
        if tag.trim().is_empty() || tag.contains(['<', '>', '/']) {
            return Err(validation_err(format!(
                "Service '{}': reasoning_tag must be a bare, non-empty tag name",
                svc.name
            )));
        }
    }
    if let Some(pricing) = &svc.pricing {
        validate_pricing(&svc.name, pricing)?;
    }
    validate_proxy_url(&svc.name, svc.proxy.as_deref())
}

fn validate_pricing(service_name: &str, pricing: &PricingConfig) -> Result<(), ConfigError> {
    let prices = [
        ("input", pricing.input),
        ("output", pricing.output),
        ("cache_write", pricing.cache_write),
        ("cache_read", pricing.cache_read),
    ];
    for (field, price) in prices {
        if !price.is_finite() || price < 0.0 {
            return Err(validation_err(format!(
                "Service '{service_name}': pricing.{field} must be a non-negative number"
            )));
        }
    }
    Ok(())
}

fn validate_proxy_url(service_name: &str, proxy: Option<&str>) -> Result<(), ConfigError> {
    let Some(proxy) = proxy.map(str::trim) else {
        return Ok(());
    };
    if proxy.is_empty() {
        return Err(validation_err(format!(
            "Service '{service_name}': proxy cannot be empty when set"
        )));
    }
    let parsed = url::Url::parse(proxy).map_err(|err| {
        validation_err(format!(
            "Service '{service_name}': proxy is not a valid URL: {err}"
        ))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "Service '{service_name}': proxy must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
