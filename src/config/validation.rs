//! Configuration validation

use super::types::{Config, ModifierConfig};
use crate::error::{RefractError, Result};

/// Validate a loaded configuration before the pipeline starts.
pub fn validate_config(config: &Config) -> Result<()> {
    validate_listen(&config.input.listen)?;

    if config.output.targets.is_empty() {
        return Err(RefractError::ConfigValidation(
            "at least one replay target is required".into(),
        ));
    }
    for target in &config.output.targets {
        if target.is_empty() {
            return Err(RefractError::ConfigValidation(
                "replay target must not be empty".into(),
            ));
        }
    }

    if config.output.timeout.is_zero() {
        return Err(RefractError::ConfigValidation(
            "replay timeout must be greater than zero".into(),
        ));
    }

    if let Some(diff) = &config.output.diff {
        if diff.host.is_empty() {
            return Err(RefractError::ConfigValidation(
                "diff host must not be empty".into(),
            ));
        }
    }

    if let Some(endpoint) = &config.output.elastic_search {
        if !endpoint.contains('/') {
            return Err(RefractError::ConfigValidation(format!(
                "elasticsearch endpoint must be host:port/index, got {:?}",
                endpoint
            )));
        }
    }

    validate_modifier(&config.modifier)?;
    Ok(())
}

fn validate_listen(listen: &str) -> Result<()> {
    let (iface, port) = listen.rsplit_once(':').ok_or_else(|| {
        RefractError::ConfigValidation(format!(
            "capture listen must be iface:port, got {:?}",
            listen
        ))
    })?;
    if iface.is_empty() {
        return Err(RefractError::ConfigValidation(
            "capture listen has an empty interface".into(),
        ));
    }
    port.parse::<u16>().map_err(|_| {
        RefractError::ConfigValidation(format!("capture listen port {:?} is not valid", port))
    })?;
    Ok(())
}

fn validate_modifier(modifier: &ModifierConfig) -> Result<()> {
    for pattern in [&modifier.allow_url, &modifier.disallow_url]
        .into_iter()
        .flatten()
    {
        regex::Regex::new(pattern)?;
    }

    for rule in &modifier.rewrite_url {
        let (pattern, _) = rule.split_once(':').ok_or_else(|| {
            RefractError::ConfigValidation(format!(
                "url rewrite must be pattern:replacement, got {:?}",
                rule
            ))
        })?;
        regex::Regex::new(pattern)?;
    }

    for rule in modifier
        .allow_headers
        .iter()
        .chain(modifier.disallow_headers.iter())
    {
        let (_, pattern) = rule.split_once(':').ok_or_else(|| {
            RefractError::ConfigValidation(format!(
                "header filter must be name:regex, got {:?}",
                rule
            ))
        })?;
        regex::Regex::new(pattern.trim())?;
    }

    for rule in modifier
        .header_limiters
        .iter()
        .chain(modifier.param_limiters.iter())
    {
        parse_limiter(rule)?;
    }

    for header in &modifier.set_headers {
        if !header.contains(':') {
            return Err(RefractError::ConfigValidation(format!(
                "header injection must be Name: value, got {:?}",
                header
            )));
        }
    }

    for param in &modifier.set_params {
        if !param.contains('=') {
            return Err(RefractError::ConfigValidation(format!(
                "param injection must be key=value, got {:?}",
                param
            )));
        }
    }

    Ok(())
}

/// Parse a `name:percent%` limiter rule into its name and percentage.
pub fn parse_limiter(rule: &str) -> Result<(String, u8)> {
    let (name, percent) = rule.rsplit_once(':').ok_or_else(|| {
        RefractError::ConfigValidation(format!("limiter must be name:percent%, got {:?}", rule))
    })?;
    let percent = percent
        .trim()
        .trim_end_matches('%')
        .parse::<u8>()
        .ok()
        .filter(|&p| p <= 100)
        .ok_or_else(|| {
            RefractError::ConfigValidation(format!(
                "limiter percentage must be 0-100, got {:?}",
                rule
            ))
        })?;
    if name.is_empty() {
        return Err(RefractError::ConfigValidation(format!(
            "limiter has an empty name: {:?}",
            rule
        )));
    }
    Ok((name.to_string(), percent))
}
