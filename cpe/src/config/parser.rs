//! INI parsing logic for converting `Ini` → `CpeDescriptor`.
//!
//! This module contains the `parse_ini()` function and its helpers.
//! It is the single place where INI key names are mapped to struct fields.

use ini::{Ini, Properties};
use std::path::PathBuf;
use std::str::FromStr;

use super::file::ConfigFileError;
use super::settings::*;

/// Prefix of pipeline stage sections.
pub const PROCESSOR_SECTION_PREFIX: &str = "processor.";

const PROCESSOR_KEYS: &[&str] = &[
    "component",
    "deployment",
    "pool_size",
    "max_consecutive_errors",
    "action_on_max_errors",
    "max_restarts",
    "action_on_max_restarts",
    "timeout_ms",
    "checkout_timeout_ms",
    "batch_size",
    "command",
    "args",
];

/// Parse an `Ini` object into a `CpeDescriptor`.
///
/// Starts from `CpeDescriptor::default()` and overlays any values found in the INI.
pub(super) fn parse_ini(ini: &Ini) -> Result<CpeDescriptor, ConfigFileError> {
    let mut descriptor = CpeDescriptor::default();

    // [cpe] section
    if let Some(section) = ini.section(Some("cpe")) {
        let cpe = &mut descriptor.cpe;
        if let Some(v) = section.get("name") {
            let v = v.trim();
            if !v.is_empty() {
                cpe.name = v.to_string();
            }
        }
        if let Some(v) = section.get("pipelines") {
            cpe.pipelines = parse_positive("cpe", "pipelines", v)?;
        }
        if let Some(v) = section.get("parallel") {
            cpe.parallel = parse_bool(v);
        }
        if let Some(v) = section.get("cas_pool_size") {
            cpe.cas_pool_size = Some(parse_positive("cpe", "cas_pool_size", v)?);
        }
        if let Some(v) = section.get("pause_on_exception") {
            cpe.pause_on_exception = parse_bool(v);
        }
        if let Some(v) = section.get("batch_size") {
            cpe.batch_size = parse_number("cpe", "batch_size", v)?;
        }
        if let Some(v) = section.get("entity_limit") {
            cpe.entity_limit = parse_number("cpe", "entity_limit", v)?;
        }
        if let Some(v) = section.get("cas_initial_heap_size") {
            cpe.cas_initial_heap_size = parse_number("cpe", "cas_initial_heap_size", v)?;
        }
    }

    // [checkpoint] section
    if let Some(section) = ini.section(Some("checkpoint")) {
        if let Some(v) = section.get("file") {
            let v = v.trim();
            if !v.is_empty() {
                descriptor.checkpoint.file = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = section.get("batch") {
            descriptor.checkpoint.batch = parse_number("checkpoint", "batch", v)?;
        }
    }

    // [reader] section
    match ini.section(Some("reader")) {
        Some(section) => {
            descriptor.reader.component = required(section, "reader", "component")?;
            descriptor.reader.params = extra_params(section, &["component"]);
        }
        None => {
            return Err(ConfigFileError::InvalidValue {
                section: "reader".to_string(),
                key: "component".to_string(),
                value: String::new(),
                reason: "a [reader] section is required".to_string(),
            });
        }
    }

    // [processor.<name>] sections, in file order
    for (name, section) in ini.iter() {
        let Some(stage) = name.and_then(|n| n.strip_prefix(PROCESSOR_SECTION_PREFIX)) else {
            continue;
        };
        let section_name = format!("{}{}", PROCESSOR_SECTION_PREFIX, stage);
        if stage.trim().is_empty() {
            return Err(ConfigFileError::InvalidValue {
                section: section_name,
                key: String::new(),
                value: String::new(),
                reason: "stage name is empty".to_string(),
            });
        }
        if descriptor.processors.iter().any(|p| p.name == stage) {
            return Err(ConfigFileError::InvalidValue {
                section: section_name,
                key: String::new(),
                value: stage.to_string(),
                reason: "stage defined twice".to_string(),
            });
        }
        descriptor
            .processors
            .push(parse_processor(stage, &section_name, section)?);
    }

    Ok(descriptor)
}

fn parse_processor(
    stage: &str,
    section_name: &str,
    section: &Properties,
) -> Result<ProcessorSettings, ConfigFileError> {
    let mut settings = ProcessorSettings::new(stage);
    settings.component = required(section, section_name, "component")?;

    if let Some(v) = section.get("deployment") {
        settings.deployment = parse_enum(section_name, "deployment", v)?;
    }
    if let Some(v) = section.get("pool_size") {
        settings.pool_size = parse_positive(section_name, "pool_size", v)?;
    }
    if let Some(v) = section.get("max_consecutive_errors") {
        settings.max_consecutive_errors = parse_number(section_name, "max_consecutive_errors", v)?;
    }
    if let Some(v) = section.get("action_on_max_errors") {
        settings.action_on_max_errors = parse_enum(section_name, "action_on_max_errors", v)?;
    }
    if let Some(v) = section.get("max_restarts") {
        settings.max_restarts = parse_number(section_name, "max_restarts", v)?;
    }
    if let Some(v) = section.get("action_on_max_restarts") {
        settings.action_on_max_restarts = parse_enum(section_name, "action_on_max_restarts", v)?;
    }
    if let Some(v) = section.get("timeout_ms") {
        settings.timeout_ms = parse_positive(section_name, "timeout_ms", v)?;
    }
    if let Some(v) = section.get("checkout_timeout_ms") {
        settings.checkout_timeout_ms = parse_number(section_name, "checkout_timeout_ms", v)?;
    }
    if let Some(v) = section.get("batch_size") {
        settings.batch_size = parse_number(section_name, "batch_size", v)?;
    }
    if let Some(v) = section.get("command") {
        let v = v.trim();
        if !v.is_empty() {
            settings.command = Some(PathBuf::from(v));
        }
    }
    if let Some(v) = section.get("args") {
        settings.args = Some(v.split_whitespace().map(str::to_string).collect());
    }
    settings.params = extra_params(section, PROCESSOR_KEYS);
    Ok(settings)
}

fn required(section: &Properties, section_name: &str, key: &str) -> Result<String, ConfigFileError> {
    match section.get(key).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        other => Err(ConfigFileError::InvalidValue {
            section: section_name.to_string(),
            key: key.to_string(),
            value: other.unwrap_or_default().to_string(),
            reason: "required".to_string(),
        }),
    }
}

fn extra_params(section: &Properties, known: &[&str]) -> std::collections::BTreeMap<String, String> {
    section
        .iter()
        .filter(|(k, _)| !known.contains(k))
        .map(|(k, v)| (k.to_string(), v.trim().to_string()))
        .collect()
}

fn parse_number<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigFileError> {
    value.trim().parse().map_err(|_| ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: "must be a non-negative integer".to_string(),
    })
}

fn parse_positive<T>(section: &str, key: &str, value: &str) -> Result<T, ConfigFileError>
where
    T: FromStr + PartialOrd + Default,
{
    let parsed: T = parse_number(section, key, value)?;
    if parsed <= T::default() {
        return Err(ConfigFileError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(parsed)
}

fn parse_enum<T>(section: &str, key: &str, value: &str) -> Result<T, ConfigFileError>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(|reason| ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason,
    })
}

/// Parse a boolean value from a string.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive) as true.
/// Everything else is false.
pub(super) fn parse_bool(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    v == "true" || v == "1" || v == "yes" || v == "on"
}
