//! Engine configuration — a YAML document mapping instance names to plugin
//! settings.
//!
//! ```yaml
//! Settings:
//!   MaxFallbackDepth: 8
//!
//! profiler:
//!   Type: consumer.Profiler
//!   Streams: profile
//!
//! console:
//!   Type: producer.Console
//!   Streams: profile
//! ```
//!
//! Everything under an instance except `Type` is handed to the plugin as
//! an opaque typed settings tree.

use std::collections::BTreeMap;

use manifold_api::config::{ConfigValue, PluginConfig};

use crate::error::EngineError;

/// Coordinator-level settings.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Bound on per-message fallback reroutes, breaking fallback loops.
    pub max_fallback_depth: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_fallback_depth: 8,
        }
    }
}

/// One configured plugin instance.
#[derive(Debug, Clone)]
pub struct NamedPlugin {
    pub name: String,
    pub enabled: bool,
    pub config: PluginConfig,
}

/// Parsed configuration tree, in document order.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub settings: CoordinatorSettings,
    pub plugins: Vec<NamedPlugin>,
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, EngineError> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Config(e.to_string()))?;

        let serde_yaml::Value::Mapping(entries) = doc else {
            return Err(EngineError::Config(
                "top level must be a mapping of instance names".to_string(),
            ));
        };

        let mut config = EngineConfig::default();
        for (key, value) in entries {
            let serde_yaml::Value::String(name) = key else {
                return Err(EngineError::Config("instance names must be strings".to_string()));
            };

            if name.eq_ignore_ascii_case("settings") {
                config.settings = parse_settings(&name, value)?;
                continue;
            }

            config.plugins.push(parse_instance(name, value)?);
        }
        Ok(config)
    }
}

fn parse_settings(name: &str, value: serde_yaml::Value) -> Result<CoordinatorSettings, EngineError> {
    let ctx = format!("'{name}'");
    let ConfigValue::Map(map) = convert(value).map_err(|e| EngineError::Config(format!("{ctx}: {e}")))? else {
        return Err(EngineError::Config(format!("{ctx}: must be a mapping")));
    };

    let mut settings = CoordinatorSettings::default();
    for (key, value) in map {
        if key.eq_ignore_ascii_case("maxfallbackdepth") {
            match value {
                ConfigValue::Int(v) if v >= 0 => settings.max_fallback_depth = v as u32,
                other => {
                    return Err(EngineError::Config(format!(
                        "{ctx}: MaxFallbackDepth must be a non-negative int, got {other:?}"
                    )));
                }
            }
        } else {
            return Err(EngineError::Config(format!("{ctx}: unknown setting '{key}'")));
        }
    }
    Ok(settings)
}

fn parse_instance(name: String, value: serde_yaml::Value) -> Result<NamedPlugin, EngineError> {
    let ctx = format!("instance '{name}'");
    let ConfigValue::Map(map) = convert(value).map_err(|e| EngineError::Config(format!("{ctx}: {e}")))? else {
        return Err(EngineError::Config(format!("{ctx}: must be a mapping")));
    };

    let mut typename = None;
    let mut enabled = true;
    let mut settings = BTreeMap::new();

    for (key, value) in map {
        if key.eq_ignore_ascii_case("type") {
            match value {
                ConfigValue::Str(t) => typename = Some(t),
                other => {
                    return Err(EngineError::Config(format!(
                        "{ctx}: Type must be a string, got {other:?}"
                    )));
                }
            }
            continue;
        }
        if key.eq_ignore_ascii_case("enable") {
            if let ConfigValue::Bool(v) = value {
                enabled = v;
                continue;
            }
        }
        settings.insert(key, value);
    }

    let typename = typename
        .ok_or_else(|| EngineError::Config(format!("{ctx}: missing 'Type'")))?;

    Ok(NamedPlugin {
        name,
        enabled,
        config: PluginConfig { typename, settings },
    })
}

/// Convert a YAML value into the engine's typed settings representation.
fn convert(value: serde_yaml::Value) -> Result<ConfigValue, String> {
    match value {
        serde_yaml::Value::Bool(v) => Ok(ConfigValue::Bool(v)),
        serde_yaml::Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(ConfigValue::Int(v))
            } else if let Some(v) = n.as_f64() {
                Ok(ConfigValue::Float(v))
            } else {
                Err(format!("unrepresentable number: {n}"))
            }
        }
        serde_yaml::Value::String(s) => Ok(ConfigValue::Str(s)),
        serde_yaml::Value::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(convert(item)?);
            }
            Ok(ConfigValue::List(out))
        }
        serde_yaml::Value::Mapping(entries) => {
            let mut out = BTreeMap::new();
            for (key, value) in entries {
                let serde_yaml::Value::String(key) = key else {
                    return Err("mapping keys must be strings".to_string());
                };
                out.insert(key, convert(value)?);
            }
            Ok(ConfigValue::Map(out))
        }
        serde_yaml::Value::Null => Err("null values are not allowed".to_string()),
        serde_yaml::Value::Tagged(_) => Err("tagged values are not allowed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
Settings:
  MaxFallbackDepth: 4

profile-router:
  Type: router.RoundRobin
  Stream: profile

profiler:
  Type: consumer.Profiler
  Streams: profile
  Runs: 100

console:
  Type: producer.Console
  Enable: false
  Streams:
    - profile
    - other
"#;

    #[test]
    fn parses_instances_in_document_order() {
        let config = EngineConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.settings.max_fallback_depth, 4);

        let names: Vec<_> = config.plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["profile-router", "profiler", "console"]);

        assert_eq!(config.plugins[0].config.typename, "router.RoundRobin");
        assert!(config.plugins[0].enabled);
        assert!(!config.plugins[2].enabled);
        // Enable is consumed, everything else stays in the settings tree.
        assert!(!config.plugins[2].config.settings.contains_key("Enable"));
        assert!(config.plugins[2].config.settings.contains_key("Streams"));
    }

    #[test]
    fn missing_type_is_an_error() {
        let err = EngineConfig::parse("broken:\n  Streams: a\n").unwrap_err();
        assert!(err.to_string().contains("missing 'Type'"));
    }

    #[test]
    fn top_level_must_be_a_mapping() {
        assert!(EngineConfig::parse("- a\n- b\n").is_err());
    }

    #[test]
    fn unknown_coordinator_setting_is_rejected() {
        let err = EngineConfig::parse("Settings:\n  Bogus: 1\n").unwrap_err();
        assert!(err.to_string().contains("unknown setting"));
    }
}
