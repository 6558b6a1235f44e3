use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Typed config value.
///
/// The engine builds these from the config source (YAML, tests, ...);
/// plugins read them through [`PluginConfigReader`] — no parsing needed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "int",
            ConfigValue::Float(_) => "float",
            ConfigValue::Str(_) => "string",
            ConfigValue::List(_) => "list",
            ConfigValue::Map(_) => "map",
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Str(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::Str(s)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

/// Configuration of one plugin instance: its registered type name plus an
/// opaque settings tree. Option keys are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    pub typename: String,
    pub settings: BTreeMap<String, ConfigValue>,
}

impl PluginConfig {
    pub fn new(typename: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Case-insensitive settings lookup.
    fn find(&self, key: &str) -> Option<&ConfigValue> {
        self.settings
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }
}

// ---------------------------------------------------------------------------
// Error stack — accumulated per plugin during configure
// ---------------------------------------------------------------------------

/// One accumulated configuration problem.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub fatal: bool,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = if self.fatal { "fatal" } else { "warning" };
        write!(f, "[{severity}] {}", self.message)
    }
}

/// Errors collected while a plugin configures itself.
///
/// A plugin that accumulates a fatal issue is rejected and omitted from the
/// graph; non-fatal issues are logged and the plugin still starts.
#[derive(Debug, Clone, Default)]
pub struct ErrorStack {
    issues: Vec<ConfigIssue>,
}

impl ErrorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.issues.push(ConfigIssue {
            fatal: false,
            message: message.into(),
        });
    }

    pub fn push_fatal(&mut self, message: impl Into<String>) {
        self.issues.push(ConfigIssue {
            fatal: true,
            message: message.into(),
        });
    }

    pub fn has_fatal(&self) -> bool {
        self.issues.iter().any(|i| i.fatal)
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.issues.iter()
    }
}

// ---------------------------------------------------------------------------
// Reader — typed accessors with defaults, recording problems in the stack
// ---------------------------------------------------------------------------

/// Typed view over a [`PluginConfig`], handed to plugins at configure time.
///
/// Getters never fail: a missing key yields the default silently, a key of
/// the wrong type yields the default and records a non-fatal issue, and the
/// `require_*` variants record a fatal issue when the key is absent.
pub struct PluginConfigReader<'a> {
    config: &'a PluginConfig,
    errors: ErrorStack,
}

impl<'a> PluginConfigReader<'a> {
    pub fn new(config: &'a PluginConfig) -> Self {
        Self {
            config,
            errors: ErrorStack::new(),
        }
    }

    pub fn typename(&self) -> &str {
        &self.config.typename
    }

    pub fn has(&self, key: &str) -> bool {
        self.config.find(key).is_some()
    }

    pub fn errors(&mut self) -> &mut ErrorStack {
        &mut self.errors
    }

    /// Consume the reader, yielding everything it accumulated.
    pub fn into_errors(self) -> ErrorStack {
        self.errors
    }

    fn wrong_type(&mut self, key: &str, want: &str, got: &ConfigValue) {
        self.errors.push(format!(
            "option '{key}': expected {want}, got {}",
            got.type_name()
        ));
    }

    pub fn get_bool(&mut self, key: &str, default: bool) -> bool {
        match self.config.find(key) {
            None => default,
            Some(ConfigValue::Bool(v)) => *v,
            Some(other) => {
                let other = other.clone();
                self.wrong_type(key, "bool", &other);
                default
            }
        }
    }

    pub fn get_int(&mut self, key: &str, default: i64) -> i64 {
        match self.config.find(key) {
            None => default,
            Some(ConfigValue::Int(v)) => *v,
            Some(other) => {
                let other = other.clone();
                self.wrong_type(key, "int", &other);
                default
            }
        }
    }

    pub fn get_str(&mut self, key: &str, default: &str) -> String {
        match self.config.find(key) {
            None => default.to_string(),
            Some(ConfigValue::Str(v)) => v.clone(),
            Some(other) => {
                let other = other.clone();
                self.wrong_type(key, "string", &other);
                default.to_string()
            }
        }
    }

    /// Millisecond option as a [`Duration`]. Negative values collapse to
    /// zero; use [`get_int`](Self::get_int) where the sign is meaningful.
    pub fn get_duration_ms(&mut self, key: &str, default: Duration) -> Duration {
        match self.config.find(key) {
            None => default,
            Some(ConfigValue::Int(v)) if *v >= 0 => Duration::from_millis(*v as u64),
            Some(ConfigValue::Int(_)) => Duration::ZERO,
            Some(other) => {
                let other = other.clone();
                self.wrong_type(key, "int (milliseconds)", &other);
                default
            }
        }
    }

    /// String list option. A bare string is treated as a one-element list.
    pub fn get_string_list(&mut self, key: &str, default: &[&str]) -> Vec<String> {
        match self.config.find(key) {
            None => default.iter().map(|s| s.to_string()).collect(),
            Some(ConfigValue::Str(v)) => vec![v.clone()],
            Some(ConfigValue::List(items)) => {
                let items = items.clone();
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        ConfigValue::Str(s) => out.push(s),
                        other => self.wrong_type(key, "list of strings", &other),
                    }
                }
                out
            }
            Some(other) => {
                let other = other.clone();
                self.wrong_type(key, "string or list of strings", &other);
                default.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    pub fn get_map(&mut self, key: &str) -> BTreeMap<String, ConfigValue> {
        match self.config.find(key) {
            None => BTreeMap::new(),
            Some(ConfigValue::Map(m)) => m.clone(),
            Some(other) => {
                let other = other.clone();
                self.wrong_type(key, "map", &other);
                BTreeMap::new()
            }
        }
    }

    /// Sub-plugin list option (e.g. `Modulators`). Each entry is either a
    /// bare type-name string or a one-key map of type name → settings.
    pub fn get_plugin_list(&mut self, key: &str) -> Vec<PluginConfig> {
        let items = match self.config.find(key) {
            None => return Vec::new(),
            Some(ConfigValue::List(items)) => items.clone(),
            Some(other) => {
                let other = other.clone();
                self.wrong_type(key, "list of plugins", &other);
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                ConfigValue::Str(typename) => out.push(PluginConfig::new(typename)),
                ConfigValue::Map(m) if m.len() == 1 => {
                    let (typename, settings) = m.into_iter().next().expect("len checked");
                    match settings {
                        ConfigValue::Map(settings) => out.push(PluginConfig {
                            typename,
                            settings,
                        }),
                        other => self.errors.push(format!(
                            "option '{key}': plugin '{typename}' settings must be a map, got {}",
                            other.type_name()
                        )),
                    }
                }
                other => self.errors.push(format!(
                    "option '{key}': plugin entries must be a type name or a one-key map, got {}",
                    other.type_name()
                )),
            }
        }
        out
    }

    pub fn require_str(&mut self, key: &str) -> String {
        if !self.has(key) {
            self.errors.push_fatal(format!("option '{key}' is required"));
            return String::new();
        }
        self.get_str(key, "")
    }

    pub fn require_int(&mut self, key: &str) -> i64 {
        if !self.has(key) {
            self.errors.push_fatal(format!("option '{key}' is required"));
            return 0;
        }
        self.get_int(key, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let config = PluginConfig::new("producer.Test")
            .with("Channel", 256i64)
            .with("FallbackStream", "spill");
        let mut reader = PluginConfigReader::new(&config);

        assert_eq!(reader.get_int("channel", 0), 256);
        assert_eq!(reader.get_str("FALLBACKSTREAM", ""), "spill");
        assert!(reader.into_errors().is_empty());
    }

    #[test]
    fn wrong_type_records_warning_and_keeps_default() {
        let config = PluginConfig::new("producer.Test").with("Channel", "many");
        let mut reader = PluginConfigReader::new(&config);

        assert_eq!(reader.get_int("Channel", 64), 64);
        let errors = reader.into_errors();
        assert!(!errors.is_empty());
        assert!(!errors.has_fatal());
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let config = PluginConfig::new("producer.File");
        let mut reader = PluginConfigReader::new(&config);

        reader.require_str("Path");
        assert!(reader.into_errors().has_fatal());
    }

    #[test]
    fn bare_string_becomes_single_stream() {
        let config = PluginConfig::new("consumer.Test").with("Streams", "alpha");
        let mut reader = PluginConfigReader::new(&config);
        assert_eq!(reader.get_string_list("Streams", &[]), vec!["alpha"]);
    }

    #[test]
    fn plugin_list_parses_both_entry_shapes() {
        let mut settings = BTreeMap::new();
        settings.insert("Prefix".to_string(), ConfigValue::from("> "));
        let entry = ConfigValue::Map(BTreeMap::from([(
            "format.Envelope".to_string(),
            ConfigValue::Map(settings),
        )]));

        let config = PluginConfig {
            typename: "producer.Test".to_string(),
            settings: BTreeMap::from([(
                "Modulators".to_string(),
                ConfigValue::List(vec![ConfigValue::from("filter.Regex"), entry]),
            )]),
        };

        let mut reader = PluginConfigReader::new(&config);
        let plugins = reader.get_plugin_list("Modulators");
        assert_eq!(plugins.len(), 2);
        assert_eq!(plugins[0].typename, "filter.Regex");
        assert_eq!(plugins[1].typename, "format.Envelope");
        assert!(plugins[1].settings.contains_key("Prefix"));
    }

    #[test]
    fn nested_map_option() {
        let mut fields = BTreeMap::new();
        fields.insert("host".to_string(), ConfigValue::from("node1"));
        fields.insert("tier".to_string(), ConfigValue::from(2i64));

        let config = PluginConfig {
            typename: "consumer.Test".to_string(),
            settings: BTreeMap::from([("Fields".to_string(), ConfigValue::Map(fields))]),
        };
        let mut reader = PluginConfigReader::new(&config);

        let map = reader.get_map("fields");
        assert_eq!(map.get("host"), Some(&ConfigValue::Str("node1".to_string())));
        assert_eq!(map.get("tier"), Some(&ConfigValue::Int(2)));
        assert!(reader.get_map("missing").is_empty());
        assert!(reader.into_errors().is_empty());
    }

    #[test]
    fn duration_ms_clamps_negatives() {
        let config = PluginConfig::new("t").with("TimeoutMs", -5i64);
        let mut reader = PluginConfigReader::new(&config);
        assert_eq!(
            reader.get_duration_ms("TimeoutMs", Duration::from_secs(1)),
            Duration::ZERO
        );
    }
}
