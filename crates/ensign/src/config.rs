//! # Configuration
//!
//! The node is configured by a serde struct with defaults for every field. Values are
//! read from an optional TOML, YAML or JSON file and then overridden by `ENSIGN_*`
//! environment variables; every variable is described in [`VARIABLES`] so that the
//! CLI can list them.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ENV_PREFIX: &str = "ENSIGN_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognized file extension {0:?}")]
    UnrecognizedExtension(String),
    #[error("could not parse toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("could not parse yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("could not parse json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Panic,
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The directive used by the tracing filter; panic and fatal only log errors.
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Panic | Self::Fatal | Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "panic" => Ok(Self::Panic),
            "fatal" => Ok(Self::Fatal),
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Panic => "panic",
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub console_log: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub meta_topic: MetaTopicConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sentry: SentryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            maintenance: false,
            log_level: LogLevel::default(),
            console_log: false,
            bind_addr: default_bind_addr(),
            meta_topic: MetaTopicConfig::default(),
            monitoring: MonitoringConfig::default(),
            storage: StorageConfig::default(),
            auth: AuthConfig::default(),
            sentry: SentryConfig::default(),
        }
    }
}

/// Settings for publishing topic changes to the meta topic of an upstream node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaTopicConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_meta_topic_name")]
    pub topic_name: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_meta_topic_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_meta_topic_auth_url")]
    pub auth_url: String,
}

impl Default for MetaTopicConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic_name: default_meta_topic_name(),
            client_id: String::new(),
            client_secret: String::new(),
            endpoint: default_meta_topic_endpoint(),
            auth_url: default_meta_topic_auth_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monitoring_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub node_id: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_monitoring_bind_addr(),
            node_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub data_path: String,
    /// Keep all data in memory, nothing is written to `data_path`.
    #[serde(default)]
    pub testing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_keys_url")]
    pub keys_url: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_min_refresh_interval", with = "duration")]
    pub min_refresh_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            keys_url: default_keys_url(),
            audience: default_audience(),
            issuer: default_issuer(),
            min_refresh_interval: default_min_refresh_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentryConfig {
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default = "default_release")]
    pub release: String,
    #[serde(default)]
    pub track_performance: bool,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default)]
    pub debug: bool,
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            server_name: String::new(),
            environment: String::new(),
            release: default_release(),
            track_performance: false,
            sample_rate: default_sample_rate(),
            debug: false,
        }
    }
}

impl SentryConfig {
    pub fn use_sentry(&self) -> bool {
        !self.dsn.is_empty()
    }
}

fn default_true() -> bool {
    true
}
fn default_bind_addr() -> String {
    ":5356".to_string()
}
fn default_meta_topic_name() -> String {
    "ensign.metatopic.topics".to_string()
}
fn default_meta_topic_endpoint() -> String {
    "ensign.rotational.app:443".to_string()
}
fn default_meta_topic_auth_url() -> String {
    "https://auth.rotational.app".to_string()
}
fn default_monitoring_bind_addr() -> String {
    ":1205".to_string()
}
fn default_keys_url() -> String {
    "https://auth.rotational.app/.well-known/jwks.json".to_string()
}
fn default_audience() -> String {
    "https://ensign.rotational.app".to_string()
}
fn default_issuer() -> String {
    "https://auth.rotational.app".to_string()
}
fn default_min_refresh_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_release() -> String {
    format!("ensign@{}", crate::VERSION)
}
fn default_sample_rate() -> f64 {
    1.0
}

// =============================================================================
// Loading
// =============================================================================

impl Config {
    /// Defaults overridden by the environment, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut conf = Self::default();
        conf.apply_env(|name| std::env::var(name).ok())?;
        conf.mark()?;
        Ok(conf)
    }

    /// Decode the file by its extension, merge the environment on top and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let mut conf: Config = match ext.as_str() {
            "toml" => toml::from_str(&data)?,
            "yaml" | "yml" => serde_yaml::from_str(&data)?,
            "json" => serde_json::from_str(&data)?,
            _ => return Err(ConfigError::UnrecognizedExtension(ext)),
        };

        conf.apply_env(|name| std::env::var(name).ok())?;
        conf.mark()?;
        Ok(conf)
    }

    /// Validate a config that was constructed programmatically.
    pub fn mark(&self) -> Result<(), ConfigError> {
        resolve_addr(&self.bind_addr).map_err(|_| ConfigError::Invalid("invalid bind address"))?;

        if self.monitoring.enabled {
            resolve_addr(&self.monitoring.bind_addr)
                .map_err(|_| ConfigError::Invalid("invalid monitoring bind address"))?;
        }

        if !self.storage.testing && self.storage.data_path.is_empty() {
            return Err(ConfigError::Invalid("storage data path is required"));
        }

        if self.meta_topic.enabled {
            if self.meta_topic.topic_name.is_empty() {
                return Err(ConfigError::Invalid("meta topic name is required"));
            }
            if self.meta_topic.client_id.is_empty() || self.meta_topic.client_secret.is_empty() {
                return Err(ConfigError::Invalid("meta topic client credentials are required"));
            }
        }

        if self.sentry.use_sentry() && self.sentry.environment.is_empty() {
            return Err(ConfigError::Invalid(
                "sentry environment must be set when a dsn is configured",
            ));
        }

        if !(0.0..=1.0).contains(&self.sentry.sample_rate) {
            return Err(ConfigError::Invalid("sentry sample rate must be between 0 and 1"));
        }

        Ok(())
    }

    /// Override fields from the variables found by `lookup`, keyed by their full
    /// `ENSIGN_` name.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut tree = serde_json::to_value(&*self)?;
        let mut changed = false;

        for var in VARIABLES {
            let name = var.env_name();
            let Some(raw) = lookup(&name) else {
                continue;
            };

            let value = var.kind.parse(&raw).map_err(|reason| ConfigError::InvalidValue {
                var: name.clone(),
                value: raw.clone(),
                reason,
            })?;
            set_path(&mut tree, var.path, value);
            changed = true;
        }

        if changed {
            *self = serde_json::from_value(tree)?;
        }
        Ok(())
    }

    /// The effective value of a configuration variable, rendered as a string.
    pub fn value_of(&self, var: &Variable) -> String {
        let Ok(tree) = serde_json::to_value(self) else {
            return String::new();
        };

        let found = var
            .path
            .split('.')
            .try_fold(&tree, |node, key| node.get(key));
        match found {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve_addr(&self.bind_addr)
    }
}

fn set_path(tree: &mut Value, path: &str, value: Value) {
    let pointer = format!("/{}", path.replace('.', "/"));
    if let Some(slot) = tree.pointer_mut(&pointer) {
        *slot = value;
    }
}

/// Resolve an address; `:port` binds on all interfaces.
pub fn resolve_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    full.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidValue {
            var: "address".to_string(),
            value: addr.to_string(),
            reason: "could not resolve socket address".to_string(),
        })
}

// =============================================================================
// Variables
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bool,
    String,
    Float,
    Duration,
    Level,
}

impl Kind {
    fn parse(self, raw: &str) -> Result<Value, String> {
        let raw = raw.trim();
        match self {
            Kind::Bool => parse_bool(raw).map(Value::Bool),
            Kind::String => Ok(Value::String(raw.to_string())),
            Kind::Float => raw
                .parse::<f64>()
                .map_err(|err| err.to_string())
                .and_then(|f| {
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .ok_or_else(|| "not a finite number".to_string())
                }),
            Kind::Duration => duration::parse(raw).map(|d| Value::String(duration::format(d))),
            Kind::Level => LogLevel::from_str(raw).map(|level| Value::String(level.to_string())),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Bool => "bool",
            Kind::String => "string",
            Kind::Float => "float",
            Kind::Duration => "duration",
            Kind::Level => "level",
        };
        f.write_str(name)
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(format!("cannot parse {other:?} as a bool")),
    }
}

/// An environment variable that overrides a configuration field.
#[derive(Debug, Clone, Copy)]
pub struct Variable {
    pub name: &'static str,
    pub path: &'static str,
    pub kind: Kind,
    pub default: &'static str,
    pub desc: &'static str,
}

impl Variable {
    pub fn env_name(&self) -> String {
        format!("{ENV_PREFIX}{}", self.name)
    }
}

macro_rules! var {
    ($name:literal, $path:literal, $kind:ident, $default:literal, $desc:literal) => {
        Variable {
            name: $name,
            path: $path,
            kind: Kind::$kind,
            default: $default,
            desc: $desc,
        }
    };
}

pub const VARIABLES: &[Variable] = &[
    var!("MAINTENANCE", "maintenance", Bool, "false", "only answer status and health checks"),
    var!("LOG_LEVEL", "log_level", Level, "info", "verbosity of logging"),
    var!("CONSOLE_LOG", "console_log", Bool, "false", "human readable console logs instead of json"),
    var!("BIND_ADDR", "bind_addr", String, ":5356", "address the gRPC server listens on"),
    var!("META_TOPIC_ENABLED", "meta_topic.enabled", Bool, "false", "publish topic changes to the meta topic"),
    var!("META_TOPIC_TOPIC_NAME", "meta_topic.topic_name", String, "ensign.metatopic.topics", "name of the meta topic"),
    var!("META_TOPIC_CLIENT_ID", "meta_topic.client_id", String, "", "client id of the meta topic publisher"),
    var!("META_TOPIC_CLIENT_SECRET", "meta_topic.client_secret", String, "", "client secret of the meta topic publisher"),
    var!("META_TOPIC_ENDPOINT", "meta_topic.endpoint", String, "ensign.rotational.app:443", "endpoint of the meta topic node"),
    var!("META_TOPIC_AUTH_URL", "meta_topic.auth_url", String, "https://auth.rotational.app", "auth url of the meta topic publisher"),
    var!("MONITORING_ENABLED", "monitoring.enabled", Bool, "true", "serve metrics and probes over http"),
    var!("MONITORING_BIND_ADDR", "monitoring.bind_addr", String, ":1205", "address the metrics server listens on"),
    var!("MONITORING_NODE_ID", "monitoring.node_id", String, "", "node id reported by metrics and streams"),
    var!("STORAGE_READ_ONLY", "storage.read_only", Bool, "false", "reject all writes to the store"),
    var!("STORAGE_DATA_PATH", "storage.data_path", String, "", "directory of the event journal"),
    var!("STORAGE_TESTING", "storage.testing", Bool, "false", "keep all data in memory"),
    var!("AUTH_KEYS_URL", "auth.keys_url", String, "https://auth.rotational.app/.well-known/jwks.json", "jwks url of the authentication service"),
    var!("AUTH_AUDIENCE", "auth.audience", String, "https://ensign.rotational.app", "required audience of access tokens"),
    var!("AUTH_ISSUER", "auth.issuer", String, "https://auth.rotational.app", "required issuer of access tokens"),
    var!("AUTH_MIN_REFRESH_INTERVAL", "auth.min_refresh_interval", Duration, "5m", "minimum time between jwks refreshes"),
    var!("SENTRY_DSN", "sentry.dsn", String, "", "dsn of the error reporting service"),
    var!("SENTRY_SERVER_NAME", "sentry.server_name", String, "", "server name reported with errors"),
    var!("SENTRY_ENVIRONMENT", "sentry.environment", String, "", "environment reported with errors"),
    var!("SENTRY_RELEASE", "sentry.release", String, "ensign@<version>", "release reported with errors"),
    var!("SENTRY_TRACK_PERFORMANCE", "sentry.track_performance", Bool, "false", "report performance traces"),
    var!("SENTRY_SAMPLE_RATE", "sentry.sample_rate", Float, "1.0", "fraction of performance traces reported"),
    var!("SENTRY_DEBUG", "sentry.debug", Bool, "false", "log error reporting activity"),
];

/// Durations are written as `250ms`, `300s`, `5m`, `1h` or a bare number of seconds.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (num, unit) = raw.split_at(split);
        let num: u64 = num
            .parse()
            .map_err(|_| format!("cannot parse {raw:?} as a duration"))?;

        match unit.trim() {
            "" | "s" => Ok(Duration::from_secs(num)),
            "ms" => Ok(Duration::from_millis(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            other => Err(format!("unknown duration unit {other:?}")),
        }
    }

    pub fn format(d: Duration) -> String {
        if d.subsec_millis() != 0 {
            format!("{}ms", d.as_millis())
        } else {
            format!("{}s", d.as_secs())
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    fn testing() -> Config {
        Config {
            storage: StorageConfig {
                testing: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let conf = Config::default();
        assert!(!conf.maintenance);
        assert_eq!(conf.log_level, LogLevel::Info);
        assert_eq!(conf.bind_addr, ":5356");
        assert!(conf.monitoring.enabled);
        assert_eq!(conf.auth.min_refresh_interval, Duration::from_secs(300));
        assert_eq!(conf.sentry.release, format!("ensign@{}", crate::VERSION));

        // A data path is required outside of testing.
        assert!(matches!(conf.mark(), Err(ConfigError::Invalid(_))));
        testing().mark().unwrap();
    }

    #[test]
    fn test_apply_env() {
        let mut conf = Config::default();
        conf.apply_env(env(&[
            ("ENSIGN_MAINTENANCE", "true"),
            ("ENSIGN_LOG_LEVEL", "DEBUG"),
            ("ENSIGN_BIND_ADDR", "127.0.0.1:7777"),
            ("ENSIGN_STORAGE_TESTING", "1"),
            ("ENSIGN_AUTH_MIN_REFRESH_INTERVAL", "90s"),
            ("ENSIGN_SENTRY_SAMPLE_RATE", "0.25"),
            ("ENSIGN_MONITORING_NODE_ID", "node-a"),
        ]))
        .unwrap();

        assert!(conf.maintenance);
        assert_eq!(conf.log_level, LogLevel::Debug);
        assert_eq!(conf.socket_addr().unwrap().port(), 7777);
        assert!(conf.storage.testing);
        assert_eq!(conf.auth.min_refresh_interval, Duration::from_secs(90));
        assert_eq!(conf.sentry.sample_rate, 0.25);
        assert_eq!(conf.monitoring.node_id, "node-a");
        conf.mark().unwrap();
    }

    #[test]
    fn test_apply_env_invalid() {
        let mut conf = Config::default();
        let err = conf
            .apply_env(env(&[("ENSIGN_CONSOLE_LOG", "sometimes")]))
            .unwrap_err();
        assert!(err.to_string().contains("ENSIGN_CONSOLE_LOG"));

        let err = conf
            .apply_env(env(&[("ENSIGN_LOG_LEVEL", "loud")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validation() {
        let mut conf = testing();
        conf.sentry.dsn = "https://key@sentry.example/1".into();
        assert!(conf.mark().is_err());
        conf.sentry.environment = "test".into();
        conf.mark().unwrap();

        let mut conf = testing();
        conf.meta_topic.enabled = true;
        assert!(conf.mark().is_err());
        conf.meta_topic.client_id = "id".into();
        conf.meta_topic.client_secret = "secret".into();
        conf.mark().unwrap();

        let mut conf = testing();
        conf.bind_addr = "not an address".into();
        assert!(conf.mark().is_err());
    }

    #[test]
    #[serial]
    fn test_load_files() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("ensign.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "maintenance = true\nlog_level = \"warn\"\n\n[storage]\ntesting = true\n\n[auth]\nmin_refresh_interval = \"1h\""
        )
        .unwrap();
        let conf = Config::load(&path).unwrap();
        assert!(conf.maintenance);
        assert_eq!(conf.log_level, LogLevel::Warn);
        assert_eq!(conf.auth.min_refresh_interval, Duration::from_secs(3600));

        let path = dir.path().join("ensign.yaml");
        std::fs::write(&path, "storage:\n  data_path: /tmp/ensign\nconsole_log: true\n").unwrap();
        let conf = Config::load(&path).unwrap();
        assert!(conf.console_log);
        assert_eq!(conf.storage.data_path, "/tmp/ensign");

        let path = dir.path().join("ensign.json");
        std::fs::write(&path, r#"{"storage": {"testing": true}, "auth": {"min_refresh_interval": 60}}"#)
            .unwrap();
        let conf = Config::load(&path).unwrap();
        assert_eq!(conf.auth.min_refresh_interval, Duration::from_secs(60));

        let path = dir.path().join("ensign.ini");
        std::fs::write(&path, "maintenance=true").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::UnrecognizedExtension(_))
        ));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("ENSIGN_STORAGE_TESTING", "true");
        std::env::set_var("ENSIGN_MONITORING_ENABLED", "false");
        let conf = Config::from_env();
        std::env::remove_var("ENSIGN_STORAGE_TESTING");
        std::env::remove_var("ENSIGN_MONITORING_ENABLED");

        let conf = conf.unwrap();
        assert!(conf.storage.testing);
        assert!(!conf.monitoring.enabled);
    }

    #[test]
    fn test_durations() {
        assert_eq!(duration::parse("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(duration::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(duration::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(duration::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(duration::parse("42").unwrap(), Duration::from_secs(42));
        assert!(duration::parse("soon").is_err());
        assert!(duration::parse("5d").is_err());
        assert_eq!(duration::format(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_variables() {
        let conf = testing();
        for var in VARIABLES {
            assert!(var.env_name().starts_with(ENV_PREFIX));
        }

        let storage = VARIABLES
            .iter()
            .find(|v| v.name == "STORAGE_TESTING")
            .unwrap();
        assert_eq!(conf.value_of(storage), "true");

        let refresh = VARIABLES
            .iter()
            .find(|v| v.name == "AUTH_MIN_REFRESH_INTERVAL")
            .unwrap();
        assert_eq!(conf.value_of(refresh), "300s");
    }
}
