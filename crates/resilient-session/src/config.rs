//! Session configuration.
//!
//! Read once by the supervisor from `session.config.json` (or the file named
//! by `SESSION_CONFIG`), validated against a JSON schema, then deep-merged
//! over the compiled defaults so every field is present. Only operator
//! commands change it afterwards; it is never written back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use colored::{ColoredString, Colorize};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const CONFIG_PATH_ENV: &str = "SESSION_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "session.config.json";

pub const SERVER_PORT: &str = "server";
pub const DEFAULT_SERVER_PORT: u16 = 3000;
pub const MIN_PORT: i64 = 1024;
pub const MAX_PORT: i64 = 65535;
pub const MAX_INTERVAL_SECONDS: u64 = 86_400;
/// Port names survive the round trip through upper-cased env var names.
pub const PORT_NAME_PATTERN: &str = "^[a-z][a-z0-9_]*$";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} is invalid:\n  {}", .violations.join("\n  "))]
    Invalid {
        path: PathBuf,
        violations: Vec<String>,
    },

    #[error("configuration schema failed to compile: {0}")]
    Schema(String),

    #[error("{name} is an invalid port number ({value})")]
    InvalidPort { name: String, value: i64 },

    #[error("{0:?} is not a valid port name")]
    InvalidPortName(String),

    #[error("the polling interval must be between 1 and 86400 seconds ({0})")]
    InvalidInterval(i64),
}

/// Terminal colors accepted for identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierColor {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    Gray,
    Grey,
}

impl IdentifierColor {
    const NAMES: [&'static str; 10] = [
        "black", "red", "green", "yellow", "blue", "magenta", "cyan", "white", "gray", "grey",
    ];

    pub fn to_color(self) -> colored::Color {
        match self {
            Self::Black => colored::Color::Black,
            Self::Red => colored::Color::Red,
            Self::Green => colored::Color::Green,
            Self::Yellow => colored::Color::Yellow,
            Self::Blue => colored::Color::Blue,
            Self::Magenta => colored::Color::Magenta,
            Self::Cyan => colored::Color::Cyan,
            Self::White => colored::Color::White,
            Self::Gray | Self::Grey => colored::Color::BrightBlack,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub text: String,
    pub color: IdentifierColor,
}

impl Identifier {
    fn new(text: &str, color: IdentifierColor) -> Self {
        Self {
            text: text.to_string(),
            color,
        }
    }

    /// `text:` in the configured color, as printed before log lines.
    pub fn painted(&self) -> ColoredString {
        format!("{}:", self.text).color(self.color.to_color())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifiers {
    pub master: Identifier,
    pub worker: Identifier,
    pub exec: Identifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Polling {
    pub route: String,
    pub interval_seconds: u64,
    pub failure_tolerance: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub show_server_output: bool,
    pub identifiers: Identifiers,
    pub ports: BTreeMap<String, u16>,
    pub polling: Polling,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            show_server_output: false,
            identifiers: Identifiers {
                master: Identifier::new("__monitor__", IdentifierColor::Yellow),
                worker: Identifier::new("__server__", IdentifierColor::Magenta),
                exec: Identifier::new("__exec__", IdentifierColor::Green),
            },
            ports: BTreeMap::from([(SERVER_PORT.to_string(), DEFAULT_SERVER_PORT)]),
            polling: Polling {
                route: "/".to_string(),
                interval_seconds: 30,
                failure_tolerance: 0,
            },
        }
    }
}

impl SessionConfig {
    pub fn server_port(&self) -> u16 {
        self.ports
            .get(SERVER_PORT)
            .copied()
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    /// Update (or add) a named port. Takes effect on the next spawn.
    pub fn set_port(&mut self, name: &str, value: i64) -> Result<(), ConfigError> {
        if !is_port_name(name) {
            return Err(ConfigError::InvalidPortName(name.to_string()));
        }
        if !(MIN_PORT..=MAX_PORT).contains(&value) {
            return Err(ConfigError::InvalidPort {
                name: name.to_string(),
                value,
            });
        }
        let port = u16::try_from(value).map_err(|_| ConfigError::InvalidPort {
            name: name.to_string(),
            value,
        })?;
        self.ports.insert(name.to_string(), port);
        Ok(())
    }

    /// Update the polling interval. Returns whether it changed.
    pub fn set_interval(&mut self, seconds: i64) -> Result<bool, ConfigError> {
        let seconds = u64::try_from(seconds)
            .ok()
            .filter(|s| (1..=MAX_INTERVAL_SECONDS).contains(s))
            .ok_or(ConfigError::InvalidInterval(seconds))?;
        let changed = seconds != self.polling.interval_seconds;
        self.polling.interval_seconds = seconds;
        Ok(changed)
    }
}

/// Matches [`PORT_NAME_PATTERN`].
pub fn is_port_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

/// `SESSION_CONFIG` if set, else `session.config.json` in the working
/// directory.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Read, validate and merge the configuration at `path`. A missing file
/// yields the defaults.
pub fn load(path: &Path) -> Result<(SessionConfig, ConfigSource), ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No configuration file, using defaults");
            return Ok((SessionConfig::default(), ConfigSource::Defaults));
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let user: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let violations = validate(&user)?;
    if !violations.is_empty() {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            violations,
        });
    }

    let config = resolve(user).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((config, ConfigSource::File(path.to_path_buf())))
}

/// Deep-merge a validated user document over the defaults.
pub fn resolve(user: Value) -> Result<SessionConfig, serde_json::Error> {
    let mut merged = serde_json::to_value(SessionConfig::default())?;
    merge(&mut merged, user);
    serde_json::from_value(merged)
}

/// Per-key recursive merge: objects merge key by key, anything else in
/// `overlay` replaces the value in `base`.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Schema violations of a user document, one line each.
pub fn validate(user: &Value) -> Result<Vec<String>, ConfigError> {
    let validator =
        jsonschema::validator_for(&schema()).map_err(|e| ConfigError::Schema(e.to_string()))?;
    if validator.validate(user).is_ok() {
        return Ok(Vec::new());
    }
    Ok(validator.iter_errors(user).map(|e| e.to_string()).collect())
}

fn schema() -> Value {
    let port = json!({ "type": "integer", "minimum": MIN_PORT, "maximum": MAX_PORT });
    let identifier = json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "text": { "type": "string", "minLength": 1 },
            "color": { "type": "string", "enum": IdentifierColor::NAMES },
        },
    });
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "showServerOutput": { "type": "boolean" },
            "ports": {
                "type": "object",
                "required": [SERVER_PORT],
                "propertyNames": { "pattern": PORT_NAME_PATTERN },
                "additionalProperties": port,
            },
            "identifiers": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "master": identifier,
                    "worker": identifier,
                    "exec": identifier,
                },
            },
            "polling": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "route": { "type": "string", "pattern": "^/[a-zA-Z]*" },
                    "intervalSeconds": { "type": "integer", "minimum": 1, "maximum": MAX_INTERVAL_SECONDS },
                    "failureTolerance": { "type": "integer", "minimum": 0 },
                },
            },
        },
    })
}
