//! Server configuration.
//!
//! Configuration is one YAML file, found via `$SENSORTRACK_CONFIG_PATH` and
//! read once at startup. Secrets never live in the file itself: `{VAR}`
//! placeholders are substituted from the environment when the file is read,
//! with `{{` and `}}` escaping literal braces. The file uses the same
//! camelCase attribute names as the rest of the wire formats.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the configuration file on disk.
pub const CONFIG_VAR: &str = "SENSORTRACK_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server is not configured, no ${CONFIG_VAR} found")]
    Unconfigured,

    #[error("configuration is not readable: {path}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration references undefined environment variable: {0}")]
    MissingVariable(String),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub smartthings: SmartThingsSettings,
    #[serde(default)]
    pub weather: WeatherSettings,
    pub influxdb: InfluxDbSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Signature checking on inbound lifecycle requests. Production deployments
/// always check; disabling is for local development only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherSettings {
    #[serde(default = "default_true")]
    pub check_signatures: bool,
    /// Allowed skew on the signed Date header; absent means any skew.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_sec: Option<i64>,
    #[serde(default = "default_keyserver_url")]
    pub keyserver_url: String,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        DispatcherSettings {
            check_signatures: true,
            clock_skew_sec: default_clock_skew(),
            keyserver_url: default_keyserver_url(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_clock_skew() -> Option<i64> {
    Some(300)
}

fn default_keyserver_url() -> String {
    "https://key.smartthings.com".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartThingsSettings {
    #[serde(default = "default_smartthings_url")]
    pub base_url: String,
    /// Optional oauth provider used for OAUTH_CALLBACK code exchange.
    #[serde(default)]
    pub oauth: Option<OauthSettings>,
}

impl Default for SmartThingsSettings {
    fn default() -> Self {
        SmartThingsSettings {
            base_url: default_smartthings_url(),
            oauth: None,
        }
    }
}

fn default_smartthings_url() -> String {
    "https://api.smartthings.com".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthSettings {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSettings {
    #[serde(default = "default_weather_url")]
    pub base_url: String,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        WeatherSettings {
            base_url: default_weather_url(),
        }
    }
}

fn default_weather_url() -> String {
    "https://api.weather.gov".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfluxDbSettings {
    pub url: String,
    pub org: String,
    pub token: String,
    pub bucket: String,
}

/// Substitute `{VAR}` placeholders using the given lookup. `{{` and `}}`
/// are escapes for literal braces.
fn replace_env_vars(
    source: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(ConfigError::MissingVariable(name)),
                    }
                }
                let value = lookup(&name).ok_or(ConfigError::MissingVariable(name))?;
                out.push_str(&value);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

impl ServerConfig {
    /// Parse configuration YAML, substituting environment variables.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let substituted = replace_env_vars(raw, |name| std::env::var(name).ok())?;
        Ok(serde_yaml::from_str(&substituted)?)
    }
}

/// Load configuration from the file named by `$SENSORTRACK_CONFIG_PATH`.
pub fn load() -> Result<ServerConfig, ConfigError> {
    let path = std::env::var(CONFIG_VAR).map_err(|_| ConfigError::Unconfigured)?;
    load_file(Path::new(&path))
}

pub fn load_file(path: &Path) -> Result<ServerConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    ServerConfig::from_yaml(&raw)
}
