//! Lifecycle envelope types and decoding.
//!
//! SmartThings posts a JSON envelope whose `lifecycle` field names one of
//! seven phases; the rest of the body is phase-specific. Decoding reads the
//! discriminator first and then parses the remainder against that phase's
//! schema, all-or-nothing — an envelope is never partially constructed.
//!
//! Wire names are camelCase; everything here renames accordingly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The seven lifecycle phases of the SmartApp webhook protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    Confirmation,
    Configuration,
    Install,
    Update,
    Event,
    OauthCallback,
    Uninstall,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecyclePhase::Confirmation => "CONFIRMATION",
            LifecyclePhase::Configuration => "CONFIGURATION",
            LifecyclePhase::Install => "INSTALL",
            LifecyclePhase::Update => "UPDATE",
            LifecyclePhase::Event => "EVENT",
            LifecyclePhase::OauthCallback => "OAUTH_CALLBACK",
            LifecyclePhase::Uninstall => "UNINSTALL",
        };
        f.write_str(name)
    }
}

/// A failure to decode an inbound lifecycle envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The `lifecycle` discriminator named a phase we do not know.
    #[error("unknown lifecycle: {0}")]
    UnknownLifecycle(String),

    /// The body was not valid JSON, or required fields were absent or of
    /// the wrong type for the discriminated phase.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(#[from] serde_json::Error),
}

/// Decode a raw request body into a typed lifecycle envelope.
pub fn decode(raw: &[u8]) -> Result<LifecycleRequest, DecodeError> {
    let value: Value = serde_json::from_slice(raw)?;
    let tag = match value.get("lifecycle").and_then(Value::as_str) {
        Some(tag) => tag,
        None => {
            return Err(DecodeError::SchemaMismatch(serde::de::Error::custom(
                "missing lifecycle discriminator",
            )))
        }
    };
    let request = match tag {
        "CONFIRMATION" => LifecycleRequest::Confirmation(serde_json::from_value(value)?),
        "CONFIGURATION" => LifecycleRequest::Configuration(serde_json::from_value(value)?),
        "INSTALL" => LifecycleRequest::Install(serde_json::from_value(value)?),
        "UPDATE" => LifecycleRequest::Update(serde_json::from_value(value)?),
        "EVENT" => LifecycleRequest::Event(serde_json::from_value(value)?),
        "OAUTH_CALLBACK" => LifecycleRequest::OauthCallback(serde_json::from_value(value)?),
        "UNINSTALL" => LifecycleRequest::Uninstall(serde_json::from_value(value)?),
        unknown => return Err(DecodeError::UnknownLifecycle(unknown.to_string())),
    };
    Ok(request)
}

/// A decoded lifecycle request, one variant per phase.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleRequest {
    Confirmation(ConfirmationRequest),
    Configuration(ConfigurationRequest),
    Install(InstallRequest),
    Update(UpdateRequest),
    Event(EventRequest),
    OauthCallback(OauthCallbackRequest),
    Uninstall(UninstallRequest),
}

impl LifecycleRequest {
    pub fn phase(&self) -> LifecyclePhase {
        match self {
            LifecycleRequest::Confirmation(_) => LifecyclePhase::Confirmation,
            LifecycleRequest::Configuration(_) => LifecyclePhase::Configuration,
            LifecycleRequest::Install(_) => LifecyclePhase::Install,
            LifecycleRequest::Update(_) => LifecyclePhase::Update,
            LifecycleRequest::Event(_) => LifecyclePhase::Event,
            LifecycleRequest::OauthCallback(_) => LifecyclePhase::OauthCallback,
            LifecycleRequest::Uninstall(_) => LifecyclePhase::Uninstall,
        }
    }

    /// Correlation id assigned by the platform, for log context.
    pub fn execution_id(&self) -> &str {
        match self {
            LifecycleRequest::Confirmation(r) => &r.execution_id,
            LifecycleRequest::Configuration(r) => &r.execution_id,
            LifecycleRequest::Install(r) => &r.execution_id,
            LifecycleRequest::Update(r) => &r.execution_id,
            LifecycleRequest::Event(r) => &r.execution_id,
            LifecycleRequest::OauthCallback(r) => &r.execution_id,
            LifecycleRequest::Uninstall(r) => &r.execution_id,
        }
    }
}

fn default_locale() -> String {
    "en".to_string()
}

// ── Request payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    pub execution_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub version: String,
    pub app_id: String,
    pub confirmation_data: ConfirmationData,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationData {
    pub app_id: String,
    pub confirmation_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationRequest {
    pub execution_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub version: String,
    pub configuration_data: ConfigData,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

/// Sub-phases within CONFIGURATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigPhase {
    Initialize,
    Page,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigData {
    pub installed_app_id: String,
    pub phase: ConfigPhase,
    #[serde(default)]
    pub page_id: String,
    #[serde(default)]
    pub previous_page_id: String,
    #[serde(default)]
    pub config: HashMap<String, Vec<ConfigValue>>,
}

/// A configured setting value, discriminated by `valueType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "valueType")]
pub enum ConfigValue {
    #[serde(rename = "DEVICE", rename_all = "camelCase")]
    Device { device_config: DeviceValue },
    #[serde(rename = "STRING", rename_all = "camelCase")]
    String { string_config: StringValue },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceValue {
    pub device_id: String,
    pub component_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringValue {
    pub value: String,
}

/// One configured installation of the app at a location.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub installed_app_id: String,
    pub location_id: String,
    #[serde(default)]
    pub config: HashMap<String, Vec<ConfigValue>>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl InstalledApp {
    /// First STRING value configured for a setting id. Unknown ids are
    /// simply absent; that is not an error at this layer.
    pub fn as_str(&self, key: &str) -> Option<&str> {
        self.config.get(key)?.iter().find_map(|value| match value {
            ConfigValue::String { string_config } => Some(string_config.value.as_str()),
            _ => None,
        })
    }

    /// Boolean setting: SmartThings sends "true"/"false" strings.
    pub fn as_bool(&self, key: &str) -> bool {
        matches!(self.as_str(key), Some("true"))
    }

    /// Device ids selected for a DEVICE setting.
    pub fn device_ids(&self, key: &str) -> Vec<&str> {
        self.config
            .get(key)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|value| match value {
                        ConfigValue::Device { device_config } => {
                            Some(device_config.device_id.as_str())
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub execution_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub version: String,
    pub install_data: InstallData,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallData {
    // auth_token and refresh_token are secrets; never log this payload
    pub auth_token: String,
    pub refresh_token: String,
    pub installed_app: InstalledApp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub execution_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub version: String,
    pub update_data: UpdateData,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateData {
    // auth_token and refresh_token are secrets; never log this payload
    pub auth_token: String,
    pub refresh_token: String,
    pub installed_app: InstalledApp,
    #[serde(default)]
    pub previous_config: Option<HashMap<String, Vec<ConfigValue>>>,
    #[serde(default)]
    pub previous_permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub execution_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub version: String,
    pub event_data: EventData,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    // auth_token is a secret; never log this payload
    pub auth_token: String,
    pub installed_app: InstalledApp,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl EventData {
    /// Device events in payload order. Ordering within a payload carries no
    /// chronological guarantee; each event has its own platform timestamp.
    pub fn device_events(&self) -> impl Iterator<Item = (&Event, &DeviceEvent)> {
        self.events
            .iter()
            .filter(|e| e.event_type == EventType::DeviceEvent)
            .filter_map(|e| e.device_event.as_ref().map(|d| (e, d)))
    }

    /// Timer events with the given schedule name.
    pub fn timer_events<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TimerEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type == EventType::TimerEvent)
            .filter_map(|e| e.timer_event.as_ref())
            .filter(move |t| t.name == name)
    }
}

/// Event types the platform may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    DeviceCommandsEvent,
    DeviceEvent,
    DeviceHealthEvent,
    DeviceLifecycleEvent,
    HubHealthEvent,
    InstalledAppLifecycleEvent,
    ModeEvent,
    SceneLifecycleEvent,
    SecurityArmStateEvent,
    TimerEvent,
    WeatherEvent,
}

/// One triggered event; exactly one of the payload fields matches the type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: EventType,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_event: Option<DeviceEvent>,
    #[serde(default)]
    pub timer_event: Option<TimerEvent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub device_id: String,
    pub location_id: String,
    #[serde(default)]
    pub capability: String,
    pub attribute: String,
    pub value: Value,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerEvent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthCallbackRequest {
    pub execution_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub version: String,
    #[serde(rename = "oAuthCallbackData")]
    pub o_auth_callback_data: OauthCallbackData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthCallbackData {
    pub installed_app_id: String,
    pub url_path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallRequest {
    pub execution_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub version: String,
    pub uninstall_data: UninstallData,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallData {
    pub installed_app: InstalledApp,
}

// ── Response envelopes ──────────────────────────────────────────────────────

/// Serializes as `{}` — several response payloads are always empty objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Empty {}

/// The phase-specific response envelope. Shape correctness is structural:
/// each phase handler can only produce its own variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LifecycleResponse {
    Confirmation(ConfirmationResponse),
    ConfigurationInit(ConfigurationInitResponse),
    ConfigurationPage(ConfigurationPageResponse),
    Install(InstallResponse),
    Update(UpdateResponse),
    Event(EventResponse),
    OauthCallback(OauthCallbackResponse),
    Uninstall(UninstallResponse),
}

impl LifecycleResponse {
    pub fn install() -> Self {
        LifecycleResponse::Install(InstallResponse {
            install_data: Empty {},
        })
    }

    pub fn update() -> Self {
        LifecycleResponse::Update(UpdateResponse {
            update_data: Empty {},
        })
    }

    pub fn event() -> Self {
        LifecycleResponse::Event(EventResponse {
            event_data: Empty {},
        })
    }

    pub fn oauth_callback() -> Self {
        LifecycleResponse::OauthCallback(OauthCallbackResponse {
            o_auth_callback_data: Empty {},
        })
    }

    pub fn uninstall() -> Self {
        LifecycleResponse::Uninstall(UninstallResponse {
            uninstall_data: Empty {},
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationResponse {
    pub target_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationInitResponse {
    pub configuration_data: ConfigInitData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigInitData {
    pub initialize: ConfigInit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInit {
    pub id: String,
    pub name: String,
    pub description: String,
    pub permissions: Vec<String>,
    pub first_page_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationPageResponse {
    pub configuration_data: ConfigPageData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigPageData {
    pub page: ConfigPage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPage {
    pub page_id: String,
    pub name: String,
    pub previous_page_id: Option<String>,
    pub next_page_id: Option<String>,
    pub complete: bool,
    pub sections: Vec<crate::definition::ConfigSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub install_data: Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    pub update_data: Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub event_data: Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OauthCallbackResponse {
    #[serde(rename = "oAuthCallbackData")]
    pub o_auth_callback_data: Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallResponse {
    pub uninstall_data: Empty,
}

// ── Test fixtures ───────────────────────────────────────────────────────────
