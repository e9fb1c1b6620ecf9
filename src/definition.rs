//! Static SmartApp definition.
//!
//! The definition (identity, permissions, configuration pages) is fixed for
//! any given release, so it lives in `definition.yaml` next to the sources
//! and is embedded into the binary at compile time. The on-disk format uses
//! the SmartThings camelCase attribute names.

use serde::{Deserialize, Serialize};

/// Definition of the SmartApp: identity, permissions, and config pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartAppDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub target_url: String,
    pub permissions: Vec<String>,
    pub config_pages: Vec<DefinitionPage>,
}

/// One page of configuration offered to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionPage {
    pub page_name: String,
    pub sections: Vec<ConfigSection>,
}

/// A section within a configuration page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSection {
    pub name: String,
    pub settings: Vec<ConfigSetting>,
}

/// An option within an ENUM setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumOption {
    pub id: String,
    pub name: String,
}

/// A single config setting, discriminated by its `type` field.
///
/// SmartThings defines more setting types than these; this is the subset the
/// sensor-track definition uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConfigSetting {
    #[serde(rename = "DEVICE", rename_all = "camelCase")]
    Device {
        id: String,
        name: String,
        description: String,
        #[serde(default)]
        required: bool,
        multiple: bool,
        // treated as AND - matches devices that have all capabilities
        capabilities: Vec<String>,
        permissions: Vec<String>,
    },
    #[serde(rename = "TEXT", rename_all = "camelCase")]
    Text {
        id: String,
        name: String,
        description: String,
        #[serde(default)]
        required: bool,
        default_value: String,
    },
    #[serde(rename = "BOOLEAN", rename_all = "camelCase")]
    Boolean {
        id: String,
        name: String,
        description: String,
        #[serde(default)]
        required: bool,
        default_value: String,
    },
    #[serde(rename = "ENUM", rename_all = "camelCase")]
    Enum {
        id: String,
        name: String,
        description: String,
        #[serde(default)]
        required: bool,
        multiple: bool,
        options: Vec<EnumOption>,
    },
    #[serde(rename = "PARAGRAPH", rename_all = "camelCase")]
    Paragraph {
        id: String,
        name: String,
        description: String,
        #[serde(default)]
        required: bool,
        default_value: String,
    },
}

impl SmartAppDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Path (plus query, if any) of the target URL. This is what the
    /// platform signs as `(request-target)`, which may differ from the path
    /// the server actually saw due to proxying.
    pub fn target_path(&self) -> &str {
        let rest = match self.target_url.find("://") {
            Some(i) => &self.target_url[i + 3..],
            None => return self.target_url.as_str(),
        };
        match rest.find('/') {
            Some(i) => &rest[i..],
            None => "/",
        }
    }
}

/// Load the embedded definition. Called once at startup.
pub fn load() -> anyhow::Result<SmartAppDefinition> {
    Ok(SmartAppDefinition::from_yaml(include_str!(
        "../definition.yaml"
    ))?)
}
