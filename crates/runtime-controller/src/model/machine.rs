//! Logical machine configuration: servers, volumes and environment of one container.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ATTR_SECURE: &str = "secure";
pub const ATTR_INTERNAL: &str = "internal";
pub const ATTR_PRIMARY: &str = "primary";
pub const ATTR_UNSECURED_PATHS: &str = "unsecuredPaths";
pub const ATTR_COOKIES_AUTH_ENABLED: &str = "cookiesAuthEnabled";
pub const ATTR_DEVFILE_ENDPOINT: &str = "devfileEndpoint";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeConfig>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// A server listening inside a machine, e.g. `port: "8080/tcp"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub port: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn flag(attributes: &BTreeMap<String, String>, key: &str) -> bool {
    attributes
        .get(key)
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

impl ServerConfig {
    pub fn new(port: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            protocol: protocol.into(),
            path: None,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        flag(&self.attributes, ATTR_SECURE)
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        flag(&self.attributes, ATTR_INTERNAL)
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        flag(&self.attributes, ATTR_PRIMARY)
    }

    #[must_use]
    pub fn is_devfile_endpoint(&self) -> bool {
        flag(&self.attributes, ATTR_DEVFILE_ENDPOINT)
    }

    #[must_use]
    pub fn cookies_auth_enabled(&self) -> bool {
        flag(&self.attributes, ATTR_COOKIES_AUTH_ENABLED)
    }

    /// Comma separated list of paths the signer proxy lets through unauthenticated
    #[must_use]
    pub fn unsecured_paths(&self) -> Vec<String> {
        self.attributes
            .get(ATTR_UNSECURED_PATHS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Port number without the `/tcp` suffix
    pub fn port_number(&self) -> Option<i32> {
        self.port
            .split('/')
            .next()
            .and_then(|p| p.trim().parse::<i32>().ok())
            .filter(|p| (1..=65535).contains(p))
    }

    /// Transport protocol from the port spec, TCP when absent
    #[must_use]
    pub fn transport(&self) -> String {
        self.port
            .split_once('/')
            .map_or_else(|| "TCP".to_string(), |(_, t)| t.to_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    pub path: String,

    /// Ephemeral volumes are backed by `emptyDir` and lost on stop
    #[serde(default)]
    pub ephemeral: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub name: String,
    pub command_line: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}
