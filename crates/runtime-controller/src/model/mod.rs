//! Desired-state model for one workspace runtime.

pub mod environment;
pub mod machine;
pub mod object;
pub mod route;

pub use environment::{ExposedServer, KubernetesEnvironment, PodData, PodRole};
pub use machine::{Command, MachineConfig, ServerConfig, VolumeConfig};
pub use object::ClusterObject;
pub use route::{Route, RouteSpec};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Label carrying the workspace id on every object a runtime owns
pub const LABEL_WORKSPACE_ID: &str = "workspaces.platform/workspace-id";
/// Label carrying the logical pod name (deployment pods get generated names)
pub const LABEL_POD_NAME: &str = "workspaces.platform/pod-name";
/// Label marking objects created for the plugin broker
pub const LABEL_BROKER: &str = "workspaces.platform/broker";

/// Key of a runtime for every lifecycle operation and the state cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeIdentity {
    pub workspace_id: String,
    pub owner_id: String,
    pub environment_name: String,
    pub infrastructure_namespace: String,
}

impl RuntimeIdentity {
    pub fn new(
        workspace_id: impl Into<String>,
        owner_id: impl Into<String>,
        environment_name: impl Into<String>,
        infrastructure_namespace: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            owner_id: owner_id.into(),
            environment_name: environment_name.into(),
            infrastructure_namespace: infrastructure_namespace.into(),
        }
    }

    /// Label selector matching every object of this runtime
    #[must_use]
    pub fn selector(&self) -> String {
        format!("{LABEL_WORKSPACE_ID}={}", self.workspace_id)
    }
}

impl fmt::Display for RuntimeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.workspace_id, self.environment_name, self.owner_id
        )
    }
}

/// Authenticated caller, threaded explicitly through every authorized call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Subject {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }
}

/// Non-fatal notice attached to a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Warning {
    pub code: u32,
    pub message: String,
}

impl Warning {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Stable warning codes rendered by external clients.
pub mod warnings {
    /// A pod's declared restart policy was replaced with the supported one
    pub const RESTART_POLICY_REWRITTEN: u32 = 4104;
    /// A non-primary secure server could not be wired through the signer proxy
    pub const SECURE_SERVER_EXPOSURE_FAILED: u32 = 4110;
    /// Stop did not observe deletion of every object before the grace period
    pub const STOP_GRACE_PERIOD_EXCEEDED: u32 = 4120;
    /// The control plane restarted while the runtime was starting
    pub const START_INTERRUPTED_BY_RESTART: u32 = 4130;
}

/// Lowercase DNS-1123 label: invalid characters become `-`, runs collapse,
/// truncated to 63 characters without leading or trailing dashes.
#[must_use]
pub fn dns_label(raw: &str) -> String {
    let mut label = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' && label.ends_with('-') {
            continue;
        }
        label.push(c);
    }
    let label = label.trim_matches('-');
    let truncated: String = label.chars().take(63).collect();
    truncated.trim_end_matches('-').to_string()
}
