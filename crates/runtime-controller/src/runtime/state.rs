//! Runtime lifecycle status and the record kept per runtime

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Command, KubernetesEnvironment, RuntimeIdentity, Warning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl RuntimeStatus {
    /// STOPPED and FAILED only leave the cache through acknowledgement
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running | Self::Failed)
                | (Self::Running, Self::Stopping | Self::Failed)
                | (Self::Stopping, Self::Stopped | Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    Starting,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub status: MachineState,
    /// Server name to URL
    #[serde(default)]
    pub servers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub identity: RuntimeIdentity,
    pub status: RuntimeStatus,
    #[serde(default)]
    pub machines: BTreeMap<String, MachineStatus>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeState {
    /// Initial record of a start, built from the provisioned environment
    #[must_use]
    pub fn starting(identity: RuntimeIdentity, env: &KubernetesEnvironment) -> Self {
        let mut machines: BTreeMap<String, MachineStatus> = env
            .machine_names()
            .into_iter()
            .map(|name| {
                (
                    name,
                    MachineStatus {
                        status: MachineState::Starting,
                        servers: BTreeMap::new(),
                    },
                )
            })
            .collect();
        for exposed in &env.exposed_servers {
            if let Some(machine) = machines.get_mut(&exposed.machine) {
                machine
                    .servers
                    .insert(exposed.server.clone(), exposed.url.clone());
            }
        }

        Self {
            identity,
            status: RuntimeStatus::Starting,
            machines,
            warnings: env.warnings().to_vec(),
            commands: env.commands.clone(),
            failure: None,
            updated_at: Utc::now(),
        }
    }

    /// Same record in `status`; machine states follow the runtime
    #[must_use]
    pub fn with_status(mut self, status: RuntimeStatus) -> Self {
        let machine_state = match status {
            RuntimeStatus::Running => Some(MachineState::Running),
            RuntimeStatus::Failed => Some(MachineState::Failed),
            _ => None,
        };
        if let Some(state) = machine_state {
            for machine in self.machines.values_mut() {
                machine.status = state;
            }
        }
        self.status = status;
        self.updated_at = Utc::now();
        self
    }

    #[must_use]
    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self.with_status(RuntimeStatus::Failed)
    }

    #[must_use]
    pub fn with_warning(mut self, warning: Warning) -> Self {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
        self
    }
}
