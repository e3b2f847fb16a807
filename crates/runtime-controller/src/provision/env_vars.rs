//! Environment variables injected into every workspace container

use k8s_openapi::api::core::v1::{Container, EnvVar};

use super::Provisioner;
use crate::config::WorkspaceEnvConfig;
use crate::error::{Error, Result};
use crate::model::environment::machine_name;
use crate::model::{KubernetesEnvironment, RuntimeIdentity};

/// Contributes exactly one variable per container
pub trait EnvVarProvider: Send + Sync {
    fn get(&self, identity: &RuntimeIdentity, machine: &str) -> Result<(String, String)>;
}

pub struct WorkspaceIdProvider;

impl EnvVarProvider for WorkspaceIdProvider {
    fn get(&self, identity: &RuntimeIdentity, _machine: &str) -> Result<(String, String)> {
        Ok(("WORKSPACE_ID".to_string(), identity.workspace_id.clone()))
    }
}

pub struct WorkspaceNamespaceProvider;

impl EnvVarProvider for WorkspaceNamespaceProvider {
    fn get(&self, identity: &RuntimeIdentity, _machine: &str) -> Result<(String, String)> {
        Ok((
            "WORKSPACE_NAMESPACE".to_string(),
            identity.infrastructure_namespace.clone(),
        ))
    }
}

pub struct MachineNameProvider;

impl EnvVarProvider for MachineNameProvider {
    fn get(&self, _identity: &RuntimeIdentity, machine: &str) -> Result<(String, String)> {
        Ok(("WORKSPACE_MACHINE_NAME".to_string(), machine.to_string()))
    }
}

pub struct LogsRootProvider {
    logs_root_path: String,
}

impl EnvVarProvider for LogsRootProvider {
    fn get(&self, identity: &RuntimeIdentity, machine: &str) -> Result<(String, String)> {
        let root = self.logs_root_path.trim_end_matches('/');
        if root.is_empty() {
            return Err(Error::Internal("Workspace logs root path is empty".to_string()));
        }
        Ok((
            "WORKSPACE_LOGS_ROOT_DIR".to_string(),
            format!("{root}/{}/{}", identity.workspace_id, machine.replace('/', "-")),
        ))
    }
}

pub struct ApiEndpointProvider {
    api_endpoint: Option<String>,
}

impl EnvVarProvider for ApiEndpointProvider {
    fn get(&self, _identity: &RuntimeIdentity, _machine: &str) -> Result<(String, String)> {
        let endpoint = self
            .api_endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| Error::Internal("Workspace API endpoint is not configured".to_string()))?;
        Ok(("WORKSPACE_API_ENDPOINT".to_string(), endpoint.to_string()))
    }
}

fn set_env(container: &mut Container, name: String, value: String) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => {
            existing.value = Some(value);
            existing.value_from = None;
        }
        None => env.push(EnvVar {
            name,
            value: Some(value),
            value_from: None,
        }),
    }
}

pub struct EnvVarsProvisioner {
    providers: Vec<Box<dyn EnvVarProvider>>,
}

impl EnvVarsProvisioner {
    pub fn new(config: &WorkspaceEnvConfig) -> Self {
        Self {
            providers: vec![
                Box::new(WorkspaceIdProvider),
                Box::new(WorkspaceNamespaceProvider),
                Box::new(ApiEndpointProvider {
                    api_endpoint: config.api_endpoint.clone(),
                }),
                Box::new(LogsRootProvider {
                    logs_root_path: config.logs_root_path.clone(),
                }),
                Box::new(MachineNameProvider),
            ],
        }
    }
}

impl Provisioner for EnvVarsProvisioner {
    fn name(&self) -> &'static str {
        "env-vars"
    }

    fn provision(&self, env: &mut KubernetesEnvironment, identity: &RuntimeIdentity) -> Result<()> {
        for (pod_name, pod) in &mut env.pods {
            for container in &mut pod.spec.containers {
                let machine = machine_name(pod_name, &container.name);
                // Declared machine env first so injected values win on clashes
                if let Some(config) = env.machines.get(&machine) {
                    for (name, value) in &config.env {
                        set_env(container, name.clone(), value.clone());
                    }
                }
                for provider in &self.providers {
                    let (name, value) = provider.get(identity, &machine)?;
                    set_env(container, name, value);
                }
            }
        }
        Ok(())
    }
}
