//! Components discovered by the plugin broker and their inclusion as sidecars

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::environment::machine_name;
use crate::model::{dns_label, KubernetesEnvironment, MachineConfig, ServerConfig, VolumeConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginComponent {
    pub name: String,
    pub image: String,
    /// Pod the sidecar joins, the first pod when absent
    #[serde(default)]
    pub target_pod: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeConfig>,
    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// Parse and validate the broker's tooling list
pub fn parse_components(tooling: &serde_json::Value) -> Result<Vec<PluginComponent>> {
    let components: Vec<PluginComponent> = serde_json::from_value(tooling.clone())
        .map_err(|e| Error::infrastructure(format!("Plugin broker returned an invalid tooling list: {e}")))?;
    for component in &components {
        if component.name.trim().is_empty() {
            return Err(Error::infrastructure("Plugin broker returned a component without a name"));
        }
        if component.image.trim().is_empty() {
            return Err(Error::infrastructure(format!(
                "Plugin component '{}' has no image",
                component.name
            )));
        }
    }
    Ok(components)
}

/// Add every component as a sidecar container with its own machine config
pub fn apply_components(env: &mut KubernetesEnvironment, components: Vec<PluginComponent>) -> Result<()> {
    for component in components {
        let pod_name = match &component.target_pod {
            Some(pod) => pod.clone(),
            None => env
                .pods
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| Error::Internal("No pod to attach plugin components to".to_string()))?,
        };
        let pod = env.pods.get_mut(&pod_name).ok_or_else(|| {
            Error::infrastructure(format!(
                "Plugin component '{}' targets unknown pod '{pod_name}'",
                component.name
            ))
        })?;

        let container_name = dns_label(&component.name);
        if !pod.spec.containers.iter().any(|c| c.name == container_name) {
            debug!(pod = %pod_name, container = %container_name, "Adding plugin sidecar");
            pod.spec.containers.push(Container {
                name: container_name.clone(),
                image: Some(component.image.clone()),
                resources: component.memory_limit.as_ref().map(|limit| ResourceRequirements {
                    limits: Some(BTreeMap::from([("memory".to_string(), Quantity(limit.clone()))])),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        env.machines.insert(
            machine_name(&pod_name, &container_name),
            MachineConfig {
                servers: component.servers,
                env: component.env,
                volumes: component.volumes,
                attributes: BTreeMap::from([("plugin".to_string(), component.name)]),
            },
        );
    }
    Ok(())
}
