//! In-memory desired state of every cluster object of one runtime.
//!
//! Mutated only by the provisioner pipeline and the broker phases before
//! submission. Once [`KubernetesEnvironment::objects`] has been submitted
//! the environment is treated as read-only.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, PodSpec, PodTemplateSpec, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};

use super::machine::{Command, MachineConfig};
use super::object::ClusterObject;
use super::route::Route;
use super::{Warning, LABEL_POD_NAME};

/// How a pod is submitted to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodRole {
    Pod,
    Deployment,
}

/// Pod metadata plus container specs, independent of the submitting object kind.
#[derive(Debug, Clone)]
pub struct PodData {
    pub role: PodRole,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

impl PodData {
    pub fn new(name: &str, spec: PodSpec) -> Self {
        Self {
            role: PodRole::Pod,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    #[must_use]
    pub fn as_deployment(mut self) -> Self {
        self.role = PodRole::Deployment;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn to_cluster_object(&self) -> ClusterObject {
        match self.role {
            PodRole::Pod => ClusterObject::Pod(Pod {
                metadata: self.metadata.clone(),
                spec: Some(self.spec.clone()),
                status: None,
            }),
            PodRole::Deployment => {
                let mut selector_labels = BTreeMap::new();
                selector_labels.insert(LABEL_POD_NAME.to_string(), self.name().to_string());
                let mut template_meta = self.metadata.clone();
                template_meta.name = None;
                template_meta
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .extend(selector_labels.clone());

                ClusterObject::Deployment(Deployment {
                    metadata: ObjectMeta {
                        name: self.metadata.name.clone(),
                        labels: self.metadata.labels.clone(),
                        annotations: self.metadata.annotations.clone(),
                        ..Default::default()
                    },
                    spec: Some(DeploymentSpec {
                        replicas: Some(1),
                        selector: LabelSelector {
                            match_labels: Some(selector_labels),
                            ..Default::default()
                        },
                        template: PodTemplateSpec {
                            metadata: Some(template_meta),
                            spec: Some(self.spec.clone()),
                        },
                        ..Default::default()
                    }),
                    status: None,
                })
            }
        }
    }
}

/// Server made reachable by the exposers; recorded for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedServer {
    pub machine: String,
    pub server: String,
    pub url: String,
    pub secure: bool,
    /// Port the real server listens on; only reachable inside the cluster when secure
    pub internal_port: i32,
    /// Port routed externally (the proxy port for secure servers)
    pub exposed_port: i32,
}

#[derive(Debug, Clone, Default)]
pub struct KubernetesEnvironment {
    pub pods: BTreeMap<String, PodData>,
    pub machines: BTreeMap<String, MachineConfig>,
    pub services: BTreeMap<String, Service>,
    pub ingresses: BTreeMap<String, Ingress>,
    pub routes: BTreeMap<String, Route>,
    pub persistent_volume_claims: BTreeMap<String, PersistentVolumeClaim>,
    pub config_maps: BTreeMap<String, ConfigMap>,
    pub secrets: BTreeMap<String, Secret>,
    pub commands: Vec<Command>,
    /// Plugin ids resolved by the broker before provisioning
    pub plugins: Vec<String>,
    pub exposed_servers: Vec<ExposedServer>,
    warnings: Vec<Warning>,
}

/// `<pod>/<container>`
#[must_use]
pub fn machine_name(pod: &str, container: &str) -> String {
    format!("{pod}/{container}")
}

/// Inverse of [`machine_name`]
#[must_use]
pub fn split_machine_name(machine: &str) -> Option<(&str, &str)> {
    machine.split_once('/')
}

impl KubernetesEnvironment {
    pub fn add_pod(&mut self, pod: PodData) {
        self.pods.insert(pod.name().to_string(), pod);
    }

    /// Appends a warning unless an identical one is already recorded
    pub fn add_warning(&mut self, warning: Warning) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Machine names of every container declared in the environment
    #[must_use]
    pub fn machine_names(&self) -> Vec<String> {
        self.pods
            .values()
            .flat_map(|pod| {
                pod.spec
                    .containers
                    .iter()
                    .map(|c| machine_name(pod.name(), &c.name))
            })
            .collect()
    }

    /// Logical names of the pods whose readiness gates the start
    #[must_use]
    pub fn workload_names(&self) -> Vec<String> {
        self.pods.keys().cloned().collect()
    }

    /// Objects in submission order: configuration and storage before
    /// routing, routing before workloads.
    #[must_use]
    pub fn objects(&self) -> Vec<ClusterObject> {
        let mut objects = Vec::new();
        objects.extend(self.secrets.values().cloned().map(ClusterObject::Secret));
        objects.extend(self.config_maps.values().cloned().map(ClusterObject::ConfigMap));
        objects.extend(
            self.persistent_volume_claims
                .values()
                .cloned()
                .map(ClusterObject::PersistentVolumeClaim),
        );
        objects.extend(self.services.values().cloned().map(ClusterObject::Service));
        objects.extend(self.ingresses.values().cloned().map(ClusterObject::Ingress));
        objects.extend(self.routes.values().cloned().map(ClusterObject::Route));
        objects.extend(self.pods.values().map(PodData::to_cluster_object));
        objects
    }
}
