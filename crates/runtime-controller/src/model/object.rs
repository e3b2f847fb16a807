//! Cluster objects as submitted to the API server

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use super::route::Route;

#[derive(Debug, Clone)]
pub enum ClusterObject {
    Secret(Secret),
    ConfigMap(ConfigMap),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Service(Service),
    Ingress(Ingress),
    Route(Route),
    Pod(Pod),
    Deployment(Deployment),
}

impl ClusterObject {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Secret(_) => "Secret",
            Self::ConfigMap(_) => "ConfigMap",
            Self::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
            Self::Service(_) => "Service",
            Self::Ingress(_) => "Ingress",
            Self::Route(_) => "Route",
            Self::Pod(_) => "Pod",
            Self::Deployment(_) => "Deployment",
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Secret(o) => o.name_any(),
            Self::ConfigMap(o) => o.name_any(),
            Self::PersistentVolumeClaim(o) => o.name_any(),
            Self::Service(o) => o.name_any(),
            Self::Ingress(o) => o.name_any(),
            Self::Route(o) => o.name_any(),
            Self::Pod(o) => o.name_any(),
            Self::Deployment(o) => o.name_any(),
        }
    }

    /// Pods and deployments are watched for readiness
    #[must_use]
    pub fn is_workload(&self) -> bool {
        matches!(self, Self::Pod(_) | Self::Deployment(_))
    }
}
