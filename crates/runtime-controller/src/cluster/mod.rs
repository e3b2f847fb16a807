//! Narrow seam between the orchestration engine and the cluster API.
//!
//! The engine only needs a handful of operations; keeping them behind a
//! trait lets unit tests mock the cluster and integration tests run against
//! an in-memory fake.

mod events;
pub mod kube_client;

pub use events::{classify_event, classify_pod, logical_pod_name, OwnedPods, RuntimeEvent};
pub use kube_client::KubeClusterClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Namespace, Secret};

#[cfg(test)]
use mockall::automock;

use crate::error::Result;
use crate::model::ClusterObject;

/// Stream of readiness/failure/deletion events for one runtime
pub type EventStream = BoxStream<'static, RuntimeEvent>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a namespace (a Project on OpenShift), `None` when absent
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Create a namespace. Fails with `Error::Conflict` when it already exists.
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace>;

    /// List namespaces matching a label selector
    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>>;

    /// Members of a cluster group, `None` when the group does not exist
    async fn group_members(&self, group: &str) -> Result<Option<Vec<String>>>;

    /// Create an object; an already existing object counts as success
    async fn create_object(&self, namespace: &str, object: &ClusterObject) -> Result<()>;

    /// Get a secret, `None` when absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Delete every non-persistent object matching a label selector
    async fn delete_objects(&self, namespace: &str, label_selector: &str) -> Result<()>;

    /// Watch pods matching the selector plus cluster events about those pods
    async fn watch(&self, namespace: &str, label_selector: &str) -> Result<EventStream>;
}
