//! [`ClusterClient`] backed by a live API server

use std::fmt::Debug;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::discovery::ApiResource;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{ClusterClient, EventStream, OwnedPods, RuntimeEvent};
use crate::config::InfrastructureKind;
use crate::error::{Error, Result};
use crate::model::ClusterObject;

fn project_api() -> ApiResource {
    ApiResource {
        group: "project.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "project.openshift.io/v1".to_string(),
        kind: "Project".to_string(),
        plural: "projects".to_string(),
    }
}

fn project_request_api() -> ApiResource {
    ApiResource {
        group: "project.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "project.openshift.io/v1".to_string(),
        kind: "ProjectRequest".to_string(),
        plural: "projectrequests".to_string(),
    }
}

fn group_api() -> ApiResource {
    ApiResource {
        group: "user.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "user.openshift.io/v1".to_string(),
        kind: "Group".to_string(),
        plural: "groups".to_string(),
    }
}

fn project_to_namespace(project: DynamicObject) -> Namespace {
    Namespace {
        metadata: project.metadata,
        ..Default::default()
    }
}

pub struct KubeClusterClient {
    client: Client,
    flavor: InfrastructureKind,
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client, flavor: InfrastructureKind) -> Self {
        Self { client, flavor }
    }

    async fn create_namespaced<K>(&self, namespace: &str, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), object).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(
                    kind = %K::kind(&()),
                    name = %object.name_any(),
                    "Object already exists, reusing it"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_labeled<K>(&self, namespace: &str, label_selector: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        for object in list.items {
            let name = object.name_any();
            match api.delete(&name, &DeleteParams::background()).await {
                Ok(_) => debug!(kind = %K::kind(&()), name = %name, "Deleted object"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        match self.flavor {
            InfrastructureKind::Kubernetes => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                Ok(api.get_opt(name).await?)
            }
            InfrastructureKind::OpenShift => {
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &project_api());
                Ok(api.get_opt(name).await?.map(project_to_namespace))
            }
        }
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let name = namespace.name_any();
        match self.flavor {
            InfrastructureKind::Kubernetes => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                Ok(api.create(&PostParams::default(), namespace).await?)
            }
            InfrastructureKind::OpenShift => {
                // Projects are requested, then labelled through the backing namespace
                let requests: Api<DynamicObject> =
                    Api::all_with(self.client.clone(), &project_request_api());
                let mut request = DynamicObject::new(&name, &project_request_api());
                request.data = json!({
                    "displayName": namespace
                        .annotations()
                        .get("openshift.io/display-name")
                        .cloned()
                        .unwrap_or_else(|| name.clone()),
                });
                requests.create(&PostParams::default(), &request).await?;

                let namespaces: Api<Namespace> = Api::all(self.client.clone());
                let patch = json!({
                    "metadata": {
                        "labels": namespace.labels(),
                        "annotations": namespace.annotations(),
                    }
                });
                let patched = namespaces
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(patched)
            }
        }
    }

    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>> {
        let params = ListParams::default().labels(label_selector);
        match self.flavor {
            InfrastructureKind::Kubernetes => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                Ok(api.list(&params).await?.items)
            }
            InfrastructureKind::OpenShift => {
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &project_api());
                Ok(api
                    .list(&params)
                    .await?
                    .items
                    .into_iter()
                    .map(project_to_namespace)
                    .collect())
            }
        }
    }

    async fn group_members(&self, group: &str) -> Result<Option<Vec<String>>> {
        if self.flavor == InfrastructureKind::Kubernetes {
            // Plain Kubernetes has no group objects to query
            return Ok(None);
        }
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &group_api());
        let Some(group) = api.get_opt(group).await? else {
            return Ok(None);
        };
        let users = group
            .data
            .get("users")
            .and_then(|u| u.as_array())
            .map(|users| {
                users
                    .iter()
                    .filter_map(|u| u.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(users))
    }

    async fn create_object(&self, namespace: &str, object: &ClusterObject) -> Result<()> {
        match object {
            ClusterObject::Secret(o) => self.create_namespaced(namespace, o).await,
            ClusterObject::ConfigMap(o) => self.create_namespaced(namespace, o).await,
            ClusterObject::PersistentVolumeClaim(o) => self.create_namespaced(namespace, o).await,
            ClusterObject::Service(o) => self.create_namespaced(namespace, o).await,
            ClusterObject::Ingress(o) => self.create_namespaced(namespace, o).await,
            ClusterObject::Route(o) => {
                if self.flavor == InfrastructureKind::Kubernetes {
                    return Err(Error::Internal(format!(
                        "Route '{}' cannot be created on plain Kubernetes",
                        o.name_any()
                    )));
                }
                self.create_namespaced(namespace, o).await
            }
            ClusterObject::Pod(o) => self.create_namespaced(namespace, o).await,
            ClusterObject::Deployment(o) => self.create_namespaced(namespace, o).await,
        }
    }

    async fn delete_objects(&self, namespace: &str, label_selector: &str) -> Result<()> {
        // Workloads first so nothing restarts against half-removed config
        self.delete_labeled::<Deployment>(namespace, label_selector).await?;
        self.delete_labeled::<Pod>(namespace, label_selector).await?;
        self.delete_labeled::<Service>(namespace, label_selector).await?;
        self.delete_labeled::<Ingress>(namespace, label_selector).await?;
        if self.flavor == InfrastructureKind::OpenShift {
            self.delete_labeled::<crate::model::Route>(namespace, label_selector)
                .await?;
        }
        self.delete_labeled::<ConfigMap>(namespace, label_selector).await?;
        self.delete_labeled::<Secret>(namespace, label_selector).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn watch(&self, namespace: &str, label_selector: &str) -> Result<EventStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod_updates = watcher(pods, watcher::Config::default().labels(label_selector))
            .filter_map(|event| async move {
                match event {
                    Ok(event) => Some(Watched::Pod(event)),
                    Err(e) => {
                        warn!(error = %e, "Pod watch error");
                        None
                    }
                }
            });

        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let cluster_events = watcher(
            events,
            watcher::Config::default().fields("involvedObject.kind=Pod"),
        )
        .filter_map(|event| async move {
            match event {
                Ok(event) => Some(Watched::Event(event)),
                Err(e) => {
                    warn!(error = %e, "Event watch error");
                    None
                }
            }
        });

        Ok(futures::stream::select(pod_updates, cluster_events)
            .scan(OwnedPods::new(), |owned, watched| {
                futures::future::ready(Some(track(owned, watched)))
            })
            .filter_map(futures::future::ready)
            .boxed())
    }
}

enum Watched {
    Pod(watcher::Event<Pod>),
    Event(watcher::Event<Event>),
}

fn track(owned: &mut OwnedPods, watched: Watched) -> Option<RuntimeEvent> {
    match watched {
        Watched::Pod(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod)) => {
            Some(owned.observe(&pod))
        }
        Watched::Pod(watcher::Event::Delete(pod)) => Some(owned.forget(&pod)),
        // Events already present when the watch starts belong to earlier runs
        Watched::Event(watcher::Event::Apply(event)) => owned.classify(&event),
        Watched::Pod(_) | Watched::Event(_) => None,
    }
}
