//! In-memory cluster and state store shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{
    Container, Event, Namespace, ObjectReference, Pod, PodCondition, PodSpec, PodStatus, Secret,
};
use kube::ResourceExt;
use runtime_controller::broker::BrokerEvents;
use runtime_controller::cluster::{ClusterClient, EventStream, OwnedPods};
use runtime_controller::config::ControllerConfig;
use runtime_controller::driver;
use runtime_controller::model::machine::ATTR_SECURE;
use runtime_controller::model::{ClusterObject, MachineConfig, PodData, ServerConfig};
use runtime_controller::retry::RetryConfig;
use runtime_controller::runtime::{InMemoryStateStore, RuntimeStateStore};
use runtime_controller::{
    Error, KubernetesEnvironment, Result, RuntimeIdentity, RuntimeOrchestrator, RuntimeState,
    RuntimeStatus, Subject,
};
use tokio::sync::{broadcast, Notify};

// =============================================================================
// Fake cluster
// =============================================================================

/// Raw watch traffic of the fake, filtered per watch like the real client does
#[derive(Debug, Clone)]
enum Feed {
    Applied(String, Pod),
    Deleted(String, Pod),
    Event(String, Event),
}

/// What submitted pods do once created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodBehavior {
    /// Report pending, then ready
    Ready,
    /// Stay silent
    Hang,
}

pub struct FakeCluster {
    namespaces: Mutex<BTreeMap<String, Namespace>>,
    namespace_creates: AtomicUsize,
    objects: Mutex<Vec<(String, ClusterObject)>>,
    deletions: Mutex<Vec<String>>,
    failing_kind: Mutex<Option<&'static str>>,
    behavior: Mutex<PodBehavior>,
    events: broadcast::Sender<Feed>,
    pod_created: Notify,
}

impl FakeCluster {
    pub fn new(behavior: PodBehavior) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            namespaces: Mutex::new(BTreeMap::new()),
            namespace_creates: AtomicUsize::new(0),
            objects: Mutex::new(Vec::new()),
            deletions: Mutex::new(Vec::new()),
            failing_kind: Mutex::new(None),
            behavior: Mutex::new(behavior),
            events,
            pod_created: Notify::new(),
        })
    }

    /// Reject every creation of `kind` with Forbidden
    pub fn fail_creation_of(&self, kind: &'static str) {
        *self.failing_kind.lock().unwrap() = Some(kind);
    }

    pub fn namespace_creates(&self) -> usize {
        self.namespace_creates.load(Ordering::SeqCst)
    }

    /// Every object currently present, in creation order
    pub fn objects(&self) -> Vec<ClusterObject> {
        self.objects.lock().unwrap().iter().map(|(_, o)| o.clone()).collect()
    }

    pub fn objects_of(&self, kind: &str) -> Vec<ClusterObject> {
        self.objects().into_iter().filter(|o| o.kind() == kind).collect()
    }

    pub fn deletions(&self) -> Vec<String> {
        self.deletions.lock().unwrap().clone()
    }

    /// Resolves once a pod has been submitted
    pub async fn wait_for_pod(&self) {
        self.pod_created.notified().await;
    }

    /// Report every submitted pod as ready
    pub fn ready_pods(&self) {
        let pods: Vec<(String, Pod)> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(ns, o)| match o {
                ClusterObject::Pod(pod) => Some((ns.clone(), pod.clone())),
                _ => None,
            })
            .collect();
        for (ns, pod) in pods {
            self.emit(Feed::Applied(ns, ready(pod)));
        }
    }

    /// Warning event about the pod object `pod` in `namespace`
    pub fn emit_pod_event(&self, namespace: &str, pod: &str, reason: &str, message: &str) {
        let event = Event {
            involved_object: ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some("Warning".to_string()),
            ..Default::default()
        };
        self.emit(Feed::Event(namespace.to_string(), event));
    }

    fn emit(&self, feed: Feed) {
        // No receiver just means nobody watches right now
        let _ = self.events.send(feed);
    }
}

fn ready(mut pod: Pod) -> Pod {
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

fn labels_of(object: &ClusterObject) -> BTreeMap<String, String> {
    match object {
        ClusterObject::Secret(o) => o.labels().clone(),
        ClusterObject::ConfigMap(o) => o.labels().clone(),
        ClusterObject::PersistentVolumeClaim(o) => o.labels().clone(),
        ClusterObject::Service(o) => o.labels().clone(),
        ClusterObject::Ingress(o) => o.labels().clone(),
        ClusterObject::Route(o) => o.labels().clone(),
        ClusterObject::Pod(o) => o.labels().clone(),
        ClusterObject::Deployment(o) => o.labels().clone(),
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector.split(',').all(|term| match term.split_once('=') {
        Some((key, value)) => labels.get(key.trim()).is_some_and(|v| v == value.trim()),
        None => false,
    })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        // Let concurrent provisions interleave between read and create
        tokio::task::yield_now().await;
        Ok(self.namespaces.lock().unwrap().get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let name = namespace.name_any();
        let mut namespaces = self.namespaces.lock().unwrap();
        if namespaces.contains_key(&name) {
            return Err(Error::Conflict(format!("namespaces \"{name}\" already exists")));
        }
        namespaces.insert(name, namespace.clone());
        self.namespace_creates.fetch_add(1, Ordering::SeqCst);
        Ok(namespace.clone())
    }

    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<Namespace>> {
        Ok(self
            .namespaces
            .lock()
            .unwrap()
            .values()
            .filter(|ns| matches_selector(ns.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn group_members(&self, _group: &str) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    async fn create_object(&self, namespace: &str, object: &ClusterObject) -> Result<()> {
        if *self.failing_kind.lock().unwrap() == Some(object.kind()) {
            return Err(Error::Forbidden(format!(
                "{} \"{}\" is forbidden",
                object.kind(),
                object.name()
            )));
        }
        {
            let mut objects = self.objects.lock().unwrap();
            if objects
                .iter()
                .any(|(ns, o)| ns == namespace && o.kind() == object.kind() && o.name() == object.name())
            {
                return Ok(());
            }
            objects.push((namespace.to_string(), object.clone()));
        }

        if let ClusterObject::Pod(pod) = object {
            self.emit(Feed::Applied(namespace.to_string(), pod.clone()));
            if *self.behavior.lock().unwrap() == PodBehavior::Ready {
                self.emit(Feed::Applied(namespace.to_string(), ready(pod.clone())));
            }
            self.pod_created.notify_one();
        }
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.objects.lock().unwrap().iter().find_map(|(ns, o)| match o {
            ClusterObject::Secret(secret) if ns == namespace && secret.name_any() == name => {
                Some(secret.clone())
            }
            _ => None,
        }))
    }

    async fn delete_objects(&self, namespace: &str, label_selector: &str) -> Result<()> {
        self.deletions.lock().unwrap().push(label_selector.to_string());
        let removed: Vec<ClusterObject> = {
            let mut objects = self.objects.lock().unwrap();
            let (removed, kept): (Vec<_>, Vec<_>) = objects.drain(..).partition(|(ns, o)| {
                ns == namespace
                    && !matches!(o, ClusterObject::PersistentVolumeClaim(_))
                    && matches_selector(&labels_of(o), label_selector)
            });
            *objects = kept;
            removed.into_iter().map(|(_, o)| o).collect()
        };
        for object in removed {
            if let ClusterObject::Pod(pod) = object {
                self.emit(Feed::Deleted(namespace.to_string(), pod));
            }
        }
        Ok(())
    }

    async fn watch(&self, namespace: &str, label_selector: &str) -> Result<EventStream> {
        let rx = self.events.subscribe();
        let namespace = namespace.to_string();
        let selector = label_selector.to_string();
        let feed = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(feed) => return Some((feed, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(feed
            .scan(OwnedPods::new(), move |owned, feed| {
                let selected =
                    |ns: &str, pod: &Pod| ns == namespace && matches_selector(pod.labels(), &selector);
                let event = match feed {
                    Feed::Applied(ns, pod) if selected(&ns, &pod) => Some(owned.observe(&pod)),
                    Feed::Deleted(ns, pod) if selected(&ns, &pod) => Some(owned.forget(&pod)),
                    // Cluster events are namespace wide
                    Feed::Event(ns, event) if ns == namespace => owned.classify(&event),
                    _ => None,
                };
                futures::future::ready(Some(event))
            })
            .filter_map(futures::future::ready)
            .boxed())
    }
}

// =============================================================================
// Recording state store
// =============================================================================

/// In-memory store that remembers every status it accepted
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryStateStore,
    history: Mutex<Vec<RuntimeStatus>>,
}

impl RecordingStore {
    pub fn history(&self) -> Vec<RuntimeStatus> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuntimeStateStore for RecordingStore {
    async fn get(&self, identity: &RuntimeIdentity) -> Result<Option<RuntimeState>> {
        self.inner.get(identity).await
    }

    async fn list(&self) -> Result<Vec<RuntimeState>> {
        self.inner.list().await
    }

    async fn put_if_absent(&self, state: RuntimeState) -> Result<()> {
        let status = state.status;
        self.inner.put_if_absent(state).await?;
        self.history.lock().unwrap().push(status);
        Ok(())
    }

    async fn compare_and_set(&self, expected: RuntimeStatus, state: RuntimeState) -> Result<()> {
        let status = state.status;
        self.inner.compare_and_set(expected, state).await?;
        let mut history = self.history.lock().unwrap();
        if history.last() != Some(&status) {
            history.push(status);
        }
        Ok(())
    }

    async fn remove(&self, identity: &RuntimeIdentity) -> Result<()> {
        self.inner.remove(identity).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Owner of [`identity`]
pub fn subject() -> Subject {
    Subject::new("user-a", "user-a")
}

pub fn identity() -> RuntimeIdentity {
    RuntimeIdentity::new("ws-1", "user-a", "default", "user-a-workspaces")
}

pub fn config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.workspace.api_endpoint = Some("https://workspaces.example.com/api".to_string());
    config.timeouts.start_timeout_seconds = 10;
    config.timeouts.stop_grace_seconds = 2;
    config.timeouts.broker_wait_seconds = 2;
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_delay_ms: 1,
        max_delay_ms: 5,
    };
    config
}

/// One pod `workspace` with a `dev` container serving a secured IDE on 3100
pub fn environment() -> KubernetesEnvironment {
    let mut env = KubernetesEnvironment::default();
    env.add_pod(PodData::new(
        "workspace",
        PodSpec {
            containers: vec![Container {
                name: "dev".to_string(),
                image: Some("quay.io/example/dev:latest".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        },
    ));
    env.machines.insert(
        "workspace/dev".to_string(),
        MachineConfig {
            servers: BTreeMap::from([(
                "ide".to_string(),
                ServerConfig::new("3100/tcp", "http").with_attribute(ATTR_SECURE, "true"),
            )]),
            ..Default::default()
        },
    );
    env
}

pub fn orchestrator(
    cluster: Arc<FakeCluster>,
    store: Arc<dyn RuntimeStateStore>,
    config: &ControllerConfig,
) -> Arc<RuntimeOrchestrator> {
    let cluster: Arc<dyn ClusterClient> = cluster;
    let driver = driver::from_config(config, cluster.clone());
    Arc::new(RuntimeOrchestrator::new(
        config,
        cluster,
        driver,
        store,
        Arc::new(BrokerEvents::new()),
    ))
}
