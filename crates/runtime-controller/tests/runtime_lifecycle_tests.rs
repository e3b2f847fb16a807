//! Start, stop, interrupt and recovery of runtimes against an in-memory cluster.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{config, environment, identity, orchestrator, subject, FakeCluster, PodBehavior, RecordingStore};
use runtime_controller::model::{warnings, VolumeConfig, LABEL_BROKER};
use runtime_controller::runtime::{InMemoryStateStore, RuntimeStateStore};
use runtime_controller::{Error, Result, RuntimeIdentity, RuntimeState, RuntimeStatus};

use runtime_controller::RuntimeStatus::{Failed, Running, Starting, Stopped, Stopping};

#[tokio::test]
async fn start_then_stop_walks_the_status_table() {
    let cluster = FakeCluster::new(PodBehavior::Ready);
    let store = Arc::new(RecordingStore::default());
    let orchestrator = orchestrator(cluster.clone(), store.clone(), &config());

    let running = orchestrator
        .start(&subject(), identity(), environment())
        .await
        .unwrap();
    assert_eq!(running.status, Running);
    assert!(running.machines["workspace/dev"].servers["ide"].starts_with("http://"));
    assert_eq!(cluster.objects_of("Pod").len(), 1);

    let stopped = orchestrator.stop(&identity()).await.unwrap();
    assert_eq!(stopped.status, Stopped);
    assert!(stopped
        .warnings
        .iter()
        .all(|w| w.code != warnings::STOP_GRACE_PERIOD_EXCEEDED));
    assert!(cluster.objects_of("Pod").is_empty());

    assert_eq!(store.history(), vec![Starting, Running, Stopping, Stopped]);
}

#[tokio::test]
async fn concurrent_starts_admit_exactly_one() {
    let cluster = FakeCluster::new(PodBehavior::Ready);
    let store = Arc::new(InMemoryStateStore::new());
    let orchestrator = orchestrator(cluster, store, &config());

    let (subject_a, subject_b) = (subject(), subject());
    let (first, second) = tokio::join!(
        orchestrator.start(&subject_a, identity(), environment()),
        orchestrator.start(&subject_b, identity(), environment())
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(e) if e.is_conflict())));

    let second_start = orchestrator
        .start(&subject(), identity(), environment())
        .await
        .unwrap_err();
    assert!(second_start.is_conflict());
}

#[tokio::test]
async fn stop_during_start_conflicts_until_interrupted() {
    let cluster = FakeCluster::new(PodBehavior::Hang);
    let store = Arc::new(RecordingStore::default());
    let orchestrator = orchestrator(cluster.clone(), store.clone(), &config());

    let start = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start(&subject(), identity(), environment()).await }
    });
    cluster.wait_for_pod().await;

    let err = orchestrator.stop(&identity()).await.unwrap_err();
    assert!(err.is_conflict());
    let current = orchestrator.status(&identity()).await.unwrap().unwrap();
    assert_eq!(current.status, Starting);

    assert!(orchestrator.interrupt(&identity()));
    let err = start.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("interrupted"));

    let failed = orchestrator.status(&identity()).await.unwrap().unwrap();
    assert_eq!(failed.status, Failed);
    assert!(cluster.objects_of("Pod").is_empty());

    // A FAILED runtime is reported as is
    let again = orchestrator.stop(&identity()).await.unwrap();
    assert_eq!(again.status, Failed);
    assert_eq!(store.history(), vec![Starting, Failed]);
}

#[tokio::test]
async fn silent_pods_time_out_into_failed() {
    let cluster = FakeCluster::new(PodBehavior::Hang);
    let store = Arc::new(RecordingStore::default());
    let mut config = config();
    config.timeouts.start_timeout_seconds = 1;
    let orchestrator = orchestrator(cluster.clone(), store.clone(), &config);

    let err = orchestrator
        .start(&subject(), identity(), environment())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let state = orchestrator.status(&identity()).await.unwrap().unwrap();
    assert_eq!(state.status, Failed);
    assert!(state.failure.is_some());
    assert!(cluster.objects_of("Pod").is_empty());
    assert!(cluster.deletions().contains(&identity().selector()));
    assert!(!store.history().contains(&Running));
}

#[tokio::test]
async fn acknowledged_failure_allows_a_new_start() {
    let cluster = FakeCluster::new(PodBehavior::Hang);
    let store = Arc::new(InMemoryStateStore::new());
    let mut config = config();
    config.timeouts.start_timeout_seconds = 1;
    let orchestrator = orchestrator(cluster, store, &config);

    orchestrator
        .start(&subject(), identity(), environment())
        .await
        .unwrap_err();

    orchestrator.acknowledge(&identity()).await.unwrap();
    assert!(orchestrator.status(&identity()).await.unwrap().is_none());

    let missing = orchestrator.stop(&identity()).await.unwrap_err();
    assert!(matches!(missing, Error::NotFound(_)));
}

#[tokio::test]
async fn failing_broker_storage_stops_before_deployment() {
    let cluster = FakeCluster::new(PodBehavior::Ready);
    cluster.fail_creation_of("PersistentVolumeClaim");
    let store = Arc::new(RecordingStore::default());
    let orchestrator = orchestrator(cluster.clone(), store.clone(), &config());

    let mut env = environment();
    env.plugins.push("example/terminal/1.0.0".to_string());
    if let Some(dev) = env.machines.get_mut("workspace/dev") {
        dev.volumes.insert(
            "projects".to_string(),
            VolumeConfig {
                path: "/projects".to_string(),
                ephemeral: false,
            },
        );
    }

    let err = orchestrator.start(&subject(), identity(), env).await.unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    // Neither the broker nor the workspace reached the cluster
    assert!(cluster.objects().is_empty());
    assert!(cluster
        .deletions()
        .contains(&format!("{LABEL_BROKER}=ws-1")));
    assert_eq!(store.history(), vec![Starting, Failed]);
}

#[tokio::test]
async fn recovery_settles_interrupted_transitions() {
    let cluster = FakeCluster::new(PodBehavior::Ready);
    let store = Arc::new(InMemoryStateStore::new());

    let starting = RuntimeState::starting(identity(), &environment());
    store.put_if_absent(starting).await.unwrap();

    let other = RuntimeIdentity::new("ws-2", "user-a", "default", "user-a-workspaces");
    let state = RuntimeState::starting(other.clone(), &environment());
    store.put_if_absent(state.clone()).await.unwrap();
    let running = state.with_status(Running);
    store.compare_and_set(Starting, running.clone()).await.unwrap();
    store
        .compare_and_set(Running, running.with_status(Stopping))
        .await
        .unwrap();

    let orchestrator = orchestrator(cluster, store.clone(), &config());
    assert_eq!(orchestrator.recover().await.unwrap(), 2);

    let failed = store.get(&identity()).await.unwrap().unwrap();
    assert_eq!(failed.status, Failed);
    assert!(failed
        .warnings
        .iter()
        .any(|w| w.code == warnings::START_INTERRUPTED_BY_RESTART));

    let stopped = store.get(&other).await.unwrap().unwrap();
    assert_eq!(stopped.status, Stopped);

    // Nothing left to settle
    assert_eq!(orchestrator.recover().await.unwrap(), 0);
}

/// Store whose write of the RUNNING status loses to a concurrent writer
#[derive(Default)]
struct RejectsRunning {
    inner: InMemoryStateStore,
}

#[async_trait]
impl RuntimeStateStore for RejectsRunning {
    async fn get(&self, identity: &RuntimeIdentity) -> Result<Option<RuntimeState>> {
        self.inner.get(identity).await
    }

    async fn list(&self) -> Result<Vec<RuntimeState>> {
        self.inner.list().await
    }

    async fn put_if_absent(&self, state: RuntimeState) -> Result<()> {
        self.inner.put_if_absent(state).await
    }

    async fn compare_and_set(&self, expected: RuntimeStatus, state: RuntimeState) -> Result<()> {
        if state.status == Running {
            return Err(Error::Conflict("resourceVersion changed".to_string()));
        }
        self.inner.compare_and_set(expected, state).await
    }

    async fn remove(&self, identity: &RuntimeIdentity) -> Result<()> {
        self.inner.remove(identity).await
    }
}

#[tokio::test]
async fn failed_running_write_rolls_the_start_back() {
    let cluster = FakeCluster::new(PodBehavior::Ready);
    let store = Arc::new(RejectsRunning::default());
    let orchestrator = orchestrator(cluster.clone(), store, &config());

    let err = orchestrator
        .start(&subject(), identity(), environment())
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let state = orchestrator.status(&identity()).await.unwrap().unwrap();
    assert_eq!(state.status, Failed);
    assert!(cluster.objects_of("Pod").is_empty());

    // The runtime is not stuck: it can be acknowledged and started again
    orchestrator.acknowledge(&identity()).await.unwrap();
}

#[tokio::test]
async fn provisioner_error_leaves_the_cluster_untouched() {
    let cluster = FakeCluster::new(PodBehavior::Ready);
    let store = Arc::new(RecordingStore::default());
    let mut config = config();
    config.workspace.api_endpoint = None;
    let orchestrator = orchestrator(cluster.clone(), store.clone(), &config);

    let mut env = environment();
    env.plugins.push("example/terminal/1.0.0".to_string());
    if let Some(dev) = env.machines.get_mut("workspace/dev") {
        dev.volumes.insert(
            "projects".to_string(),
            VolumeConfig {
                path: "/projects".to_string(),
                ephemeral: false,
            },
        );
    }

    orchestrator.start(&subject(), identity(), env).await.unwrap_err();

    assert!(cluster.objects().is_empty());
    assert_eq!(cluster.namespace_creates(), 0);
    assert_eq!(store.history(), vec![Starting, Failed]);
}

#[tokio::test]
async fn events_about_other_pods_do_not_fail_the_start() {
    let cluster = FakeCluster::new(PodBehavior::Hang);
    let orchestrator = orchestrator(cluster.clone(), Arc::new(InMemoryStateStore::new()), &config());

    let start = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start(&subject(), identity(), environment()).await }
    });
    cluster.wait_for_pod().await;

    // Another workspace's pod in the shared namespace cannot be scheduled
    cluster.emit_pod_event(
        &identity().infrastructure_namespace,
        "ws-2-workspace",
        "FailedScheduling",
        "0/3 nodes are available",
    );
    cluster.ready_pods();

    let running = start.await.unwrap().unwrap();
    assert_eq!(running.status, Running);
}

#[tokio::test]
async fn events_about_own_pods_fail_the_start() {
    let cluster = FakeCluster::new(PodBehavior::Hang);
    let orchestrator = orchestrator(cluster.clone(), Arc::new(InMemoryStateStore::new()), &config());

    let start = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start(&subject(), identity(), environment()).await }
    });
    cluster.wait_for_pod().await;

    let pod = cluster.objects_of("Pod")[0].name();
    cluster.emit_pod_event(
        &identity().infrastructure_namespace,
        &pod,
        "FailedScheduling",
        "0/3 nodes are available",
    );

    let err = start.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("FailedScheduling"));
    let state = orchestrator.status(&identity()).await.unwrap().unwrap();
    assert_eq!(state.status, Failed);
}
