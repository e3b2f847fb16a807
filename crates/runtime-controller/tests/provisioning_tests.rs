//! Provisioner pipeline applied more than once to the same environment.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{config, environment, identity, FakeCluster, PodBehavior};
use k8s_openapi::api::core::v1::Container;
use runtime_controller::cluster::ClusterClient;
use runtime_controller::driver;
use runtime_controller::model::{warnings, MachineConfig, VolumeConfig};
use runtime_controller::provision::ProvisionerPipeline;
use runtime_controller::server::signer::PROXY_CONTAINER_NAME;
use runtime_controller::KubernetesEnvironment;

fn pipeline() -> ProvisionerPipeline {
    let cluster: Arc<dyn ClusterClient> = FakeCluster::new(PodBehavior::Ready);
    let config = config();
    ProvisionerPipeline::new(&config, driver::from_config(&config, cluster))
}

fn provision_twice(env: &mut KubernetesEnvironment) {
    let pipeline = pipeline();
    pipeline.provision(env, &identity()).unwrap();
    pipeline.provision(env, &identity()).unwrap();
}

#[test]
fn restart_policy_rewrite_is_idempotent() {
    let mut env = environment();
    if let Some(pod) = env.pods.get_mut("workspace") {
        pod.spec.restart_policy = Some("Always".to_string());
    }

    provision_twice(&mut env);

    assert_eq!(env.pods["workspace"].spec.restart_policy.as_deref(), Some("Never"));
    let rewrites = env
        .warnings()
        .iter()
        .filter(|w| w.code == warnings::RESTART_POLICY_REWRITTEN)
        .count();
    assert_eq!(rewrites, 1);
}

#[test]
fn shared_ephemeral_volume_is_declared_once() {
    let mut env = environment();
    if let Some(pod) = env.pods.get_mut("workspace") {
        pod.spec.containers.push(Container {
            name: "tools".to_string(),
            image: Some("quay.io/example/tools:latest".to_string()),
            ..Default::default()
        });
    }
    let cache = VolumeConfig {
        path: "/cache".to_string(),
        ephemeral: true,
    };
    if let Some(dev) = env.machines.get_mut("workspace/dev") {
        dev.volumes.insert("cache".to_string(), cache.clone());
    }
    env.machines.insert(
        "workspace/tools".to_string(),
        MachineConfig {
            volumes: BTreeMap::from([("cache".to_string(), cache)]),
            ..Default::default()
        },
    );

    provision_twice(&mut env);

    let spec = &env.pods["workspace"].spec;
    let cache_volumes = spec
        .volumes
        .iter()
        .flatten()
        .filter(|v| v.name == "cache")
        .count();
    assert_eq!(cache_volumes, 1);
    for name in ["dev", "tools"] {
        let container = spec.containers.iter().find(|c| c.name == name).unwrap();
        let mounts = container
            .volume_mounts
            .iter()
            .flatten()
            .filter(|m| m.name == "cache")
            .count();
        assert_eq!(mounts, 1, "container {name}");
    }
    assert!(env.persistent_volume_claims.is_empty());
}

#[test]
fn secure_server_gets_a_single_proxy_across_runs() {
    let mut env = environment();

    provision_twice(&mut env);

    let proxies = env.pods["workspace"]
        .spec
        .containers
        .iter()
        .filter(|c| c.name == PROXY_CONTAINER_NAME)
        .count();
    assert_eq!(proxies, 1);
    assert_eq!(env.ingresses.len(), 1);
    assert_eq!(env.secrets.len(), 1);
    assert_eq!(env.exposed_servers.len(), 1);
    assert_eq!(env.exposed_servers[0].exposed_port, 4400);
}

#[test]
fn missing_api_endpoint_aborts_provisioning() {
    let cluster: Arc<dyn ClusterClient> = FakeCluster::new(PodBehavior::Ready);
    let mut config = config();
    config.workspace.api_endpoint = None;
    let pipeline = ProvisionerPipeline::new(&config, driver::from_config(&config, cluster));

    let mut env = environment();
    assert!(pipeline.provision(&mut env, &identity()).is_err());
}
