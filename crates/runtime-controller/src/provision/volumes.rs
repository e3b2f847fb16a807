//! Volume wiring for machine volume requests

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::labels::runtime_labels;
use super::Provisioner;
use crate::config::{PvcStrategy, StorageConfig};
use crate::error::{Error, Result};
use crate::model::environment::split_machine_name;
use crate::model::{dns_label, KubernetesEnvironment, RuntimeIdentity, VolumeConfig};

/// Adds an `emptyDir` volume unless the pod already has a volume of that name
pub fn add_empty_dir_volume_if_absent(spec: &mut PodSpec, name: &str) {
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if volumes.iter().any(|v| v.name == name) {
        return;
    }
    volumes.push(Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
}

/// Adds a claim-backed volume, reusing an existing volume referencing the same claim.
/// Returns the pod volume name to mount.
pub fn add_claim_volume_if_absent(spec: &mut PodSpec, claim_name: &str) -> String {
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if let Some(existing) = volumes.iter().find(|v| {
        v.persistent_volume_claim
            .as_ref()
            .is_some_and(|pvc| pvc.claim_name == claim_name)
    }) {
        return existing.name.clone();
    }
    volumes.push(Volume {
        name: claim_name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: None,
        }),
        ..Default::default()
    });
    claim_name.to_string()
}

fn add_mount(spec: &mut PodSpec, container: &str, mount: VolumeMount) -> Result<()> {
    let target = spec
        .containers
        .iter_mut()
        .chain(spec.init_containers.iter_mut().flatten())
        .find(|c| c.name == container)
        .ok_or_else(|| Error::Internal(format!("Container '{container}' not found")))?;
    let mounts = target.volume_mounts.get_or_insert_with(Vec::new);
    // Re-applying the same request leaves a single mount
    if !mounts
        .iter()
        .any(|m| m.name == mount.name && m.mount_path == mount.mount_path)
    {
        mounts.push(mount);
    }
    Ok(())
}

/// Claim name backing `volume` for a workspace
#[must_use]
pub fn claim_name(storage: &StorageConfig, identity: &RuntimeIdentity, volume: &str) -> String {
    match storage.strategy {
        PvcStrategy::Common => storage.common_claim_name.clone(),
        PvcStrategy::PerWorkspace => dns_label(&format!("claim-{}-{volume}", identity.workspace_id)),
    }
}

fn claim(
    name: &str,
    storage: &StorageConfig,
    labels: Option<BTreeMap<String, String>>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels,
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![storage.access_mode.clone()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.claim_size.clone()),
                )])),
                limits: None,
            }),
            storage_class_name: storage.storage_class_name.clone(),
            ..Default::default()
        }),
        status: None,
    }
}

/// Every claim the persistent volumes of `env` need.
///
/// The common claim is shared by all workspaces of a namespace and carries
/// no runtime labels, so stopping one workspace never removes it.
#[must_use]
pub fn workspace_claims(
    env: &KubernetesEnvironment,
    identity: &RuntimeIdentity,
    storage: &StorageConfig,
) -> Vec<PersistentVolumeClaim> {
    let mut claims = BTreeMap::new();
    for machine in env.machines.values() {
        for (volume, config) in &machine.volumes {
            if config.ephemeral {
                continue;
            }
            let name = claim_name(storage, identity, volume);
            let labels = match storage.strategy {
                PvcStrategy::Common => None,
                PvcStrategy::PerWorkspace => Some(runtime_labels(identity)),
            };
            claims
                .entry(name.clone())
                .or_insert_with(|| claim(&name, storage, labels));
        }
    }
    claims.into_values().collect()
}

pub struct VolumesProvisioner {
    storage: StorageConfig,
}

impl VolumesProvisioner {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }
}

impl Provisioner for VolumesProvisioner {
    fn name(&self) -> &'static str {
        "volumes"
    }

    fn provision(&self, env: &mut KubernetesEnvironment, identity: &RuntimeIdentity) -> Result<()> {
        let requests: Vec<(String, String, VolumeConfig)> = env
            .machines
            .iter()
            .flat_map(|(machine, config)| {
                config
                    .volumes
                    .iter()
                    .map(move |(volume, request)| (machine.clone(), volume.clone(), request.clone()))
            })
            .collect();

        for (machine, volume, request) in requests {
            let (pod_name, container) = split_machine_name(&machine).ok_or_else(|| {
                Error::Internal(format!("Machine name '{machine}' is not '<pod>/<container>'"))
            })?;
            let pod = env.pods.get_mut(pod_name).ok_or_else(|| {
                Error::Internal(format!("Machine '{machine}' references unknown pod '{pod_name}'"))
            })?;

            let mount = if request.ephemeral {
                let name = dns_label(&volume);
                add_empty_dir_volume_if_absent(&mut pod.spec, &name);
                VolumeMount {
                    name,
                    mount_path: request.path.clone(),
                    ..Default::default()
                }
            } else {
                let claim = claim_name(&self.storage, identity, &volume);
                let name = add_claim_volume_if_absent(&mut pod.spec, &claim);
                let sub_path = match self.storage.strategy {
                    PvcStrategy::Common => Some(format!("{}/{volume}", identity.workspace_id)),
                    PvcStrategy::PerWorkspace => None,
                };
                VolumeMount {
                    name,
                    mount_path: request.path.clone(),
                    sub_path,
                    ..Default::default()
                }
            };
            add_mount(&mut pod.spec, container, mount)?;
        }

        for claim in workspace_claims(env, identity, &self.storage) {
            let name = claim.metadata.name.clone().unwrap_or_default();
            env.persistent_volume_claims.entry(name).or_insert(claim);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MachineConfig, PodData};
    use k8s_openapi::api::core::v1::Container;

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity::new("ws-1", "user-a", "default", "user-a-workspaces")
    }

    fn env(volumes: &[(&str, &str, bool)]) -> KubernetesEnvironment {
        let mut env = KubernetesEnvironment::default();
        env.add_pod(PodData::new(
            "workspace",
            PodSpec {
                containers: vec![Container {
                    name: "dev".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        ));
        let mut machine = MachineConfig::default();
        for (name, path, ephemeral) in volumes {
            machine.volumes.insert(
                (*name).to_string(),
                VolumeConfig {
                    path: (*path).to_string(),
                    ephemeral: *ephemeral,
                },
            );
        }
        env.machines.insert("workspace/dev".to_string(), machine);
        env
    }

    #[test]
    fn empty_dir_is_added_once_per_name() {
        let mut spec = PodSpec::default();
        add_empty_dir_volume_if_absent(&mut spec, "cache");
        add_empty_dir_volume_if_absent(&mut spec, "cache");
        add_empty_dir_volume_if_absent(&mut spec, "tmp");

        let names: Vec<_> = spec.volumes.unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["cache", "tmp"]);
    }

    #[test]
    fn common_strategy_shares_one_claim_with_sub_paths() {
        let mut env = env(&[("projects", "/projects", false), ("m2", "/home/user/.m2", false)]);
        VolumesProvisioner::new(StorageConfig::default())
            .provision(&mut env, &identity())
            .unwrap();

        let spec = &env.pods["workspace"].spec;
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 1);
        let mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
        let sub_paths: Vec<_> = mounts.iter().filter_map(|m| m.sub_path.clone()).collect();
        assert_eq!(sub_paths, vec!["ws-1/m2", "ws-1/projects"]);

        let claim = &env.persistent_volume_claims["claim-workspaces"];
        assert!(claim.metadata.labels.is_none());
    }

    #[test]
    fn per_workspace_strategy_creates_labelled_claims() {
        let mut env = env(&[("projects", "/projects", false)]);
        let storage = StorageConfig {
            strategy: PvcStrategy::PerWorkspace,
            ..Default::default()
        };
        VolumesProvisioner::new(storage).provision(&mut env, &identity()).unwrap();

        let claim = &env.persistent_volume_claims["claim-ws-1-projects"];
        assert!(claim.metadata.labels.as_ref().unwrap().contains_key(crate::model::LABEL_WORKSPACE_ID));
    }

    #[test]
    fn provisioning_twice_adds_no_duplicates() {
        let mut env = env(&[("cache", "/cache", true), ("projects", "/projects", false)]);
        let provisioner = VolumesProvisioner::new(StorageConfig::default());
        provisioner.provision(&mut env, &identity()).unwrap();
        let once = env.pods["workspace"].spec.clone();
        provisioner.provision(&mut env, &identity()).unwrap();

        assert_eq!(env.pods["workspace"].spec, once);
        assert_eq!(once.volumes.as_ref().unwrap().len(), 2);
        assert_eq!(once.containers[0].volume_mounts.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn unknown_pod_is_an_internal_error() {
        let mut env = env(&[("cache", "/cache", true)]);
        env.pods.clear();
        let result = VolumesProvisioner::new(StorageConfig::default()).provision(&mut env, &identity());
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
