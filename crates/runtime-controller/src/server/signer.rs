//! Signing proxy sidecar wiring.
//!
//! Each pod with secured servers gets one proxy container. Every secured
//! server gets a listener on a port from the configured range that
//! forwards to the real server on localhost; external routing points at
//! the listener instead of the server.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, ResourceRequirements,
    Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::external::ExternalServerExposer;
use super::secure::SecureServerExposer;
use super::token::{PrivateKeyFile, SigningKey};
use super::{add_service_port, ServerTarget};
use crate::config::SignerProxySettings;
use crate::error::{Error, Result};
use crate::model::environment::split_machine_name;
use crate::model::{dns_label, KubernetesEnvironment, RuntimeIdentity};
use crate::provision::labels::runtime_labels;

pub const PROXY_CONTAINER_NAME: &str = "signer-proxy";
pub const PROXY_CONFIG_KEY: &str = "config.json";
/// Public key file in the Secret mounted into the proxy
pub const KEY_FILE_KEY: &str = "key.json";
/// Private key file in the Secret only the controller reads
pub const PRIVATE_KEY_FILE_KEY: &str = "private-key.json";
pub const CONFIG_MOUNT_PATH: &str = "/etc/signer-proxy";
pub const KEY_MOUNT_PATH: &str = "/etc/signer-proxy-key";
const CONFIG_VOLUME: &str = "signer-proxy-config";
const KEY_VOLUME: &str = "signer-proxy-key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyListener {
    pub machine: String,
    pub server: String,
    pub listen_port: i32,
    /// `http://127.0.0.1:<server port>`
    pub upstream: String,
    #[serde(default)]
    pub unsecured_paths: Vec<String>,
    #[serde(default)]
    pub cookies_auth_enabled: bool,
}

/// Configuration file read by the proxy sidecar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub workspace_id: String,
    #[serde(default)]
    pub listeners: Vec<ProxyListener>,
}

impl ProxyConfig {
    fn listener(&self, machine: &str, server: &str) -> Option<&ProxyListener> {
        self.listeners
            .iter()
            .find(|l| l.machine == machine && l.server == server)
    }
}

#[must_use]
pub fn config_map_name(identity: &RuntimeIdentity, pod: &str) -> String {
    dns_label(&format!("{}-{pod}-signer-proxy", identity.workspace_id))
}

#[must_use]
pub fn key_secret_name(identity: &RuntimeIdentity) -> String {
    dns_label(&format!("{}-signer-key", identity.workspace_id))
}

#[must_use]
pub fn private_key_secret_name(identity: &RuntimeIdentity) -> String {
    dns_label(&format!("{}-signer-private-key", identity.workspace_id))
}

/// Read the runtime's signing key back from its private key Secret
pub fn signing_key_from_secret(secret: &Secret) -> Result<SigningKey> {
    let stored = secret
        .data
        .as_ref()
        .and_then(|data| data.get(PRIVATE_KEY_FILE_KEY))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(PRIVATE_KEY_FILE_KEY))
                .cloned()
        })
        .ok_or_else(|| {
            Error::Internal(format!(
                "Secret '{}' has no {PRIVATE_KEY_FILE_KEY}",
                secret.metadata.name.as_deref().unwrap_or_default()
            ))
        })?;
    let file: PrivateKeyFile = serde_json::from_str(&stored)?;
    Ok(SigningKey::from_private_key_file(&file)?)
}

pub struct SignerProxyExposer {
    identity: RuntimeIdentity,
    settings: SignerProxySettings,
    key: SigningKey,
}

impl SignerProxyExposer {
    pub fn new(identity: RuntimeIdentity, settings: SignerProxySettings, key: SigningKey) -> Self {
        Self {
            identity,
            settings,
            key,
        }
    }

    fn read_config(env: &KubernetesEnvironment, name: &str) -> Result<Option<ProxyConfig>> {
        let Some(raw) = env
            .config_maps
            .get(name)
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(PROXY_CONFIG_KEY))
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(raw)?))
    }

    fn write_config(&self, env: &mut KubernetesEnvironment, name: &str, config: &ProxyConfig) -> Result<()> {
        let rendered = serde_json::to_string_pretty(config)?;
        env.config_maps.insert(
            name.to_string(),
            ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(runtime_labels(&self.identity)),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(PROXY_CONFIG_KEY.to_string(), rendered)])),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn key_secret(&self, name: &str, key: &str, content: String) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(runtime_labels(&self.identity)),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([(key.to_string(), content)])),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Public key Secret for the proxy and the private key Secret for token
    /// issuing. Returns the name of the public one.
    fn ensure_key_secrets(&self, env: &mut KubernetesEnvironment) -> Result<String> {
        let public = key_secret_name(&self.identity);
        if !env.secrets.contains_key(&public) {
            let key_file = serde_json::to_string(&self.key.public_key_file()?)?;
            let secret = self.key_secret(&public, KEY_FILE_KEY, key_file);
            env.secrets.insert(public.clone(), secret);
        }
        let private = private_key_secret_name(&self.identity);
        if !env.secrets.contains_key(&private) {
            let key_file = serde_json::to_string(&self.key.to_private_key_file())?;
            let secret = self.key_secret(&private, PRIVATE_KEY_FILE_KEY, key_file);
            env.secrets.insert(private, secret);
        }
        Ok(public)
    }

    /// First port of the range not used by a container, a declared server or a listener
    fn allocate_port(&self, env: &KubernetesEnvironment, pod: &str, config: &ProxyConfig) -> Result<i32> {
        let mut used: BTreeSet<i32> = config.listeners.iter().map(|l| l.listen_port).collect();
        if let Some(data) = env.pods.get(pod) {
            used.extend(
                data.spec
                    .containers
                    .iter()
                    .flat_map(|c| c.ports.iter().flatten())
                    .map(|p| p.container_port),
            );
        }
        used.extend(
            env.machines
                .iter()
                .filter(|(machine, _)| split_machine_name(machine).is_some_and(|(p, _)| p == pod))
                .flat_map(|(_, config)| config.servers.values())
                .filter_map(|s| s.port_number()),
        );

        (self.settings.port_range_start..=self.settings.port_range_end)
            .find(|port| !used.contains(port))
            .ok_or_else(|| {
                Error::Internal(format!(
                    "No free signer proxy port in range {}-{} for pod '{pod}'",
                    self.settings.port_range_start, self.settings.port_range_end
                ))
            })
    }

    fn ensure_proxy_container(
        &self,
        spec: &mut PodSpec,
        config_map: &str,
        secret: &str,
        listen_port: i32,
    ) {
        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        if !volumes.iter().any(|v| v.name == CONFIG_VOLUME) {
            volumes.push(Volume {
                name: CONFIG_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        if !volumes.iter().any(|v| v.name == KEY_VOLUME) {
            volumes.push(Volume {
                name: KEY_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        if !spec.containers.iter().any(|c| c.name == PROXY_CONTAINER_NAME) {
            spec.containers.push(Container {
                name: PROXY_CONTAINER_NAME.to_string(),
                image: Some(self.settings.image.clone()),
                args: Some(vec![
                    "--config".to_string(),
                    format!("{CONFIG_MOUNT_PATH}/{PROXY_CONFIG_KEY}"),
                    "--key".to_string(),
                    format!("{KEY_MOUNT_PATH}/{KEY_FILE_KEY}"),
                ]),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: CONFIG_VOLUME.to_string(),
                        mount_path: CONFIG_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: KEY_VOLUME.to_string(),
                        mount_path: KEY_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                ]),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([(
                        "memory".to_string(),
                        Quantity(self.settings.memory_limit.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        if let Some(proxy) = spec
            .containers
            .iter_mut()
            .find(|c| c.name == PROXY_CONTAINER_NAME)
        {
            let ports = proxy.ports.get_or_insert_with(Vec::new);
            if !ports.iter().any(|p| p.container_port == listen_port) {
                ports.push(ContainerPort {
                    container_port: listen_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                });
            }
        }
    }
}

impl SecureServerExposer for SignerProxyExposer {
    #[instrument(skip_all, fields(workspace_id = %self.identity.workspace_id, server = %target.server_id))]
    fn expose(
        &mut self,
        env: &mut KubernetesEnvironment,
        target: &ServerTarget<'_>,
        external: &ExternalServerExposer,
    ) -> Result<()> {
        let upstream_port = target.server.port_number().ok_or_else(|| {
            Error::Internal(format!(
                "Secure server '{}' has unparsable port '{}'",
                target.server_id, target.server.port
            ))
        })?;
        if !env.pods.contains_key(target.pod) {
            return Err(Error::NotFound(format!(
                "Pod '{}' of secure server '{}' is not part of the environment",
                target.pod, target.server_id
            )));
        }

        let config_map = config_map_name(&self.identity, target.pod);
        let mut config = Self::read_config(env, &config_map)?.unwrap_or_else(|| ProxyConfig {
            workspace_id: self.identity.workspace_id.clone(),
            listeners: Vec::new(),
        });
        let listen_port = match config.listener(target.machine, target.server_id) {
            Some(existing) => existing.listen_port,
            None => {
                let port = self.allocate_port(env, target.pod, &config)?;
                config.listeners.push(ProxyListener {
                    machine: target.machine.to_string(),
                    server: target.server_id.to_string(),
                    listen_port: port,
                    upstream: format!("http://127.0.0.1:{upstream_port}"),
                    unsecured_paths: target.server.unsecured_paths(),
                    cookies_auth_enabled: target.server.cookies_auth_enabled(),
                });
                port
            }
        };
        self.write_config(env, &config_map, &config)?;
        let secret = self.ensure_key_secrets(env)?;

        if let Some(pod) = env.pods.get_mut(target.pod) {
            self.ensure_proxy_container(&mut pod.spec, &config_map, &secret, listen_port);
        }
        if let Some(service) = env.services.get_mut(target.service) {
            add_service_port(service, &format!("proxy-{listen_port}"), listen_port, "TCP");
        }

        debug!(listen_port, upstream_port, "Routing secure server through signer proxy");
        external.expose(env, target, upstream_port, listen_port, true);
        Ok(())
    }
}
