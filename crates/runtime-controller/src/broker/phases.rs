//! The four broker phases

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use super::component::parse_components;
use super::events::BrokerEvent;
use super::{BrokerContext, BrokerPhase};
use crate::cluster::ClusterClient;
use crate::config::{BrokerConfig, StorageConfig};
use crate::error::{Error, Result};
use crate::model::{dns_label, ClusterObject, RuntimeIdentity, LABEL_BROKER};
use crate::provision::labels::runtime_labels;
use crate::provision::volumes::workspace_claims;
use crate::retry::{retry_with_backoff, RetryConfig};

const BROKER_CONFIG_KEY: &str = "config.json";
const BROKER_CONFIG_PATH: &str = "/broker-config";
/// Environment variable holding the token the broker signs its reports with
pub const REPORT_TOKEN_ENV: &str = "BROKER_REPORT_TOKEN";

fn broker_labels(identity: &RuntimeIdentity) -> BTreeMap<String, String> {
    let mut labels = runtime_labels(identity);
    labels.insert(LABEL_BROKER.to_string(), identity.workspace_id.clone());
    labels
}

/// Ensures the workspace claims exist so the broker can write to them
pub struct PrepareStorage {
    cluster: Arc<dyn ClusterClient>,
    storage: StorageConfig,
    retry: RetryConfig,
}

impl PrepareStorage {
    pub fn new(cluster: Arc<dyn ClusterClient>, storage: StorageConfig, retry: RetryConfig) -> Self {
        Self {
            cluster,
            storage,
            retry,
        }
    }
}

#[async_trait]
impl BrokerPhase for PrepareStorage {
    fn name(&self) -> &'static str {
        "prepare-storage"
    }

    async fn execute(&self, ctx: &mut BrokerContext<'_>) -> Result<()> {
        let namespace = &ctx.identity.infrastructure_namespace;
        for claim in workspace_claims(ctx.env, ctx.identity, &self.storage) {
            let object = ClusterObject::PersistentVolumeClaim(claim);
            debug!(claim = %object.name(), "Ensuring workspace claim");
            retry_with_backoff(&self.retry, "create_claim", || {
                self.cluster.create_object(namespace, &object)
            })
            .await?;
        }
        Ok(())
    }
}

/// Creates the broker configuration and pod
pub struct DeployBroker {
    cluster: Arc<dyn ClusterClient>,
    config: BrokerConfig,
}

impl DeployBroker {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: BrokerConfig) -> Self {
        Self { cluster, config }
    }

    fn objects(&self, ctx: &BrokerContext<'_>) -> Result<(ConfigMap, Pod)> {
        let ws = &ctx.identity.workspace_id;
        let labels = broker_labels(ctx.identity);
        let config_name = dns_label(&format!("{ws}-broker-config"));
        let pod_name = dns_label(&format!("{ws}-broker"));

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(config_name.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                BROKER_CONFIG_KEY.to_string(),
                serde_json::to_string(&ctx.env.plugins)?,
            )])),
            ..Default::default()
        };

        let mut args = vec![
            "--workspace-id".to_string(),
            ws.clone(),
            "--plugins".to_string(),
            format!("{BROKER_CONFIG_PATH}/{BROKER_CONFIG_KEY}"),
        ];
        if let Some(registry) = &self.config.registry_url {
            args.push("--registry-address".to_string());
            args.push(registry.clone());
        }
        if let Some(report_url) = &self.config.report_url {
            args.push("--report-url".to_string());
            args.push(format!("{}/broker/{ws}/events", report_url.trim_end_matches('/')));
        }

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(pod_name),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: "broker".to_string(),
                    image: Some(self.config.image.clone()),
                    args: Some(args),
                    env: Some(vec![EnvVar {
                        name: REPORT_TOKEN_ENV.to_string(),
                        value: Some(ctx.report_token.clone()),
                        ..Default::default()
                    }]),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "broker-config".to_string(),
                        mount_path: BROKER_CONFIG_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "broker-config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: config_name,
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        };
        Ok((config_map, pod))
    }
}

#[async_trait]
impl BrokerPhase for DeployBroker {
    fn name(&self) -> &'static str {
        "deploy-broker"
    }

    async fn execute(&self, ctx: &mut BrokerContext<'_>) -> Result<()> {
        let (config_map, pod) = self.objects(ctx)?;
        let namespace = &ctx.identity.infrastructure_namespace;
        self.cluster
            .create_object(namespace, &ClusterObject::ConfigMap(config_map))
            .await?;
        self.cluster
            .create_object(namespace, &ClusterObject::Pod(pod))
            .await?;
        info!(plugins = ctx.env.plugins.len(), "Plugin broker deployed");
        Ok(())
    }
}

/// Waits for the broker's completion report
pub struct WaitBroker {
    timeout: Duration,
}

impl WaitBroker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl BrokerPhase for WaitBroker {
    fn name(&self) -> &'static str {
        "wait-broker"
    }

    async fn execute(&self, ctx: &mut BrokerContext<'_>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, ctx.events.recv())
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "Plugin broker did not report within {}s",
                        self.timeout.as_secs()
                    ))
                })?;
            match event {
                Some(BrokerEvent::Started) => debug!("Plugin broker started"),
                Some(BrokerEvent::Done { tooling }) => {
                    ctx.tooling = Some(tooling);
                    return Ok(());
                }
                Some(BrokerEvent::Failed { error }) => {
                    return Err(Error::infrastructure(format!("Plugin broker failed: {error}")));
                }
                None => {
                    return Err(Error::Internal(
                        "Plugin broker event channel closed".to_string(),
                    ))
                }
            }
        }
    }
}

/// Turns the broker's tooling list into plugin components
pub struct ParseResult;

#[async_trait]
impl BrokerPhase for ParseResult {
    fn name(&self) -> &'static str {
        "parse-result"
    }

    async fn execute(&self, ctx: &mut BrokerContext<'_>) -> Result<()> {
        let tooling = ctx
            .tooling
            .take()
            .ok_or_else(|| Error::Internal("No broker result to parse".to_string()))?;
        ctx.components = parse_components(&tooling)?;
        debug!(components = ctx.components.len(), "Parsed broker result");
        Ok(())
    }
}
