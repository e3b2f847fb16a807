//! Plugin broker: an ordered list of phases run by a single driver function.
//!
//! The driver stops at the first failing phase. Each phase runs inside its
//! own span.

pub mod component;
pub mod events;
pub mod phases;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info_span, instrument, warn, Instrument};

pub use component::{apply_components, parse_components, PluginComponent};
pub use events::{BrokerEvent, BrokerEvents, BrokerSubscription};
pub use phases::{DeployBroker, ParseResult, PrepareStorage, WaitBroker};

use crate::cluster::ClusterClient;
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::model::{KubernetesEnvironment, RuntimeIdentity, LABEL_BROKER};

/// State shared by the phases of one broker run
pub struct BrokerContext<'a> {
    pub identity: &'a RuntimeIdentity,
    pub env: &'a KubernetesEnvironment,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
    /// Handed to the broker pod; reports without it are refused
    pub report_token: String,
    /// Raw tooling list reported by the broker
    pub tooling: Option<serde_json::Value>,
    pub components: Vec<PluginComponent>,
}

impl<'a> BrokerContext<'a> {
    pub fn new(
        identity: &'a RuntimeIdentity,
        env: &'a KubernetesEnvironment,
        subscription: BrokerSubscription,
    ) -> Self {
        Self {
            identity,
            env,
            events: subscription.events,
            report_token: subscription.token,
            tooling: None,
            components: Vec::new(),
        }
    }
}

#[async_trait]
pub trait BrokerPhase: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut BrokerContext<'_>) -> Result<()>;
}

/// Run `phases` in order; no phase runs after the first failure
pub async fn run_phases(
    phases: &[Box<dyn BrokerPhase>],
    ctx: &mut BrokerContext<'_>,
) -> Result<Vec<PluginComponent>> {
    for phase in phases {
        let span = info_span!(
            "broker_phase",
            phase = phase.name(),
            workspace_id = %ctx.identity.workspace_id
        );
        if let Err(e) = phase.execute(ctx).instrument(span).await {
            error!(phase = phase.name(), error = %e, "Broker phase failed");
            return Err(e);
        }
    }
    Ok(std::mem::take(&mut ctx.components))
}

pub struct PluginBroker {
    cluster: Arc<dyn ClusterClient>,
    events: Arc<BrokerEvents>,
    phases: Vec<Box<dyn BrokerPhase>>,
}

impl PluginBroker {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        events: Arc<BrokerEvents>,
        config: &ControllerConfig,
    ) -> Self {
        let phases: Vec<Box<dyn BrokerPhase>> = vec![
            Box::new(PrepareStorage::new(
                cluster.clone(),
                config.storage.clone(),
                config.retry.clone(),
            )),
            Box::new(DeployBroker::new(cluster.clone(), config.broker.clone())),
            Box::new(WaitBroker::new(config.timeouts.broker_wait())),
            Box::new(ParseResult),
        ];
        Self {
            cluster,
            events,
            phases,
        }
    }

    /// Resolve the environment's plugins and add them as sidecars.
    ///
    /// Broker objects are removed whatever the outcome.
    #[instrument(skip_all, fields(workspace_id = %identity.workspace_id))]
    pub async fn run(&self, identity: &RuntimeIdentity, env: &mut KubernetesEnvironment) -> Result<()> {
        if env.plugins.is_empty() {
            return Ok(());
        }

        let subscription = self.events.subscribe(&identity.workspace_id);
        let result = {
            let mut ctx = BrokerContext::new(identity, env, subscription);
            run_phases(&self.phases, &mut ctx).await
        };
        self.events.unsubscribe(&identity.workspace_id);

        let selector = format!("{LABEL_BROKER}={}", identity.workspace_id);
        if let Err(e) = self
            .cluster
            .delete_objects(&identity.infrastructure_namespace, &selector)
            .await
        {
            warn!(error = %e, "Failed to remove plugin broker objects");
        }

        apply_components(env, result?)
    }
}
