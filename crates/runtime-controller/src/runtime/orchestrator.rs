//! Start, stop and recovery of workspace runtimes.
//!
//! Every status change goes through a compare-and-set on the state cache.
//! A failed start always ends in FAILED with the objects it created rolled
//! back best-effort.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::cache::RuntimeStateStore;
use super::state::{RuntimeState, RuntimeStatus};
use super::synchronizer::{await_deletion, await_readiness, StartSynchronizer};
use crate::broker::{BrokerEvents, PluginBroker};
use crate::cluster::ClusterClient;
use crate::config::ControllerConfig;
use crate::driver::InfrastructureDriver;
use crate::error::{Error, Result};
use crate::model::environment::split_machine_name;
use crate::model::{warnings, KubernetesEnvironment, RuntimeIdentity, Subject, Warning};
use crate::namespace::{NamespaceManager, NamespaceResolutionContext};
use crate::provision::ProvisionerPipeline;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::server::signer;
use crate::server::token::AccessToken;

pub struct RuntimeOrchestrator {
    cluster: Arc<dyn ClusterClient>,
    namespaces: NamespaceManager,
    broker: PluginBroker,
    pipeline: ProvisionerPipeline,
    store: Arc<dyn RuntimeStateStore>,
    synchronizer: Arc<StartSynchronizer>,
    retry: RetryConfig,
    start_timeout: Duration,
    stop_grace: Duration,
    token_ttl: chrono::Duration,
}

impl RuntimeOrchestrator {
    pub fn new(
        config: &ControllerConfig,
        cluster: Arc<dyn ClusterClient>,
        driver: Arc<dyn InfrastructureDriver>,
        store: Arc<dyn RuntimeStateStore>,
        broker_events: Arc<BrokerEvents>,
    ) -> Self {
        Self {
            namespaces: NamespaceManager::new(cluster.clone(), driver.clone(), config),
            broker: PluginBroker::new(cluster.clone(), broker_events, config),
            pipeline: ProvisionerPipeline::new(config, driver),
            cluster,
            store,
            synchronizer: Arc::new(StartSynchronizer::new()),
            retry: config.retry.clone(),
            start_timeout: config.timeouts.start_timeout(),
            stop_grace: config.timeouts.stop_grace(),
            token_ttl: config.signer_proxy.token_ttl(),
        }
    }

    /// Start a runtime and wait until every pod is ready.
    ///
    /// Returns the RUNNING state. On failure the runtime is left FAILED and
    /// the start error is returned.
    #[instrument(skip_all, fields(workspace_id = %identity.workspace_id))]
    pub async fn start(
        &self,
        subject: &Subject,
        identity: RuntimeIdentity,
        env: KubernetesEnvironment,
    ) -> Result<RuntimeState> {
        let guard = self.synchronizer.begin(&identity)?;

        if let Some(existing) = self.store.get(&identity).await? {
            if !existing.status.is_terminal() {
                return Err(Error::Conflict(format!(
                    "Runtime {identity} is {}",
                    existing.status
                )));
            }
            // Previous outcome was never acknowledged
            self.store.remove(&identity).await?;
        }
        self.store
            .put_if_absent(RuntimeState::starting(identity.clone(), &env))
            .await?;
        info!(namespace = %identity.infrastructure_namespace, "Starting runtime");

        let outcome = match self.run_start(subject, &identity, env, guard.token()).await {
            Ok(state) => {
                let running = state.with_status(RuntimeStatus::Running);
                self.store
                    .compare_and_set(RuntimeStatus::Starting, running.clone())
                    .await
                    .map(|()| running)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(running) => {
                info!("Runtime running");
                Ok(running)
            }
            Err(e) => {
                warn!(error = %e, "Runtime start failed, rolling back");
                self.rollback(&identity).await;
                self.record_failure(&identity, &e.to_string(), None).await;
                Err(e)
            }
        }
    }

    async fn run_start(
        &self,
        subject: &Subject,
        identity: &RuntimeIdentity,
        mut env: KubernetesEnvironment,
        cancel: &CancellationToken,
    ) -> Result<RuntimeState> {
        // Provisioner errors surface before anything is written to the cluster
        self.pipeline.check(&env, identity)?;

        let ctx = NamespaceResolutionContext::new(subject.clone()).with_workspace(&identity.workspace_id);
        let namespace = self.namespaces.provision(&ctx).await?;
        if namespace.name != identity.infrastructure_namespace {
            return Err(Error::Internal(format!(
                "Runtime targets namespace '{}' but '{}' was provisioned",
                identity.infrastructure_namespace, namespace.name
            )));
        }

        self.broker.run(identity, &mut env).await?;
        self.pipeline.provision(&mut env, identity)?;

        let state = RuntimeState::starting(identity.clone(), &env);
        self.store
            .compare_and_set(RuntimeStatus::Starting, state.clone())
            .await?;

        // Last point where an interrupt avoids touching the cluster
        if cancel.is_cancelled() {
            return Err(Error::infrastructure("Start interrupted"));
        }

        let ns = identity.infrastructure_namespace.as_str();
        // Watch first so no readiness event is missed
        let events = self.cluster.watch(ns, &identity.selector()).await?;
        for object in env.objects() {
            retry_with_backoff(&self.retry, "create_object", || {
                self.cluster.create_object(ns, &object)
            })
            .await?;
        }

        let workloads: BTreeSet<String> = env.workload_names().into_iter().collect();
        await_readiness(events, workloads, self.start_timeout, cancel).await?;
        Ok(state)
    }

    async fn rollback(&self, identity: &RuntimeIdentity) {
        if let Err(e) = self
            .cluster
            .delete_objects(&identity.infrastructure_namespace, &identity.selector())
            .await
        {
            warn!(error = %e, workspace_id = %identity.workspace_id, "Rollback of runtime objects failed");
        }
    }

    async fn record_failure(&self, identity: &RuntimeIdentity, reason: &str, warning: Option<Warning>) {
        let current = match self.store.get(identity).await {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Could not read runtime state to record failure");
                return;
            }
        };
        let expected = current.status;
        let mut failed = current.with_failure(reason);
        if let Some(warning) = warning {
            failed = failed.with_warning(warning);
        }
        if let Err(e) = self.store.compare_and_set(expected, failed).await {
            warn!(error = %e, "Could not record runtime failure");
        }
    }

    /// Stop a RUNNING runtime. Conflict while a start is in flight.
    ///
    /// STOPPED and FAILED runtimes are returned unchanged.
    #[instrument(skip_all, fields(workspace_id = %identity.workspace_id))]
    pub async fn stop(&self, identity: &RuntimeIdentity) -> Result<RuntimeState> {
        if self.synchronizer.is_starting(identity) {
            return Err(Error::Conflict(format!(
                "Runtime {identity} is starting; interrupt it before stopping"
            )));
        }
        let current = self
            .store
            .get(identity)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Runtime {identity}")))?;

        match current.status {
            RuntimeStatus::Running => {}
            RuntimeStatus::Stopped | RuntimeStatus::Failed => return Ok(current),
            status => {
                return Err(Error::Conflict(format!("Runtime {identity} is {status}")));
            }
        }

        let stopping = current.with_status(RuntimeStatus::Stopping);
        self.store
            .compare_and_set(RuntimeStatus::Running, stopping.clone())
            .await?;
        info!("Stopping runtime");
        self.teardown(stopping).await
    }

    async fn teardown(&self, stopping: RuntimeState) -> Result<RuntimeState> {
        let identity = stopping.identity.clone();
        let ns = identity.infrastructure_namespace.as_str();
        let selector = identity.selector();
        let workloads: BTreeSet<String> = stopping
            .machines
            .keys()
            .filter_map(|m| split_machine_name(m).map(|(pod, _)| pod.to_string()))
            .collect();

        let events = match self.cluster.watch(ns, &selector).await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!(error = %e, "Could not watch runtime deletion");
                None
            }
        };

        let deleted = retry_with_backoff(&self.retry, "delete_objects", || {
            self.cluster.delete_objects(ns, &selector)
        })
        .await;
        if let Err(e) = deleted {
            let failed = stopping.with_failure(format!("Stop failed: {e}"));
            self.store
                .compare_and_set(RuntimeStatus::Stopping, failed)
                .await?;
            return Err(e);
        }

        let confirmed = match events {
            Some(events) => await_deletion(events, workloads, self.stop_grace).await,
            None => false,
        };
        let mut stopped = stopping.with_status(RuntimeStatus::Stopped);
        if !confirmed {
            stopped = stopped.with_warning(Warning::new(
                warnings::STOP_GRACE_PERIOD_EXCEEDED,
                format!(
                    "Deletion of runtime objects was not confirmed within {}s",
                    self.stop_grace.as_secs()
                ),
            ));
        }
        self.store
            .compare_and_set(RuntimeStatus::Stopping, stopped.clone())
            .await?;
        info!("Runtime stopped");
        Ok(stopped)
    }

    /// Cancel an in-flight start at its next wake-up
    pub fn interrupt(&self, identity: &RuntimeIdentity) -> bool {
        let interrupted = self.synchronizer.interrupt(identity);
        if interrupted {
            info!(workspace_id = %identity.workspace_id, "Start interrupt requested");
        }
        interrupted
    }

    /// Drop a STOPPED or FAILED runtime from the cache
    pub async fn acknowledge(&self, identity: &RuntimeIdentity) -> Result<()> {
        let current = self
            .store
            .get(identity)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Runtime {identity}")))?;
        if !current.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "Runtime {identity} is {} and cannot be acknowledged",
                current.status
            )));
        }
        self.store.remove(identity).await
    }

    /// Issue an access token for the secured servers of a RUNNING runtime.
    ///
    /// Only the owner of the workspace gets one.
    #[instrument(skip_all, fields(workspace_id = %workspace_id))]
    pub async fn issue_token(&self, subject: &Subject, workspace_id: &str) -> Result<AccessToken> {
        let state = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|s| s.identity.workspace_id == workspace_id)
            .ok_or_else(|| Error::NotFound(format!("No runtime for workspace '{workspace_id}'")))?;
        let identity = &state.identity;
        if identity.owner_id != subject.user_id {
            return Err(Error::Forbidden(format!(
                "User '{}' does not own workspace '{workspace_id}'",
                subject.user_id
            )));
        }
        if state.status != RuntimeStatus::Running {
            return Err(Error::Conflict(format!("Runtime {identity} is {}", state.status)));
        }

        let name = signer::private_key_secret_name(identity);
        let secret = self
            .cluster
            .get_secret(&identity.infrastructure_namespace, &name)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Runtime {identity} has no secured servers"))
            })?;
        let key = signer::signing_key_from_secret(&secret)?;
        let token = key.access_token(&subject.user_id, workspace_id, self.token_ttl)?;
        info!(user_id = %subject.user_id, expires_at = %token.expires_at, "Issued access token");
        Ok(token)
    }

    pub async fn status(&self, identity: &RuntimeIdentity) -> Result<Option<RuntimeState>> {
        self.store.get(identity).await
    }

    pub async fn runtimes(&self) -> Result<Vec<RuntimeState>> {
        self.store.list().await
    }

    /// Settle runtimes left mid-transition by a previous process.
    ///
    /// Interrupted starts are rolled back and FAILED, interrupted stops are
    /// completed. Returns how many runtimes were settled.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let mut settled = 0;
        for state in self.store.list().await? {
            let identity = state.identity.clone();
            match state.status {
                RuntimeStatus::Starting if !self.synchronizer.is_starting(&identity) => {
                    warn!(workspace_id = %identity.workspace_id, "Rolling back start interrupted by restart");
                    self.rollback(&identity).await;
                    self.record_failure(
                        &identity,
                        "Control plane restarted while the runtime was starting",
                        Some(Warning::new(
                            warnings::START_INTERRUPTED_BY_RESTART,
                            "Start was interrupted by a control plane restart",
                        )),
                    )
                    .await;
                    settled += 1;
                }
                RuntimeStatus::Stopping => {
                    info!(workspace_id = %identity.workspace_id, "Completing interrupted stop");
                    if let Err(e) = self.teardown(state).await {
                        warn!(error = %e, workspace_id = %identity.workspace_id, "Interrupted stop failed");
                    }
                    settled += 1;
                }
                _ => {}
            }
        }
        Ok(settled)
    }
}
