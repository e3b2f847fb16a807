//! Runtime state cache.
//!
//! Written only by the synchronizer. Every update is a compare-and-set on the
//! status the writer last observed, so two writers racing on one runtime
//! cannot both record a transition.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::debug;

use super::state::{RuntimeState, RuntimeStatus};
use crate::error::{Error, Result};
use crate::model::{dns_label, RuntimeIdentity};

const LABEL_RUNTIME_STATE: &str = "workspaces.platform/runtime-state";
const STATE_KEY: &str = "state.json";

#[async_trait]
pub trait RuntimeStateStore: Send + Sync {
    async fn get(&self, identity: &RuntimeIdentity) -> Result<Option<RuntimeState>>;

    async fn list(&self) -> Result<Vec<RuntimeState>>;

    /// Conflict when the runtime already has a state
    async fn put_if_absent(&self, state: RuntimeState) -> Result<()>;

    /// Replace the state only while its status is still `expected`
    async fn compare_and_set(&self, expected: RuntimeStatus, state: RuntimeState) -> Result<()>;

    async fn remove(&self, identity: &RuntimeIdentity) -> Result<()>;
}

fn check_transition(current: &RuntimeState, expected: RuntimeStatus, next: &RuntimeState) -> Result<()> {
    if current.status != expected {
        return Err(Error::Conflict(format!(
            "Runtime {} is {}, expected {expected}",
            current.identity, current.status
        )));
    }
    if current.status != next.status && !current.status.can_transition_to(next.status) {
        return Err(Error::Internal(format!(
            "Illegal transition {} -> {} for runtime {}",
            current.status, next.status, current.identity
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: DashMap<RuntimeIdentity, RuntimeState>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStateStore for InMemoryStateStore {
    async fn get(&self, identity: &RuntimeIdentity) -> Result<Option<RuntimeState>> {
        Ok(self.states.get(identity).map(|s| s.clone()))
    }

    async fn list(&self) -> Result<Vec<RuntimeState>> {
        Ok(self.states.iter().map(|s| s.value().clone()).collect())
    }

    async fn put_if_absent(&self, state: RuntimeState) -> Result<()> {
        match self.states.entry(state.identity.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Err(Error::Conflict(format!(
                "Runtime {} already exists in state {}",
                state.identity,
                existing.get().status
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }

    async fn compare_and_set(&self, expected: RuntimeStatus, state: RuntimeState) -> Result<()> {
        let mut current = self
            .states
            .get_mut(&state.identity)
            .ok_or_else(|| Error::NotFound(format!("Runtime {}", state.identity)))?;
        check_transition(&current, expected, &state)?;
        *current = state;
        Ok(())
    }

    async fn remove(&self, identity: &RuntimeIdentity) -> Result<()> {
        self.states.remove(identity);
        Ok(())
    }
}

/// One ConfigMap per runtime; `resourceVersion` guards each replace
pub struct ConfigMapStateStore {
    api: Api<ConfigMap>,
}

impl ConfigMapStateStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn config_map_name(identity: &RuntimeIdentity) -> String {
        dns_label(&format!("runtime-state-{}", identity.workspace_id))
    }

    fn to_config_map(state: &RuntimeState, resource_version: Option<String>) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(Self::config_map_name(&state.identity)),
                labels: Some(BTreeMap::from([(
                    LABEL_RUNTIME_STATE.to_string(),
                    "true".to_string(),
                )])),
                resource_version,
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                STATE_KEY.to_string(),
                serde_json::to_string(state)?,
            )])),
            ..Default::default()
        })
    }

    fn from_config_map(cm: &ConfigMap) -> Result<Option<RuntimeState>> {
        let Some(raw) = cm.data.as_ref().and_then(|d| d.get(STATE_KEY)) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(raw)?))
    }
}

#[async_trait]
impl RuntimeStateStore for ConfigMapStateStore {
    async fn get(&self, identity: &RuntimeIdentity) -> Result<Option<RuntimeState>> {
        let Some(cm) = self.api.get_opt(&Self::config_map_name(identity)).await? else {
            return Ok(None);
        };
        Ok(Self::from_config_map(&cm)?.filter(|state| state.identity == *identity))
    }

    async fn list(&self) -> Result<Vec<RuntimeState>> {
        let params = ListParams::default().labels(&format!("{LABEL_RUNTIME_STATE}=true"));
        let mut states = Vec::new();
        for cm in self.api.list(&params).await? {
            match Self::from_config_map(&cm) {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Skipping unreadable runtime state"),
            }
        }
        Ok(states)
    }

    async fn put_if_absent(&self, state: RuntimeState) -> Result<()> {
        let cm = Self::to_config_map(&state, None)?;
        match self.api.create(&PostParams::default(), &cm).await {
            Ok(_) => Ok(()),
            Err(e) => match Error::from(e) {
                Error::Conflict(_) => Err(Error::Conflict(format!(
                    "Runtime {} already exists",
                    state.identity
                ))),
                other => Err(other),
            },
        }
    }

    async fn compare_and_set(&self, expected: RuntimeStatus, state: RuntimeState) -> Result<()> {
        let name = Self::config_map_name(&state.identity);
        let current_cm = self
            .api
            .get_opt(&name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Runtime {}", state.identity)))?;
        let current = Self::from_config_map(&current_cm)?
            .ok_or_else(|| Error::NotFound(format!("Runtime {}", state.identity)))?;
        check_transition(&current, expected, &state)?;

        let cm = Self::to_config_map(&state, current_cm.metadata.resource_version.clone())?;
        // A 409 means another writer replaced the state since it was read
        self.api.replace(&name, &PostParams::default(), &cm).await?;
        Ok(())
    }

    async fn remove(&self, identity: &RuntimeIdentity) -> Result<()> {
        match self
            .api
            .delete(&Self::config_map_name(identity), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
