use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::Provisioner;
use crate::error::Result;
use crate::model::{KubernetesEnvironment, RuntimeIdentity, LABEL_POD_NAME, LABEL_WORKSPACE_ID};

/// Labels every object of a runtime carries
#[must_use]
pub fn runtime_labels(identity: &RuntimeIdentity) -> BTreeMap<String, String> {
    BTreeMap::from([(
        LABEL_WORKSPACE_ID.to_string(),
        identity.workspace_id.clone(),
    )])
}

fn label(metadata: &mut ObjectMeta, labels: &BTreeMap<String, String>) {
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Labels objects already in the environment so they can be watched and torn down.
///
/// Objects added by later provisioners label themselves with [`runtime_labels`].
pub struct RuntimeLabeler;

impl Provisioner for RuntimeLabeler {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn provision(&self, env: &mut KubernetesEnvironment, identity: &RuntimeIdentity) -> Result<()> {
        let labels = runtime_labels(identity);
        for (name, pod) in &mut env.pods {
            label(&mut pod.metadata, &labels);
            pod.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert(LABEL_POD_NAME.to_string(), name.clone());
        }
        for service in env.services.values_mut() {
            label(&mut service.metadata, &labels);
        }
        for ingress in env.ingresses.values_mut() {
            label(&mut ingress.metadata, &labels);
        }
        for route in env.routes.values_mut() {
            label(&mut route.metadata, &labels);
        }
        for config_map in env.config_maps.values_mut() {
            label(&mut config_map.metadata, &labels);
        }
        for secret in env.secrets.values_mut() {
            label(&mut secret.metadata, &labels);
        }
        Ok(())
    }
}
