//! Translation of pod state and cluster events into runtime events

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{Event, Pod};
use kube::ResourceExt;

use crate::model::LABEL_POD_NAME;

/// Container waiting reasons that never resolve on their own
const UNRECOVERABLE_CONTAINER_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CrashLoopBackOff",
    "CreateContainerConfigError",
];

/// Event reasons that fail a start immediately
const UNRECOVERABLE_EVENT_REASONS: &[&str] = &["FailedScheduling", "FailedMount", "Failed"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    PodPending { pod: String },
    PodReady { pod: String },
    PodFailed { pod: String, reason: String },
    PodDeleted { pod: String },
    /// A cluster event about `object` that makes the start hopeless
    Unrecoverable {
        object: String,
        reason: String,
        message: String,
    },
}

/// Logical pod name: the pod-name label when present (deployment pods), else the object name
#[must_use]
pub fn logical_pod_name(pod: &Pod) -> String {
    pod.labels()
        .get(LABEL_POD_NAME)
        .cloned()
        .unwrap_or_else(|| pod.name_any())
}

#[must_use]
pub fn classify_pod(pod: &Pod) -> RuntimeEvent {
    let name = logical_pod_name(pod);
    let Some(status) = &pod.status else {
        return RuntimeEvent::PodPending { pod: name };
    };

    if status.phase.as_deref() == Some("Failed") {
        return RuntimeEvent::PodFailed {
            pod: name,
            reason: status
                .reason
                .clone()
                .unwrap_or_else(|| "PodFailed".to_string()),
        };
    }

    let waiting = status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .filter_map(|cs| cs.state.as_ref().and_then(|s| s.waiting.as_ref()))
        .find(|w| {
            w.reason
                .as_deref()
                .is_some_and(|r| UNRECOVERABLE_CONTAINER_REASONS.contains(&r))
        });
    if let Some(waiting) = waiting {
        return RuntimeEvent::PodFailed {
            pod: name,
            reason: format!(
                "{}: {}",
                waiting.reason.clone().unwrap_or_default(),
                waiting.message.clone().unwrap_or_default()
            ),
        };
    }

    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    if ready {
        RuntimeEvent::PodReady { pod: name }
    } else {
        RuntimeEvent::PodPending { pod: name }
    }
}

/// Only warning events with a known fatal reason are reported
#[must_use]
pub fn classify_event(event: &Event) -> Option<RuntimeEvent> {
    if event.involved_object.kind.as_deref() != Some("Pod") {
        return None;
    }
    let reason = event.reason.as_deref()?;
    if !UNRECOVERABLE_EVENT_REASONS.contains(&reason) {
        return None;
    }
    // Generic "Failed" only counts for image pulls and container errors
    if reason == "Failed" {
        let message = event.message.as_deref().unwrap_or_default();
        if !message.contains("Failed to pull image") && !message.contains("Error: ") {
            return None;
        }
    }
    Some(RuntimeEvent::Unrecoverable {
        object: event.involved_object.name.clone().unwrap_or_default(),
        reason: reason.to_string(),
        message: event.message.clone().unwrap_or_default(),
    })
}

/// Pods of one runtime as reported by its label-selected pod watch.
///
/// Cluster events are namespace wide; only those about a tracked pod are
/// attributed to the runtime.
#[derive(Debug, Default)]
pub struct OwnedPods {
    names: HashSet<String>,
}

impl OwnedPods {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, pod: &Pod) -> RuntimeEvent {
        self.names.insert(pod.name_any());
        classify_pod(pod)
    }

    pub fn forget(&mut self, pod: &Pod) -> RuntimeEvent {
        self.names.remove(&pod.name_any());
        RuntimeEvent::PodDeleted {
            pod: logical_pod_name(pod),
        }
    }

    /// [`classify_event`] restricted to tracked pods
    #[must_use]
    pub fn classify(&self, event: &Event) -> Option<RuntimeEvent> {
        let pod = event.involved_object.name.as_deref()?;
        if !self.names.contains(pod) {
            return None;
        }
        classify_event(event)
    }
}
