//! Per-tenant namespace resolution, authorization and provisioning.

pub mod auth;
pub mod naming;

pub use naming::{evaluate_template, NamespaceResolutionContext};

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::cluster::ClusterClient;
use crate::config::ControllerConfig;
use crate::driver::InfrastructureDriver;
use crate::error::{Error, Result};
use crate::model::Subject;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Label marking namespaces managed for workspaces
pub const LABEL_NAMESPACE_ROLE: &str = "workspaces.platform/namespace";
pub const NAMESPACE_ROLE: &str = "workspace";
pub const ANNOTATION_USERNAME: &str = "workspaces.platform/username";
pub const ANNOTATION_USER_ID: &str = "workspaces.platform/user-id";

pub const ATTR_DISPLAY_NAME: &str = "displayName";
pub const ATTR_DEFAULT: &str = "default";
pub const ATTR_PHASE: &str = "phase";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMeta {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
}

impl NamespaceMeta {
    fn from_namespace(namespace: &Namespace, default_name: &str) -> Self {
        let name = namespace.name_any();
        let mut attributes = BTreeMap::new();
        attributes.insert(
            ATTR_DISPLAY_NAME.to_string(),
            namespace
                .annotations()
                .get("openshift.io/display-name")
                .cloned()
                .unwrap_or_else(|| name.clone()),
        );
        attributes.insert(ATTR_DEFAULT.to_string(), (name == default_name).to_string());
        if let Some(phase) = namespace.status.as_ref().and_then(|s| s.phase.clone()) {
            attributes.insert(ATTR_PHASE.to_string(), phase);
        }
        Self { name, attributes }
    }

    /// Namespace that will be created on first provisioning
    fn not_yet_created(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: BTreeMap::from([
                (ATTR_DISPLAY_NAME.to_string(), name.to_string()),
                (ATTR_DEFAULT.to_string(), "true".to_string()),
            ]),
        }
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.attributes.get(ATTR_DEFAULT).is_some_and(|v| v == "true")
    }
}

/// True when the namespace records a different owning user id.
///
/// Namespaces pre-created by an administrator carry no owner and are
/// shared with whoever resolves to them.
fn owned_by_other(namespace: &Namespace, subject: &Subject) -> bool {
    namespace
        .annotations()
        .get(ANNOTATION_USER_ID)
        .is_some_and(|owner| *owner != subject.user_id)
}

fn ensure_owner(namespace: &Namespace, subject: &Subject) -> Result<()> {
    if owned_by_other(namespace, subject) {
        return Err(Error::Conflict(format!(
            "Namespace '{}' belongs to another user",
            namespace.name_any()
        )));
    }
    Ok(())
}

pub struct NamespaceManager {
    cluster: Arc<dyn ClusterClient>,
    driver: Arc<dyn InfrastructureDriver>,
    template: String,
    retry: RetryConfig,
}

impl NamespaceManager {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        driver: Arc<dyn InfrastructureDriver>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            driver,
            template: config.namespace.template.clone(),
            retry: config.retry.clone(),
        }
    }

    async fn ensure_authorized(&self, subject: &Subject) -> Result<()> {
        if self.driver.authorize(subject).await? {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "User '{}' is not allowed to create workspaces",
                subject.user_name
            )))
        }
    }

    /// Computed name for a resolution context
    pub fn namespace_name(&self, ctx: &NamespaceResolutionContext) -> Result<String> {
        evaluate_template(&self.template, ctx)
    }

    /// Namespaces the subject may use; the computed default when none exist yet
    #[instrument(skip(self, subject), fields(user = %subject.user_name))]
    pub async fn list(&self, subject: &Subject) -> Result<Vec<NamespaceMeta>> {
        self.ensure_authorized(subject).await?;
        let default_name = self.namespace_name(&NamespaceResolutionContext::new(subject.clone()))?;

        let selector = format!("{LABEL_NAMESPACE_ROLE}={NAMESPACE_ROLE}");
        let owned: Vec<NamespaceMeta> = self
            .cluster
            .list_namespaces(&selector)
            .await?
            .iter()
            .filter(|ns| match ns.annotations().get(ANNOTATION_USER_ID) {
                Some(owner) => *owner == subject.user_id,
                None => ns.annotations().get(ANNOTATION_USERNAME) == Some(&subject.user_name),
            })
            .map(|ns| NamespaceMeta::from_namespace(ns, &default_name))
            .collect();
        if !owned.is_empty() {
            return Ok(owned);
        }

        // Pre-created by an administrator without our labels
        if let Some(existing) = self.cluster.get_namespace(&default_name).await? {
            if owned_by_other(&existing, subject) {
                return Ok(Vec::new());
            }
            return Ok(vec![NamespaceMeta::from_namespace(&existing, &default_name)]);
        }
        Ok(vec![NamespaceMeta::not_yet_created(&default_name)])
    }

    /// Idempotent get-or-create of the namespace computed for `ctx`.
    ///
    /// Losing a creation race is not an error: the winner's namespace is
    /// read back and returned. A namespace owned by another user is a
    /// Conflict.
    #[instrument(skip(self, ctx), fields(user = %ctx.subject.user_name))]
    pub async fn provision(&self, ctx: &NamespaceResolutionContext) -> Result<NamespaceMeta> {
        self.ensure_authorized(&ctx.subject).await?;
        let name = self.namespace_name(ctx)?;
        let default_name = self
            .namespace_name(&NamespaceResolutionContext::new(ctx.subject.clone()))
            .unwrap_or_else(|_| name.clone());

        let (name, default_name, subject) = (name.as_str(), default_name.as_str(), &ctx.subject);
        retry_with_backoff(&self.retry, "provision_namespace", move || {
            self.get_or_create(name, default_name, subject)
        })
        .await
    }

    async fn get_or_create(
        &self,
        name: &str,
        default_name: &str,
        subject: &Subject,
    ) -> Result<NamespaceMeta> {
        if let Some(existing) = self.cluster.get_namespace(name).await? {
            debug!(namespace = %name, "Namespace already present");
            ensure_owner(&existing, subject)?;
            return Ok(NamespaceMeta::from_namespace(&existing, default_name));
        }

        let desired = self.driver.resolve_namespace(name, subject);
        match self.cluster.create_namespace(&desired).await {
            Ok(created) => {
                info!(namespace = %name, user = %subject.user_name, "Created workspace namespace");
                Ok(NamespaceMeta::from_namespace(&created, default_name))
            }
            Err(e) if e.is_conflict() => {
                debug!(namespace = %name, "Lost namespace creation race, reading winner");
                let winner = self.cluster.get_namespace(name).await?.ok_or_else(|| {
                    // Retryable: the winner may not be readable yet
                    Error::infrastructure(format!(
                        "Namespace '{name}' reported as existing but could not be read"
                    ))
                })?;
                ensure_owner(&winner, subject)?;
                Ok(NamespaceMeta::from_namespace(&winner, default_name))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::driver::KubernetesDriver;
    use crate::namespace::auth::AuthorizationChecker;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::NamespaceStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::Sequence;

    struct Fixed(bool);

    #[async_trait]
    impl AuthorizationChecker for Fixed {
        async fn is_authorized(&self, _subject: &Subject) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn manager(cluster: MockClusterClient, allowed: bool) -> NamespaceManager {
        let mut config = ControllerConfig::default();
        config.retry = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        };
        NamespaceManager::new(
            Arc::new(cluster),
            Arc::new(KubernetesDriver::new(Arc::new(Fixed(allowed)), None)),
            &config,
        )
    }

    fn namespace(name: &str, phase: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_USERNAME.to_string(),
                    "alice".to_string(),
                )])),
                ..Default::default()
            },
            status: Some(NamespaceStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn alice() -> NamespaceResolutionContext {
        NamespaceResolutionContext::new(Subject::new("u-1", "alice"))
    }

    #[tokio::test]
    async fn existing_namespace_is_returned_unchanged() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_namespace()
            .withf(|name| name == "alice-workspaces")
            .returning(|name| Ok(Some(namespace(name, "Active"))));
        cluster.expect_create_namespace().never();

        let meta = manager(cluster, true).provision(&alice()).await.unwrap();
        assert_eq!(meta.name, "alice-workspaces");
        assert!(meta.is_default());
        assert_eq!(meta.attributes[ATTR_PHASE], "Active");
    }

    #[tokio::test]
    async fn creation_race_returns_the_winner() {
        let mut cluster = MockClusterClient::new();
        let mut seq = Sequence::new();
        cluster
            .expect_get_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        cluster
            .expect_create_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::Conflict("namespaces \"alice-workspaces\" already exists".into())));
        cluster
            .expect_get_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| Ok(Some(namespace(name, "Active"))));

        let meta = manager(cluster, true).provision(&alice()).await.unwrap();
        assert_eq!(meta.name, "alice-workspaces");
    }

    #[tokio::test]
    async fn namespace_of_another_user_is_a_conflict() {
        let owned_by_bob = |name: &str| {
            let mut ns = namespace(name, "Active");
            ns.metadata.annotations = Some(BTreeMap::from([(
                ANNOTATION_USER_ID.to_string(),
                "u-2".to_string(),
            )]));
            ns
        };
        let mut cluster = MockClusterClient::new();
        let mut seq = Sequence::new();
        cluster
            .expect_get_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        cluster
            .expect_create_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::Conflict("already exists".into())));
        cluster
            .expect_get_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |name| Ok(Some(owned_by_bob(name))));

        let result = manager(cluster, true).provision(&alice()).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn creates_labelled_namespace() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_get_namespace().returning(|_| Ok(None));
        cluster
            .expect_create_namespace()
            .withf(|ns| {
                ns.labels().get(LABEL_NAMESPACE_ROLE).map(String::as_str) == Some(NAMESPACE_ROLE)
                    && ns.annotations().get(ANNOTATION_USER_ID).map(String::as_str) == Some("u-1")
            })
            .times(1)
            .returning(|ns| Ok(ns.clone()));

        let meta = manager(cluster, true).provision(&alice()).await.unwrap();
        assert_eq!(meta.attributes[ATTR_DISPLAY_NAME], "alice-workspaces");
    }

    #[tokio::test]
    async fn unauthorized_subject_is_forbidden() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_get_namespace().never();

        let result = manager(cluster, false).provision(&alice()).await;
        assert!(matches!(result, Err(Error::Forbidden(_))));
    }

    #[tokio::test]
    async fn list_falls_back_to_computed_default() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_namespaces().returning(|_| Ok(Vec::new()));
        cluster.expect_get_namespace().returning(|_| Ok(None));

        let listed = manager(cluster, true)
            .list(&Subject::new("u-1", "alice"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "alice-workspaces");
        assert!(listed[0].is_default());
        assert!(!listed[0].attributes.contains_key(ATTR_PHASE));
    }

    #[tokio::test]
    async fn list_only_returns_owned_namespaces() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_namespaces().returning(|_| {
            let mut other = namespace("bob-workspaces", "Active");
            other.metadata.annotations = Some(BTreeMap::from([(
                ANNOTATION_USERNAME.to_string(),
                "bob".to_string(),
            )]));
            Ok(vec![namespace("alice-workspaces", "Active"), other])
        });

        let listed = manager(cluster, true)
            .list(&Subject::new("u-1", "alice"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "alice-workspaces");
    }
}
