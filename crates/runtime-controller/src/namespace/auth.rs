//! Authorization checkpoint deciding whether a subject may use the cluster at all

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cluster::ClusterClient;
use crate::config::AuthorizationConfig;
use crate::error::Result;
use crate::model::Subject;

#[async_trait]
pub trait AuthorizationChecker: Send + Sync {
    async fn is_authorized(&self, subject: &Subject) -> Result<bool>;
}

/// Resolves whether a subject belongs to a named group
#[async_trait]
pub trait GroupResolver: Send + Sync {
    async fn is_member(&self, group: &str, subject: &Subject) -> Result<bool>;
}

/// Group membership from the subject's own groups, then from cluster group objects.
pub struct ClusterGroupResolver {
    cluster: Arc<dyn ClusterClient>,
}

impl ClusterGroupResolver {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl GroupResolver for ClusterGroupResolver {
    async fn is_member(&self, group: &str, subject: &Subject) -> Result<bool> {
        if subject.groups.iter().any(|g| g == group) {
            return Ok(true);
        }
        match self.cluster.group_members(group).await {
            Ok(Some(members)) => Ok(members.iter().any(|m| m == &subject.user_name)),
            Ok(None) => Ok(false),
            Err(e) if e.is_not_found() => {
                debug!(group = %group, "Group not found, treating as non-membership");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Allow/deny list policy. Deny rules always win; no allow rules means allow all.
pub struct ListAuthorizationChecker {
    allow_users: BTreeSet<String>,
    allow_groups: BTreeSet<String>,
    deny_users: BTreeSet<String>,
    deny_groups: BTreeSet<String>,
    groups: Arc<dyn GroupResolver>,
}

impl ListAuthorizationChecker {
    pub fn new(config: &AuthorizationConfig, groups: Arc<dyn GroupResolver>) -> Self {
        Self {
            allow_users: config.allow_users.clone(),
            allow_groups: config.allow_groups.clone(),
            deny_users: config.deny_users.clone(),
            deny_groups: config.deny_groups.clone(),
            groups,
        }
    }

    fn names_user(users: &BTreeSet<String>, subject: &Subject) -> bool {
        users.contains(&subject.user_name) || users.contains(&subject.user_id)
    }

    async fn member_of_any(&self, groups: &BTreeSet<String>, subject: &Subject) -> Result<bool> {
        for group in groups {
            if self.groups.is_member(group, subject).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl AuthorizationChecker for ListAuthorizationChecker {
    async fn is_authorized(&self, subject: &Subject) -> Result<bool> {
        if Self::names_user(&self.deny_users, subject)
            || self.member_of_any(&self.deny_groups, subject).await?
        {
            debug!(user = %subject.user_name, "Subject matched a deny rule");
            return Ok(false);
        }

        if self.allow_users.is_empty() && self.allow_groups.is_empty() {
            return Ok(true);
        }

        Ok(Self::names_user(&self.allow_users, subject)
            || self.member_of_any(&self.allow_groups, subject).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::error::Error;

    /// Membership taken only from the subject's groups
    struct SubjectGroups;

    #[async_trait]
    impl GroupResolver for SubjectGroups {
        async fn is_member(&self, group: &str, subject: &Subject) -> Result<bool> {
            Ok(subject.groups.iter().any(|g| g == group))
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn checker(config: AuthorizationConfig) -> ListAuthorizationChecker {
        ListAuthorizationChecker::new(&config, Arc::new(SubjectGroups))
    }

    fn alice() -> Subject {
        Subject::new("u-1", "alice").with_groups(vec!["G1".to_string()])
    }

    #[tokio::test]
    async fn allows_everyone_without_allow_lists() {
        let checker = checker(AuthorizationConfig::default());
        assert!(checker.is_authorized(&alice()).await.unwrap());
    }

    #[tokio::test]
    async fn deny_group_beats_allow_group() {
        let checker = checker(AuthorizationConfig {
            allow_groups: set(&["G1"]),
            deny_groups: set(&["G1"]),
            ..Default::default()
        });
        assert!(!checker.is_authorized(&alice()).await.unwrap());
    }

    #[tokio::test]
    async fn deny_user_beats_allow_user() {
        let checker = checker(AuthorizationConfig {
            allow_users: set(&["alice"]),
            deny_users: set(&["alice"]),
            ..Default::default()
        });
        assert!(!checker.is_authorized(&alice()).await.unwrap());
    }

    #[tokio::test]
    async fn allow_lists_restrict_access() {
        let checker = checker(AuthorizationConfig {
            allow_users: set(&["bob"]),
            allow_groups: set(&["G2"]),
            ..Default::default()
        });
        assert!(!checker.is_authorized(&alice()).await.unwrap());
        assert!(checker
            .is_authorized(&Subject::new("u-2", "bob"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn missing_cluster_group_is_non_membership() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_group_members()
            .withf(|group| group == "admins")
            .returning(|_| Ok(None));
        cluster
            .expect_group_members()
            .withf(|group| group == "legacy")
            .returning(|_| Err(Error::NotFound("groups.user.openshift.io \"legacy\"".into())));

        let resolver = ClusterGroupResolver::new(Arc::new(cluster));
        let subject = Subject::new("u-1", "alice");
        assert!(!resolver.is_member("admins", &subject).await.unwrap());
        assert!(!resolver.is_member("legacy", &subject).await.unwrap());
    }

    #[tokio::test]
    async fn cluster_group_members_are_resolved() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_group_members()
            .returning(|_| Ok(Some(vec!["alice".to_string(), "carol".to_string()])));

        let checker = ListAuthorizationChecker::new(
            &AuthorizationConfig {
                allow_groups: set(&["developers"]),
                ..Default::default()
            },
            Arc::new(ClusterGroupResolver::new(Arc::new(cluster))),
        );
        assert!(checker
            .is_authorized(&Subject::new("u-1", "alice"))
            .await
            .unwrap());
        assert!(!checker
            .is_authorized(&Subject::new("u-2", "mallory"))
            .await
            .unwrap());
    }
}
