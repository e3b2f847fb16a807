use tracing::debug;

use super::Provisioner;
use crate::error::Result;
use crate::model::{warnings, KubernetesEnvironment, PodRole, RuntimeIdentity, Warning};

/// Forces every pod to the one restart policy its role supports.
pub struct RestartPolicyRewriter;

impl RestartPolicyRewriter {
    fn supported(role: PodRole) -> &'static str {
        match role {
            PodRole::Pod => "Never",
            PodRole::Deployment => "Always",
        }
    }
}

impl Provisioner for RestartPolicyRewriter {
    fn name(&self) -> &'static str {
        "restart-policy"
    }

    fn provision(&self, env: &mut KubernetesEnvironment, _identity: &RuntimeIdentity) -> Result<()> {
        let mut rewritten = Vec::new();
        for (name, pod) in &mut env.pods {
            let supported = Self::supported(pod.role);
            if let Some(declared) = pod.spec.restart_policy.as_deref() {
                if declared != supported {
                    debug!(pod = %name, declared = %declared, supported = %supported, "Rewriting restart policy");
                    rewritten.push(Warning::new(
                        warnings::RESTART_POLICY_REWRITTEN,
                        format!(
                            "Restart policy '{declared}' of pod '{name}' is not supported and was replaced with '{supported}'"
                        ),
                    ));
                }
            }
            pod.spec.restart_policy = Some(supported.to_string());
        }
        for warning in rewritten {
            env.add_warning(warning);
        }
        Ok(())
    }
}
