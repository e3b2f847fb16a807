//! Ordered transformations applied to an environment before submission.
//!
//! Any provisioner error aborts the start before a single object reaches
//! the cluster.

pub mod env_vars;
pub mod labels;
pub mod restart_policy;
pub mod servers;
pub mod volumes;

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::ControllerConfig;
use crate::driver::InfrastructureDriver;
use crate::error::Result;
use crate::model::{KubernetesEnvironment, RuntimeIdentity};
use crate::server::SecureExposerFactory;

pub use env_vars::{EnvVarProvider, EnvVarsProvisioner};
pub use labels::RuntimeLabeler;
pub use restart_policy::RestartPolicyRewriter;
pub use servers::ServersProvisioner;
pub use volumes::VolumesProvisioner;

pub trait Provisioner: Send + Sync {
    fn name(&self) -> &'static str;

    fn provision(&self, env: &mut KubernetesEnvironment, identity: &RuntimeIdentity) -> Result<()>;
}

pub struct ProvisionerPipeline {
    provisioners: Vec<Box<dyn Provisioner>>,
}

impl ProvisionerPipeline {
    /// Fixed order: restart policy, labels, volumes, environment, servers
    pub fn new(config: &ControllerConfig, driver: Arc<dyn InfrastructureDriver>) -> Self {
        Self::with_provisioners(vec![
            Box::new(RestartPolicyRewriter),
            Box::new(RuntimeLabeler),
            Box::new(VolumesProvisioner::new(config.storage.clone())),
            Box::new(EnvVarsProvisioner::new(&config.workspace)),
            Box::new(ServersProvisioner::new(
                config.exposure.clone(),
                SecureExposerFactory::new(config.signer_proxy.clone()),
                driver,
            )),
        ])
    }

    pub fn with_provisioners(provisioners: Vec<Box<dyn Provisioner>>) -> Self {
        Self { provisioners }
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.provisioners.iter().map(|p| p.name()).collect()
    }

    #[instrument(skip_all, fields(workspace_id = %identity.workspace_id))]
    pub fn provision(&self, env: &mut KubernetesEnvironment, identity: &RuntimeIdentity) -> Result<()> {
        for provisioner in &self.provisioners {
            debug!(provisioner = provisioner.name(), "Applying provisioner");
            provisioner.provision(env, identity)?;
        }
        Ok(())
    }

    /// Run the pipeline on a copy of `env` and report its first error
    pub fn check(&self, env: &KubernetesEnvironment, identity: &RuntimeIdentity) -> Result<()> {
        self.provision(&mut env.clone(), identity)
    }
}
