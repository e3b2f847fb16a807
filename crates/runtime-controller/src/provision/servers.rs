use std::sync::Arc;

use super::Provisioner;
use crate::config::ExposureConfig;
use crate::driver::InfrastructureDriver;
use crate::error::Result;
use crate::model::{KubernetesEnvironment, RuntimeIdentity};
use crate::server::{ExternalServerExposer, SecureExposerFactory, ServerExposer};

/// Services, external routes and secure exposure for every declared server.
///
/// Runs last so the signing proxy sees the final container list of each pod.
pub struct ServersProvisioner {
    exposure: ExposureConfig,
    secure: SecureExposerFactory,
    driver: Arc<dyn InfrastructureDriver>,
}

impl ServersProvisioner {
    pub fn new(
        exposure: ExposureConfig,
        secure: SecureExposerFactory,
        driver: Arc<dyn InfrastructureDriver>,
    ) -> Self {
        Self {
            exposure,
            secure,
            driver,
        }
    }
}

impl Provisioner for ServersProvisioner {
    fn name(&self) -> &'static str {
        "servers"
    }

    fn provision(&self, env: &mut KubernetesEnvironment, identity: &RuntimeIdentity) -> Result<()> {
        let external =
            ExternalServerExposer::new(identity.clone(), self.exposure.clone(), self.driver.clone());
        let mut exposer = ServerExposer::new(identity.clone(), external, self.secure.create(identity)?);

        let machines: Vec<_> = env
            .machines
            .iter()
            .map(|(name, config)| (name.clone(), config.servers.clone()))
            .collect();
        for (machine, servers) in machines {
            exposer.expose(env, &machine, &servers)?;
        }
        Ok(())
    }
}
