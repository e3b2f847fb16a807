//! Secure exposure of servers requiring authenticated access

use tracing::{debug, warn};

use super::external::ExternalServerExposer;
use super::signer::SignerProxyExposer;
use super::token::SigningKey;
use super::ServerTarget;
use crate::config::SignerProxySettings;
use crate::error::{Error, Result};
use crate::model::{KubernetesEnvironment, RuntimeIdentity};

pub trait SecureServerExposer: Send {
    /// Make `target` reachable externally only through an authenticating hop
    fn expose(
        &mut self,
        env: &mut KubernetesEnvironment,
        target: &ServerTarget<'_>,
        external: &ExternalServerExposer,
    ) -> Result<()>;
}

/// Signing proxy settings of one runtime
#[derive(Debug, Clone)]
pub struct SignerProxyConfig {
    pub enabled: bool,
    /// Present only when enabled
    pub key: Option<SigningKey>,
}

impl SignerProxyConfig {
    /// Generates the runtime's key pair when the proxy is enabled
    pub fn for_runtime(enabled: bool) -> Result<Self> {
        let key = if enabled {
            Some(SigningKey::generate()?)
        } else {
            None
        };
        Ok(Self { enabled, key })
    }
}

/// Builds the secure exposer of a runtime
#[derive(Debug, Clone)]
pub struct SecureExposerFactory {
    settings: SignerProxySettings,
}

impl SecureExposerFactory {
    pub fn new(settings: SignerProxySettings) -> Self {
        Self { settings }
    }

    pub fn create(&self, identity: &RuntimeIdentity) -> Result<Box<dyn SecureServerExposer>> {
        let config = SignerProxyConfig::for_runtime(self.settings.enabled)?;
        let exposer: Box<dyn SecureServerExposer> = match config {
            SignerProxyConfig {
                enabled: true,
                key: Some(key),
            } => Box::new(SignerProxyExposer::new(
                identity.clone(),
                self.settings.clone(),
                key,
            )),
            _ => {
                debug!(workspace_id = %identity.workspace_id, "Signer proxy disabled, exposing secure servers directly");
                Box::new(PassthroughExposer)
            }
        };
        Ok(exposer)
    }
}

/// Exposes secure servers like any other server, without a proxy
pub struct PassthroughExposer;

impl SecureServerExposer for PassthroughExposer {
    fn expose(
        &mut self,
        env: &mut KubernetesEnvironment,
        target: &ServerTarget<'_>,
        external: &ExternalServerExposer,
    ) -> Result<()> {
        let port = target.server.port_number().ok_or_else(|| {
            Error::Internal(format!(
                "Server '{}' has invalid port '{}'",
                target.server_id, target.server.port
            ))
        })?;
        if let Some(service) = env.services.get_mut(target.service) {
            super::add_service_port(service, &format!("srv-{port}"), port, &target.server.transport());
        }
        warn!(server = %target.server_id, "Secure server exposed without authentication");
        external.expose(env, target, port, port, false);
        Ok(())
    }
}
