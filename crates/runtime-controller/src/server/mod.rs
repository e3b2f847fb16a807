//! Server exposure: services for every machine, external routes, and the
//! signing proxy in front of secured servers.

pub mod external;
pub mod proxy;
pub mod secure;
pub mod signer;
pub mod token;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{info, instrument, warn};

pub use external::ExternalServerExposer;
pub use secure::{SecureExposerFactory, SecureServerExposer, SignerProxyConfig};

use crate::error::{Error, Result};
use crate::model::environment::split_machine_name;
use crate::model::{
    dns_label, warnings, KubernetesEnvironment, RuntimeIdentity, ServerConfig, Warning,
    LABEL_POD_NAME,
};
use crate::provision::labels::runtime_labels;

/// One server of one machine being exposed
#[derive(Debug, Clone, Copy)]
pub struct ServerTarget<'a> {
    pub machine: &'a str,
    pub pod: &'a str,
    pub container: &'a str,
    pub server_id: &'a str,
    pub server: &'a ServerConfig,
    /// Service selecting the machine's pod
    pub service: &'a str,
}

/// Service name of a machine
#[must_use]
pub fn service_name(identity: &RuntimeIdentity, pod: &str) -> String {
    dns_label(&format!("{}-{pod}", identity.workspace_id))
}

/// Add `port` to a service unless a port with that number already exists
pub(crate) fn add_service_port(service: &mut Service, name: &str, port: i32, protocol: &str) {
    let ports = service
        .spec
        .get_or_insert_with(ServiceSpec::default)
        .ports
        .get_or_insert_with(Vec::new);
    if ports.iter().any(|p| p.port == port) {
        return;
    }
    ports.push(ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    });
}

pub struct ServerExposer {
    identity: RuntimeIdentity,
    external: ExternalServerExposer,
    secure: Box<dyn SecureServerExposer>,
}

impl ServerExposer {
    pub fn new(
        identity: RuntimeIdentity,
        external: ExternalServerExposer,
        secure: Box<dyn SecureServerExposer>,
    ) -> Self {
        Self {
            identity,
            external,
            secure,
        }
    }

    fn ensure_service(&self, env: &mut KubernetesEnvironment, pod: &str) -> String {
        let name = service_name(&self.identity, pod);
        env.services.entry(name.clone()).or_insert_with(|| Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(runtime_labels(&self.identity)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(
                    LABEL_POD_NAME.to_string(),
                    pod.to_string(),
                )])),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            status: None,
        });
        name
    }

    /// Expose every server of `machine`.
    ///
    /// Secure exposure failures degrade to a warning unless the server is
    /// the workspace's primary server.
    #[instrument(skip(self, env, servers), fields(workspace_id = %self.identity.workspace_id))]
    pub fn expose(
        &mut self,
        env: &mut KubernetesEnvironment,
        machine: &str,
        servers: &BTreeMap<String, ServerConfig>,
    ) -> Result<()> {
        if servers.is_empty() {
            return Ok(());
        }
        let (pod, container) = split_machine_name(machine).ok_or_else(|| {
            Error::Internal(format!("Machine name '{machine}' is not '<pod>/<container>'"))
        })?;
        let service = self.ensure_service(env, pod);

        for (server_id, server) in servers {
            let target = ServerTarget {
                machine,
                pod,
                container,
                server_id,
                server,
                service: &service,
            };

            if server.is_secure() {
                if let Err(e) = self.secure.expose(env, &target, &self.external) {
                    if server.is_primary() {
                        return Err(e);
                    }
                    warn!(machine = %machine, server = %server_id, error = %e, "Secure server exposure failed");
                    env.add_warning(Warning::new(
                        warnings::SECURE_SERVER_EXPOSURE_FAILED,
                        format!("Server '{server_id}' of machine '{machine}' was not exposed: {e}"),
                    ));
                }
                continue;
            }

            let port = server.port_number().ok_or_else(|| {
                Error::Internal(format!(
                    "Server '{server_id}' of machine '{machine}' has invalid port '{}'",
                    server.port
                ))
            })?;
            if let Some(svc) = env.services.get_mut(&service) {
                add_service_port(svc, &format!("srv-{port}"), port, &server.transport());
            }

            if server.is_internal() {
                let url = format!(
                    "{}://{service}:{port}{}",
                    server.protocol,
                    server.path.as_deref().unwrap_or_default()
                );
                external::record(env, &target, &url, false, port, port);
                continue;
            }

            let url = self.external.expose(env, &target, port, port, false);
            info!(machine = %machine, server = %server_id, url = %url, "Exposed server");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExposureConfig, SignerProxySettings};
    use crate::driver::KubernetesDriver;
    use crate::model::machine::{ATTR_INTERNAL, ATTR_PRIMARY, ATTR_SECURE};
    use crate::model::{PodData, Subject};
    use crate::namespace::auth::AuthorizationChecker;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use std::sync::Arc;

    struct AllowAll;

    #[async_trait]
    impl AuthorizationChecker for AllowAll {
        async fn is_authorized(&self, _subject: &Subject) -> Result<bool> {
            Ok(true)
        }
    }

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity::new("ws-1", "user-a", "default", "user-a-workspaces")
    }

    fn exposer(proxy: SignerProxySettings) -> ServerExposer {
        let external = ExternalServerExposer::new(
            identity(),
            ExposureConfig::default(),
            Arc::new(KubernetesDriver::new(Arc::new(AllowAll), None)),
        );
        let secure = SecureExposerFactory::new(proxy).create(&identity()).unwrap();
        ServerExposer::new(identity(), external, secure)
    }

    fn env() -> KubernetesEnvironment {
        let mut env = KubernetesEnvironment::default();
        env.add_pod(PodData::new(
            "workspace",
            PodSpec {
                containers: vec![Container {
                    name: "dev".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        ));
        env
    }

    fn secure(port: &str) -> ServerConfig {
        ServerConfig::new(port, "http").with_attribute(ATTR_SECURE, "true")
    }

    fn ingress_port(env: &KubernetesEnvironment) -> Option<i32> {
        env.ingresses
            .values()
            .next()?
            .spec
            .as_ref()?
            .rules
            .as_ref()?[0]
            .http
            .as_ref()?
            .paths[0]
            .backend
            .service
            .as_ref()?
            .port
            .as_ref()?
            .number
    }

    #[test]
    fn secure_server_is_routed_through_the_proxy() {
        let mut env = env();
        let servers = BTreeMap::from([("ide".to_string(), secure("3100/tcp"))]);
        let mut exposer = exposer(SignerProxySettings::default());
        exposer.expose(&mut env, "workspace/dev", &servers).unwrap();
        exposer.expose(&mut env, "workspace/dev", &servers).unwrap();

        let containers = &env.pods["workspace"].spec.containers;
        assert_eq!(
            containers.iter().filter(|c| c.name == signer::PROXY_CONTAINER_NAME).count(),
            1
        );
        assert_eq!(env.ingresses.len(), 1);
        assert_eq!(ingress_port(&env), Some(4400));

        let service = &env.services["ws-1-workspace"];
        let ports: Vec<i32> = service.spec.as_ref().unwrap().ports.as_ref().unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![4400]);

        let exposed = &env.exposed_servers[0];
        assert!(exposed.secure);
        assert_eq!((exposed.internal_port, exposed.exposed_port), (3100, 4400));
        assert_eq!(env.exposed_servers.len(), 1);
    }

    #[test]
    fn proxy_mounts_only_the_public_key() {
        let mut env = env();
        let servers = BTreeMap::from([("ide".to_string(), secure("3100/tcp"))]);
        exposer(SignerProxySettings::default())
            .expose(&mut env, "workspace/dev", &servers)
            .unwrap();

        let public = &env.secrets[&signer::key_secret_name(&identity())];
        let public = &public.string_data.as_ref().unwrap()[signer::KEY_FILE_KEY];
        assert!(public.contains("PUBLIC KEY"));
        assert!(!public.contains("PRIVATE KEY"));

        let private_name = signer::private_key_secret_name(&identity());
        let private_secret = &env.secrets[&private_name];
        let private = &private_secret.string_data.as_ref().unwrap()[signer::PRIVATE_KEY_FILE_KEY];
        assert!(private.contains("PRIVATE KEY"));

        // The stored private half signs tokens the mounted public half accepts
        let key = signer::signing_key_from_secret(private_secret).unwrap();
        let public_file: token::PublicKeyFile = serde_json::from_str(public).unwrap();
        let verifying = token::VerifyingKey::from_public_key_file(&public_file).unwrap();
        let issued = key
            .issue("user-a", "ws-1", chrono::Duration::minutes(5))
            .unwrap();
        assert!(verifying.verify(&issued, "ws-1").is_ok());

        let mounted: Vec<_> = env.pods["workspace"]
            .spec
            .volumes
            .iter()
            .flatten()
            .filter_map(|v| v.secret.as_ref()?.secret_name.clone())
            .collect();
        assert_eq!(mounted, vec![signer::key_secret_name(&identity())]);
    }

    #[test]
    fn disabled_proxy_passes_secure_servers_through() {
        let mut env = env();
        let servers = BTreeMap::from([("ide".to_string(), secure("3100/tcp"))]);
        let settings = SignerProxySettings {
            enabled: false,
            ..Default::default()
        };
        exposer(settings).expose(&mut env, "workspace/dev", &servers).unwrap();

        assert_eq!(env.pods["workspace"].spec.containers.len(), 1);
        assert_eq!(ingress_port(&env), Some(3100));
        assert!(!env.exposed_servers[0].secure);
        assert!(env.secrets.is_empty());
    }

    #[test]
    fn failed_secure_exposure_degrades_to_warning() {
        let mut env = env();
        let settings = SignerProxySettings {
            port_range_start: 4400,
            port_range_end: 4400,
            ..Default::default()
        };
        let servers = BTreeMap::from([
            ("a-ide".to_string(), secure("3100/tcp")),
            ("b-terminal".to_string(), secure("3200/tcp")),
            ("c-docs".to_string(), ServerConfig::new("8080/tcp", "http")),
        ]);
        exposer(settings).expose(&mut env, "workspace/dev", &servers).unwrap();

        let codes: Vec<u32> = env.warnings().iter().map(|w| w.code).collect();
        assert_eq!(codes, vec![warnings::SECURE_SERVER_EXPOSURE_FAILED]);
        let exposed: Vec<&str> = env.exposed_servers.iter().map(|s| s.server.as_str()).collect();
        assert_eq!(exposed, vec!["a-ide", "c-docs"]);
    }

    #[test]
    fn failed_primary_secure_server_fails_exposure() {
        let mut env = env();
        let servers = BTreeMap::from([(
            "ide".to_string(),
            secure("not-a-port").with_attribute(ATTR_PRIMARY, "true"),
        )]);
        let result = exposer(SignerProxySettings::default()).expose(&mut env, "workspace/dev", &servers);

        assert!(matches!(result, Err(Error::Internal(_))));
        assert!(env.warnings().is_empty());
    }

    #[test]
    fn internal_servers_get_only_the_service() {
        let mut env = env();
        let servers = BTreeMap::from([(
            "db".to_string(),
            ServerConfig::new("5432/tcp", "tcp").with_attribute(ATTR_INTERNAL, "true"),
        )]);
        exposer(SignerProxySettings::default()).expose(&mut env, "workspace/dev", &servers).unwrap();

        assert!(env.ingresses.is_empty());
        assert_eq!(env.exposed_servers[0].url, "tcp://ws-1-workspace:5432");
    }
}
