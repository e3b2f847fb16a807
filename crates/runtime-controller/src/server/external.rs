//! External routing of servers: multi-host or single-host

use std::sync::Arc;

use crate::config::{ExposureConfig, ServerStrategy};
use crate::driver::{ExternalRoute, InfrastructureDriver};
use crate::model::{dns_label, ExposedServer, KubernetesEnvironment, RuntimeIdentity};
use crate::provision::labels::runtime_labels;

use super::ServerTarget;

pub struct ExternalServerExposer {
    identity: RuntimeIdentity,
    exposure: ExposureConfig,
    driver: Arc<dyn InfrastructureDriver>,
}

impl ExternalServerExposer {
    pub fn new(
        identity: RuntimeIdentity,
        exposure: ExposureConfig,
        driver: Arc<dyn InfrastructureDriver>,
    ) -> Self {
        Self {
            identity,
            exposure,
            driver,
        }
    }

    /// Single-host devfile endpoints follow their own exposure mode
    fn strategy_for(&self, target: &ServerTarget<'_>) -> ServerStrategy {
        if self.exposure.strategy == ServerStrategy::SingleHost && target.server.is_devfile_endpoint() {
            self.exposure.devfile_endpoint_exposure
        } else {
            self.exposure.strategy
        }
    }

    fn scheme(&self, protocol: &str) -> String {
        match (protocol, self.exposure.tls_enabled) {
            ("ws" | "wss", true) => "wss".to_string(),
            ("ws" | "wss", false) => "ws".to_string(),
            (_, true) => "https".to_string(),
            (_, false) => "http".to_string(),
        }
    }

    /// Route `target` externally to `port` of its service and record the URL.
    ///
    /// `port` is the proxy port for secured servers, the server port otherwise.
    pub fn expose(
        &self,
        env: &mut KubernetesEnvironment,
        target: &ServerTarget<'_>,
        internal_port: i32,
        port: i32,
        secure: bool,
    ) -> String {
        let ws = &self.identity.workspace_id;
        let machine = dns_label(target.machine);
        let server = dns_label(target.server_id);

        let strategy = self.strategy_for(target);
        let (host, path) = match strategy {
            ServerStrategy::MultiHost => (
                Some(format!(
                    "{}.{}",
                    dns_label(&format!("{server}-{ws}-{machine}")),
                    self.exposure.domain
                )),
                "/".to_string(),
            ),
            ServerStrategy::SingleHost => (
                Some(self.exposure.domain.clone()).filter(|d| !d.is_empty()),
                format!("/{ws}/{machine}/{server}/"),
            ),
        };

        let route = ExternalRoute {
            name: dns_label(&format!("{ws}-{machine}-{server}")),
            host: host.clone(),
            path: path.clone(),
            service: target.service.to_string(),
            port,
            labels: runtime_labels(&self.identity),
            tls: self.exposure.tls_enabled,
            strip_prefix: strategy == ServerStrategy::SingleHost,
        };
        self.driver.expose_route(env, &route);

        let suffix = target
            .server
            .path
            .as_deref()
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or_default();
        let url = format!(
            "{}://{}{path}{suffix}",
            self.scheme(&target.server.protocol),
            host.unwrap_or_default()
        );
        record(env, target, &url, secure, internal_port, port);
        url
    }
}

/// Record a server as reachable, replacing a previous record for the same server
pub(crate) fn record(
    env: &mut KubernetesEnvironment,
    target: &ServerTarget<'_>,
    url: &str,
    secure: bool,
    internal_port: i32,
    exposed_port: i32,
) {
    env.exposed_servers
        .retain(|s| !(s.machine == target.machine && s.server == target.server_id));
    env.exposed_servers.push(ExposedServer {
        machine: target.machine.to_string(),
        server: target.server_id.to_string(),
        url: url.to_string(),
        secure,
        internal_port,
        exposed_port,
    });
}
