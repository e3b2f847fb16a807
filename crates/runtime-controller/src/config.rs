//! Runtime controller configuration
//!
//! Loaded from a mounted YAML file, then overridden by environment
//! variables. Every section has defaults so a missing file still yields a
//! usable (if permissive) configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::retry::RetryConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Cluster flavor, selected once at startup
    #[serde(default)]
    pub infrastructure: InfrastructureKind,

    #[serde(default)]
    pub namespace: NamespaceConfig,

    #[serde(default)]
    pub authorization: AuthorizationConfig,

    #[serde(default)]
    pub workspace: WorkspaceEnvConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub exposure: ExposureConfig,

    #[serde(default, rename = "signerProxy")]
    pub signer_proxy: SignerProxySettings,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default, rename = "stateStore")]
    pub state_store: StateStoreConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InfrastructureKind {
    #[default]
    Kubernetes,
    OpenShift,
}

impl std::str::FromStr for InfrastructureKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "openshift" => Ok(Self::OpenShift),
            other => Err(anyhow::anyhow!("Unknown infrastructure '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamespaceConfig {
    /// Supports `<username>`, `<userid>` and `<workspaceid>` placeholders
    #[serde(default = "default_namespace_template")]
    pub template: String,
}

fn default_namespace_template() -> String {
    "<username>-workspaces".to_string()
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            template: default_namespace_template(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthorizationConfig {
    #[serde(default, rename = "allowUsers")]
    pub allow_users: BTreeSet<String>,
    #[serde(default, rename = "allowGroups")]
    pub allow_groups: BTreeSet<String>,
    #[serde(default, rename = "denyUsers")]
    pub deny_users: BTreeSet<String>,
    #[serde(default, rename = "denyGroups")]
    pub deny_groups: BTreeSet<String>,
}

/// Values injected into every workspace container
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceEnvConfig {
    #[serde(default = "default_logs_root", rename = "logsRootPath")]
    pub logs_root_path: String,

    /// Workspace API endpoint, required to start a runtime
    #[serde(default, rename = "apiEndpoint")]
    pub api_endpoint: Option<String>,
}

fn default_logs_root() -> String {
    "/workspace_logs".to_string()
}

impl Default for WorkspaceEnvConfig {
    fn default() -> Self {
        Self {
            logs_root_path: default_logs_root(),
            api_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PvcStrategy {
    /// One claim per namespace, each workspace volume on its own sub-path
    #[default]
    Common,
    /// One claim per workspace volume
    PerWorkspace,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub strategy: PvcStrategy,

    #[serde(default = "default_common_claim", rename = "commonClaimName")]
    pub common_claim_name: String,

    #[serde(default = "default_claim_size", rename = "claimSize")]
    pub claim_size: String,

    #[serde(default = "default_access_mode", rename = "accessMode")]
    pub access_mode: String,

    /// None lets the cluster pick its default storage class
    #[serde(default, rename = "storageClassName")]
    pub storage_class_name: Option<String>,
}

fn default_common_claim() -> String {
    "claim-workspaces".to_string()
}

fn default_claim_size() -> String {
    "1Gi".to_string()
}

fn default_access_mode() -> String {
    "ReadWriteOnce".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            strategy: PvcStrategy::default(),
            common_claim_name: default_common_claim(),
            claim_size: default_claim_size(),
            access_mode: default_access_mode(),
            storage_class_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerStrategy {
    /// Host per server: `<server>-<workspace>-<machine>.<domain>`
    #[default]
    MultiHost,
    /// Path per server on a single host: `/<workspace>/<machine>/<server>/`
    SingleHost,
}

impl std::str::FromStr for ServerStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "multi-host" => Ok(Self::MultiHost),
            "single-host" => Ok(Self::SingleHost),
            other => Err(anyhow::anyhow!("Unknown server strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExposureConfig {
    #[serde(default)]
    pub strategy: ServerStrategy,

    /// Base domain for multi-host, the host itself for single-host
    #[serde(default)]
    pub domain: String,

    /// How devfile endpoints are exposed when `strategy` is single-host
    #[serde(default, rename = "devfileEndpointExposure")]
    pub devfile_endpoint_exposure: ServerStrategy,

    #[serde(default, rename = "tlsEnabled")]
    pub tls_enabled: bool,

    #[serde(default, rename = "ingressClassName")]
    pub ingress_class_name: Option<String>,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            strategy: ServerStrategy::MultiHost,
            domain: "workspaces.local".to_string(),
            devfile_endpoint_exposure: ServerStrategy::MultiHost,
            tls_enabled: false,
            ingress_class_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignerProxySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_proxy_image")]
    pub image: String,

    /// First port handed out to secured servers
    #[serde(default = "default_port_start", rename = "portRangeStart")]
    pub port_range_start: i32,

    /// Last port (inclusive)
    #[serde(default = "default_port_end", rename = "portRangeEnd")]
    pub port_range_end: i32,

    #[serde(default = "default_memory_limit", rename = "memoryLimit")]
    pub memory_limit: String,

    /// Lifetime of the access tokens issued to workspace owners
    #[serde(default = "default_token_ttl", rename = "tokenTtlSeconds")]
    pub token_ttl_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_proxy_image() -> String {
    "ghcr.io/workspaces-platform/signer-proxy:latest".to_string()
}

fn default_port_start() -> i32 {
    4400
}

fn default_port_end() -> i32 {
    4499
}

fn default_memory_limit() -> String {
    "128Mi".to_string()
}

fn default_token_ttl() -> u64 {
    12 * 3600
}

impl Default for SignerProxySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            image: default_proxy_image(),
            port_range_start: default_port_start(),
            port_range_end: default_port_end(),
            memory_limit: default_memory_limit(),
            token_ttl_seconds: default_token_ttl(),
        }
    }
}

impl SignerProxySettings {
    #[must_use]
    pub fn token_ttl(&self) -> chrono::Duration {
        let seconds = i64::try_from(self.token_ttl_seconds).unwrap_or(i64::MAX);
        chrono::Duration::seconds(seconds.min(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_image")]
    pub image: String,

    /// Plugin registry the broker resolves plugin ids against
    #[serde(default, rename = "registryUrl")]
    pub registry_url: Option<String>,

    /// Controller address the broker posts its reports to
    #[serde(default, rename = "reportUrl")]
    pub report_url: Option<String>,
}

fn default_broker_image() -> String {
    "ghcr.io/workspaces-platform/plugin-broker:latest".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            image: default_broker_image(),
            registry_url: None,
            report_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_start_timeout", rename = "startTimeoutSeconds")]
    pub start_timeout_seconds: u64,

    #[serde(default = "default_stop_grace", rename = "stopGraceSeconds")]
    pub stop_grace_seconds: u64,

    #[serde(default = "default_broker_wait", rename = "brokerWaitSeconds")]
    pub broker_wait_seconds: u64,
}

fn default_start_timeout() -> u64 {
    480
}

fn default_stop_grace() -> u64 {
    30
}

fn default_broker_wait() -> u64 {
    180
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start_timeout_seconds: default_start_timeout(),
            stop_grace_seconds: default_stop_grace(),
            broker_wait_seconds: default_broker_wait(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }

    #[must_use]
    pub fn broker_wait(&self) -> Duration {
        Duration::from_secs(self.broker_wait_seconds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStoreKind {
    #[default]
    ConfigMap,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateStoreConfig {
    #[serde(default)]
    pub kind: StateStoreKind,

    /// Namespace holding the runtime state ConfigMaps
    #[serde(default = "default_state_namespace")]
    pub namespace: String,
}

fn default_state_namespace() -> String {
    "workspaces-system".to_string()
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            kind: StateStoreKind::ConfigMap,
            namespace: default_state_namespace(),
        }
    }
}

fn split_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ControllerConfig {
    /// Load configuration from mounted file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(yaml).map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), anyhow::Error> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WORKSPACE_INFRASTRUCTURE") {
            self.infrastructure = v.parse()?;
        }
        if let Some(v) = lookup("WORKSPACE_NAMESPACE_TEMPLATE") {
            self.namespace.template = v;
        }
        if let Some(v) = lookup("WORKSPACE_ALLOW_USERS") {
            self.authorization.allow_users = split_list(&v);
        }
        if let Some(v) = lookup("WORKSPACE_ALLOW_GROUPS") {
            self.authorization.allow_groups = split_list(&v);
        }
        if let Some(v) = lookup("WORKSPACE_DENY_USERS") {
            self.authorization.deny_users = split_list(&v);
        }
        if let Some(v) = lookup("WORKSPACE_DENY_GROUPS") {
            self.authorization.deny_groups = split_list(&v);
        }
        if let Some(v) = lookup("WORKSPACE_LOGS_ROOT_PATH") {
            self.workspace.logs_root_path = v;
        }
        if let Some(v) = lookup("WORKSPACE_API_ENDPOINT") {
            self.workspace.api_endpoint = Some(v);
        }
        if let Some(v) = lookup("WORKSPACE_SERVER_STRATEGY") {
            self.exposure.strategy = v.parse()?;
        }
        if let Some(v) = lookup("WORKSPACE_INGRESS_DOMAIN") {
            self.exposure.domain = v;
        }
        if let Some(v) = lookup("WORKSPACE_DEVFILE_ENDPOINT_EXPOSURE") {
            self.exposure.devfile_endpoint_exposure = v.parse()?;
        }
        if let Some(v) = lookup("WORKSPACE_SIGNER_PROXY_ENABLED") {
            self.signer_proxy.enabled = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid WORKSPACE_SIGNER_PROXY_ENABLED '{v}': {e}"))?;
        }
        if let Some(v) = lookup("WORKSPACE_SIGNER_PROXY_IMAGE") {
            self.signer_proxy.image = v;
        }
        Ok(())
    }

    /// Load the mounted file when present, defaults otherwise.
    ///
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load(config_path: &str) -> Result<Self, anyhow::Error> {
        if std::path::Path::new(config_path).exists() {
            Self::from_mounted_file(config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate that the configuration can drive a runtime start
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self
            .workspace
            .api_endpoint
            .as_deref()
            .is_none_or(|e| e.trim().is_empty())
        {
            return Err(anyhow::anyhow!(
                "workspace.apiEndpoint is required to start runtimes"
            ));
        }

        let template = &self.namespace.template;
        if !template.contains("<username>") && !template.contains("<userid>") {
            return Err(anyhow::anyhow!(
                "Namespace template '{template}' must contain <username> or <userid> so names stay unique per tenant"
            ));
        }

        let needs_domain = self.exposure.strategy == ServerStrategy::MultiHost
            || self.exposure.devfile_endpoint_exposure == ServerStrategy::MultiHost;
        if needs_domain && self.exposure.domain.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "exposure.domain is required for multi-host server exposure"
            ));
        }

        if self.signer_proxy.enabled {
            if self.signer_proxy.image.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "signerProxy.image must be set when the signer proxy is enabled"
                ));
            }
            if self.signer_proxy.port_range_start > self.signer_proxy.port_range_end
                || self.signer_proxy.port_range_start < 1
                || self.signer_proxy.port_range_end > 65535
            {
                return Err(anyhow::anyhow!(
                    "signerProxy port range {}-{} is empty or invalid",
                    self.signer_proxy.port_range_start,
                    self.signer_proxy.port_range_end
                ));
            }
            if self.signer_proxy.token_ttl_seconds == 0 {
                return Err(anyhow::anyhow!(
                    "signerProxy.tokenTtlSeconds must be greater than zero"
                ));
            }
        }

        if self.timeouts.start_timeout_seconds == 0
            || self.timeouts.stop_grace_seconds == 0
            || self.timeouts.broker_wait_seconds == 0
        {
            return Err(anyhow::anyhow!("Timeouts must be greater than zero"));
        }

        Ok(())
    }
}
