//! Infrastructure variants sharing one orchestration skeleton.
//!
//! A driver is selected once from configuration. It decides what a tenant
//! namespace object looks like, how a server is routed externally (Ingress
//! or Route) and whether a subject may use the cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::cluster::ClusterClient;
use crate::config::{ControllerConfig, InfrastructureKind};
use crate::error::Result;
use crate::model::route::{RoutePort, RouteTargetReference, RouteTls};
use crate::model::{KubernetesEnvironment, Route, RouteSpec, Subject};
use crate::namespace::auth::{AuthorizationChecker, ClusterGroupResolver, ListAuthorizationChecker};
use crate::namespace::{ANNOTATION_USERNAME, ANNOTATION_USER_ID, LABEL_NAMESPACE_ROLE, NAMESPACE_ROLE};

const NGINX_REWRITE_TARGET: &str = "nginx.ingress.kubernetes.io/rewrite-target";
const NGINX_USE_REGEX: &str = "nginx.ingress.kubernetes.io/use-regex";
const HAPROXY_REWRITE_TARGET: &str = "haproxy.router.openshift.io/rewrite-target";

/// External route to a service port
#[derive(Debug, Clone)]
pub struct ExternalRoute {
    pub name: String,
    /// `None` routes every host
    pub host: Option<String>,
    pub path: String,
    pub service: String,
    pub port: i32,
    pub labels: BTreeMap<String, String>,
    pub tls: bool,
    /// Forward requests with `path` replaced by `/`
    pub strip_prefix: bool,
}

#[async_trait]
pub trait InfrastructureDriver: Send + Sync {
    fn kind(&self) -> InfrastructureKind;

    /// Desired namespace object for a computed name
    fn resolve_namespace(&self, name: &str, subject: &Subject) -> Namespace;

    /// Add the routing object for `route` to the environment
    fn expose_route(&self, env: &mut KubernetesEnvironment, route: &ExternalRoute);

    async fn authorize(&self, subject: &Subject) -> Result<bool>;
}

fn tenant_namespace(name: &str, subject: &Subject, extra: &[(&str, String)]) -> Namespace {
    let mut annotations = BTreeMap::from([
        (ANNOTATION_USERNAME.to_string(), subject.user_name.clone()),
        (ANNOTATION_USER_ID.to_string(), subject.user_id.clone()),
    ]);
    for (key, value) in extra {
        annotations.insert((*key).to_string(), value.clone());
    }
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_NAMESPACE_ROLE.to_string(),
                NAMESPACE_ROLE.to_string(),
            )])),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct KubernetesDriver {
    authorizer: Arc<dyn AuthorizationChecker>,
    ingress_class: Option<String>,
}

impl KubernetesDriver {
    pub fn new(authorizer: Arc<dyn AuthorizationChecker>, ingress_class: Option<String>) -> Self {
        Self {
            authorizer,
            ingress_class,
        }
    }
}

#[async_trait]
impl InfrastructureDriver for KubernetesDriver {
    fn kind(&self) -> InfrastructureKind {
        InfrastructureKind::Kubernetes
    }

    fn resolve_namespace(&self, name: &str, subject: &Subject) -> Namespace {
        tenant_namespace(name, subject, &[])
    }

    fn expose_route(&self, env: &mut KubernetesEnvironment, route: &ExternalRoute) {
        let (path, path_type, annotations) = if route.strip_prefix {
            (
                format!("{}(.*)", route.path),
                "ImplementationSpecific",
                Some(BTreeMap::from([
                    (NGINX_REWRITE_TARGET.to_string(), "/$1".to_string()),
                    (NGINX_USE_REGEX.to_string(), "true".to_string()),
                ])),
            )
        } else {
            (route.path.clone(), "Prefix", None)
        };
        let path = HTTPIngressPath {
            path: Some(path),
            path_type: path_type.to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: route.service.clone(),
                    port: Some(ServiceBackendPort {
                        number: Some(route.port),
                        name: None,
                    }),
                }),
                resource: None,
            },
        };
        let tls = match (&route.host, route.tls) {
            (Some(host), true) => Some(vec![IngressTLS {
                hosts: Some(vec![host.clone()]),
                secret_name: None,
            }]),
            _ => None,
        };
        let ingress = Ingress {
            metadata: ObjectMeta {
                name: Some(route.name.clone()),
                labels: Some(route.labels.clone()),
                annotations,
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: self.ingress_class.clone(),
                rules: Some(vec![IngressRule {
                    host: route.host.clone(),
                    http: Some(HTTPIngressRuleValue { paths: vec![path] }),
                }]),
                tls,
                ..Default::default()
            }),
            status: None,
        };
        env.ingresses.insert(route.name.clone(), ingress);
    }

    async fn authorize(&self, subject: &Subject) -> Result<bool> {
        self.authorizer.is_authorized(subject).await
    }
}

pub struct OpenShiftDriver {
    authorizer: Arc<dyn AuthorizationChecker>,
}

impl OpenShiftDriver {
    pub fn new(authorizer: Arc<dyn AuthorizationChecker>) -> Self {
        Self { authorizer }
    }
}

#[async_trait]
impl InfrastructureDriver for OpenShiftDriver {
    fn kind(&self) -> InfrastructureKind {
        InfrastructureKind::OpenShift
    }

    fn resolve_namespace(&self, name: &str, subject: &Subject) -> Namespace {
        tenant_namespace(
            name,
            subject,
            &[
                ("openshift.io/display-name", name.to_string()),
                ("openshift.io/requester", subject.user_name.clone()),
            ],
        )
    }

    fn expose_route(&self, env: &mut KubernetesEnvironment, route: &ExternalRoute) {
        let spec = RouteSpec {
            host: route.host.clone(),
            path: Some(route.path.clone()),
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name: route.service.clone(),
            },
            port: Some(RoutePort {
                target_port: IntOrString::Int(route.port),
            }),
            tls: route.tls.then(|| RouteTls {
                termination: "edge".to_string(),
                insecure_edge_termination_policy: Some("Redirect".to_string()),
            }),
        };
        let mut object = Route::new(&route.name, spec);
        object.metadata.labels = Some(route.labels.clone());
        if route.strip_prefix {
            object.metadata.annotations = Some(BTreeMap::from([(
                HAPROXY_REWRITE_TARGET.to_string(),
                "/".to_string(),
            )]));
        }
        env.routes.insert(route.name.clone(), object);
    }

    async fn authorize(&self, subject: &Subject) -> Result<bool> {
        self.authorizer.is_authorized(subject).await
    }
}

/// Select the driver for the configured infrastructure
pub fn from_config(
    config: &ControllerConfig,
    cluster: Arc<dyn ClusterClient>,
) -> Arc<dyn InfrastructureDriver> {
    let authorizer: Arc<dyn AuthorizationChecker> = Arc::new(ListAuthorizationChecker::new(
        &config.authorization,
        Arc::new(ClusterGroupResolver::new(cluster)),
    ));
    match config.infrastructure {
        InfrastructureKind::Kubernetes => Arc::new(KubernetesDriver::new(
            authorizer,
            config.exposure.ingress_class_name.clone(),
        )),
        InfrastructureKind::OpenShift => Arc::new(OpenShiftDriver::new(authorizer)),
    }
}
