//! Cluster transport
//!
//! [`ClusterTransport`] is the narrow set of raw API calls the orchestrator
//! needs. "Not found" is a normal outcome at this boundary (`None` / `false`);
//! transport and permission failures are errors.
//!
//! The production implementation is [`KubeTransport`] (kube-rs). Tests use
//! mocks or the in-memory [`crate::testing::FakeCluster`].

mod client;

pub use self::client::{create_client, KubeTransport};

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
#[cfg(test)]
use mockall::automock;

use crate::context::WorkloadKind;
use crate::Error;

/// The "Ready" condition type for pods
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";
/// The "False" status value for conditions
pub const STATUS_FALSE: &str = "False";

/// Kinds of objects the workflows read, scale or delete
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps.openshift.io/v1 DeploymentConfig
    DeploymentConfig,
    /// v1 Service
    Service,
    /// networking.k8s.io/v1 Ingress
    Ingress,
    /// route.openshift.io/v1 Route
    Route,
    /// v1 ConfigMap
    ConfigMap,
    /// rbac.authorization.k8s.io/v1 RoleBinding
    RoleBinding,
    /// v1 ServiceAccount
    ServiceAccount,
    /// v1 PersistentVolumeClaim
    PersistentVolumeClaim,
    /// org.eclipse.che/v1 CheCluster
    CheCluster,
}

impl ResourceKind {
    /// Full API version
    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "apps/v1",
            ResourceKind::DeploymentConfig => "apps.openshift.io/v1",
            ResourceKind::Service
            | ResourceKind::ConfigMap
            | ResourceKind::ServiceAccount
            | ResourceKind::PersistentVolumeClaim => "v1",
            ResourceKind::Ingress => "networking.k8s.io/v1",
            ResourceKind::Route => "route.openshift.io/v1",
            ResourceKind::RoleBinding => "rbac.authorization.k8s.io/v1",
            ResourceKind::CheCluster => "org.eclipse.che/v1",
        }
    }

    /// Kind name as the API server knows it
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::DeploymentConfig => "DeploymentConfig",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Route => "Route",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::CheCluster => "CheCluster",
        }
    }

    /// Look a kind up by its apiVersion and kind strings
    pub fn from_type_meta(api_version: &str, kind: &str) -> Option<Self> {
        ALL_KINDS
            .into_iter()
            .find(|k| k.api_version() == api_version && k.kind() == kind)
    }

    /// ApiResource for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(self.api_version(), self.kind())
    }
}

const ALL_KINDS: [ResourceKind; 10] = [
    ResourceKind::Deployment,
    ResourceKind::DeploymentConfig,
    ResourceKind::Service,
    ResourceKind::Ingress,
    ResourceKind::Route,
    ResourceKind::ConfigMap,
    ResourceKind::RoleBinding,
    ResourceKind::ServiceAccount,
    ResourceKind::PersistentVolumeClaim,
    ResourceKind::CheCluster,
];

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl From<WorkloadKind> for ResourceKind {
    fn from(kind: WorkloadKind) -> Self {
        match kind {
            WorkloadKind::Deployment => ResourceKind::Deployment,
            WorkloadKind::DeploymentConfig => ResourceKind::DeploymentConfig,
        }
    }
}

/// Raw cluster API calls used by the orchestrator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Fail unless the API server answers with our credentials
    async fn check_api(&self) -> Result<(), Error>;

    /// Whether the API server serves the given group
    async fn api_group_exists(&self, group: &str) -> Result<bool, Error>;

    /// Fetch a namespaced object; `None` when it does not exist
    async fn get_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Pods matching a label selector
    async fn list_pods(&self, selector: &str, namespace: &str) -> Result<Vec<Pod>, Error>;

    /// Set a controller's replica count
    async fn scale(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
        replicas: i32,
    ) -> Result<(), Error>;

    /// Delete every object of a kind in a namespace
    async fn delete_all(&self, kind: ResourceKind, namespace: &str) -> Result<(), Error>;

    /// Delete one object; `false` when it did not exist
    async fn delete_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool, Error>;

    /// Create or update an object from its JSON manifest
    async fn apply(&self, namespace: &str, manifest: &serde_json::Value) -> Result<(), Error>;
}

/// Pod phase as reported in `status.phase`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    /// No pod, or no phase reported yet
    Unknown,
    /// Accepted but not all containers running (scheduling, image pulls)
    Pending,
    /// Bound to a node with containers started
    Running,
    /// All containers terminated successfully
    Succeeded,
    /// All containers terminated, at least one failed
    Failed,
}

impl PodPhase {
    /// Parse the API string
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Phase of a pod object
    pub fn of(pod: &Pod) -> Self {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(Self::parse)
            .unwrap_or(PodPhase::Unknown)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Unknown => "Unknown",
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Tri-state condition status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition reported "True"
    True,
    /// Condition reported "False"
    False,
    /// Condition absent or "Unknown"
    Unknown,
}

impl ConditionStatus {
    /// Status of a condition type on a pod
    pub fn of(pod: &Pod, condition_type: &str) -> Self {
        let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_ref());
        match find_condition(conditions.map(|c| c.as_slice()), condition_type) {
            Some(status) if status == STATUS_TRUE => ConditionStatus::True,
            Some(status) if status == STATUS_FALSE => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        }
    }
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Status string of the first condition of the given type
pub fn find_condition<'a, T>(conditions: Option<&'a [T]>, condition_type: &str) -> Option<&'a str>
where
    T: HasConditionFields,
{
    conditions?
        .iter()
        .find(|c| c.type_field() == condition_type)
        .map(|c| c.status_field())
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into (group, version); the core group is ""
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with("ss") || lower.ends_with('x') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else if lower.ends_with('s') {
        format!("{}es", lower)
    } else {
        format!("{}s", lower)
    }
}

/// Translate a kube error
///
/// 401/403 become [`Error::Connectivity`], which is never retried. Everything
/// else, transport blips included, stays a retryable [`Error::Kube`].
pub(crate) fn classify_kube_error(context: &str, err: ::kube::Error) -> Error {
    match &err {
        ::kube::Error::Api(response) if response.code == 401 || response.code == 403 => {
            Error::connectivity(format!(
                "{}: {} ({} {})",
                context, response.message, response.code, response.reason
            ))
        }
        _ => Error::from(err),
    }
}

/// Whether a kube error is a 404
pub(crate) fn is_not_found(err: &::kube::Error) -> bool {
    matches!(err, ::kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    fn pod(phase: Option<&str>, ready: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: phase.map(str::to_string),
                conditions: ready.map(|status| {
                    vec![PodCondition {
                        type_: CONDITION_READY.to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn api_error(code: u16, reason: &str) -> ::kube::Error {
        ::kube::Error::Api(::kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "pods is forbidden".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_auth_failures_are_fatal_connectivity_errors() {
        for code in [401, 403] {
            let err = classify_kube_error("list pods", api_error(code, "Forbidden"));
            assert!(matches!(err, Error::Connectivity { .. }));
            assert!(!err.is_transient());
            assert!(err.to_string().contains("list pods"));
            assert!(err.to_string().contains(&code.to_string()));
        }
    }

    #[test]
    fn test_server_errors_stay_retryable() {
        let err = classify_kube_error("list pods", api_error(500, "InternalError"));
        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_pluralize_kind() {
        assert_eq!(pluralize_kind("Deployment"), "deployments");
        assert_eq!(pluralize_kind("DeploymentConfig"), "deploymentconfigs");
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("Route"), "routes");
        assert_eq!(pluralize_kind("PersistentVolumeClaim"), "persistentvolumeclaims");
        assert_eq!(pluralize_kind("CheCluster"), "checlusters");
    }

    #[test]
    fn test_parse_api_version() {
        assert_eq!(
            parse_api_version("apps.openshift.io/v1"),
            ("apps.openshift.io".to_string(), "v1".to_string())
        );
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn test_api_resources() {
        let dc = ResourceKind::DeploymentConfig.api_resource();
        assert_eq!(dc.group, "apps.openshift.io");
        assert_eq!(dc.plural, "deploymentconfigs");

        let svc = ResourceKind::Service.api_resource();
        assert_eq!(svc.group, "");
        assert_eq!(svc.version, "v1");
    }

    #[test]
    fn test_from_type_meta() {
        assert_eq!(
            ResourceKind::from_type_meta("org.eclipse.che/v1", "CheCluster"),
            Some(ResourceKind::CheCluster)
        );
        assert_eq!(ResourceKind::from_type_meta("v1", "Secret"), None);
        assert_eq!(
            ResourceKind::from(WorkloadKind::DeploymentConfig),
            ResourceKind::DeploymentConfig
        );
    }

    #[test]
    fn test_pod_phase() {
        assert_eq!(PodPhase::of(&pod(Some("Running"), None)), PodPhase::Running);
        assert_eq!(PodPhase::of(&pod(Some("Pending"), None)), PodPhase::Pending);
        assert_eq!(PodPhase::of(&pod(None, None)), PodPhase::Unknown);
        assert_eq!(PodPhase::of(&Pod::default()), PodPhase::Unknown);
    }

    #[test]
    fn test_ready_condition() {
        assert_eq!(
            ConditionStatus::of(&pod(Some("Running"), Some("True")), CONDITION_READY),
            ConditionStatus::True
        );
        assert_eq!(
            ConditionStatus::of(&pod(Some("Running"), Some("False")), CONDITION_READY),
            ConditionStatus::False
        );
        assert_eq!(
            ConditionStatus::of(&pod(Some("Pending"), None), CONDITION_READY),
            ConditionStatus::Unknown
        );
    }
}
