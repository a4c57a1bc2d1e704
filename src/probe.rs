//! Cluster probe
//!
//! Read-only queries answering "is Che there, and in what state". The probe
//! never mutates the cluster.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::{ClusterTransport, ConditionStatus, PodPhase, ResourceKind, CONDITION_READY};
use crate::config::ComponentTargets;
use crate::context::{Component, ComponentStatus, DeploymentStatus, WorkloadKind};
use crate::{Error, OPENSHIFT_APPS_GROUP};

/// Cluster flavor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flavor {
    /// Whether the OpenShift apps API group is served
    pub is_openshift: bool,
}

/// Read-only cluster queries
#[derive(Clone)]
pub struct ClusterProbe {
    transport: Arc<dyn ClusterTransport>,
}

impl ClusterProbe {
    /// Probe through the given transport
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self { transport }
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn ClusterTransport> {
        &self.transport
    }

    /// Fail with [`Error::Connectivity`] unless the API server answers
    pub async fn check_api_reachable(&self) -> Result<(), Error> {
        self.transport.check_api().await.map_err(|e| match e {
            Error::Connectivity { .. } => e,
            other => Error::connectivity(other.to_string()),
        })
    }

    /// Detect whether the cluster is OpenShift
    pub async fn detect_flavor(&self) -> Result<Flavor, Error> {
        let is_openshift = self.transport.api_group_exists(OPENSHIFT_APPS_GROUP).await?;
        debug!(is_openshift, "detected cluster flavor");
        Ok(Flavor { is_openshift })
    }

    /// Find a component's controller
    ///
    /// On OpenShift the DeploymentConfig is looked up first and the Deployment
    /// only when no DeploymentConfig exists. Elsewhere only Deployments are
    /// considered.
    pub async fn component_exists(
        &self,
        name: &str,
        namespace: &str,
        is_openshift: bool,
    ) -> Result<ComponentStatus, Error> {
        if is_openshift
            && self
                .transport
                .get_resource(ResourceKind::DeploymentConfig, name, namespace)
                .await?
                .is_some()
        {
            return Ok(ComponentStatus::deployed(WorkloadKind::DeploymentConfig));
        }
        let found = self
            .transport
            .get_resource(ResourceKind::Deployment, name, namespace)
            .await?;
        Ok(match found {
            Some(_) => ComponentStatus::deployed(WorkloadKind::Deployment),
            None => ComponentStatus::default(),
        })
    }

    /// Whether any pod matches the selector
    pub async fn pods_exist(&self, selector: &str, namespace: &str) -> Result<bool, Error> {
        Ok(!self.transport.list_pods(selector, namespace).await?.is_empty())
    }

    /// Ready condition of the first matching pod
    pub async fn ready_condition_status(
        &self,
        selector: &str,
        namespace: &str,
    ) -> Result<ConditionStatus, Error> {
        let pods = self.transport.list_pods(selector, namespace).await?;
        Ok(pods
            .first()
            .map(|pod| ConditionStatus::of(pod, CONDITION_READY))
            .unwrap_or(ConditionStatus::Unknown))
    }

    /// Phase of the first matching pod
    pub async fn pod_phase(&self, selector: &str, namespace: &str) -> Result<PodPhase, Error> {
        let pods = self.transport.list_pods(selector, namespace).await?;
        Ok(pods.first().map(PodPhase::of).unwrap_or(PodPhase::Unknown))
    }

    /// Probe every component's controller and pods
    ///
    /// The secondary components are only probed when the application server
    /// is deployed; otherwise the returned status is all "not deployed".
    pub async fn probe_components(
        &self,
        targets: &ComponentTargets,
        is_openshift: bool,
    ) -> Result<DeploymentStatus, Error> {
        let mut status = DeploymentStatus::default();
        let namespace = &targets.namespace;

        for component in Component::ALL {
            if component != Component::AppServer && !status.app_server.is_deployed() {
                break;
            }
            let target = targets.get(component);
            let mut found = self
                .component_exists(&target.name, namespace, is_openshift)
                .await?;
            if found.is_deployed() {
                let running = self.pods_exist(&target.selector, namespace).await?;
                let ready = running
                    && self.ready_condition_status(&target.selector, namespace).await?
                        == ConditionStatus::True;
                found.observe_pods(running, ready);
            }
            debug!(
                component = %component,
                deployed = found.is_deployed(),
                running = found.is_running(),
                ready = found.is_ready(),
                "probed component"
            );
            *status.get_mut(component) = found;
        }

        status.verify_consistent_kinds()?;
        if let Some(kind) = status.app_server.resource_kind() {
            info!(%kind, "found Che server controller");
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterTransport;
    use crate::config::OrchestratorConfig;
    use crate::testing::FakeCluster;
    use kube::api::DynamicObject;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn object(kind: ResourceKind, name: &str) -> DynamicObject {
        DynamicObject::new(name, &kind.api_resource())
    }

    fn probe(transport: impl ClusterTransport + 'static) -> ClusterProbe {
        ClusterProbe::new(Arc::new(transport))
    }

    #[tokio::test]
    async fn test_openshift_prefers_deployment_config() {
        let mut mock = MockClusterTransport::new();
        mock.expect_get_resource()
            .with(eq(ResourceKind::DeploymentConfig), eq("che"), eq("che"))
            .times(1)
            .returning(|kind, name, _| Ok(Some(object(kind, name))));
        mock.expect_get_resource()
            .with(eq(ResourceKind::Deployment), eq("che"), eq("che"))
            .never();

        let status = probe(mock).component_exists("che", "che", true).await.unwrap();
        assert_eq!(status.resource_kind(), Some(WorkloadKind::DeploymentConfig));
    }

    #[tokio::test]
    async fn test_openshift_falls_back_to_deployment() {
        let mut mock = MockClusterTransport::new();
        let mut seq = Sequence::new();
        mock.expect_get_resource()
            .with(eq(ResourceKind::DeploymentConfig), eq("che"), eq("che"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(None));
        mock.expect_get_resource()
            .with(eq(ResourceKind::Deployment), eq("che"), eq("che"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|kind, name, _| Ok(Some(object(kind, name))));

        let status = probe(mock).component_exists("che", "che", true).await.unwrap();
        assert_eq!(status.resource_kind(), Some(WorkloadKind::Deployment));
    }

    #[tokio::test]
    async fn test_kubernetes_never_queries_deployment_config() {
        let mut mock = MockClusterTransport::new();
        mock.expect_get_resource()
            .with(eq(ResourceKind::DeploymentConfig), eq("che"), eq("che"))
            .never();
        mock.expect_get_resource()
            .with(eq(ResourceKind::Deployment), eq("che"), eq("che"))
            .times(1)
            .returning(|_, _, _| Ok(None));

        let status = probe(mock).component_exists("che", "che", false).await.unwrap();
        assert!(!status.is_deployed());
    }

    #[tokio::test]
    async fn test_api_errors_propagate() {
        let mut mock = MockClusterTransport::new();
        mock.expect_get_resource()
            .returning(|_, _, _| Err(Error::connectivity("forbidden")));

        let result = probe(mock).component_exists("che", "che", false).await;
        assert!(matches!(result, Err(Error::Connectivity { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_maps_to_connectivity() {
        let mut mock = MockClusterTransport::new();
        mock.expect_check_api()
            .returning(|| Err(Error::internal_with_context("check", "boom")));
        let result = probe(mock).check_api_reachable().await;
        assert!(matches!(result, Err(Error::Connectivity { .. })));
    }

    #[tokio::test]
    async fn test_detect_flavor() {
        let kube = probe(FakeCluster::new("che"));
        assert!(!kube.detect_flavor().await.unwrap().is_openshift);
        let os = probe(FakeCluster::new("che").openshift());
        assert!(os.detect_flavor().await.unwrap().is_openshift);
    }

    #[tokio::test]
    async fn test_no_pods_reads_as_unknown() {
        let p = probe(FakeCluster::new("che"));
        assert_eq!(p.pod_phase("app=che", "che").await.unwrap(), PodPhase::Unknown);
        assert_eq!(
            p.ready_condition_status("app=che", "che").await.unwrap(),
            ConditionStatus::Unknown
        );
        assert!(!p.pods_exist("app=che", "che").await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_skips_secondaries_without_app_server() {
        let cluster = FakeCluster::new("che").with_workload(
            WorkloadKind::Deployment,
            "postgres",
            "app=che,component=postgres",
            1,
        );
        let targets = OrchestratorConfig::default().targets(None);
        let status = probe(cluster.clone())
            .probe_components(&targets, false)
            .await
            .unwrap();
        assert!(!status.data_store.is_deployed());
        assert_eq!(cluster.log_matching("get:"), vec!["get:Deployment/che"]);
    }

    #[tokio::test]
    async fn test_probe_observes_pods() {
        let cluster = FakeCluster::new("che")
            .openshift()
            .with_workload(WorkloadKind::DeploymentConfig, "che", "app=che,component=che", 0)
            .with_workload(
                WorkloadKind::DeploymentConfig,
                "postgres",
                "app=che,component=postgres",
                1,
            );
        let targets = OrchestratorConfig::default().targets(None);
        let status = probe(cluster).probe_components(&targets, true).await.unwrap();
        assert!(status.app_server.is_deployed());
        assert!(!status.app_server.is_running());
        assert!(status.data_store.is_ready());
        assert!(!status.identity_service.is_deployed());
    }

    #[tokio::test]
    async fn test_probe_rejects_mixed_kinds() {
        let cluster = FakeCluster::new("che")
            .openshift()
            .with_workload(WorkloadKind::DeploymentConfig, "che", "app=che,component=che", 1)
            .with_workload(
                WorkloadKind::Deployment,
                "keycloak",
                "app=che,component=keycloak",
                1,
            );
        let targets = OrchestratorConfig::default().targets(None);
        let result = probe(cluster).probe_components(&targets, true).await;
        assert!(matches!(result, Err(Error::InconsistentFlavor { .. })));
    }
}
