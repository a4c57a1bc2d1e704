use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{split_image, InstallerStrategy};
use crate::cluster::{ClusterTransport, ResourceKind};
use crate::config::OrchestratorConfig;
use crate::platform::Installer;
use crate::Error;

/// Name of the operator deployment and its service account
pub const OPERATOR_NAME: &str = "che-operator";
/// Name of the default CheCluster resource
pub const CHE_CLUSTER_NAME: &str = "eclipse-che";

/// Deploys the Che operator and hands it a `CheCluster` resource
#[derive(Clone)]
pub struct OperatorInstaller {
    transport: Arc<dyn ClusterTransport>,
}

impl OperatorInstaller {
    /// Installer applying resources through `transport`
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self { transport }
    }

    fn error(message: impl Into<String>) -> Error {
        Error::installer(Installer::Operator.as_str(), message)
    }

    /// Operator service account
    pub fn service_account(config: &OrchestratorConfig) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": { "name": OPERATOR_NAME, "namespace": config.namespace }
        })
    }

    /// Operator deployment
    pub fn operator_deployment(config: &OrchestratorConfig) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": OPERATOR_NAME,
                "namespace": config.namespace,
                "labels": { "app": OPERATOR_NAME }
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": OPERATOR_NAME } },
                "template": {
                    "metadata": { "labels": { "app": OPERATOR_NAME } },
                    "spec": {
                        "serviceAccountName": OPERATOR_NAME,
                        "containers": [{
                            "name": OPERATOR_NAME,
                            "image": config.install.operator_image,
                            "imagePullPolicy": "Always",
                            "env": [
                                { "name": "WATCH_NAMESPACE", "value": config.namespace },
                                { "name": "OPERATOR_NAME", "value": OPERATOR_NAME }
                            ]
                        }]
                    }
                }
            }
        })
    }

    /// Default `CheCluster` built from the configuration
    pub fn default_che_cluster(config: &OrchestratorConfig) -> Value {
        let install = &config.install;
        let (image, tag) = split_image(&install.che_image);
        json!({
            "apiVersion": ResourceKind::CheCluster.api_version(),
            "kind": ResourceKind::CheCluster.kind(),
            "metadata": { "name": CHE_CLUSTER_NAME, "namespace": config.namespace },
            "spec": {
                "server": {
                    "cheImage": image,
                    "cheImageTag": tag,
                    "tlsSupport": install.tls,
                    "selfSignedCert": install.self_signed_cert,
                    "pluginRegistryUrl": install.plugin_registry_url.clone().unwrap_or_default(),
                    "devfileRegistryUrl": install.devfile_registry_url.clone().unwrap_or_default()
                },
                "database": { "externalDb": false },
                "auth": {
                    "openShiftoAuth": config.os_oauth,
                    "externalKeycloak": false
                },
                "k8s": { "ingressDomain": install.domain.clone().unwrap_or_default() }
            }
        })
    }

    fn che_cluster(config: &OrchestratorConfig) -> Result<Value, Error> {
        let Some(path) = &config.install.operator_cr_yaml else {
            return Ok(Self::default_che_cluster(config));
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| Self::error(format!("failed to read {}: {}", path.display(), e)))?;
        let cr: Value = serde_yaml::from_str(&content)
            .map_err(|e| Self::error(format!("invalid CheCluster {}: {}", path.display(), e)))?;
        if cr["kind"].as_str() != Some(ResourceKind::CheCluster.kind()) {
            return Err(Self::error(format!(
                "{} does not contain a CheCluster resource",
                path.display()
            )));
        }
        Ok(cr)
    }
}

#[async_trait]
impl InstallerStrategy for OperatorInstaller {
    fn installer(&self) -> Installer {
        Installer::Operator
    }

    async fn install(&self, config: &OrchestratorConfig) -> Result<(), Error> {
        let cr = Self::che_cluster(config)?;
        for manifest in [
            Self::service_account(config),
            Self::operator_deployment(config),
            cr,
        ] {
            self.transport
                .apply(&config.namespace, &manifest)
                .await
                .map_err(|e| Self::error(e.to_string()))?;
        }
        info!(namespace = %config.namespace, image = %config.install.operator_image, "Che operator deployed");
        Ok(())
    }

    async fn uninstall(&self, config: &OrchestratorConfig) -> Result<(), Error> {
        let ns = &config.namespace;
        for (kind, name) in [
            (ResourceKind::CheCluster, CHE_CLUSTER_NAME),
            (ResourceKind::Deployment, OPERATOR_NAME),
            (ResourceKind::ServiceAccount, OPERATOR_NAME),
        ] {
            let deleted = self
                .transport
                .delete_resource(kind, name, ns)
                .await
                .map_err(|e| Self::error(e.to_string()))?;
            if deleted {
                info!(%kind, name, namespace = %ns, "deleted");
            }
        }
        Ok(())
    }
}
