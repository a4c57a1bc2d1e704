//! kube-rs implementation of [`ClusterTransport`]

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use tracing::{debug, trace};

use super::{build_api_resource, classify_kube_error, is_not_found, ClusterTransport, ResourceKind};
use crate::context::WorkloadKind;
use crate::Error;

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "chectl";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
///
/// Without a path the configuration is inferred (KUBECONFIG, ~/.kube/config,
/// then in-cluster).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::connectivity(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::connectivity(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::connectivity(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::connectivity(format!("failed to create client: {}", e)))
}

/// [`ClusterTransport`] backed by a kube client
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

#[async_trait]
impl ClusterTransport for KubeTransport {
    async fn check_api(&self) -> Result<(), Error> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| classify_kube_error("API server unreachable", e))?;
        debug!(version = %info.git_version, "API server reachable");
        Ok(())
    }

    async fn api_group_exists(&self, group: &str) -> Result<bool, Error> {
        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|e| classify_kube_error("failed to list API groups", e))?;
        Ok(groups.groups.iter().any(|g| g.name == group))
    }

    async fn get_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let api = self.dynamic_api(kind, namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(classify_kube_error(
                &format!("failed to get {} {}/{}", kind, namespace, name),
                e,
            )),
        }
    }

    async fn list_pods(&self, selector: &str, namespace: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| {
                classify_kube_error(&format!("failed to list pods {} in {}", selector, namespace), e)
            })?;
        trace!(selector, count = pods.items.len(), "listed pods");
        Ok(pods.items)
    }

    async fn scale(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let api = self.dynamic_api(kind.into(), namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                classify_kube_error(
                    &format!("failed to scale {} {}/{} to {}", kind, namespace, name, replicas),
                    e,
                )
            })?;
        debug!(%kind, name, namespace, replicas, "scaled");
        Ok(())
    }

    async fn delete_all(&self, kind: ResourceKind, namespace: &str) -> Result<(), Error> {
        let api = self.dynamic_api(kind, namespace);
        match api
            .delete_collection(&DeleteParams::default(), &ListParams::default())
            .await
        {
            Ok(_) => Ok(()),
            // The kind is not served here (e.g. routes on plain Kubernetes)
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify_kube_error(
                &format!("failed to delete {} in {}", kind, namespace),
                e,
            )),
        }
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool, Error> {
        let api = self.dynamic_api(kind, namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(classify_kube_error(
                &format!("failed to delete {} {}/{}", kind, namespace, name),
                e,
            )),
        }
    }

    async fn apply(&self, namespace: &str, manifest: &serde_json::Value) -> Result<(), Error> {
        let api_version = manifest["apiVersion"]
            .as_str()
            .ok_or_else(|| Error::internal_with_context("apply", "manifest missing apiVersion"))?;
        let kind = manifest["kind"]
            .as_str()
            .ok_or_else(|| Error::internal_with_context("apply", "manifest missing kind"))?;
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or_else(|| Error::internal_with_context("apply", "manifest missing metadata.name"))?;

        let api_resource = build_api_resource(api_version, kind);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &api_resource);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(manifest),
        )
        .await
        .map_err(|e| {
            classify_kube_error(&format!("failed to apply {} {}/{}", kind, namespace, name), e)
        })?;
        debug!(kind, name, namespace, "applied");
        Ok(())
    }
}
