//! In-memory cluster for tests
//!
//! [`FakeCluster`] implements [`ClusterTransport`] without an API server.
//! Controllers own pods through their selector: scaling to a positive count
//! creates a pod whose state follows the controller's [`PodBehavior`], and
//! scaling to zero removes it. Every mutating call and every pod observation
//! is appended to an ordered log so tests can assert call order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;

use crate::cluster::{ClusterTransport, ResourceKind, CONDITION_READY, STATUS_FALSE, STATUS_TRUE};
use crate::context::WorkloadKind;
use crate::{Error, OPENSHIFT_APPS_GROUP};

/// How a controller's pod behaves once it has replicas
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodBehavior {
    /// Running and Ready immediately
    Healthy,
    /// Never leaves Pending
    StuckPending,
    /// Running but never Ready
    NeverReady,
}

#[derive(Clone, Debug)]
struct Workload {
    kind: WorkloadKind,
    selector: String,
    replicas: i32,
    behavior: PodBehavior,
}

#[derive(Debug, Default)]
struct State {
    openshift: bool,
    unreachable: bool,
    workloads: BTreeMap<String, Workload>,
    objects: BTreeMap<(ResourceKind, String), serde_json::Value>,
    failing_scales: Vec<String>,
    log: Vec<String>,
}

/// In-memory [`ClusterTransport`]
#[derive(Clone, Debug)]
pub struct FakeCluster {
    namespace: String,
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    /// An empty, reachable, plain Kubernetes cluster
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Expose the OpenShift API groups
    pub fn openshift(self) -> Self {
        self.state().openshift = true;
        self
    }

    /// Make every call fail as if the API server were down
    pub fn unreachable(self) -> Self {
        self.state().unreachable = true;
        self
    }

    /// Add a controller with a healthy pod template
    pub fn with_workload(
        self,
        kind: WorkloadKind,
        name: &str,
        selector: &str,
        replicas: i32,
    ) -> Self {
        self.with_workload_behavior(kind, name, selector, replicas, PodBehavior::Healthy)
    }

    /// Add a controller whose pod behaves as given
    pub fn with_workload_behavior(
        self,
        kind: WorkloadKind,
        name: &str,
        selector: &str,
        replicas: i32,
        behavior: PodBehavior,
    ) -> Self {
        self.add_workload(kind, name, selector, replicas, behavior);
        self
    }

    /// Add a controller after construction (installers use this)
    pub fn add_workload(
        &self,
        kind: WorkloadKind,
        name: &str,
        selector: &str,
        replicas: i32,
        behavior: PodBehavior,
    ) {
        self.state().workloads.insert(
            name.to_string(),
            Workload {
                kind,
                selector: selector.to_string(),
                replicas,
                behavior,
            },
        );
    }

    /// Add an arbitrary object (routes, ingresses, config maps)
    pub fn with_object(self, kind: ResourceKind, name: &str, data: serde_json::Value) -> Self {
        self.state().objects.insert((kind, name.to_string()), data);
        self
    }

    /// Make scale calls on the named controller fail
    pub fn fail_scale_of(self, name: &str) -> Self {
        self.state().failing_scales.push(name.to_string());
        self
    }

    /// Ordered call log
    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Log entries starting with `prefix`
    pub fn log_matching(&self, prefix: &str) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| entry.starts_with(prefix))
            .collect()
    }

    /// Position of the first log entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log().iter().position(|e| e == entry)
    }

    /// Current replica count of a controller
    pub fn replicas(&self, name: &str) -> Option<i32> {
        self.state().workloads.get(name).map(|w| w.replicas)
    }

    /// Whether an object (or controller) still exists
    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        let state = self.state();
        state.objects.contains_key(&(kind, name.to_string()))
            || state
                .workloads
                .get(name)
                .is_some_and(|w| ResourceKind::from(w.kind) == kind)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reachable(&self) -> Result<MutexGuard<'_, State>, Error> {
        let state = self.state();
        if state.unreachable {
            return Err(Error::connectivity("connection refused"));
        }
        Ok(state)
    }
}

fn fake_pod(name: &str, behavior: PodBehavior) -> Pod {
    let (phase, ready) = match behavior {
        PodBehavior::Healthy => ("Running", Some(STATUS_TRUE)),
        PodBehavior::NeverReady => ("Running", Some(STATUS_FALSE)),
        PodBehavior::StuckPending => ("Pending", None),
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-0", name)),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
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

#[async_trait]
impl ClusterTransport for FakeCluster {
    async fn check_api(&self) -> Result<(), Error> {
        self.reachable().map(|_| ())
    }

    async fn api_group_exists(&self, group: &str) -> Result<bool, Error> {
        let state = self.reachable()?;
        Ok(state.openshift && group == OPENSHIFT_APPS_GROUP)
    }

    async fn get_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let mut state = self.reachable()?;
        state.log.push(format!("get:{}/{}", kind, name));
        if namespace != self.namespace {
            return Ok(None);
        }
        let found_workload = state
            .workloads
            .get(name)
            .filter(|w| ResourceKind::from(w.kind) == kind)
            .map(|w| serde_json::json!({ "spec": { "replicas": w.replicas } }));
        let data = found_workload.or_else(|| state.objects.get(&(kind, name.to_string())).cloned());
        Ok(data.map(|data| {
            DynamicObject::new(name, &kind.api_resource())
                .within(namespace)
                .data(data)
        }))
    }

    async fn list_pods(&self, selector: &str, namespace: &str) -> Result<Vec<Pod>, Error> {
        let mut state = self.reachable()?;
        if namespace != self.namespace {
            return Ok(Vec::new());
        }
        let pods: Vec<Pod> = state
            .workloads
            .iter()
            .filter(|(_, w)| w.selector == selector && w.replicas > 0)
            .map(|(name, w)| fake_pod(name, w.behavior))
            .collect();
        let observation = if pods.is_empty() {
            "gone"
        } else if pods
            .iter()
            .all(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
        {
            "running"
        } else {
            "pending"
        };
        state.log.push(format!("pods:{}:{}", selector, observation));
        Ok(pods)
    }

    async fn scale(
        &self,
        kind: WorkloadKind,
        name: &str,
        _namespace: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let mut state = self.reachable()?;
        state.log.push(format!("scale:{}/{}={}", kind, name, replicas));
        if state.failing_scales.iter().any(|n| n == name) {
            return Err(Error::internal_with_context("scale", "injected failure"));
        }
        match state.workloads.get_mut(name) {
            Some(workload) if workload.kind == kind => {
                workload.replicas = replicas;
                Ok(())
            }
            _ => Err(Error::internal_with_context(
                "scale",
                format!("{} {} not found", kind, name),
            )),
        }
    }

    async fn delete_all(&self, kind: ResourceKind, _namespace: &str) -> Result<(), Error> {
        let mut state = self.reachable()?;
        state.log.push(format!("delete-all:{}", kind));
        state.objects.retain(|(k, _), _| *k != kind);
        state
            .workloads
            .retain(|_, w| ResourceKind::from(w.kind) != kind);
        Ok(())
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        _namespace: &str,
    ) -> Result<bool, Error> {
        let mut state = self.reachable()?;
        state.log.push(format!("delete:{}/{}", kind, name));
        Ok(state.objects.remove(&(kind, name.to_string())).is_some())
    }

    async fn apply(&self, _namespace: &str, manifest: &serde_json::Value) -> Result<(), Error> {
        let mut state = self.reachable()?;
        let api_version = manifest["apiVersion"].as_str().unwrap_or_default();
        let kind_name = manifest["kind"].as_str().unwrap_or_default();
        let name = manifest["metadata"]["name"].as_str().unwrap_or_default();
        let kind = ResourceKind::from_type_meta(api_version, kind_name).ok_or_else(|| {
            Error::internal_with_context("apply", format!("unknown kind {}", kind_name))
        })?;
        state.log.push(format!("apply:{}/{}", kind, name));
        state
            .objects
            .insert((kind, name.to_string()), manifest.clone());
        Ok(())
    }
}
