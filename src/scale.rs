//! Dependency-ordered scaling of the Che components
//!
//! Down: Che server, Keycloak, PostgreSQL, then the registries. Every
//! scale-to-zero waits for the component's pods to be gone before the next
//! component is touched. Before the Che server goes down it is asked to
//! prepare for shutdown when its pod is ready.
//!
//! Up: PostgreSQL, Keycloak, the registries, then the Che server. Every
//! scale-to-one runs the full pod start wait before the next component.
//!
//! Components that are not deployed are skipped in both directions. A failed
//! scale call aborts the sequence; components already scaled stay as they are.

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::ApplicationClient;
use crate::cluster::ClusterTransport;
use crate::config::ComponentTargets;
use crate::context::{Component, ExecutionContext};
use crate::task::{Renderer, Task, TaskList};
use crate::wait::PodWaiter;
use crate::Error;

/// Scale-down order: dependents before their dependencies
pub const SCALE_DOWN_ORDER: [Component; 5] = [
    Component::AppServer,
    Component::IdentityService,
    Component::DataStore,
    Component::DevfileRegistry,
    Component::PluginRegistry,
];

/// Scale-up order: dependencies before their dependents
pub const SCALE_UP_ORDER: [Component; 5] = [
    Component::DataStore,
    Component::IdentityService,
    Component::DevfileRegistry,
    Component::PluginRegistry,
    Component::AppServer,
];

/// Builds and runs the scale sequences
#[derive(Clone)]
pub struct ScaleSequencer {
    transport: Arc<dyn ClusterTransport>,
    waiter: PodWaiter,
    app: Arc<dyn ApplicationClient>,
    targets: Arc<ComponentTargets>,
    access_token: Option<String>,
}

impl ScaleSequencer {
    /// Sequencer for the given components
    pub fn new(
        transport: Arc<dyn ClusterTransport>,
        waiter: PodWaiter,
        app: Arc<dyn ApplicationClient>,
        targets: ComponentTargets,
        access_token: Option<String>,
    ) -> Self {
        Self {
            transport,
            waiter,
            app,
            targets: Arc::new(targets),
            access_token,
        }
    }

    /// Set one component's replica count
    ///
    /// Uses the resource kind the probe recorded. Failures are reported with
    /// the component name.
    pub async fn scale_component(
        &self,
        ctx: &ExecutionContext,
        component: Component,
        replicas: i32,
    ) -> Result<(), Error> {
        let target = self.targets.get(component);
        let namespace = &self.targets.namespace;
        let kind = ctx.status.get(component).resource_kind().ok_or_else(|| {
            Error::internal_with_context(
                "scale_component",
                format!("{} is not deployed", component),
            )
        })?;
        self.transport
            .scale(kind, &target.name, namespace, replicas)
            .await
            .map_err(|source| Error::Scale {
                component: component.display_name().to_string(),
                kind: kind.to_string(),
                name: target.name.clone(),
                namespace: namespace.clone(),
                replicas,
                source: Box::new(source),
            })?;
        info!(component = %component, %kind, name = %target.name, replicas, "scaled component");
        Ok(())
    }

    /// Graceful shutdown handshake
    ///
    /// Fails with [`Error::Coordination`] when the server requires
    /// authentication and no token was given; nothing is sent in that case.
    pub async fn request_graceful_shutdown(&self, ctx: &mut ExecutionContext) -> Result<(), Error> {
        let url = match &ctx.app_url {
            Some(url) => url.clone(),
            None => {
                let url = self
                    .app
                    .resolve_public_url(&self.targets.namespace, ctx.is_openshift)
                    .await?;
                ctx.app_url = Some(url.clone());
                url
            }
        };
        let auth_enabled = match ctx.auth_enabled {
            Some(enabled) => enabled,
            None => {
                let enabled = self.app.is_auth_enabled(&url).await?;
                ctx.auth_enabled = Some(enabled);
                enabled
            }
        };
        if auth_enabled && self.access_token.is_none() {
            return Err(Error::coordination(
                "Che authentication is enabled and an access token needs to be provided (flag --access-token)",
            ));
        }
        self.app
            .request_shutdown(&url, self.access_token.clone())
            .await?;
        self.app
            .wait_until_ready_to_shutdown(&url, self.waiter.timeouts().shutdown)
            .await
    }

    /// Scale-down sequence
    pub fn scale_down_tasks(&self) -> TaskList<ExecutionContext> {
        let mut tasks = TaskList::new();

        let seq = self.clone();
        tasks.push(
            Task::new(
                "Stop Che server and wait until it's ready to shutdown",
                move |ctx: &mut ExecutionContext, title| {
                    let seq = seq.clone();
                    Box::pin(async move {
                        seq.request_graceful_shutdown(ctx).await?;
                        title.append("done.");
                        Ok(())
                    })
                },
            )
            .enabled(|ctx: &ExecutionContext| ctx.status.app_server.is_ready()),
        );

        for component in SCALE_DOWN_ORDER {
            tasks.push(self.scale_down_component(component));
        }
        tasks
    }

    fn scale_down_component(&self, component: Component) -> Task<ExecutionContext> {
        let scale = {
            let seq = self.clone();
            Task::new(
                format!("Scale \"{}\" to zero", self.targets.get(component).name),
                move |ctx: &mut ExecutionContext, title| {
                    let seq = seq.clone();
                    Box::pin(async move {
                        seq.scale_component(ctx, component, 0).await?;
                        title.append("done.");
                        Ok(())
                    })
                },
            )
        };
        let wait = {
            let seq = self.clone();
            Task::new(
                format!("Wait until {} pod is deleted", component),
                move |ctx: &mut ExecutionContext, title| {
                    let seq = seq.clone();
                    Box::pin(async move {
                        let target = seq.targets.get(component);
                        seq.waiter
                            .wait_until_pods_deleted(&target.selector, &seq.targets.namespace)
                            .await?;
                        ctx.status.get_mut(component).mark_stopped();
                        title.append("done.");
                        Ok(())
                    })
                },
            )
        };
        Task::nested(
            format!("Stop {}", component),
            TaskList::new().add(scale).add(wait),
        )
        .enabled(move |ctx: &ExecutionContext| ctx.status.get(component).is_deployed())
    }

    /// Scale-up sequence
    pub fn scale_up_tasks(&self) -> TaskList<ExecutionContext> {
        let mut tasks = TaskList::new();
        for component in SCALE_UP_ORDER {
            tasks.push(self.scale_up_component(component));
        }
        tasks
    }

    fn scale_up_component(&self, component: Component) -> Task<ExecutionContext> {
        let target = self.targets.get(component);
        let scale = {
            let seq = self.clone();
            Task::new(
                format!("Scale \"{}\" to one", target.name),
                move |ctx: &mut ExecutionContext, title| {
                    let seq = seq.clone();
                    Box::pin(async move {
                        seq.scale_component(ctx, component, 1).await?;
                        title.append("done.");
                        Ok(())
                    })
                },
            )
        };
        let wait = Task::nested(
            format!("Wait for {} pod", component),
            self.waiter
                .pod_start_tasks(&target.selector, &self.targets.namespace),
        );
        let mark = Task::new(
            format!("{} is ready", component),
            move |ctx: &mut ExecutionContext, _title| {
                Box::pin(async move {
                    ctx.status.get_mut(component).mark_ready();
                    Ok(())
                })
            },
        );
        Task::nested(
            format!("Start {}", component),
            TaskList::new().add(scale).add(wait).add(mark),
        )
        .enabled(move |ctx: &ExecutionContext| ctx.status.get(component).is_deployed())
    }

    /// Run the scale-down sequence
    pub async fn scale_down(
        &self,
        ctx: &mut ExecutionContext,
        renderer: &dyn Renderer,
    ) -> Result<(), Error> {
        let result = self.scale_down_tasks().execute(ctx, renderer).await;
        if let Err(e) = &result {
            warn!(error = %e, "scale down aborted");
        }
        result
    }

    /// Run the scale-up sequence
    pub async fn scale_up(
        &self,
        ctx: &mut ExecutionContext,
        renderer: &dyn Renderer,
    ) -> Result<(), Error> {
        let result = self.scale_up_tasks().execute(ctx, renderer).await;
        if let Err(e) = &result {
            warn!(error = %e, "scale up aborted");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::MockApplicationClient;
    use crate::cluster::MockClusterTransport;
    use crate::config::{OrchestratorConfig, Timeouts};
    use crate::context::{ComponentStatus, WorkloadKind};
    use crate::probe::ClusterProbe;
    use crate::task::SilentRenderer;
    use crate::testing::{FakeCluster, PodBehavior};
    use reqwest::Url;
    use std::time::Duration;

    const NS: &str = "che";

    fn fast() -> Timeouts {
        Timeouts {
            pod_wait: Duration::from_millis(100),
            pod_download: Duration::from_millis(100),
            pod_ready: Duration::from_millis(100),
            pod_delete: Duration::from_millis(100),
            server_boot: Duration::from_millis(100),
            shutdown: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn sequencer(
        transport: Arc<dyn ClusterTransport>,
        app: MockApplicationClient,
        token: Option<&str>,
    ) -> ScaleSequencer {
        let waiter = PodWaiter::new(ClusterProbe::new(transport.clone()), fast());
        let targets = OrchestratorConfig::default().targets(None);
        ScaleSequencer::new(
            transport,
            waiter,
            Arc::new(app),
            targets,
            token.map(str::to_string),
        )
    }

    /// Full multi-user deployment on plain Kubernetes
    fn full_cluster(replicas: i32) -> FakeCluster {
        let mut cluster = FakeCluster::new(NS);
        for (name, component) in [
            ("che", "che"),
            ("keycloak", "keycloak"),
            ("postgres", "postgres"),
            ("plugin-registry", "plugin-registry"),
            ("devfile-registry", "devfile-registry"),
        ] {
            cluster = cluster.with_workload(
                WorkloadKind::Deployment,
                name,
                &format!("app=che,component={}", component),
                replicas,
            );
        }
        cluster
    }

    fn all_deployed(kind: WorkloadKind) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        for component in Component::ALL {
            *ctx.status.get_mut(component) = ComponentStatus::deployed(kind);
        }
        ctx
    }

    fn no_app() -> MockApplicationClient {
        let mut app = MockApplicationClient::new();
        app.expect_request_shutdown().never();
        app
    }

    #[tokio::test]
    async fn test_scale_up_order() {
        let cluster = full_cluster(0);
        let seq = sequencer(Arc::new(cluster.clone()), no_app(), None);
        let mut ctx = all_deployed(WorkloadKind::Deployment);

        seq.scale_up(&mut ctx, &SilentRenderer).await.unwrap();

        assert_eq!(
            cluster.log_matching("scale:"),
            vec![
                "scale:Deployment/postgres=1",
                "scale:Deployment/keycloak=1",
                "scale:Deployment/devfile-registry=1",
                "scale:Deployment/plugin-registry=1",
                "scale:Deployment/che=1",
            ]
        );
        for component in Component::ALL {
            assert!(ctx.status.get(component).is_ready());
        }
    }

    #[tokio::test]
    async fn test_data_store_ready_before_identity_scaled() {
        let cluster = full_cluster(0);
        let seq = sequencer(Arc::new(cluster.clone()), no_app(), None);
        let mut ctx = all_deployed(WorkloadKind::Deployment);
        seq.scale_up(&mut ctx, &SilentRenderer).await.unwrap();

        let postgres_ready = cluster
            .position("pods:app=che,component=postgres:running")
            .unwrap();
        let keycloak_up = cluster.position("scale:Deployment/keycloak=1").unwrap();
        let che_up = cluster.position("scale:Deployment/che=1").unwrap();
        assert!(postgres_ready < keycloak_up);
        assert!(keycloak_up < che_up);
    }

    #[tokio::test]
    async fn test_scale_down_order_and_waits() {
        let cluster = full_cluster(1);
        let seq = sequencer(Arc::new(cluster.clone()), no_app(), None);
        let mut ctx = all_deployed(WorkloadKind::Deployment);

        seq.scale_down(&mut ctx, &SilentRenderer).await.unwrap();

        assert_eq!(
            cluster.log_matching("scale:"),
            vec![
                "scale:Deployment/che=0",
                "scale:Deployment/keycloak=0",
                "scale:Deployment/postgres=0",
                "scale:Deployment/devfile-registry=0",
                "scale:Deployment/plugin-registry=0",
            ]
        );
        let che_gone = cluster.position("pods:app=che,component=che:gone").unwrap();
        let keycloak_down = cluster.position("scale:Deployment/keycloak=0").unwrap();
        assert!(che_gone < keycloak_down);
        assert!(!ctx.status.app_server.is_running());
    }

    #[tokio::test]
    async fn test_absent_components_are_skipped() {
        let cluster = FakeCluster::new(NS)
            .openshift()
            .with_workload(WorkloadKind::DeploymentConfig, "che", "app=che,component=che", 0);
        let seq = sequencer(Arc::new(cluster.clone()), no_app(), None);
        let mut ctx = ExecutionContext::new();
        ctx.status.app_server = ComponentStatus::deployed(WorkloadKind::DeploymentConfig);

        seq.scale_up(&mut ctx, &SilentRenderer).await.unwrap();
        assert_eq!(
            cluster.log_matching("scale:"),
            vec!["scale:DeploymentConfig/che=1"]
        );
    }

    #[tokio::test]
    async fn test_failure_names_component_and_aborts() {
        let cluster = full_cluster(0).fail_scale_of("keycloak");
        let seq = sequencer(Arc::new(cluster.clone()), no_app(), None);
        let mut ctx = all_deployed(WorkloadKind::Deployment);

        let err = seq.scale_up(&mut ctx, &SilentRenderer).await.unwrap_err();
        assert_eq!(err.component(), Some("Keycloak"));
        match &err {
            Error::Scale {
                kind,
                name,
                namespace,
                replicas,
                ..
            } => {
                assert_eq!(kind, "Deployment");
                assert_eq!(name, "keycloak");
                assert_eq!(namespace, NS);
                assert_eq!(*replicas, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        // postgres stays up, nothing after keycloak is touched
        assert_eq!(cluster.replicas("postgres"), Some(1));
        assert_eq!(cluster.log_matching("scale:").len(), 2);
    }

    #[tokio::test]
    async fn test_readiness_timeout_stops_sequence() {
        let cluster = FakeCluster::new(NS)
            .with_workload_behavior(
                WorkloadKind::Deployment,
                "postgres",
                "app=che,component=postgres",
                0,
                PodBehavior::NeverReady,
            )
            .with_workload(WorkloadKind::Deployment, "che", "app=che,component=che", 0);
        let seq = sequencer(Arc::new(cluster.clone()), no_app(), None);
        let mut ctx = ExecutionContext::new();
        ctx.status.app_server = ComponentStatus::deployed(WorkloadKind::Deployment);
        ctx.status.data_store = ComponentStatus::deployed(WorkloadKind::Deployment);

        let err = seq.scale_up(&mut ctx, &SilentRenderer).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(cluster.position("scale:Deployment/che=1"), None);
    }

    #[tokio::test]
    async fn test_auth_without_token_fails_before_scaling() {
        let mut transport = MockClusterTransport::new();
        transport.expect_scale().never();
        let mut app = MockApplicationClient::new();
        app.expect_request_shutdown().never();

        let seq = sequencer(Arc::new(transport), app, None);
        let mut ctx = all_deployed(WorkloadKind::Deployment);
        ctx.status.app_server.observe_pods(true, true);
        ctx.app_url = Some(Url::parse("https://che.example.com").unwrap());
        ctx.auth_enabled = Some(true);

        let err = seq.scale_down(&mut ctx, &SilentRenderer).await.unwrap_err();
        assert!(matches!(err, Error::Coordination { .. }));
    }

    #[tokio::test]
    async fn test_handshake_with_token() {
        let cluster = full_cluster(1);
        let mut app = MockApplicationClient::new();
        app.expect_resolve_public_url()
            .returning(|_, _| Ok(Url::parse("https://che.example.com").unwrap()));
        app.expect_is_auth_enabled().returning(|_| Ok(true));
        app.expect_request_shutdown()
            .withf(|_, token| token.as_deref() == Some("secret"))
            .times(1)
            .returning(|_, _| Ok(()));
        app.expect_wait_until_ready_to_shutdown()
            .times(1)
            .returning(|_, _| Ok(()));

        let seq = sequencer(Arc::new(cluster.clone()), app, Some("secret"));
        let mut ctx = all_deployed(WorkloadKind::Deployment);
        ctx.status.app_server.observe_pods(true, true);

        seq.scale_down(&mut ctx, &SilentRenderer).await.unwrap();
        assert_eq!(ctx.auth_enabled, Some(true));
        assert_eq!(cluster.replicas("che"), Some(0));
    }

    #[tokio::test]
    async fn test_not_ready_server_skips_handshake() {
        let cluster = full_cluster(1);
        let seq = sequencer(Arc::new(cluster.clone()), no_app(), None);
        let mut ctx = all_deployed(WorkloadKind::Deployment);
        ctx.status.app_server.observe_pods(true, false);

        seq.scale_down(&mut ctx, &SilentRenderer).await.unwrap();
        assert_eq!(cluster.replicas("che"), Some(0));
    }
}
