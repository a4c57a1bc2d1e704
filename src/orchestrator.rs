//! Lifecycle workflows
//!
//! [`Orchestrator`] exposes the four entry points the CLI calls. Each call
//! builds a fresh task tree and a fresh [`ExecutionContext`], probes the
//! cluster from scratch and runs the tree through the task engine. Nothing is
//! carried over between calls.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use reqwest::Url;
use tracing::{info, warn};

use crate::app::{ApplicationClient, CheApiClient, ServerStatus};
use crate::cluster::{create_client, ClusterTransport, KubeTransport, ResourceKind};
use crate::config::{ComponentTargets, OrchestratorConfig};
use crate::context::{Component, DeploymentStatus, Disposition, ExecutionContext};
use crate::installer::{default_factory, InstallerFactory, InstallerStrategy, ProcessRunner};
use crate::platform::{self, Installer};
use crate::probe::ClusterProbe;
use crate::scale::{ScaleSequencer, SCALE_UP_ORDER};
use crate::task::{Renderer, Task, TaskList};
use crate::wait::PodWaiter;
use crate::Error;

/// Config maps removed by the delete workflow
pub const CONFIG_MAPS: [&str; 2] = ["che", "che-operator"];
/// Role bindings removed by the delete workflow
pub const ROLE_BINDINGS: [&str; 4] = [
    "che",
    "che-operator",
    "che-workspace-exec",
    "che-workspace-view",
];
/// Service accounts removed by the delete workflow
pub const SERVICE_ACCOUNTS: [&str; 2] = ["che", "che-workspace"];
/// Persistent volume claims removed by the delete workflow
pub const VOLUME_CLAIMS: [&str; 2] = ["postgres-data", "che-data-volume"];

/// Snapshot returned by [`Orchestrator::status_check`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusReport {
    /// Whether the cluster is OpenShift
    pub is_openshift: bool,
    /// Per-component status
    pub status: DeploymentStatus,
    /// Public Che URL, when the server is ready
    pub url: Option<Url>,
    /// Che server status, when the server is ready
    pub server_status: Option<ServerStatus>,
    /// What a start would do
    pub disposition: Disposition,
}

impl StatusReport {
    /// Whether Che is deployed and ready
    pub fn is_running(&self) -> bool {
        self.disposition == Disposition::AlreadyRunning
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flavor = if self.is_openshift {
            "OpenShift"
        } else {
            "Kubernetes"
        };
        writeln!(f, "{:<18}{}", "Cluster", flavor)?;
        for component in Component::ALL {
            let status = self.status.get(component);
            let state = match (status.is_deployed(), status.is_running(), status.is_ready()) {
                (false, _, _) => "not deployed",
                (true, _, true) => "ready",
                (true, true, false) => "starting",
                (true, false, false) => "stopped",
            };
            match status.resource_kind() {
                Some(kind) => writeln!(f, "{:<18}{} ({})", component.display_name(), state, kind)?,
                None => writeln!(f, "{:<18}{}", component.display_name(), state)?,
            }
        }
        if let Some(url) = &self.url {
            writeln!(f, "{:<18}{}", "URL", url)?;
        }
        if let Some(status) = &self.server_status {
            writeln!(f, "{:<18}{}", "Server status", status)?;
        }
        Ok(())
    }
}

/// Entry point for the start / stop / delete / status workflows
#[derive(Clone)]
pub struct Orchestrator {
    transport: Arc<dyn ClusterTransport>,
    app: Arc<dyn ApplicationClient>,
    installers: InstallerFactory,
    renderer: Arc<dyn Renderer>,
}

impl Orchestrator {
    /// Orchestrator over explicit collaborators
    pub fn new(
        transport: Arc<dyn ClusterTransport>,
        app: Arc<dyn ApplicationClient>,
        installers: InstallerFactory,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            transport,
            app,
            installers,
            renderer,
        }
    }

    /// Orchestrator talking to a real cluster
    pub async fn connect(
        kubeconfig: Option<&Path>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, Error> {
        let client = create_client(kubeconfig).await?;
        let transport: Arc<dyn ClusterTransport> = Arc::new(KubeTransport::new(client));
        let app = Arc::new(CheApiClient::new(transport.clone())?);
        let installers = default_factory(transport.clone(), Arc::new(ProcessRunner));
        Ok(Self::new(transport, app, installers, renderer))
    }

    fn workflow(&self, config: &OrchestratorConfig, installer: Option<Installer>) -> Workflow {
        let probe = ClusterProbe::new(self.transport.clone());
        let waiter = PodWaiter::new(probe.clone(), config.timeouts.clone());
        let targets = config.targets(installer);
        let sequencer = ScaleSequencer::new(
            self.transport.clone(),
            waiter.clone(),
            self.app.clone(),
            targets.clone(),
            config.access_token.clone(),
        );
        Workflow {
            config: Arc::new(config.clone()),
            targets: Arc::new(targets),
            transport: self.transport.clone(),
            app: self.app.clone(),
            probe,
            waiter,
            sequencer,
        }
    }

    /// Bring Che to a running state: install, recover, or report it running
    ///
    /// The platform/installer combination is resolved before anything touches
    /// the cluster; an invalid combination fails without side effects.
    pub async fn start_workflow(
        &self,
        config: &OrchestratorConfig,
    ) -> Result<ExecutionContext, Error> {
        config.validate()?;
        let resolution = platform::resolve(&config.install_request())?;
        for warning in &resolution.warnings {
            warn!("{}", warning);
        }
        let mut config = config.clone();
        config.installer = Some(resolution.installer);
        config.multiuser = resolution.multiuser;
        info!(
            platform = %resolution.platform,
            installer = %resolution.installer,
            multiuser = resolution.multiuser,
            namespace = %config.namespace,
            "starting Che"
        );

        let wf = self.workflow(&config, Some(resolution.installer));
        let installer = (self.installers)(resolution.installer);
        wf.start_tasks(installer)
            .run(ExecutionContext::new(), self.renderer.as_ref())
            .await
    }

    /// Gracefully stop Che by scaling every component to zero
    pub async fn stop_workflow(
        &self,
        config: &OrchestratorConfig,
    ) -> Result<ExecutionContext, Error> {
        config.validate()?;
        let wf = self.workflow(config, config.installer);
        wf.stop_tasks()
            .run(ExecutionContext::new(), self.renderer.as_ref())
            .await
    }

    /// Remove every Che resource from the namespace
    pub async fn delete_workflow(&self, config: &OrchestratorConfig) -> Result<(), Error> {
        config.validate()?;
        let wf = self.workflow(config, config.installer);
        let installers = [
            Installer::Operator,
            Installer::Helm,
            Installer::MinishiftAddon,
        ]
        .map(|installer| (self.installers)(installer));
        wf.delete_tasks(installers)
            .run(ExecutionContext::new(), self.renderer.as_ref())
            .await
            .map(|_| ())
    }

    /// Probe the cluster and report what is there
    pub async fn status_check(&self, config: &OrchestratorConfig) -> Result<StatusReport, Error> {
        config.validate()?;
        let wf = self.workflow(config, config.installer);
        let ctx = wf
            .probe_tasks()
            .run(ExecutionContext::new(), self.renderer.as_ref())
            .await?;
        let disposition = ctx
            .disposition
            .unwrap_or_else(|| Disposition::from_status(&ctx.status));
        Ok(StatusReport {
            is_openshift: ctx.is_openshift,
            status: ctx.status,
            url: ctx.app_url,
            server_status: ctx.server_status,
            disposition,
        })
    }
}

/// Collaborators of one workflow run
#[derive(Clone)]
struct Workflow {
    config: Arc<OrchestratorConfig>,
    targets: Arc<ComponentTargets>,
    transport: Arc<dyn ClusterTransport>,
    app: Arc<dyn ApplicationClient>,
    probe: ClusterProbe,
    waiter: PodWaiter,
    sequencer: ScaleSequencer,
}

impl Workflow {
    fn verify_api_task(&self) -> Task<ExecutionContext> {
        let wf = self.clone();
        Task::new(
            "Verify Kubernetes API",
            move |_ctx: &mut ExecutionContext, title| {
                let wf = wf.clone();
                Box::pin(async move {
                    wf.probe.check_api_reachable().await?;
                    title.append("OK");
                    Ok(())
                })
            },
        )
    }

    fn detect_flavor_task(&self) -> Task<ExecutionContext> {
        let wf = self.clone();
        Task::new(
            "Detect cluster flavor",
            move |ctx: &mut ExecutionContext, title| {
                let wf = wf.clone();
                Box::pin(async move {
                    let flavor = wf.probe.detect_flavor().await?;
                    ctx.is_openshift = flavor.is_openshift;
                    if wf.config.platform.is_openshift_family() && !flavor.is_openshift {
                        warn!(
                            platform = %wf.config.platform,
                            "platform is OpenShift-based but the cluster does not serve OpenShift APIs"
                        );
                    }
                    title.append(if flavor.is_openshift {
                        "OpenShift"
                    } else {
                        "Kubernetes"
                    });
                    Ok(())
                })
            },
        )
    }

    fn probe_components_task(&self) -> Task<ExecutionContext> {
        let wf = self.clone();
        Task::new(
            format!(
                "Verify if Che is deployed in namespace \"{}\"",
                self.targets.namespace
            ),
            move |ctx: &mut ExecutionContext, title| {
                let wf = wf.clone();
                Box::pin(async move {
                    ctx.status = wf
                        .probe
                        .probe_components(&wf.targets, ctx.is_openshift)
                        .await?;
                    let disposition = Disposition::from_status(&ctx.status);
                    ctx.disposition = Some(disposition);
                    title.append(match disposition {
                        Disposition::FreshInstall => "it is not",
                        Disposition::Recover => "it is, but not ready",
                        Disposition::AlreadyRunning => "it is",
                    });
                    Ok(())
                })
            },
        )
    }

    fn server_status_task(&self) -> Task<ExecutionContext> {
        let wf = self.clone();
        Task::new(
            "Check Che server status",
            move |ctx: &mut ExecutionContext, title| {
                let wf = wf.clone();
                Box::pin(async move {
                    let url = wf
                        .app
                        .resolve_public_url(&wf.targets.namespace, ctx.is_openshift)
                        .await?;
                    let status = wf.app.get_status(&url).await?;
                    let auth = wf.app.is_auth_enabled(&url).await?;
                    title.append(format!(
                        "{} (auth {})",
                        status,
                        if auth { "enabled" } else { "disabled" }
                    ));
                    ctx.app_url = Some(url);
                    ctx.server_status = Some(status);
                    ctx.auth_enabled = Some(auth);
                    Ok(())
                })
            },
        )
        .enabled(|ctx: &ExecutionContext| ctx.status.app_server.is_ready())
    }

    /// API check, flavor detection, component probe and server status
    fn probe_tasks(&self) -> TaskList<ExecutionContext> {
        TaskList::new()
            .add(self.verify_api_task())
            .add(self.detect_flavor_task())
            .add(self.probe_components_task())
            .add(self.server_status_task())
    }

    /// Components a fresh install must bring up, in start order
    fn expected_components(&self) -> Vec<Component> {
        SCALE_UP_ORDER
            .into_iter()
            .filter(|component| match component {
                Component::AppServer => true,
                Component::DataStore | Component::IdentityService => self.config.multiuser,
                Component::PluginRegistry | Component::DevfileRegistry => false,
            })
            .collect()
    }

    fn start_tasks(&self, installer: Arc<dyn InstallerStrategy>) -> TaskList<ExecutionContext> {
        let already_running = {
            let wf = self.clone();
            Task::new(
                "Che is already running",
                move |ctx: &mut ExecutionContext, title| {
                    let wf = wf.clone();
                    Box::pin(async move {
                        let url = match &ctx.app_url {
                            Some(url) => url.clone(),
                            None => {
                                wf.app
                                    .resolve_public_url(&wf.targets.namespace, ctx.is_openshift)
                                    .await?
                            }
                        };
                        title.append(url.as_str());
                        ctx.app_url = Some(url);
                        Ok(())
                    })
                },
            )
            .enabled(|ctx: &ExecutionContext| ctx.already_running())
        };

        let recover = Task::nested("Scale Che up", self.sequencer.scale_up_tasks())
            .enabled(|ctx: &ExecutionContext| ctx.needs_recovery());

        let run_installer = {
            let wf = self.clone();
            Task::new(
                format!("Run the Che {} installer", installer.installer()),
                move |_ctx: &mut ExecutionContext, title| {
                    let (wf, installer) = (wf.clone(), installer.clone());
                    Box::pin(async move {
                        installer.install(&wf.config).await?;
                        title.append("done.");
                        Ok(())
                    })
                },
            )
        };
        let mut install = TaskList::new().add(run_installer);
        for component in self.expected_components() {
            let target = self.targets.get(component);
            install.push(Task::nested(
                format!("Wait for {} pod", component),
                self.waiter
                    .pod_start_tasks(&target.selector, &self.targets.namespace),
            ));
        }
        let refresh = {
            let wf = self.clone();
            Task::new(
                "Refresh component status",
                move |ctx: &mut ExecutionContext, _title| {
                    let wf = wf.clone();
                    Box::pin(async move {
                        ctx.status = wf
                            .probe
                            .probe_components(&wf.targets, ctx.is_openshift)
                            .await?;
                        Ok(())
                    })
                },
            )
        };
        let install = Task::nested("Install Che", install.add(refresh))
            .enabled(|ctx: &ExecutionContext| ctx.fresh_install());

        let retrieve_url = {
            let wf = self.clone();
            Task::new(
                "Retrieve Che URL",
                move |ctx: &mut ExecutionContext, title| {
                    let wf = wf.clone();
                    Box::pin(async move {
                        let url = wf
                            .app
                            .resolve_public_url(&wf.targets.namespace, ctx.is_openshift)
                            .await?;
                        title.append(url.as_str());
                        ctx.app_url = Some(url);
                        Ok(())
                    })
                },
            )
        };
        let boot_check = {
            let wf = self.clone();
            Task::new(
                "Che status check",
                move |ctx: &mut ExecutionContext, title| {
                    let wf = wf.clone();
                    Box::pin(async move {
                        let url = ctx.app_url.clone().ok_or_else(|| {
                            Error::internal_with_context("Che status check", "Che URL not resolved")
                        })?;
                        wf.app
                            .wait_until_ready(&url, wf.config.timeouts.server_boot)
                            .await?;
                        ctx.server_status = Some(ServerStatus::Running);
                        title.append("RUNNING");
                        Ok(())
                    })
                },
            )
        };
        let checklist = Task::nested(
            "Post installation checklist",
            TaskList::new().add(retrieve_url).add(boot_check),
        )
        .enabled(|ctx: &ExecutionContext| !ctx.already_running());

        self.probe_tasks()
            .add(already_running)
            .add(recover)
            .add(install)
            .add(checklist)
    }

    fn stop_tasks(&self) -> TaskList<ExecutionContext> {
        let verify_deployed = {
            let wf = self.clone();
            Task::new(
                format!("Verify \"{}\" is deployed", self.targets.app_server.name),
                move |ctx: &mut ExecutionContext, title| {
                    let wf = wf.clone();
                    Box::pin(async move {
                        let kind = ctx.status.app_server.resource_kind().ok_or_else(|| {
                            Error::NotDeployed {
                                name: wf.targets.app_server.name.clone(),
                                namespace: wf.targets.namespace.clone(),
                            }
                        })?;
                        title.append(format!("{} found", kind));
                        Ok(())
                    })
                },
            )
        };
        let already_stopped = Task::new(
            "Che is already stopped",
            |_ctx: &mut ExecutionContext, _title| Box::pin(async { Ok(()) }),
        )
        .enabled(|ctx: &ExecutionContext| ctx.app_server_stopped());
        let scale_down = Task::nested("Scale Che down", self.sequencer.scale_down_tasks())
            .enabled(|ctx: &ExecutionContext| !ctx.app_server_stopped());

        self.probe_tasks()
            .add(verify_deployed)
            .add(already_stopped)
            .add(scale_down)
    }

    fn delete_all_task(&self, title: &str, kind: ResourceKind) -> Task<ExecutionContext> {
        let wf = self.clone();
        Task::new(title, move |_ctx: &mut ExecutionContext, title| {
            let wf = wf.clone();
            Box::pin(async move {
                wf.transport.delete_all(kind, &wf.targets.namespace).await?;
                title.append("done.");
                Ok(())
            })
        })
    }

    fn delete_named_task(
        &self,
        title: &str,
        kind: ResourceKind,
        names: &'static [&'static str],
    ) -> Task<ExecutionContext> {
        let wf = self.clone();
        Task::new(title, move |_ctx: &mut ExecutionContext, title| {
            let wf = wf.clone();
            Box::pin(async move {
                let mut deleted = 0;
                for name in names {
                    if wf
                        .transport
                        .delete_resource(kind, name, &wf.targets.namespace)
                        .await?
                    {
                        deleted += 1;
                    }
                }
                title.append(format!("{} deleted", deleted));
                Ok(())
            })
        })
    }

    /// Run an installer's uninstall; a failure is logged and the run goes on
    fn uninstall_task(&self, installer: Arc<dyn InstallerStrategy>) -> Task<ExecutionContext> {
        let wf = self.clone();
        Task::new(
            format!("Remove the {} installation", installer.installer()),
            move |_ctx: &mut ExecutionContext, title| {
                let (wf, installer) = (wf.clone(), installer.clone());
                Box::pin(async move {
                    match installer.uninstall(&wf.config).await {
                        Ok(()) => title.append("done."),
                        Err(e) => {
                            warn!(installer = %installer.installer(), error = %e, "uninstall failed, continuing");
                            title.append("skipped");
                        }
                    }
                    Ok(())
                })
            },
        )
    }

    fn delete_tasks(
        &self,
        installers: [Arc<dyn InstallerStrategy>; 3],
    ) -> TaskList<ExecutionContext> {
        let [operator, helm, addon] = installers;

        let resources = TaskList::new()
            .add(
                self.delete_all_task(
                    "Delete all deployment configs",
                    ResourceKind::DeploymentConfig,
                )
                .enabled(|ctx: &ExecutionContext| ctx.is_openshift),
            )
            .add(self.delete_all_task("Delete all deployments", ResourceKind::Deployment))
            .add(self.delete_all_task("Delete all services", ResourceKind::Service))
            .add(
                self.delete_all_task("Delete all ingresses", ResourceKind::Ingress)
                    .enabled(|ctx: &ExecutionContext| !ctx.is_openshift),
            )
            .add(
                self.delete_all_task("Delete all routes", ResourceKind::Route)
                    .enabled(|ctx: &ExecutionContext| ctx.is_openshift),
            )
            .add(self.delete_named_task("Delete configmaps", ResourceKind::ConfigMap, &CONFIG_MAPS))
            .add(self.delete_named_task(
                "Delete role bindings",
                ResourceKind::RoleBinding,
                &ROLE_BINDINGS,
            ))
            .add(self.delete_named_task(
                "Delete service accounts",
                ResourceKind::ServiceAccount,
                &SERVICE_ACCOUNTS,
            ))
            .add(self.delete_named_task(
                "Delete persistent volume claims",
                ResourceKind::PersistentVolumeClaim,
                &VOLUME_CLAIMS,
            ));

        TaskList::new()
            .add(self.verify_api_task())
            .add(self.detect_flavor_task())
            .add(self.uninstall_task(operator))
            .add(Task::nested(
                format!(
                    "Delete Che resources in namespace \"{}\"",
                    self.targets.namespace
                ),
                resources,
            ))
            .add(self.uninstall_task(helm))
            .add(self.uninstall_task(addon))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::MockApplicationClient;
    use crate::cluster::MockClusterTransport;
    use crate::config::Timeouts;
    use crate::context::WorkloadKind;
    use crate::installer::MockInstallerStrategy;
    use crate::platform::Platform;
    use crate::task::{RecordingRenderer, SilentRenderer};
    use crate::testing::FakeCluster;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const NS: &str = "che";

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            timeouts: Timeouts {
                pod_wait: Duration::from_millis(100),
                pod_download: Duration::from_millis(100),
                pod_ready: Duration::from_millis(100),
                pod_delete: Duration::from_millis(100),
                server_boot: Duration::from_millis(100),
                shutdown: Duration::from_millis(100),
                poll_interval: Duration::from_millis(5),
            },
            ..OrchestratorConfig::default()
        }
    }

    fn url() -> Url {
        Url::parse("http://che-che.192.168.99.100.nip.io").unwrap()
    }

    fn healthy_app() -> MockApplicationClient {
        let mut app = MockApplicationClient::new();
        app.expect_resolve_public_url().returning(|_, _| Ok(url()));
        app.expect_get_status()
            .returning(|_| Ok(ServerStatus::Running));
        app.expect_is_auth_enabled().returning(|_| Ok(false));
        app.expect_wait_until_ready().returning(|_, _| Ok(()));
        app
    }

    fn no_installer(installer: Installer) -> Arc<dyn InstallerStrategy> {
        let mut mock = MockInstallerStrategy::new();
        mock.expect_installer().return_const(installer);
        mock.expect_install().never();
        mock.expect_uninstall().returning(|_| Ok(()));
        Arc::new(mock)
    }

    fn orchestrator(
        transport: Arc<dyn ClusterTransport>,
        app: MockApplicationClient,
        installers: InstallerFactory,
    ) -> Orchestrator {
        Orchestrator::new(transport, Arc::new(app), installers, Arc::new(SilentRenderer))
    }

    #[tokio::test]
    async fn test_incompatible_request_touches_nothing() {
        // any transport call would panic
        let transport = MockClusterTransport::new();
        let orch = orchestrator(
            Arc::new(transport),
            MockApplicationClient::new(),
            Arc::new(no_installer),
        );
        let mut config = fast_config();
        config.platform = Platform::K8s;
        config.installer = Some(Installer::MinishiftAddon);

        let err = orch.start_workflow(&config).await.unwrap_err();
        assert!(matches!(err, Error::Compatibility { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_connectivity_error() {
        let orch = orchestrator(
            Arc::new(FakeCluster::new(NS).unreachable()),
            MockApplicationClient::new(),
            Arc::new(no_installer),
        );
        let err = orch.status_check(&fast_config()).await.unwrap_err();
        assert!(matches!(err, Error::Connectivity { .. }));
    }

    #[tokio::test]
    async fn test_status_of_running_che() {
        let cluster = FakeCluster::new(NS).with_workload(
            WorkloadKind::Deployment,
            "che",
            "app=che,component=che",
            1,
        );
        let orch = orchestrator(Arc::new(cluster), healthy_app(), Arc::new(no_installer));
        let report = orch.status_check(&fast_config()).await.unwrap();
        assert!(report.is_running());
        assert_eq!(report.url, Some(url()));
        assert_eq!(report.server_status, Some(ServerStatus::Running));
        assert!(report.to_string().contains("ready (Deployment)"));
    }

    #[tokio::test]
    async fn test_status_of_empty_namespace() {
        let orch = orchestrator(
            Arc::new(FakeCluster::new(NS)),
            MockApplicationClient::new(),
            Arc::new(no_installer),
        );
        let report = orch.status_check(&fast_config()).await.unwrap();
        assert_eq!(report.disposition, Disposition::FreshInstall);
        assert_eq!(report.url, None);
        assert!(report.to_string().contains("Che server        not deployed"));
    }

    #[tokio::test]
    async fn test_stop_without_che_is_not_deployed() {
        let orch = orchestrator(
            Arc::new(FakeCluster::new(NS)),
            MockApplicationClient::new(),
            Arc::new(no_installer),
        );
        let err = orch.stop_workflow(&fast_config()).await.unwrap_err();
        match err {
            Error::NotDeployed { name, namespace } => {
                assert_eq!(name, "che");
                assert_eq!(namespace, NS);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stop_already_stopped_issues_no_scale() {
        let cluster = FakeCluster::new(NS).with_workload(
            WorkloadKind::Deployment,
            "che",
            "app=che,component=che",
            0,
        );
        let recorder = RecordingRenderer::default();
        let orch = Orchestrator::new(
            Arc::new(cluster.clone()),
            Arc::new(MockApplicationClient::new()),
            Arc::new(no_installer),
            Arc::new(recorder.clone()),
        );
        orch.stop_workflow(&fast_config()).await.unwrap();
        assert!(cluster.log_matching("scale:").is_empty());
        assert!(recorder
            .events()
            .contains(&"done:0:Che is already stopped".to_string()));
    }

    #[tokio::test]
    async fn test_start_already_running_skips_installer() {
        let cluster = FakeCluster::new(NS).with_workload(
            WorkloadKind::Deployment,
            "che",
            "app=che,component=che",
            1,
        );
        let orch = orchestrator(
            Arc::new(cluster.clone()),
            healthy_app(),
            Arc::new(no_installer),
        );
        let ctx = orch.start_workflow(&fast_config()).await.unwrap();
        assert!(ctx.already_running());
        assert_eq!(ctx.app_url, Some(url()));
        assert!(cluster.log_matching("scale:").is_empty());
    }

    #[tokio::test]
    async fn test_installer_failure_aborts_start() {
        let factory: InstallerFactory = Arc::new(|installer: Installer| {
            let mut mock = MockInstallerStrategy::new();
            mock.expect_installer().return_const(installer);
            mock.expect_install()
                .returning(move |_| Err(Error::installer(installer.as_str(), "chart not found")));
            Arc::new(mock) as Arc<dyn InstallerStrategy>
        });
        let mut app = MockApplicationClient::new();
        app.expect_resolve_public_url().never();
        let orch = orchestrator(Arc::new(FakeCluster::new(NS)), app, factory);

        let mut config = fast_config();
        config.platform = Platform::K8s;
        let err = orch.start_workflow(&config).await.unwrap_err();
        assert!(matches!(err, Error::Installer { .. }));
    }

    #[tokio::test]
    async fn test_operator_forces_multiuser_waits() {
        let installs = Arc::new(AtomicUsize::new(0));
        let counter = installs.clone();
        let cluster = FakeCluster::new(NS).openshift();
        let fake = cluster.clone();
        let factory: InstallerFactory = Arc::new(move |installer: Installer| {
            let counter = counter.clone();
            let fake = fake.clone();
            let mut mock = MockInstallerStrategy::new();
            mock.expect_installer().return_const(installer);
            mock.expect_install().returning(move |config| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert!(config.multiuser);
                for name in ["che", "keycloak", "postgres"] {
                    fake.add_workload(
                        WorkloadKind::Deployment,
                        name,
                        &format!("app=che,component={}", name),
                        1,
                        crate::testing::PodBehavior::Healthy,
                    );
                }
                Ok(())
            });
            Arc::new(mock) as Arc<dyn InstallerStrategy>
        });
        let orch = orchestrator(Arc::new(cluster.clone()), healthy_app(), factory);

        let mut config = fast_config();
        config.platform = Platform::Openshift;
        let ctx = orch.start_workflow(&config).await.unwrap();

        assert_eq!(installs.load(Ordering::SeqCst), 1);
        assert!(ctx.status.data_store.is_ready());
        assert!(ctx.status.identity_service.is_ready());
        assert!(cluster
            .position("pods:app=che,component=postgres:running")
            .is_some());
        assert_eq!(ctx.server_status, Some(ServerStatus::Running));
    }

    #[tokio::test]
    async fn test_delete_on_openshift() {
        let cluster = FakeCluster::new(NS)
            .openshift()
            .with_object(ResourceKind::ConfigMap, "che", serde_json::json!({}))
            .with_object(
                ResourceKind::PersistentVolumeClaim,
                "postgres-data",
                serde_json::json!({}),
            );
        let orch = orchestrator(
            Arc::new(cluster.clone()),
            MockApplicationClient::new(),
            Arc::new(no_installer),
        );
        orch.delete_workflow(&fast_config()).await.unwrap();

        assert_eq!(
            cluster.log_matching("delete-all:"),
            vec![
                "delete-all:DeploymentConfig",
                "delete-all:Deployment",
                "delete-all:Service",
                "delete-all:Route",
            ]
        );
        assert!(!cluster.contains(ResourceKind::ConfigMap, "che"));
        assert!(!cluster.contains(ResourceKind::PersistentVolumeClaim, "postgres-data"));
        assert_eq!(
            cluster.log_matching("delete:RoleBinding/"),
            vec![
                "delete:RoleBinding/che",
                "delete:RoleBinding/che-operator",
                "delete:RoleBinding/che-workspace-exec",
                "delete:RoleBinding/che-workspace-view",
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_tolerates_uninstall_failure() {
        let factory: InstallerFactory = Arc::new(|installer: Installer| {
            let mut mock = MockInstallerStrategy::new();
            mock.expect_installer().return_const(installer);
            mock.expect_uninstall()
                .times(1)
                .returning(move |_| Err(Error::installer(installer.as_str(), "release not found")));
            Arc::new(mock) as Arc<dyn InstallerStrategy>
        });
        let cluster = FakeCluster::new(NS);
        let orch = orchestrator(
            Arc::new(cluster.clone()),
            MockApplicationClient::new(),
            factory,
        );
        orch.delete_workflow(&fast_config()).await.unwrap();
        assert_eq!(
            cluster.log_matching("delete-all:"),
            vec![
                "delete-all:Deployment",
                "delete-all:Service",
                "delete-all:Ingress",
            ]
        );
    }
}
