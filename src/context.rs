//! Execution context threaded through a single workflow run
//!
//! The context is a fixed-shape record. Each task declares which fields it
//! reads and writes; there is no free-form key/value bag. One context lives
//! exactly as long as one workflow call and is never persisted.

use std::fmt;

use reqwest::Url;
use serde::Serialize;

use crate::app::ServerStatus;
use crate::Error;

/// Controller kinds a Che component can be deployed as
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum WorkloadKind {
    /// Portable `apps/v1` Deployment
    Deployment,
    /// OpenShift-only `apps.openshift.io/v1` DeploymentConfig
    DeploymentConfig,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => f.write_str("Deployment"),
            WorkloadKind::DeploymentConfig => f.write_str("DeploymentConfig"),
        }
    }
}

/// Managed components
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Component {
    /// Che server (primary application)
    AppServer,
    /// Keycloak
    IdentityService,
    /// PostgreSQL
    DataStore,
    /// Plugin registry
    PluginRegistry,
    /// Devfile registry
    DevfileRegistry,
}

impl Component {
    /// Every component, application server first
    pub const ALL: [Component; 5] = [
        Component::AppServer,
        Component::IdentityService,
        Component::DataStore,
        Component::PluginRegistry,
        Component::DevfileRegistry,
    ];

    /// Human readable name used in titles and errors
    pub fn display_name(&self) -> &'static str {
        match self {
            Component::AppServer => "Che server",
            Component::IdentityService => "Keycloak",
            Component::DataStore => "PostgreSQL",
            Component::PluginRegistry => "Plugin registry",
            Component::DevfileRegistry => "Devfile registry",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Observed state of one component
///
/// The resource kind is only known for a deployed component, so "deployed"
/// is represented by the presence of the kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    kind: Option<WorkloadKind>,
    running: bool,
    ready: bool,
}

impl ComponentStatus {
    /// A component whose controller was found with the given kind
    pub fn deployed(kind: WorkloadKind) -> Self {
        Self {
            kind: Some(kind),
            running: false,
            ready: false,
        }
    }

    /// Whether a controller exists for this component
    pub fn is_deployed(&self) -> bool {
        self.kind.is_some()
    }

    /// Controller kind, set only when deployed
    pub fn resource_kind(&self) -> Option<WorkloadKind> {
        self.kind
    }

    /// Whether at least one pod exists for the component
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the component's pod reports the Ready condition
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Record pod observations; ignored for components that are not deployed
    pub fn observe_pods(&mut self, running: bool, ready: bool) {
        if self.is_deployed() {
            self.running = running;
            self.ready = running && ready;
        }
    }

    /// Record a completed readiness wait
    pub fn mark_ready(&mut self) {
        self.running = true;
        self.ready = true;
    }

    /// Record a completed scale-to-zero
    pub fn mark_stopped(&mut self) {
        self.running = false;
        self.ready = false;
    }
}

/// Status of every managed component
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentStatus {
    /// Che server
    pub app_server: ComponentStatus,
    /// Keycloak
    pub identity_service: ComponentStatus,
    /// PostgreSQL
    pub data_store: ComponentStatus,
    /// Plugin registry
    pub plugin_registry: ComponentStatus,
    /// Devfile registry
    pub devfile_registry: ComponentStatus,
}

impl DeploymentStatus {
    /// Status of one component
    pub fn get(&self, component: Component) -> &ComponentStatus {
        match component {
            Component::AppServer => &self.app_server,
            Component::IdentityService => &self.identity_service,
            Component::DataStore => &self.data_store,
            Component::PluginRegistry => &self.plugin_registry,
            Component::DevfileRegistry => &self.devfile_registry,
        }
    }

    /// Mutable status of one component
    pub fn get_mut(&mut self, component: Component) -> &mut ComponentStatus {
        match component {
            Component::AppServer => &mut self.app_server,
            Component::IdentityService => &mut self.identity_service,
            Component::DataStore => &mut self.data_store,
            Component::PluginRegistry => &mut self.plugin_registry,
            Component::DevfileRegistry => &mut self.devfile_registry,
        }
    }

    /// Components with a controller, in [`Component::ALL`] order
    pub fn deployed_components(&self) -> Vec<Component> {
        Component::ALL
            .into_iter()
            .filter(|c| self.get(*c).is_deployed())
            .collect()
    }

    /// Check that every deployed component shares the application server's kind
    ///
    /// A mix of Deployments and DeploymentConfigs within one run means the
    /// probe looked at the wrong thing.
    pub fn verify_consistent_kinds(&self) -> Result<(), Error> {
        let Some(expected) = self.app_server.resource_kind() else {
            return Ok(());
        };
        for component in Component::ALL {
            if let Some(found) = self.get(component).resource_kind() {
                if found != expected {
                    return Err(Error::InconsistentFlavor {
                        component: component.display_name().to_string(),
                        expected: expected.to_string(),
                        found: found.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Which start branch a run takes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Disposition {
    /// Che is deployed and ready; nothing to do
    AlreadyRunning,
    /// Che is deployed but not ready; scale up and wait
    Recover,
    /// Che is not deployed; run the installer
    FreshInstall,
}

impl Disposition {
    /// Decide from the probed application server status
    pub fn from_status(status: &DeploymentStatus) -> Self {
        let server = &status.app_server;
        if !server.is_deployed() {
            Disposition::FreshInstall
        } else if server.is_ready() {
            Disposition::AlreadyRunning
        } else {
            Disposition::Recover
        }
    }
}

/// Mutable record shared by every task of one workflow run
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    /// Whether the cluster exposes OpenShift APIs
    pub is_openshift: bool,
    /// Per-component status, written by the probe and the scale sequencer
    pub status: DeploymentStatus,
    /// Public Che server URL, once resolved
    pub app_url: Option<Url>,
    /// Che server status as reported by its API
    pub server_status: Option<ServerStatus>,
    /// Whether the Che server requires authentication
    pub auth_enabled: Option<bool>,
    /// Branch chosen by the start workflow
    pub disposition: Option<Disposition>,
}

impl ExecutionContext {
    /// Fresh context for a new workflow run
    pub fn new() -> Self {
        Self::default()
    }

    /// Che is deployed and ready
    pub fn already_running(&self) -> bool {
        self.disposition == Some(Disposition::AlreadyRunning)
    }

    /// Che is deployed but must be scaled up
    pub fn needs_recovery(&self) -> bool {
        self.disposition == Some(Disposition::Recover)
    }

    /// Che must be installed
    pub fn fresh_install(&self) -> bool {
        self.disposition == Some(Disposition::FreshInstall)
    }

    /// Che server controller exists but none of its pods do
    pub fn app_server_stopped(&self) -> bool {
        self.status.app_server.is_deployed() && !self.status.app_server.is_running()
    }
}
