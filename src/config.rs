//! Workflow configuration
//!
//! [`OrchestratorConfig`] is the validated record every workflow consumes. The
//! CLI builds it from flags; it can also be read from a YAML file, in which
//! case flags given on the command line take precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::context::Component;
use crate::platform::{InstallRequest, Installer, Platform};
use crate::{Error, CHE_APP_SELECTOR, DEFAULT_CHE_IMAGE, DEFAULT_DEPLOYMENT_NAME};
use crate::{DEFAULT_NAMESPACE, DEFAULT_OPERATOR_IMAGE};

/// Polling interval for every bounded wait
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bounds for every wait a workflow performs
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    /// Waiting for a pod to be scheduled
    #[serde(with = "millis")]
    pub pod_wait: Duration,
    /// Waiting for images to be pulled and the pod to run
    #[serde(with = "millis")]
    pub pod_download: Duration,
    /// Waiting for the Ready condition
    #[serde(with = "millis")]
    pub pod_ready: Duration,
    /// Waiting for pods to disappear after a scale to zero
    #[serde(with = "millis")]
    pub pod_delete: Duration,
    /// Waiting for the Che server API to answer after its pod is ready
    #[serde(with = "millis")]
    pub server_boot: Duration,
    /// Waiting for the Che server to become ready to shut down
    #[serde(with = "millis")]
    pub shutdown: Duration,
    /// Interval between polls
    #[serde(with = "millis")]
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pod_wait: Duration::from_millis(300_000),
            pod_download: Duration::from_millis(600_000),
            pod_ready: Duration::from_millis(130_000),
            pod_delete: Duration::from_millis(130_000),
            server_boot: Duration::from_millis(40_000),
            shutdown: Duration::from_millis(60_000),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Parameters only the installer back-ends read
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstallParams {
    /// Che server image
    pub che_image: String,
    /// Directory holding the helm chart and operator templates
    pub templates: PathBuf,
    /// Che operator image
    pub operator_image: String,
    /// CheCluster custom resource to apply instead of the default one
    pub operator_cr_yaml: Option<PathBuf>,
    /// Cluster ingress domain
    pub domain: Option<String>,
    /// Enable TLS
    pub tls: bool,
    /// Allow self-signed certificates
    pub self_signed_cert: bool,
    /// External plugin registry URL
    pub plugin_registry_url: Option<String>,
    /// External devfile registry URL
    pub devfile_registry_url: Option<String>,
}

impl Default for InstallParams {
    fn default() -> Self {
        Self {
            che_image: DEFAULT_CHE_IMAGE.to_string(),
            templates: PathBuf::from("templates"),
            operator_image: DEFAULT_OPERATOR_IMAGE.to_string(),
            operator_cr_yaml: None,
            domain: None,
            tls: false,
            self_signed_cert: false,
            plugin_registry_url: None,
            devfile_registry_url: None,
        }
    }
}

/// Validated configuration for one workflow invocation
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Namespace Che lives in
    pub namespace: String,
    /// Target platform
    pub platform: Platform,
    /// Requested installer, `None` to pick the platform default
    pub installer: Option<Installer>,
    /// Multi-user mode requested
    pub multiuser: bool,
    /// OpenShift OAuth requested
    pub os_oauth: bool,
    /// Name of the Che server controller
    pub deployment_name: String,
    /// Override for the Che server pod selector
    pub che_selector: Option<String>,
    /// Access token for the Che server API
    pub access_token: Option<String>,
    /// Wait bounds
    pub timeouts: Timeouts,
    /// Installer parameters
    pub install: InstallParams,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            platform: Platform::default(),
            installer: None,
            multiuser: false,
            os_oauth: false,
            deployment_name: DEFAULT_DEPLOYMENT_NAME.to_string(),
            che_selector: None,
            access_token: None,
            timeouts: Timeouts::default(),
            install: InstallParams::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the fields the workflows rely on
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.trim().is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        if self.deployment_name.trim().is_empty() {
            return Err(Error::config("deployment name must not be empty"));
        }
        if self.timeouts.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        Ok(())
    }

    /// The installer request handed to the compatibility matrix
    pub fn install_request(&self) -> InstallRequest {
        InstallRequest {
            platform: self.platform,
            installer: self.installer,
            multiuser: self.multiuser,
            os_oauth: self.os_oauth,
        }
    }

    /// Controller names and selectors for every component
    ///
    /// `installer` is the resolved installer when known: the minishift addon
    /// labels the Che server pod with `app=che` only.
    pub fn targets(&self, installer: Option<Installer>) -> ComponentTargets {
        let app_selector = match (&self.che_selector, installer) {
            (Some(selector), _) => selector.clone(),
            (None, Some(Installer::MinishiftAddon)) => CHE_APP_SELECTOR.to_string(),
            (None, _) => format!("{},component=che", CHE_APP_SELECTOR),
        };
        ComponentTargets {
            namespace: self.namespace.clone(),
            app_server: ComponentTarget::new(&self.deployment_name, app_selector),
            identity_service: ComponentTarget::for_component("keycloak"),
            data_store: ComponentTarget::for_component("postgres"),
            plugin_registry: ComponentTarget::for_component("plugin-registry"),
            devfile_registry: ComponentTarget::for_component("devfile-registry"),
        }
    }
}

/// Controller name and pod selector of one component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentTarget {
    /// Deployment / DeploymentConfig name
    pub name: String,
    /// Pod label selector
    pub selector: String,
}

impl ComponentTarget {
    fn new(name: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: selector.into(),
        }
    }

    fn for_component(name: &str) -> Self {
        Self::new(name, format!("{},component={}", CHE_APP_SELECTOR, name))
    }
}

/// Where every component lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentTargets {
    /// Namespace shared by all components
    pub namespace: String,
    /// Che server
    pub app_server: ComponentTarget,
    /// Keycloak
    pub identity_service: ComponentTarget,
    /// PostgreSQL
    pub data_store: ComponentTarget,
    /// Plugin registry
    pub plugin_registry: ComponentTarget,
    /// Devfile registry
    pub devfile_registry: ComponentTarget,
}

impl ComponentTargets {
    /// Target of one component
    pub fn get(&self, component: Component) -> &ComponentTarget {
        match component {
            Component::AppServer => &self.app_server,
            Component::IdentityService => &self.identity_service,
            Component::DataStore => &self.data_store,
            Component::PluginRegistry => &self.plugin_registry,
            Component::DevfileRegistry => &self.devfile_registry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_cli_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.namespace, "che");
        assert_eq!(config.platform, Platform::Minikube);
        assert_eq!(config.timeouts.pod_wait, Duration::from_secs(300));
        assert_eq!(config.timeouts.pod_ready, Duration::from_secs(130));
        assert_eq!(config.timeouts.poll_interval, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_selectors() {
        let config = OrchestratorConfig::default();
        let targets = config.targets(Some(Installer::Helm));
        assert_eq!(targets.app_server.selector, "app=che,component=che");
        assert_eq!(targets.app_server.name, "che");
        assert_eq!(
            targets.get(Component::PluginRegistry).selector,
            "app=che,component=plugin-registry"
        );
        assert_eq!(targets.get(Component::DataStore).name, "postgres");

        let addon = config.targets(Some(Installer::MinishiftAddon));
        assert_eq!(addon.app_server.selector, "app=che");

        let mut custom = config.clone();
        custom.che_selector = Some("app=custom".to_string());
        assert_eq!(
            custom.targets(Some(Installer::MinishiftAddon)).app_server.selector,
            "app=custom"
        );
    }

    #[test]
    fn test_yaml_overrides_and_defaults() {
        let config = OrchestratorConfig::from_yaml(
            r#"
namespace: eclipse-che
platform: openshift
installer: operator
multiuser: true
timeouts:
  podReady: 1000
install:
  tls: true
"#,
        )
        .expect("valid YAML config should parse");
        assert_eq!(config.namespace, "eclipse-che");
        assert_eq!(config.platform, Platform::Openshift);
        assert_eq!(config.installer, Some(Installer::Operator));
        assert_eq!(config.timeouts.pod_ready, Duration::from_secs(1));
        assert_eq!(config.timeouts.pod_wait, Duration::from_secs(300));
        assert!(config.install.tls);
        assert_eq!(config.deployment_name, "che");
    }

    #[test]
    fn test_yaml_validation() {
        assert!(OrchestratorConfig::from_yaml("namespace: \"\"").is_err());
        assert!(OrchestratorConfig::from_yaml("platform: vax").is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "namespace: from-file\nplatform: k8s").expect("write");
        let config = OrchestratorConfig::from_yaml_file(file.path()).expect("parse file");
        assert_eq!(config.namespace, "from-file");
        assert_eq!(config.platform, Platform::K8s);

        let missing = OrchestratorConfig::from_yaml_file(Path::new("/nonexistent/chectl.yaml"));
        assert!(matches!(missing, Err(Error::Config { .. })));
    }
}
