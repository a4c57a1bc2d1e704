use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{args, CommandRunner, InstallerStrategy};
use crate::config::OrchestratorConfig;
use crate::platform::Installer;
use crate::Error;

/// Helm release name
pub const RELEASE_NAME: &str = "che";

/// Installs the Che helm chart from the templates directory
#[derive(Clone)]
pub struct HelmInstaller {
    runner: Arc<dyn CommandRunner>,
}

impl HelmInstaller {
    /// Installer running helm through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Location of the chart under the templates directory
    pub fn chart_dir(config: &OrchestratorConfig) -> PathBuf {
        config.install.templates.join("kubernetes").join("helm").join("che")
    }

    /// Arguments of the `helm upgrade --install` call
    pub fn install_args(config: &OrchestratorConfig) -> Vec<String> {
        let chart = Self::chart_dir(config);
        let install = &config.install;
        let mut argv = args([
            "upgrade",
            "--install",
            RELEASE_NAME,
            "--force",
            "--namespace",
            config.namespace.as_str(),
        ]);
        argv.push("--set".into());
        argv.push(format!("cheImage={}", install.che_image));
        argv.push("--set".into());
        argv.push(format!("global.cheWorkspacesNamespace={}", config.namespace));
        if let Some(domain) = &install.domain {
            argv.push("--set".into());
            argv.push(format!("global.ingressDomain={}", domain));
        }
        if let Some(url) = &install.plugin_registry_url {
            argv.push("--set".into());
            argv.push(format!("che.workspace.pluginRegistryUrl={}", url));
        }
        if let Some(url) = &install.devfile_registry_url {
            argv.push("--set".into());
            argv.push(format!("che.workspace.devfileRegistryUrl={}", url));
        }
        if config.multiuser {
            argv.push("-f".into());
            argv.push(chart.join("values").join("multi-user.yaml").display().to_string());
        }
        if install.tls {
            argv.push("-f".into());
            argv.push(chart.join("values").join("tls.yaml").display().to_string());
        }
        argv.push(chart.display().to_string());
        argv
    }

    fn error(message: impl Into<String>) -> Error {
        Error::installer(Installer::Helm.as_str(), message)
    }
}

#[async_trait]
impl InstallerStrategy for HelmInstaller {
    fn installer(&self) -> Installer {
        Installer::Helm
    }

    async fn install(&self, config: &OrchestratorConfig) -> Result<(), Error> {
        if !self.runner.tool_available("helm").await {
            return Err(Self::error("helm is not installed or not on the PATH"));
        }
        let chart = Self::chart_dir(config);
        if !chart.is_dir() {
            return Err(Self::error(format!(
                "chart directory {} does not exist (see --templates)",
                chart.display()
            )));
        }

        let chart_path = chart.display().to_string();
        self.runner
            .run("helm", &args(["dependency", "update", chart_path.as_str()]))
            .await
            .map_err(|e| Self::error(e.to_string()))?;
        self.runner
            .run("helm", &Self::install_args(config))
            .await
            .map_err(|e| Self::error(e.to_string()))?;
        info!(release = RELEASE_NAME, namespace = %config.namespace, "helm release installed");
        Ok(())
    }

    async fn uninstall(&self, _config: &OrchestratorConfig) -> Result<(), Error> {
        if !self.runner.tool_available("helm").await {
            return Ok(());
        }
        if self
            .runner
            .run("helm", &args(["status", RELEASE_NAME]))
            .await
            .is_err()
        {
            return Ok(());
        }
        if let Err(e) = self
            .runner
            .run("helm", &args(["delete", RELEASE_NAME, "--purge"]))
            .await
        {
            warn!(error = %e, "helm delete failed");
            return Err(Self::error(e.to_string()));
        }
        info!(release = RELEASE_NAME, "helm release deleted");
        Ok(())
    }
}
