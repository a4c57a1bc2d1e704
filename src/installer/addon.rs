use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{args, split_image, CommandRunner, InstallerStrategy};
use crate::config::OrchestratorConfig;
use crate::platform::Installer;
use crate::Error;

const ADDON_NAME: &str = "che";

/// Installs Che through the minishift `che` addon (single-user only)
#[derive(Clone)]
pub struct MinishiftAddonInstaller {
    runner: Arc<dyn CommandRunner>,
}

impl MinishiftAddonInstaller {
    /// Installer running minishift through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn error(message: impl Into<String>) -> Error {
        Error::installer(Installer::MinishiftAddon.as_str(), message)
    }

    /// Arguments of the `minishift addons apply` call
    pub fn apply_args(config: &OrchestratorConfig) -> Vec<String> {
        let (repo, tag) = match split_image(&config.install.che_image) {
            (repo, "") => (repo, "latest"),
            split => split,
        };
        let mut argv = args(["addons", "apply"]);
        for env in [
            format!("NAMESPACE={}", config.namespace),
            format!("CHE_IMAGE_REPO={}", repo),
            format!("CHE_IMAGE_TAG={}", tag),
        ] {
            argv.push("--addon-env".into());
            argv.push(env);
        }
        argv.push(ADDON_NAME.into());
        argv
    }
}

#[async_trait]
impl InstallerStrategy for MinishiftAddonInstaller {
    fn installer(&self) -> Installer {
        Installer::MinishiftAddon
    }

    async fn install(&self, config: &OrchestratorConfig) -> Result<(), Error> {
        if !self.runner.tool_available("minishift").await {
            return Err(Self::error("minishift is not installed or not on the PATH"));
        }
        self.runner
            .run("minishift", &args(["addons", "install", "--defaults"]))
            .await
            .map_err(|e| Self::error(e.to_string()))?;
        self.runner
            .run("minishift", &Self::apply_args(config))
            .await
            .map_err(|e| Self::error(e.to_string()))?;
        info!(namespace = %config.namespace, "minishift addon applied");
        Ok(())
    }

    async fn uninstall(&self, _config: &OrchestratorConfig) -> Result<(), Error> {
        if !self.runner.tool_available("minishift").await {
            return Ok(());
        }
        self.runner
            .run("minishift", &args(["addons", "remove", ADDON_NAME]))
            .await
            .map_err(|e| Self::error(e.to_string()))?;
        Ok(())
    }
}
