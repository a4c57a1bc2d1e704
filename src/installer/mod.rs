//! Installer back-ends
//!
//! Each back-end performs the first-time installation of Che in its own way
//! and knows how to remove what it installed. The orchestrator treats an
//! install as a single opaque step.
//!
//! - [`HelmInstaller`] - `helm upgrade --install` of the Che chart
//! - [`OperatorInstaller`] - Che operator deployment plus a `CheCluster` resource
//! - [`MinishiftAddonInstaller`] - `minishift addons apply che`

mod addon;
mod helm;
mod operator;

pub use addon::MinishiftAddonInstaller;
pub use helm::HelmInstaller;
pub use operator::OperatorInstaller;

use std::io;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

use crate::cluster::ClusterTransport;
use crate::config::OrchestratorConfig;
use crate::platform::Installer;
use crate::Error;

/// One installation mechanism
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstallerStrategy: Send + Sync {
    /// Which installer this is
    fn installer(&self) -> Installer;

    /// Install Che; returns once the installer itself has finished
    async fn install(&self, config: &OrchestratorConfig) -> Result<(), Error>;

    /// Remove what this installer created; succeeds when nothing is there
    async fn uninstall(&self, config: &OrchestratorConfig) -> Result<(), Error>;
}

/// Produces the back-end for a resolved installer
pub type InstallerFactory = Arc<dyn Fn(Installer) -> Arc<dyn InstallerStrategy> + Send + Sync>;

/// Factory for the real back-ends
pub fn default_factory(
    transport: Arc<dyn ClusterTransport>,
    runner: Arc<dyn CommandRunner>,
) -> InstallerFactory {
    Arc::new(move |installer| -> Arc<dyn InstallerStrategy> {
        match installer {
            Installer::Helm => Arc::new(HelmInstaller::new(runner.clone())),
            Installer::Operator => Arc::new(OperatorInstaller::new(transport.clone())),
            Installer::MinishiftAddon => Arc::new(MinishiftAddonInstaller::new(runner.clone())),
        }
    })
}

/// Runs external tools
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion; stdout on success, stderr in the error otherwise
    async fn run(&self, program: &str, args: &[String]) -> Result<String, Error>;

    /// Whether `program` can be spawned from the PATH
    async fn tool_available(&self, program: &str) -> bool;
}

/// [`CommandRunner`] spawning real processes
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, Error> {
        let command = format!("{} {}", program, args.join(" "));
        debug!(%command, "running");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::internal_with_context(
                    command.clone(),
                    format!("{} is not installed or not on the PATH", program),
                ),
                _ => Error::internal_with_context(command.clone(), e.to_string()),
            })?;

        if !output.status.success() {
            return Err(Error::internal_with_context(
                command,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn tool_available(&self, program: &str) -> bool {
        // Any exit status counts; only a failed spawn means the tool is missing
        let spawned = Command::new(program)
            .arg("--help")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match spawned {
            Ok(_) => true,
            Err(e) => {
                debug!(program, error = %e, "tool cannot be spawned");
                false
            }
        }
    }
}

/// Turn `&str` literals and owned strings into an argument vector
pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Split `repo:tag`; the tag is empty when absent
///
/// A colon followed by a path is a registry port, not a tag.
pub(crate) fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, ""),
    }
}
