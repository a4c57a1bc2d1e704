//! Platform / installer compatibility matrix
//!
//! Pure decision logic: given the platform the user targets, the installer
//! they asked for (if any) and whether they asked for multi-user mode, pick the
//! installer that will run and the multi-user mode it will run in, or reject
//! the combination before anything touches the cluster.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Kubernetes platform flavors chectl knows how to target
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// Local minikube cluster
    #[default]
    Minikube,
    /// Local minishift (OpenShift 3) cluster
    Minishift,
    /// Generic Kubernetes cluster
    K8s,
    /// OpenShift cluster
    Openshift,
    /// Local MicroK8s cluster
    Microk8s,
    /// Docker Desktop's bundled Kubernetes
    DockerDesktop,
}

impl Platform {
    /// Every platform, in declaration order
    pub const ALL: [Platform; 6] = [
        Platform::Minikube,
        Platform::Minishift,
        Platform::K8s,
        Platform::Openshift,
        Platform::Microk8s,
        Platform::DockerDesktop,
    ];

    /// Flag value used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Minikube => "minikube",
            Platform::Minishift => "minishift",
            Platform::K8s => "k8s",
            Platform::Openshift => "openshift",
            Platform::Microk8s => "microk8s",
            Platform::DockerDesktop => "docker-desktop",
        }
    }

    /// Whether this platform is expected to expose OpenShift APIs
    pub fn is_openshift_family(&self) -> bool {
        matches!(self, Platform::Openshift | Platform::Minishift)
    }

    /// Human readable name for progress titles
    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Minikube => "Minikube",
            Platform::Minishift => "Minishift",
            Platform::K8s => "Kubernetes",
            Platform::Openshift => "Openshift",
            Platform::Microk8s => "MicroK8s",
            Platform::DockerDesktop => "Docker Desktop",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installation mechanisms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Installer {
    /// Helm chart
    Helm,
    /// Che operator and a CheCluster custom resource
    Operator,
    /// Minishift addon
    MinishiftAddon,
}

impl Installer {
    /// Every installer, in declaration order
    pub const ALL: [Installer; 3] = [
        Installer::Helm,
        Installer::Operator,
        Installer::MinishiftAddon,
    ];

    /// Flag value used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Installer::Helm => "helm",
            Installer::Operator => "operator",
            Installer::MinishiftAddon => "minishift-addon",
        }
    }
}

impl fmt::Display for Installer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstallRequest {
    /// Target platform
    pub platform: Platform,
    /// Explicit installer, or `None` to use the platform default
    pub installer: Option<Installer>,
    /// Whether multi-user mode was requested
    pub multiuser: bool,
    /// Whether OpenShift OAuth integration was requested
    pub os_oauth: bool,
}

/// A validated platform/installer pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    /// Target platform
    pub platform: Platform,
    /// Installer that will run
    pub installer: Installer,
    /// Multi-user mode after installer constraints were applied
    pub multiuser: bool,
    /// Non-fatal notes for the user (e.g. a forced multi-user mode)
    pub warnings: Vec<String>,
}

/// Default installer for a platform when none was requested
///
/// MicroK8s has no dedicated installer; it gets helm like the other
/// vanilla Kubernetes flavors.
pub fn default_installer(platform: Platform, multiuser: bool) -> Installer {
    match (platform, multiuser) {
        (Platform::Minishift, false) => Installer::MinishiftAddon,
        (Platform::Minishift, true) => Installer::Operator,
        (Platform::Minikube, false) => Installer::Helm,
        (Platform::Minikube, true) => Installer::Operator,
        (Platform::Openshift, _) => Installer::Operator,
        (Platform::K8s, _) | (Platform::DockerDesktop, _) | (Platform::Microk8s, _) => {
            Installer::Helm
        }
    }
}

/// Closed compatibility table
pub fn is_compatible(platform: Platform, installer: Installer) -> bool {
    match installer {
        Installer::MinishiftAddon => platform == Platform::Minishift,
        Installer::Helm => matches!(
            platform,
            Platform::K8s | Platform::Minikube | Platform::Microk8s | Platform::DockerDesktop
        ),
        Installer::Operator => true,
    }
}

/// Resolve the installer and effective multi-user mode for a request
///
/// Rules, in order: default the installer from the platform, reject
/// incompatible pairs, apply the installer's multi-user constraint, then
/// validate the OpenShift OAuth flag.
pub fn resolve(request: &InstallRequest) -> Result<Resolution, Error> {
    let platform = request.platform;
    let installer = request
        .installer
        .unwrap_or_else(|| default_installer(platform, request.multiuser));

    if !is_compatible(platform, installer) {
        let message = match installer {
            Installer::MinishiftAddon => {
                "the minishift addon is only available on top of the minishift platform"
            }
            Installer::Helm => {
                "the helm installer is only available on Kubernetes flavor platforms \
                 (k8s, minikube, microk8s, docker-desktop)"
            }
            Installer::Operator => "the operator installer is not available on this platform",
        };
        return Err(Error::compatibility_for(
            platform.as_str(),
            installer.as_str(),
            message,
        ));
    }

    let mut warnings = Vec::new();
    let multiuser = match installer {
        Installer::Operator => {
            if !request.multiuser {
                warnings.push(
                    "Che will be deployed in multi-user mode since the operator installer \
                     only supports multi-user"
                        .to_string(),
                );
            }
            true
        }
        Installer::MinishiftAddon => false,
        Installer::Helm => request.multiuser,
    };

    if request.os_oauth {
        if !platform.is_openshift_family() {
            return Err(Error::compatibility_for(
                platform.as_str(),
                installer.as_str(),
                "OpenShift OAuth was requested but the platform is not OpenShift",
            ));
        }
        if installer != Installer::Operator {
            return Err(Error::compatibility_for(
                platform.as_str(),
                installer.as_str(),
                "OpenShift OAuth is only possible with the operator installer (--installer operator)",
            ));
        }
    }

    Ok(Resolution {
        platform,
        installer,
        multiuser,
        warnings,
    })
}
