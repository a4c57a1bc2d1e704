//! Error types for chectl
//!
//! Errors are structured with fields so a failed workflow can be diagnosed
//! without re-running it: every variant that touches the cluster carries the
//! component, resource kind, namespace or selector involved.

use std::time::Duration;

use thiserror::Error;

/// Main error type for chectl operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither "not found" nor an auth failure
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The cluster API cannot be reached or refused our credentials
    #[error("failed to connect to Kubernetes API: {message}")]
    Connectivity {
        /// Description of what failed
        message: String,
    },

    /// Invalid platform / installer / flag combination
    #[error("platform {platform} is not compatible with the request: {message}")]
    Compatibility {
        /// Requested platform
        platform: String,
        /// Resolved installer (if resolution got that far)
        installer: Option<String>,
        /// Description of the rejected combination
        message: String,
    },

    /// A bounded wait exceeded its deadline
    #[error("timed out after {timeout:?} waiting for {phase} (selector \"{selector}\", namespace \"{namespace}\")")]
    Timeout {
        /// What was being waited for (scheduling, image download, ready, ...)
        phase: String,
        /// Pod label selector or resource name being polled
        selector: String,
        /// Namespace being polled
        namespace: String,
        /// The bound that was exhausted
        timeout: Duration,
    },

    /// A per-component scale call failed; earlier components are left as-is
    #[error("failed to scale {component} ({kind} \"{name}\" in \"{namespace}\") to {replicas}: {source}")]
    Scale {
        /// Component display name
        component: String,
        /// Resource kind that was scaled
        kind: String,
        /// Controller name
        name: String,
        /// Namespace of the controller
        namespace: String,
        /// Target replica count
        replicas: i32,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Shutdown coordination cannot proceed (e.g. auth enabled without a token)
    #[error("coordination error: {message}")]
    Coordination {
        /// Description of what is missing
        message: String,
    },

    /// The application server controller does not exist
    #[error("neither a Deployment nor a DeploymentConfig named \"{name}\" exists in namespace \"{namespace}\"")]
    NotDeployed {
        /// Controller name that was looked up
        name: String,
        /// Namespace that was searched
        namespace: String,
    },

    /// Components resolved to different resource kinds within one run
    #[error("component {component} resolved to {found} but the application server is a {expected}")]
    InconsistentFlavor {
        /// Component with the unexpected kind
        component: String,
        /// Kind of the application server
        expected: String,
        /// Kind found for the component
        found: String,
    },

    /// An installer back-end failed
    #[error("installer {installer} failed: {message}")]
    Installer {
        /// Installer name (helm, operator, minishift-addon)
        installer: String,
        /// Description of what failed
        message: String,
    },

    /// The application's HTTP control surface returned an error
    #[error("application error [{url}]: {message}")]
    Application {
        /// URL that was called
        url: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid or unreadable configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a connectivity error
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity {
            message: msg.into(),
        }
    }

    /// Create a compatibility error naming both platform and installer
    pub fn compatibility_for(
        platform: impl Into<String>,
        installer: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Compatibility {
            platform: platform.into(),
            installer: Some(installer.into()),
            message: msg.into(),
        }
    }

    /// Create a timeout error for a bounded wait
    pub fn timeout(
        phase: impl Into<String>,
        selector: impl Into<String>,
        namespace: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self::Timeout {
            phase: phase.into(),
            selector: selector.into(),
            namespace: namespace.into(),
            timeout,
        }
    }

    /// Create a coordination error
    pub fn coordination(msg: impl Into<String>) -> Self {
        Self::Coordination {
            message: msg.into(),
        }
    }

    /// Create an installer error
    pub fn installer(installer: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Installer {
            installer: installer.into(),
            message: msg.into(),
        }
    }

    /// Create an application error
    pub fn application(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Application {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether a polling loop may retry after this error.
    ///
    /// Only raw API/HTTP failures are transient. Connectivity failures
    /// (unreachable cluster, rejected credentials) are fatal, as is every
    /// decision made by our own code.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube { .. } | Error::Application { .. })
    }

    /// The component name carried by this error, if any
    pub fn component(&self) -> Option<&str> {
        match self {
            Error::Scale { component, .. } | Error::InconsistentFlavor { component, .. } => {
                Some(component)
            }
            _ => None,
        }
    }
}
