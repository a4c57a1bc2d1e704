//! chectl - lifecycle orchestration for Eclipse Che on Kubernetes and OpenShift
//!
//! Given a target cluster, chectl determines whether Che is already deployed,
//! installs it through one of several installer back-ends if it is not, scales
//! it down and up in dependency order, and recovers it to a running state.
//!
//! # Architecture
//!
//! Every workflow is an ordered tree of tasks executed by one engine against a
//! single [`context::ExecutionContext`]. Leaf tasks call into the components:
//!
//! - [`task`] - Task graph engine and progress renderers
//! - [`platform`] - Platform/installer compatibility matrix
//! - [`cluster`] - Cluster transport abstraction and its kube-rs implementation
//! - [`probe`] - Cluster probe: reachability, flavor, component existence
//! - [`wait`] - Bounded polling and the pod readiness waiter
//! - [`scale`] - Dependency-ordered scale sequencer
//! - [`app`] - Che server HTTP control surface
//! - [`installer`] - Installer back-ends (helm, operator, minishift addon)
//! - [`orchestrator`] - The start / stop / delete / status workflows
//! - [`config`] - Workflow configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod app;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod installer;
pub mod orchestrator;
pub mod platform;
pub mod probe;
pub mod scale;
pub mod task;
pub mod testing;
pub mod wait;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace for Che resources
pub const DEFAULT_NAMESPACE: &str = "che";

/// Default name of the Che server controller
pub const DEFAULT_DEPLOYMENT_NAME: &str = "che";

/// Default Che server image
pub const DEFAULT_CHE_IMAGE: &str = "eclipse/che-server:nightly";

/// Default Che operator image
pub const DEFAULT_OPERATOR_IMAGE: &str = "quay.io/eclipse/che-operator:nightly";

/// Label selector shared by all Che components
pub const CHE_APP_SELECTOR: &str = "app=che";

/// API group only present on OpenShift clusters
pub const OPENSHIFT_APPS_GROUP: &str = "apps.openshift.io";
