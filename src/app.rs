//! Che server control surface
//!
//! [`ApplicationClient`] covers what the workflows need from the running Che
//! server: where it is, whether it answers, whether it requires
//! authentication, and the graceful shutdown handshake. [`CheApiClient`] is
//! the HTTP implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::cluster::{ClusterTransport, ResourceKind};
use crate::config::DEFAULT_POLL_INTERVAL;
use crate::wait::poll_until;
use crate::Error;

/// Name of the OpenShift route exposing the Che server
pub const CHE_ROUTE_NAME: &str = "che";
/// Name of the Kubernetes ingress exposing the Che server
pub const CHE_INGRESS_NAME: &str = "che-ingress";

const STATE_PATH: &str = "api/system/state";
const KEYCLOAK_SETTINGS_PATH: &str = "api/keycloak/settings";
const SHUTDOWN_PATH: &str = "api/system/stop?shutdown=true";
const KEYCLOAK_AUTH_SERVER_KEY: &str = "che.keycloak.auth_server_url";

/// Che server status as reported by `/api/system/state`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    /// Serving requests
    Running,
    /// Shutdown requested, workspaces still stopping
    PreparingToShutdown,
    /// Safe to stop
    ReadyToShutdown,
    /// Anything else the server reported
    Unknown(String),
}

impl ServerStatus {
    /// Parse the wire value
    pub fn parse(status: &str) -> Self {
        match status {
            "RUNNING" => ServerStatus::Running,
            "PREPARING_TO_SHUTDOWN" => ServerStatus::PreparingToShutdown,
            "READY_TO_SHUTDOWN" => ServerStatus::ReadyToShutdown,
            other => ServerStatus::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Running => f.write_str("RUNNING"),
            ServerStatus::PreparingToShutdown => f.write_str("PREPARING_TO_SHUTDOWN"),
            ServerStatus::ReadyToShutdown => f.write_str("READY_TO_SHUTDOWN"),
            ServerStatus::Unknown(s) => f.write_str(s),
        }
    }
}

#[derive(Deserialize)]
struct SystemState {
    status: String,
}

/// The Che server's own HTTP control surface
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplicationClient: Send + Sync {
    /// Public URL of the Che server, from its route or ingress
    async fn resolve_public_url(&self, namespace: &str, is_openshift: bool) -> Result<Url, Error>;

    /// Current server status
    async fn get_status(&self, url: &Url) -> Result<ServerStatus, Error>;

    /// Whether the server requires authentication
    async fn is_auth_enabled(&self, url: &Url) -> Result<bool, Error>;

    /// Ask the server to prepare for shutdown
    async fn request_shutdown(&self, url: &Url, token: Option<String>) -> Result<(), Error>;

    /// Wait until the server reports it is ready to shut down
    async fn wait_until_ready_to_shutdown(&self, url: &Url, timeout: Duration)
        -> Result<(), Error>;

    /// Wait until the server answers with `RUNNING`
    async fn wait_until_ready(&self, url: &Url, timeout: Duration) -> Result<(), Error>;
}

/// URL of an OpenShift route object
///
/// https when the route terminates TLS (edge, passthrough or reencrypt).
pub fn url_from_route(route: &Value) -> Option<Url> {
    let spec = route.get("spec")?;
    let host = spec.get("host")?.as_str()?;
    let secure = matches!(
        spec.pointer("/tls/termination").and_then(Value::as_str),
        Some("edge" | "passthrough" | "reencrypt")
    );
    build_url(secure, host)
}

/// URL of a Kubernetes ingress object (first rule's host)
pub fn url_from_ingress(ingress: &Value) -> Option<Url> {
    let spec = ingress.get("spec")?;
    let host = spec.pointer("/rules/0/host")?.as_str()?;
    let secure = spec
        .get("tls")
        .and_then(Value::as_array)
        .is_some_and(|tls| !tls.is_empty());
    build_url(secure, host)
}

fn build_url(secure: bool, host: &str) -> Option<Url> {
    let scheme = if secure { "https" } else { "http" };
    Url::parse(&format!("{}://{}", scheme, host)).ok()
}

/// [`ApplicationClient`] over HTTP
#[derive(Clone)]
pub struct CheApiClient {
    http: reqwest::Client,
    transport: Arc<dyn ClusterTransport>,
    poll_interval: Duration,
}

impl CheApiClient {
    /// Client resolving URLs through `transport`
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal_with_context("CheApiClient::new", e.to_string()))?;
        Ok(Self {
            http,
            transport,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    fn endpoint(url: &Url, path: &str) -> Result<Url, Error> {
        url.join(path)
            .map_err(|e| Error::application(url.as_str(), format!("invalid URL: {}", e)))
    }
}

#[async_trait]
impl ApplicationClient for CheApiClient {
    async fn resolve_public_url(&self, namespace: &str, is_openshift: bool) -> Result<Url, Error> {
        let (kind, name, parse): (_, _, fn(&Value) -> Option<Url>) = if is_openshift {
            (ResourceKind::Route, CHE_ROUTE_NAME, url_from_route)
        } else {
            (ResourceKind::Ingress, CHE_INGRESS_NAME, url_from_ingress)
        };
        let object = self
            .transport
            .get_resource(kind, name, namespace)
            .await?
            .ok_or_else(|| {
                Error::application(
                    format!("{}/{}", namespace, name),
                    format!("{} not found, cannot determine the Che URL", kind),
                )
            })?;
        let url = parse(&object.data).ok_or_else(|| {
            Error::application(
                format!("{}/{}", namespace, name),
                format!("{} has no host", kind),
            )
        })?;
        debug!(%url, "resolved Che URL");
        Ok(url)
    }

    async fn get_status(&self, url: &Url) -> Result<ServerStatus, Error> {
        let endpoint = Self::endpoint(url, STATE_PATH)?;
        let response = self
            .http
            .get(endpoint.clone())
            .send()
            .await
            .map_err(|e| Error::application(endpoint.as_str(), e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::application(
                endpoint.as_str(),
                format!("unexpected status {}", response.status()),
            ));
        }
        let state: SystemState = response
            .json()
            .await
            .map_err(|e| Error::application(endpoint.as_str(), e.to_string()))?;
        Ok(ServerStatus::parse(&state.status))
    }

    async fn is_auth_enabled(&self, url: &Url) -> Result<bool, Error> {
        let endpoint = Self::endpoint(url, KEYCLOAK_SETTINGS_PATH)?;
        let response = self
            .http
            .get(endpoint.clone())
            .send()
            .await
            .map_err(|e| Error::application(endpoint.as_str(), e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => {
                let settings: Value = response
                    .json()
                    .await
                    .map_err(|e| Error::application(endpoint.as_str(), e.to_string()))?;
                Ok(settings.get(KEYCLOAK_AUTH_SERVER_KEY).is_some())
            }
            status => Err(Error::application(
                endpoint.as_str(),
                format!("unexpected status {}", status),
            )),
        }
    }

    async fn request_shutdown(&self, url: &Url, token: Option<String>) -> Result<(), Error> {
        let endpoint = Self::endpoint(url, SHUTDOWN_PATH)?;
        let mut request = self.http.post(endpoint.clone());
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::application(endpoint.as_str(), e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::application(
                endpoint.as_str(),
                format!("shutdown request rejected with {}", response.status()),
            ));
        }
        info!(%url, "Che server shutdown requested");
        Ok(())
    }

    async fn wait_until_ready_to_shutdown(
        &self,
        url: &Url,
        timeout: Duration,
    ) -> Result<(), Error> {
        poll_until(
            timeout,
            self.poll_interval,
            || Error::timeout("Che server ready to shutdown", url.as_str(), "", timeout),
            || async { Ok(self.get_status(url).await? == ServerStatus::ReadyToShutdown) },
        )
        .await
    }

    async fn wait_until_ready(&self, url: &Url, timeout: Duration) -> Result<(), Error> {
        poll_until(
            timeout,
            self.poll_interval,
            || Error::timeout("Che server boot", url.as_str(), "", timeout),
            || async { Ok(self.get_status(url).await? == ServerStatus::Running) },
        )
        .await
    }
}
