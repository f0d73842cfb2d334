//! Construction and startup verification of the [`kube::Client`] used to talk to the
//! cluster API server.
use std::convert::TryFrom;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;

/// Errors that can occur while building or verifying the API client. Both are fatal;
/// the process cannot do useful work without a working client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Neither an in-cluster service account nor a usable kubeconfig could be found.
    #[error("failed to resolve cluster connection info: {0}")]
    Discovery(#[from] kube::config::KubeconfigError),
    /// The resolved configuration could not be turned into a client.
    #[error("failed to build API client: {0}")]
    Build(#[source] kube::Error),
    /// The client was built but a basic API call against it failed, meaning the cluster
    /// is unreachable or the credentials are not authorized.
    #[error("failed to reach cluster API server: {0}")]
    Unreachable(#[source] kube::Error),
}

/// Builds a [`kube::Client`], preferring an explicit kubeconfig and falling back to
/// in-cluster service account credentials, mirroring `kube::Config::infer`'s own
/// fallback order. If [`Config::cluster_api_server_host`] is set it overrides the
/// discovered host, which is mainly useful for pointing at a test API server.
pub async fn build_client(config: &Config) -> Result<kube::Client, ClientError> {
    let mut conf = kube::Config::infer().await?;
    if let Some(host) = &config.cluster_api_server_host {
        debug!(%host, "overriding discovered API server host");
        conf.cluster_url = host
            .parse()
            .unwrap_or_else(|_| conf.cluster_url.clone());
    }

    let client = kube::Client::try_from(conf).map_err(ClientError::Build)?;
    Ok(client)
}

/// Confirms the client can actually reach the API server by requesting server version
/// info, the same lightweight call `kubectl version` makes. Called once at startup so
/// that connectivity problems fail fast instead of surfacing as a mysterious first-day
/// scheduling error.
pub async fn verify_client(client: &kube::Client) -> Result<(), ClientError> {
    let version = client
        .apiserver_version()
        .await
        .map_err(ClientError::Unreachable)?;
    info!(
        major = %version.major,
        minor = %version.minor,
        git_version = %version.git_version,
        "connected to cluster API server"
    );
    Ok(())
}
