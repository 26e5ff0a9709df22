//! Authenticated access to the Kubernetes API of one cluster.
//!
//! The cluster CA is handed to the client as a file, so the decoded bundle lives in a
//! [`TrustAnchor`] for as long as the session needs it and is removed when it goes away.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

const SESSION_NAME: &str = "eksauth";
const UNKNOWN_PHASE: &str = "Unknown";

#[derive(Error, Debug)]
pub enum TrustAnchorError {
    #[error("Cluster certificate authority is not valid base64: {source}")]
    Decode { source: base64::DecodeError },

    #[error("Failed to write the cluster certificate authority to a temporary file: {source}")]
    Write { source: std::io::Error },

    #[error("Failed to remove temporary file {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ApiInteractionError {
    /// The API server answered, but refused or failed the request.
    #[error("Kubernetes API Error: {code} ({reason}): {message}")]
    Rejected {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("Failed to assemble the session kubeconfig: {source}")]
    KubeconfigShape { source: serde_json::Error },

    #[error("Failed to build the Kubernetes client configuration: {source}")]
    InvalidConfig { source: KubeconfigError },

    #[error("Failed to create the Kubernetes client: {source}")]
    ClientSetup { source: kube::Error },

    #[error("Kubernetes request failed: {source}")]
    Transport { source: kube::Error },
}

impl From<kube::Error> for ApiInteractionError {
    fn from(source: kube::Error) -> Self {
        match source {
            kube::Error::Api(response) => ApiInteractionError::Rejected {
                code: response.code,
                reason: response.reason,
                message: response.message,
            },
            source => ApiInteractionError::Transport { source },
        }
    }
}

/// The decoded cluster CA bundle, written to a uniquely named temporary file.
///
/// The file is deleted by [`TrustAnchor::close`] or, failing that, when the value is dropped.
#[derive(Debug)]
pub struct TrustAnchor {
    file: NamedTempFile,
}

impl TrustAnchor {
    pub fn from_base64(ca_certificate: &str) -> Result<Self, TrustAnchorError> {
        let bytes = STANDARD
            .decode(ca_certificate.trim())
            .map_err(|source| TrustAnchorError::Decode { source })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TrustAnchorError> {
        let mut file = tempfile::Builder::new()
            .prefix("eks-ca-")
            .suffix(".crt")
            .tempfile()
            .map_err(|source| TrustAnchorError::Write { source })?;
        file.write_all(bytes)
            .and_then(|()| file.flush())
            .map_err(|source| TrustAnchorError::Write { source })?;

        tracing::info!(path = %file.path().display(), "CA certificate written to temporary file");
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Deletes the file now, reporting failures instead of swallowing them like drop does.
    pub fn close(self) -> Result<(), TrustAnchorError> {
        let path = self.file.path().to_path_buf();
        tracing::info!(path = %path.display(), "Cleaning up temporary file");
        self.file
            .close()
            .map_err(|source| TrustAnchorError::Remove { path, source })
    }
}

/// Everything a client needs to reach the cluster.
#[derive(Debug)]
pub struct SessionSettings {
    pub endpoint: String,
    pub trust_anchor: PathBuf,
    pub token: SecretString,
}

impl SessionSettings {
    /// A single-context kubeconfig equivalent to these settings.
    pub fn kubeconfig(&self) -> Result<Kubeconfig, ApiInteractionError> {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": SESSION_NAME,
                "cluster": {
                    "server": self.endpoint,
                    "certificate-authority": self.trust_anchor.to_string_lossy(),
                },
            }],
            "users": [{
                "name": SESSION_NAME,
                "user": { "token": self.token.expose_secret() },
            }],
            "contexts": [{
                "name": SESSION_NAME,
                "context": { "cluster": SESSION_NAME, "user": SESSION_NAME },
            }],
            "current-context": SESSION_NAME,
        }))
        .map_err(|source| ApiInteractionError::KubeconfigShape { source })
    }
}

/// A pod as reported to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSummary {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

impl From<Pod> for PodSummary {
    fn from(pod: Pod) -> Self {
        PodSummary {
            namespace: pod.metadata.namespace.unwrap_or_default(),
            name: pod.metadata.name.unwrap_or_default(),
            phase: pod
                .status
                .and_then(|status| status.phase)
                .unwrap_or_else(|| UNKNOWN_PHASE.to_string()),
        }
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(&self) -> Result<Vec<PodSummary>, ApiInteractionError>;
}

#[async_trait]
pub trait Connector {
    async fn connect(
        &self,
        settings: &SessionSettings,
    ) -> Result<Box<dyn ClusterApi>, ApiInteractionError>;
}

/// Connects through `kube`, reading the trust anchor from disk.
#[derive(Debug, Default)]
pub struct KubeConnector;

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(
        &self,
        settings: &SessionSettings,
    ) -> Result<Box<dyn ClusterApi>, ApiInteractionError> {
        tracing::info!(endpoint = %settings.endpoint, "Configuring Kubernetes client");
        let config =
            Config::from_custom_kubeconfig(settings.kubeconfig()?, &KubeConfigOptions::default())
                .await
                .map_err(|source| ApiInteractionError::InvalidConfig { source })?;
        let client =
            Client::try_from(config).map_err(|source| ApiInteractionError::ClientSetup { source })?;
        Ok(Box::new(KubeClusterApi { client }))
    }
}

pub struct KubeClusterApi {
    client: Client,
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_pods(&self) -> Result<Vec<PodSummary>, ApiInteractionError> {
        tracing::info!("Listing pods in all namespaces");
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(PodSummary::from).collect())
    }
}
