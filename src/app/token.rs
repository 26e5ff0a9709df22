use crate::app::aws::{load_sdk_config, ClusterTarget};
use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::Credentials;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::ErrorKind;
use thiserror::Error;

const EXEC_CREDENTIAL_KIND: &str = "ExecCredential";
const EXEC_CREDENTIAL_GROUP: &str = "client.authentication.k8s.io/";
const TOKEN_PREFIX: &str = "k8s-aws-v1.";
const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";
const PRESIGNED_URL_EXPIRY_SECS: u64 = 60;
// the AWS CLI reports tokens as valid for 14 minutes
const TOKEN_LIFETIME_SECS: i64 = 14 * 60;

/// `client.authentication.k8s.io` ExecCredential as printed by `aws eks get-token`.
#[derive(Debug, Deserialize, Serialize)]
pub struct K8sToken {
    pub kind: String,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub spec: serde_json::Value,
    pub status: K8sTokenStatus,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct K8sTokenStatus {
    #[serde(rename = "expirationTimestamp", default)]
    pub expiration_timestamp: Option<String>,
    pub token: String,
}

/// A short lived bearer token for the Kubernetes API of one cluster.
#[derive(Debug)]
pub struct AuthToken {
    pub value: SecretString,
    pub expires_at: Option<String>,
}

#[derive(Error, Debug)]
pub enum TokenAcquisitionError {
    #[error("Error: '{program}' command not found. Is the AWS CLI installed and in your PATH?")]
    ToolNotInstalled { program: String },

    #[error("Failed to run '{program}': {source}")]
    ToolSpawnFailed {
        program: String,
        source: std::io::Error,
    },

    #[error("Error getting EKS token: {stderr}")]
    ToolFailed {
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Error getting EKS token: {source}")]
    MalformedOutput { source: serde_json::Error },

    #[error("Error getting EKS token: unsupported credential schema {kind} ({api_version})")]
    UnsupportedSchema { kind: String, api_version: String },

    #[error(
        "Credentials provider was None when trying to get credentials from the AWS shared config"
    )]
    CredentialsProviderNone,

    #[error("Unable to get credentials from the AWS credentials provider: {source}")]
    CredentialsProviderError {
        source: aws_credential_types::provider::error::CredentialsError,
    },

    #[error("Failed to build the SigV4 signing params for the EKS token: {source}")]
    FailedToBuildSigningParams {
        source: aws_sigv4::sign::v4::signing_params::BuildError,
    },

    #[error("Failed to build HTTP request for authenticating to EKS: {source}")]
    FailedToBuildHttpRequest { source: http::Error },

    #[error("Failed to create signable request to sign EKS authentication request: {source}")]
    FailedToCreateSignableRequest {
        source: aws_sigv4::http_request::SigningError,
    },

    #[error("Failed to sign HTTP request for authenticating against EKS cluster: {source}")]
    FailedToSignHttpRequest {
        source: aws_sigv4::http_request::SigningError,
    },
}

#[async_trait]
pub trait TokenMinter {
    async fn mint(&self, target: &ClusterTarget) -> Result<AuthToken, TokenAcquisitionError>;
}

/// Mints tokens by running `aws eks get-token`.
#[derive(Debug, Clone)]
pub struct AwsCliTokenMinter {
    program: OsString,
    leading_args: Vec<OsString>,
}

impl AwsCliTokenMinter {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before `eks get-token`, for wrappers such as `aws-vault exec <profile> -- aws`.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn command(&self, target: &ClusterTarget) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(["eks", "get-token", "--cluster-name"])
            .arg(&target.cluster_name)
            .arg("--region")
            .arg(&target.region);
        if let Some(profile) = &target.profile {
            command.arg("--profile").arg(profile);
        }
        command.kill_on_drop(true);
        command
    }
}

#[async_trait]
impl TokenMinter for AwsCliTokenMinter {
    async fn mint(&self, target: &ClusterTarget) -> Result<AuthToken, TokenAcquisitionError> {
        tracing::info!(cluster = %target.cluster_name, "Getting EKS token from the AWS CLI");
        let program = self.program.to_string_lossy().into_owned();

        let output = self
            .command(target)
            .output()
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => TokenAcquisitionError::ToolNotInstalled {
                    program: program.clone(),
                },
                _ => TokenAcquisitionError::ToolSpawnFailed {
                    program: program.clone(),
                    source,
                },
            })?;

        if !output.status.success() {
            return Err(TokenAcquisitionError::ToolFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let token = parse_exec_credential(&output.stdout)?;
        tracing::info!("Successfully retrieved EKS token");
        Ok(token)
    }
}

/// Reads the token out of an ExecCredential document.
pub fn parse_exec_credential(document: &[u8]) -> Result<AuthToken, TokenAcquisitionError> {
    let credential: K8sToken = serde_json::from_slice(document)
        .map_err(|source| TokenAcquisitionError::MalformedOutput { source })?;

    if credential.kind != EXEC_CREDENTIAL_KIND
        || !credential.api_version.starts_with(EXEC_CREDENTIAL_GROUP)
    {
        return Err(TokenAcquisitionError::UnsupportedSchema {
            kind: credential.kind,
            api_version: credential.api_version,
        });
    }

    Ok(AuthToken {
        value: SecretString::from(credential.status.token),
        expires_at: credential.status.expiration_timestamp,
    })
}

/// Mints tokens locally by presigning an STS `GetCallerIdentity` request.
#[derive(Debug, Default)]
pub struct SigV4TokenMinter;

#[async_trait]
impl TokenMinter for SigV4TokenMinter {
    async fn mint(&self, target: &ClusterTarget) -> Result<AuthToken, TokenAcquisitionError> {
        tracing::info!(cluster = %target.cluster_name, "Presigning EKS token");
        let shared_config = load_sdk_config(target).await;

        let credentials = shared_config
            .credentials_provider()
            .ok_or(TokenAcquisitionError::CredentialsProviderNone)?
            .provide_credentials()
            .await
            .map_err(|source| TokenAcquisitionError::CredentialsProviderError { source })?;

        presign_token(credentials, &target.region, &target.cluster_name, Utc::now())
    }
}

pub fn presign_token(
    credentials: Credentials,
    region: &str,
    cluster_name: &str,
    request_ts: DateTime<Utc>,
) -> Result<AuthToken, TokenAcquisitionError> {
    let identity = credentials.into();

    let mut signing_settings = aws_sigv4::http_request::SigningSettings::default();
    signing_settings.signature_location = aws_sigv4::http_request::SignatureLocation::QueryParams;
    signing_settings.expires_in = Some(std::time::Duration::from_secs(PRESIGNED_URL_EXPIRY_SECS));
    let signing_params = aws_sigv4::sign::v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name("sts")
        .time(request_ts.into())
        .settings(signing_settings)
        .build()
        .map_err(|source| TokenAcquisitionError::FailedToBuildSigningParams { source })?
        .into();

    let uri = format!(
        "https://sts.{}.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15",
        region
    );

    let mut request = http::Request::builder()
        .uri(&uri)
        .header(CLUSTER_ID_HEADER, cluster_name)
        .body(())
        .map_err(|source| TokenAcquisitionError::FailedToBuildHttpRequest { source })?;

    let signable_request = aws_sigv4::http_request::SignableRequest::new(
        "GET",
        &uri,
        std::iter::once((CLUSTER_ID_HEADER, cluster_name)),
        aws_sigv4::http_request::SignableBody::Bytes(&[]),
    )
    .map_err(|source| TokenAcquisitionError::FailedToCreateSignableRequest { source })?;

    let (signing_instructions, _signature) =
        aws_sigv4::http_request::sign(signable_request, &signing_params)
            .map_err(|source| TokenAcquisitionError::FailedToSignHttpRequest { source })?
            .into_parts();

    signing_instructions.apply_to_request_http1x(&mut request);

    let token = format!(
        "{}{}",
        TOKEN_PREFIX,
        URL_SAFE_NO_PAD.encode(request.uri().to_string())
    );
    let expires_at = request_ts + chrono::Duration::seconds(TOKEN_LIFETIME_SECS);

    Ok(AuthToken {
        value: SecretString::from(token),
        expires_at: Some(expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
    })
}
