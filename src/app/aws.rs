use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_eks::error::{DisplayErrorContext, SdkError};
use aws_sdk_eks::operation::describe_cluster::DescribeClusterError;
use aws_sdk_eks::types::Cluster;
use aws_types::SdkConfig;
use thiserror::Error;

/// Which cluster to talk to and how to reach AWS for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTarget {
    pub cluster_name: String,
    pub region: String,
    pub profile: Option<String>,
}

/// Connection details of an EKS cluster as reported by the EKS control plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub name: String,
    pub region: String,
    pub endpoint: String,
    /// Base64 encoded PEM bundle of the cluster certificate authority.
    pub ca_certificate: String,
}

#[derive(Error, Debug)]
pub enum ConfigurationLookupError {
    #[error("Failed to describe EKS cluster {cluster}: {}", DisplayErrorContext(.source))]
    DescribeCluster {
        cluster: String,
        source: SdkError<DescribeClusterError>,
    },

    #[error("EKS returned no cluster named {cluster}")]
    ClusterMissing { cluster: String },

    #[error("EKS cluster {cluster} has no API endpoint yet. Is it still being created?")]
    EndpointMissing { cluster: String },

    #[error("EKS cluster {cluster} has no certificate authority data")]
    CertificateAuthorityMissing { cluster: String },
}

/// Loads the shared AWS configuration for the region (and optional profile) of a target.
pub async fn load_sdk_config(target: &ClusterTarget) -> SdkConfig {
    let region = aws_config::Region::new(target.region.clone());
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
    if let Some(profile) = &target.profile {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}

#[async_trait]
pub trait ClusterResolver {
    async fn describe(
        &self,
        target: &ClusterTarget,
    ) -> Result<ClusterDescriptor, ConfigurationLookupError>;
}

/// Resolves clusters through the EKS `DescribeCluster` API.
#[derive(Debug, Default)]
pub struct EksClusterResolver;

#[async_trait]
impl ClusterResolver for EksClusterResolver {
    async fn describe(
        &self,
        target: &ClusterTarget,
    ) -> Result<ClusterDescriptor, ConfigurationLookupError> {
        tracing::info!(
            cluster = %target.cluster_name,
            region = %target.region,
            "Fetching EKS cluster details"
        );
        let shared_config = load_sdk_config(target).await;
        let client = aws_sdk_eks::Client::new(&shared_config);

        let response = client
            .describe_cluster()
            .name(&target.cluster_name)
            .send()
            .await
            .map_err(|source| ConfigurationLookupError::DescribeCluster {
                cluster: target.cluster_name.clone(),
                source,
            })?;

        let descriptor = descriptor_from_cluster(target, response.cluster)?;
        tracing::info!(endpoint = %descriptor.endpoint, "Fetched EKS cluster details");
        Ok(descriptor)
    }
}

pub(crate) fn descriptor_from_cluster(
    target: &ClusterTarget,
    cluster: Option<Cluster>,
) -> Result<ClusterDescriptor, ConfigurationLookupError> {
    let cluster_name = || target.cluster_name.clone();
    let cluster = cluster.ok_or_else(|| ConfigurationLookupError::ClusterMissing {
        cluster: cluster_name(),
    })?;

    let endpoint = cluster
        .endpoint
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or_else(|| ConfigurationLookupError::EndpointMissing {
            cluster: cluster_name(),
        })?;

    let ca_certificate = cluster
        .certificate_authority
        .and_then(|ca| ca.data)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| ConfigurationLookupError::CertificateAuthorityMissing {
            cluster: cluster_name(),
        })?;

    Ok(ClusterDescriptor {
        name: cluster.name.unwrap_or_else(cluster_name),
        region: target.region.clone(),
        endpoint,
        ca_certificate,
    })
}
