use crate::app::aws::ClusterTarget;
use clap::{Parser, ValueEnum};

/// Cluster name shipped as the default. Running with it untouched means the
/// tool has not been configured yet.
pub const PLACEHOLDER_CLUSTER_NAME: &str = "your-cluster-name";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TokenSource {
    /// Run `aws eks get-token` and read the token from its output
    #[default]
    AwsCli,
    /// Presign the STS request in-process with the resolved AWS credentials
    Sigv4,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Name of the EKS Kubernetes cluster to authenticate against
    #[clap(short, long, env = "EKS_CLUSTER_NAME", default_value = PLACEHOLDER_CLUSTER_NAME)]
    pub cluster_name: String,

    /// Name of the AWS region that the cluster is in
    #[clap(short, long, env = "AWS_REGION", default_value = "us-east-1")]
    pub region: String,

    /// AWS profile to use for the cluster lookup and the token
    #[clap(short, long, env = "AWS_PROFILE", default_value = None)]
    pub profile: Option<String>,

    /// AWS CLI executable used to mint the token
    #[clap(long, env = "EKS_AUTH_AWS_CLI", default_value = "aws")]
    pub aws_cli: String,

    /// Where the bearer token comes from
    #[clap(short, long, value_enum, default_value_t = TokenSource::AwsCli)]
    pub token_source: TokenSource,
}

impl CliArgs {
    pub fn is_placeholder(&self) -> bool {
        self.cluster_name == PLACEHOLDER_CLUSTER_NAME
    }
}

impl From<&CliArgs> for ClusterTarget {
    fn from(args: &CliArgs) -> Self {
        ClusterTarget {
            cluster_name: args.cluster_name.clone(),
            region: args.region.clone(),
            profile: args.profile.clone(),
        }
    }
}
