use super::aws::{
    ClusterDescriptor, ClusterResolver, ClusterTarget, ConfigurationLookupError,
    EksClusterResolver,
};
use super::session::{
    ApiInteractionError, Connector, KubeConnector, PodSummary, SessionSettings, TrustAnchor,
    TrustAnchorError,
};
use super::token::{
    AuthToken, AwsCliTokenMinter, SigV4TokenMinter, TokenAcquisitionError, TokenMinter,
};
use crate::app::cli::{CliArgs, TokenSource};
use anyhow::Result;
use clap::Parser;
use std::io::Write;
use thiserror::Error;

pub const CONFIGURE_REMINDER: &str = "Please set the EKS cluster name and AWS region (--cluster-name and --region, or EKS_CLUSTER_NAME and AWS_REGION) before running.";
pub const NO_PODS_FOUND: &str = "No pods found in the cluster.";
pub const AUTHORIZATION_HINTS: [&str; 3] = [
    "This might be an authorization issue. Please ensure:",
    "1. Your AWS IAM identity has permissions to access the EKS cluster.",
    "2. The IAM identity is correctly mapped in the 'aws-auth' ConfigMap in the 'kube-system' namespace of your cluster.",
];

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Lookup(#[from] ConfigurationLookupError),

    #[error(transparent)]
    Token(#[from] TokenAcquisitionError),

    #[error(transparent)]
    Api(#[from] ApiInteractionError),

    #[error(transparent)]
    TrustAnchor(#[from] TrustAnchorError),
}

pub async fn run() -> Result<()> {
    let args = CliArgs::parse();
    let minter: Box<dyn TokenMinter> = match args.token_source {
        TokenSource::AwsCli => Box::new(AwsCliTokenMinter::new(&args.aws_cli)),
        TokenSource::Sigv4 => Box::new(SigV4TokenMinter),
    };

    let mut stdout = std::io::stdout();
    execute(
        &args,
        &EksClusterResolver,
        minter.as_ref(),
        &KubeConnector,
        &mut stdout,
    )
    .await?;
    stdout.flush()?;
    Ok(())
}

/// Runs the whole flow and reports the outcome on `out`.
///
/// Failures of the flow are reported, not returned. Only failing to write to `out` is an error.
pub async fn execute<W: Write>(
    args: &CliArgs,
    resolver: &dyn ClusterResolver,
    minter: &dyn TokenMinter,
    connector: &dyn Connector,
    out: &mut W,
) -> std::io::Result<()> {
    if args.is_placeholder() {
        return writeln!(out, "{}", CONFIGURE_REMINDER);
    }

    let target = ClusterTarget::from(args);
    match list_pods(&target, resolver, minter, connector).await {
        Ok(pods) => report_pods(out, &pods),
        Err(err) => {
            tracing::debug!(error = ?err, "Run failed");
            report_error(out, &err)
        }
    }
}

async fn list_pods(
    target: &ClusterTarget,
    resolver: &dyn ClusterResolver,
    minter: &dyn TokenMinter,
    connector: &dyn Connector,
) -> Result<Vec<PodSummary>, RunError> {
    let cluster = resolver.describe(target).await?;
    let token = minter.mint(target).await?;

    let anchor = TrustAnchor::from_base64(&cluster.ca_certificate)?;
    let outcome = list_pods_with_anchor(&cluster, token, &anchor, connector).await;

    match (outcome, anchor.close()) {
        (Ok(pods), Ok(())) => Ok(pods),
        (outcome, Err(cleanup)) => {
            tracing::error!(error = %cleanup, "Trust anchor cleanup failed");
            outcome
        }
        (Err(err), Ok(())) => Err(err),
    }
}

async fn list_pods_with_anchor(
    cluster: &ClusterDescriptor,
    token: AuthToken,
    anchor: &TrustAnchor,
    connector: &dyn Connector,
) -> Result<Vec<PodSummary>, RunError> {
    let settings = SessionSettings {
        endpoint: cluster.endpoint.clone(),
        trust_anchor: anchor.path().to_path_buf(),
        token: token.value,
    };
    let api = connector.connect(&settings).await?;

    tracing::info!("Successfully authenticated. Making an API call to the cluster");
    Ok(api.list_pods().await?)
}

pub fn report_pods<W: Write>(out: &mut W, pods: &[PodSummary]) -> std::io::Result<()> {
    if pods.is_empty() {
        return writeln!(out, "{}", NO_PODS_FOUND);
    }
    for pod in pods {
        writeln!(
            out,
            "- Namespace: {}, Pod: {}, Status: {}",
            pod.namespace, pod.name, pod.phase
        )?;
    }
    Ok(())
}

pub fn report_error<W: Write>(out: &mut W, err: &RunError) -> std::io::Result<()> {
    match err {
        RunError::Lookup(err) => writeln!(out, "Error fetching cluster details: {}", err),
        RunError::Token(err) => writeln!(out, "{}", err),
        RunError::Api(ApiInteractionError::Rejected {
            code,
            reason,
            message,
        }) => {
            writeln!(out, "Kubernetes API Error: {}", code)?;
            writeln!(out, "Reason: {}", reason)?;
            if !message.is_empty() {
                writeln!(out, "Message: {}", message)?;
            }
            writeln!(out)?;
            for line in AUTHORIZATION_HINTS {
                writeln!(out, "{}", line)?;
            }
            Ok(())
        }
        err => writeln!(out, "An unexpected error occurred: {}", err),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app::session::ClusterApi;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use secrecy::{ExposeSecret, SecretString};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const ENDPOINT: &str = "https://ABCDEF.gr7.eu-west-2.eks.amazonaws.com";
    const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBtest\n-----END CERTIFICATE-----\n";
    const TOKEN: &str = "k8s-aws-v1.dGVzdA";

    fn args(cluster_name: &str) -> CliArgs {
        CliArgs::try_parse_from([
            "eksauth",
            "--cluster-name",
            cluster_name,
            "--region",
            "eu-west-2",
        ])
        .unwrap()
    }

    #[derive(Default)]
    struct StaticResolver {
        missing: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClusterResolver for StaticResolver {
        async fn describe(
            &self,
            target: &ClusterTarget,
        ) -> Result<ClusterDescriptor, ConfigurationLookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.missing {
                return Err(ConfigurationLookupError::ClusterMissing {
                    cluster: target.cluster_name.clone(),
                });
            }
            Ok(ClusterDescriptor {
                name: target.cluster_name.clone(),
                region: target.region.clone(),
                endpoint: ENDPOINT.to_string(),
                ca_certificate: STANDARD.encode(CA_PEM),
            })
        }
    }

    #[derive(Default)]
    struct StaticMinter {
        not_installed: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenMinter for StaticMinter {
        async fn mint(&self, _target: &ClusterTarget) -> Result<AuthToken, TokenAcquisitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.not_installed {
                return Err(TokenAcquisitionError::ToolNotInstalled {
                    program: "aws".to_string(),
                });
            }
            Ok(AuthToken {
                value: SecretString::from(TOKEN.to_string()),
                expires_at: None,
            })
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Pods,
        PodsAnchorRemoved,
        NoPods,
        Forbidden,
        Broken,
        RefuseConnect,
    }

    struct Seen {
        endpoint: String,
        trust_anchor: PathBuf,
        ca_bytes: Vec<u8>,
        token: String,
    }

    struct RecordingConnector {
        reply: Reply,
        seen: Mutex<Option<Seen>>,
    }

    impl RecordingConnector {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                seen: Mutex::new(None),
            }
        }

        fn seen_anchor(&self) -> Option<PathBuf> {
            self.seen
                .lock()
                .unwrap()
                .as_ref()
                .map(|seen| seen.trust_anchor.clone())
        }
    }

    fn broken() -> ApiInteractionError {
        ApiInteractionError::KubeconfigShape {
            source: serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
        }
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn connect(
            &self,
            settings: &SessionSettings,
        ) -> Result<Box<dyn ClusterApi>, ApiInteractionError> {
            *self.seen.lock().unwrap() = Some(Seen {
                endpoint: settings.endpoint.clone(),
                trust_anchor: settings.trust_anchor.clone(),
                ca_bytes: std::fs::read(&settings.trust_anchor).unwrap(),
                token: settings.token.expose_secret().to_string(),
            });
            match self.reply {
                Reply::PodsAnchorRemoved => {
                    std::fs::remove_file(&settings.trust_anchor).unwrap();
                    Ok(Box::new(StaticApi(Reply::Pods)))
                }
                Reply::RefuseConnect => Err(broken()),
                reply => Ok(Box::new(StaticApi(reply))),
            }
        }
    }

    struct StaticApi(Reply);

    #[async_trait]
    impl ClusterApi for StaticApi {
        async fn list_pods(&self) -> Result<Vec<PodSummary>, ApiInteractionError> {
            match self.0 {
                Reply::Pods | Reply::PodsAnchorRemoved => Ok(vec![
                    PodSummary {
                        namespace: "kube-system".to_string(),
                        name: "coredns-5d8".to_string(),
                        phase: "Running".to_string(),
                    },
                    PodSummary {
                        namespace: "default".to_string(),
                        name: "batch-7x2".to_string(),
                        phase: "Pending".to_string(),
                    },
                ]),
                Reply::NoPods => Ok(vec![]),
                Reply::Forbidden => Err(ApiInteractionError::Rejected {
                    code: 403,
                    reason: "Forbidden".to_string(),
                    message: "pods is forbidden: User \"arn:aws:iam::1:user/x\" \
                              cannot list resource \"pods\""
                        .to_string(),
                }),
                Reply::Broken | Reply::RefuseConnect => Err(broken()),
            }
        }
    }

    async fn execute_to_string(
        args: &CliArgs,
        resolver: &StaticResolver,
        minter: &StaticMinter,
        connector: &RecordingConnector,
    ) -> String {
        let mut out = Vec::new();
        execute(args, resolver, minter, connector, &mut out)
            .await
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn placeholder_configuration_only_prints_reminder() {
        let resolver = StaticResolver::default();
        let minter = StaticMinter::default();
        let connector = RecordingConnector::new(Reply::Pods);

        let output =
            execute_to_string(&args("your-cluster-name"), &resolver, &minter, &connector).await;

        assert_eq!(output, format!("{}\n", CONFIGURE_REMINDER));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(minter.calls.load(Ordering::SeqCst), 0);
        assert!(connector.seen_anchor().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn session_uses_resolved_endpoint_ca_and_token() {
        let resolver = StaticResolver::default();
        let minter = StaticMinter::default();
        let connector = RecordingConnector::new(Reply::Pods);

        let output = execute_to_string(&args("demo"), &resolver, &minter, &connector).await;

        assert_eq!(
            output,
            "- Namespace: kube-system, Pod: coredns-5d8, Status: Running\n\
             - Namespace: default, Pod: batch-7x2, Status: Pending\n"
        );
        let seen = connector.seen.lock().unwrap();
        let seen = seen.as_ref().unwrap();
        assert_eq!(seen.endpoint, ENDPOINT);
        assert_eq!(seen.ca_bytes, CA_PEM.as_bytes());
        assert_eq!(seen.token, TOKEN);
        assert!(!seen.trust_anchor.exists());
    }

    #[test_log::test(tokio::test)]
    async fn failed_cleanup_still_reports_pods() {
        let resolver = StaticResolver::default();
        let minter = StaticMinter::default();
        let connector = RecordingConnector::new(Reply::PodsAnchorRemoved);

        let output = execute_to_string(&args("demo"), &resolver, &minter, &connector).await;

        let expected = "- Namespace: kube-system, Pod: coredns-5d8, Status: Running\n\
                        - Namespace: default, Pod: batch-7x2, Status: Pending\n";
        assert_eq!(output, expected);
    }

    #[test_log::test(tokio::test)]
    async fn empty_cluster_prints_one_line() {
        let resolver = StaticResolver::default();
        let minter = StaticMinter::default();
        let connector = RecordingConnector::new(Reply::NoPods);

        let output = execute_to_string(&args("demo"), &resolver, &minter, &connector).await;

        assert_eq!(output, "No pods found in the cluster.\n");
        assert!(!connector.seen_anchor().unwrap().exists());
    }

    #[test_log::test(tokio::test)]
    async fn forbidden_prints_remediation_hints() {
        let resolver = StaticResolver::default();
        let minter = StaticMinter::default();
        let connector = RecordingConnector::new(Reply::Forbidden);

        let output = execute_to_string(&args("demo"), &resolver, &minter, &connector).await;

        let expected_head = "Kubernetes API Error: 403\n\
                             Reason: Forbidden\n\
                             Message: pods is forbidden";
        let iam_hint = "1. Your AWS IAM identity has permissions to access the EKS cluster.\n";
        let mapping_hint = "2. The IAM identity is correctly mapped in the 'aws-auth' ConfigMap \
                            in the 'kube-system' namespace of your cluster.\n";
        assert!(output.starts_with(expected_head));
        assert!(output.contains(iam_hint));
        assert!(output.contains(mapping_hint));
        assert!(!connector.seen_anchor().unwrap().exists());
    }

    #[test_log::test(tokio::test)]
    async fn unexpected_api_failure_is_reported_and_cleaned_up() {
        let resolver = StaticResolver::default();
        let minter = StaticMinter::default();
        let connector = RecordingConnector::new(Reply::Broken);

        let output = execute_to_string(&args("demo"), &resolver, &minter, &connector).await;

        assert!(output.starts_with("An unexpected error occurred: "));
        assert!(!output.contains(AUTHORIZATION_HINTS[0]));
        assert!(!connector.seen_anchor().unwrap().exists());
    }

    #[test_log::test(tokio::test)]
    async fn failed_connect_still_removes_trust_anchor() {
        let resolver = StaticResolver::default();
        let minter = StaticMinter::default();
        let connector = RecordingConnector::new(Reply::RefuseConnect);

        let output = execute_to_string(&args("demo"), &resolver, &minter, &connector).await;

        assert!(output.starts_with("An unexpected error occurred: "));
        assert!(!connector.seen_anchor().unwrap().exists());
    }

    #[test_log::test(tokio::test)]
    async fn missing_tool_skips_the_cluster_api() {
        let resolver = StaticResolver::default();
        let minter = StaticMinter {
            not_installed: true,
            ..Default::default()
        };
        let connector = RecordingConnector::new(Reply::Pods);

        let output = execute_to_string(&args("demo"), &resolver, &minter, &connector).await;

        assert_eq!(
            output,
            "Error: 'aws' command not found. Is the AWS CLI installed and in your PATH?\n"
        );
        assert!(connector.seen_anchor().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn lookup_failure_stops_before_token() {
        let resolver = StaticResolver {
            missing: true,
            ..Default::default()
        };
        let minter = StaticMinter::default();
        let connector = RecordingConnector::new(Reply::Pods);

        let output = execute_to_string(&args("demo"), &resolver, &minter, &connector).await;

        assert_eq!(
            output,
            "Error fetching cluster details: EKS returned no cluster named demo\n"
        );
        assert_eq!(minter.calls.load(Ordering::SeqCst), 0);
        assert!(connector.seen_anchor().is_none());
    }

    #[test]
    fn empty_message_is_omitted() {
        let err = RunError::Api(ApiInteractionError::Rejected {
            code: 401,
            reason: "Unauthorized".to_string(),
            message: String::new(),
        });
        let mut out = Vec::new();
        report_error(&mut out, &err).unwrap();
        let output = String::from_utf8(out).unwrap();
        let expected_head = "Kubernetes API Error: 401\nReason: Unauthorized\n\n";
        assert!(output.starts_with(expected_head));
        assert!(!output.contains("Message:"));
    }
}
