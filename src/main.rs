use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use anyhow::Context as _;
use aws_config::SdkConfig;
use clap::{Args, Parser, Subcommand};
use prometheus::{Encoder, TextEncoder};
use tracing::*;

use cloudsap::clients::{aws, AwsIam, KubeClient};
use cloudsap::controllers::cloudserviceaccount::IamRoleReconciler;
use cloudsap::{telemetry, Settings, State};

/// Name of the controller's own ServiceAccount, which `install irsa` provisions a role for
const CONTROLLER_SERVICE_ACCOUNT: &str = "cloudsap";

/// Everything the controller does to IAM, scoped to the roles it names
const CONTROLLER_POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Action": [
        "iam:GetRole",
        "iam:CreateRole",
        "iam:UpdateRole",
        "iam:UpdateAssumeRolePolicy",
        "iam:DeleteRole",
        "iam:GetRolePolicy",
        "iam:PutRolePolicy",
        "iam:DeleteRolePolicy",
        "iam:ListAttachedRolePolicies",
        "iam:AttachRolePolicy",
        "iam:DetachRolePolicy"
      ],
      "Resource": "arn:aws:iam::{{ account_id }}:role/{{ cluster_name }}-sa-*"
    },
    {
      "Effect": "Allow",
      "Action": "eks:DescribeCluster",
      "Resource": "arn:aws:eks:*:{{ account_id }}:cluster/{{ cluster_name }}"
    }
  ]
}"#;

#[derive(Debug, Parser)]
#[command(name = "cloudsap", version, about = "IAM roles for Kubernetes ServiceAccounts")]
struct Arguments {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, env = "CLOUDSAP_DEBUG", global = true)]
    debug: bool,

    /// Export spans to this OTLP collector
    #[arg(long, env = "OPENTELEMETRY_ENDPOINT_URL", global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the CloudServiceAccount controller
    Controller {
        #[command(flatten)]
        aws: AwsArgs,

        /// Upper bound on every IAM and Kubernetes API call
        #[arg(long, env = "CLOUDSAP_API_TIMEOUT_SECS", default_value_t = 30)]
        api_timeout_secs: u64,

        /// Delay before restarting a failed watch
        #[arg(long, env = "CLOUDSAP_RESTART_BACKOFF_SECS", default_value_t = 5)]
        restart_backoff_secs: u64,

        /// Address serving /metrics, /health and diagnostics
        #[arg(long, env = "CLOUDSAP_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
    },
    /// Provision prerequisites in the cloud account
    Install {
        #[command(subcommand)]
        target: InstallTarget,
    },
}

#[derive(Debug, Subcommand)]
enum InstallTarget {
    /// Create or update the IAM role assumed by the controller itself
    Irsa {
        #[command(flatten)]
        aws: AwsArgs,

        /// Namespace the controller runs in
        #[arg(long, env = "CLOUDSAP_NAMESPACE", default_value = "cloudsap")]
        namespace: String,
    },
}

#[derive(Debug, Args)]
struct AwsArgs {
    #[arg(long, env = "AWS_REGION")]
    aws_region: String,

    /// Prefix of every managed IAM role name
    #[arg(long, env = "CLOUDSAP_CLUSTER_NAME")]
    cluster_name: String,

    /// Defaults to the OIDC issuer of the EKS cluster named by --cluster-name
    #[arg(long, env = "CLOUDSAP_OIDC_ISSUER")]
    oidc_issuer: Option<String>,
}

impl AwsArgs {
    async fn settings(&self) -> anyhow::Result<(SdkConfig, Settings)> {
        let config = aws::sdk_config(&self.aws_region).await;
        let account_id = aws::account_id(&config).await?;
        let oidc_issuer = match &self.oidc_issuer {
            Some(issuer) => aws::normalize_issuer(issuer),
            None => aws::oidc_issuer(&config, &self.cluster_name).await?,
        };
        let settings = Settings {
            cluster_name: self.cluster_name.clone(),
            account_id,
            oidc_issuer,
            ..Default::default()
        };
        Ok((config, settings))
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

async fn controller(
    aws: AwsArgs,
    api_timeout: Duration,
    restart_backoff: Duration,
    bind: SocketAddr,
) -> anyhow::Result<()> {
    let (config, settings) = aws.settings().await?;
    let state = State::new(Settings {
        api_timeout,
        restart_backoff,
        ..settings
    });
    let controller_metrics = state
        .register_metrics()
        .context("Failed to register metrics")?;

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let controller = cloudsap::run(
        state.clone(),
        controller_metrics,
        Arc::new(KubeClient::new(client, "cloudsap")),
        Arc::new(AwsIam::new(&config)),
    );

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(bind)?
    .shutdown_timeout(5)
    .run();

    // The controller only returns when it cannot continue
    tokio::select! {
        err = controller => Err::<(), _>(err).context("CloudServiceAccount controller stopped"),
        res = server => res.context("HTTP server stopped"),
    }
}

async fn install_irsa(aws: AwsArgs, namespace: String) -> anyhow::Result<()> {
    let (config, settings) = aws.settings().await?;
    let reconciled = IamRoleReconciler::new(
        Arc::new(AwsIam::new(&config)),
        &settings,
        &namespace,
        CONTROLLER_SERVICE_ACCOUNT,
    )
    .with_policy(CONTROLLER_POLICY, &BTreeMap::new())
    .apply(None)
    .await
    .context("Failed to reconcile the controller's IAM role")?;

    info!(role = %reconciled.name, "Controller IAM role is ready");
    println!(
        "{}",
        reconciled
            .observed
            .role
            .map(|role| role.arn)
            .unwrap_or(reconciled.name)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();
    telemetry::init(
        if args.debug { "debug" } else { "info" },
        args.otlp_endpoint.as_deref(),
    )?;

    match args.command {
        Command::Controller {
            aws,
            api_timeout_secs,
            restart_backoff_secs,
            bind,
        } => {
            controller(
                aws,
                Duration::from_secs(api_timeout_secs),
                Duration::from_secs(restart_backoff_secs),
                bind,
            )
            .await
        }
        Command::Install {
            target: InstallTarget::Irsa { aws, namespace },
        } => install_irsa(aws, namespace).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Arguments::command().debug_assert();
    }

    #[test]
    fn controller_defaults() {
        let args = Arguments::try_parse_from([
            "cloudsap",
            "controller",
            "--aws-region",
            "us-east-1",
            "--cluster-name",
            "prod",
        ])
        .unwrap();
        let Command::Controller {
            aws,
            api_timeout_secs,
            restart_backoff_secs,
            bind,
        } = args.command
        else {
            panic!("expected the controller command");
        };
        assert_eq!(aws.cluster_name, "prod");
        assert_eq!(api_timeout_secs, 30);
        assert_eq!(restart_backoff_secs, 5);
        assert_eq!(bind, "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn controller_policy_renders() {
        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        let rendered = env
            .render_str(
                CONTROLLER_POLICY,
                BTreeMap::from([("account_id", "123456789012"), ("cluster_name", "prod")]),
            )
            .unwrap();
        let policy: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(
            policy["Statement"][0]["Resource"],
            "arn:aws:iam::123456789012:role/prod-sa-*"
        );
    }
}
