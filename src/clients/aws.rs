//! AWS SDK configuration and the account/cluster facts the controller needs at startup.

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use tracing::info;

/// Load AWS SDK configuration from the default credential chain (which supports IRSA)
pub async fn sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

/// The account that owns the credentials in use
pub async fn account_id(config: &SdkConfig) -> Result<String> {
    let identity = aws_sdk_sts::Client::new(config)
        .get_caller_identity()
        .send()
        .await
        .context("Failed to get caller identity from STS")?;
    let account = identity
        .account()
        .context("STS caller identity has no account")?
        .to_string();
    info!("Running with AWS identity {}", identity.arn().unwrap_or(&account));
    Ok(account)
}

/// Discover the OIDC issuer of an EKS cluster
pub async fn oidc_issuer(config: &SdkConfig, cluster_name: &str) -> Result<String> {
    let output = aws_sdk_eks::Client::new(config)
        .describe_cluster()
        .name(cluster_name)
        .send()
        .await
        .with_context(|| format!("Failed to describe EKS cluster {cluster_name}"))?;
    let issuer = output
        .cluster()
        .and_then(|c| c.identity())
        .and_then(|i| i.oidc())
        .and_then(|o| o.issuer())
        .with_context(|| format!("EKS cluster {cluster_name} has no OIDC issuer"))?;
    Ok(normalize_issuer(issuer))
}

/// IAM refers to OIDC providers without the URL scheme
pub fn normalize_issuer(issuer: &str) -> String {
    issuer
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_string()
}
