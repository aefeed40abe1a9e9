use async_trait::async_trait;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_iam::Client as AwsIamClient;
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum IamError {
    #[error("IAM entity does not exist")]
    NotFound,
    #[error("IAM entity already exists")]
    AlreadyExists,
    #[error("IAM {operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
    #[error("IAM {operation} did not complete in time")]
    Timeout { operation: &'static str },
}

impl IamError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            IamError::NotFound => "NotFound",
            IamError::AlreadyExists => "AlreadyExists",
            IamError::Api { .. } => "Api",
            IamError::Timeout { .. } => "Timeout",
        }
    }
}

/// The parts of an IAM role that the controller manages
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    pub arn: String,
    pub description: Option<String>,
    /// URL-encoded, as returned by IAM
    pub trust_policy_document: Option<String>,
}

/// The IAM API calls the controller makes.
///
/// Absent entities surface as [`IamError::NotFound`] so that callers can decide whether that is
/// a failure.
#[async_trait]
pub trait IamApi: Send + Sync {
    async fn get_role(&self, name: &str) -> Result<Role, IamError>;

    async fn get_role_policy(&self, role_name: &str, policy_name: &str)
        -> Result<String, IamError>;

    async fn list_attached_role_policies(&self, role_name: &str) -> Result<Vec<String>, IamError>;

    async fn create_role(
        &self,
        name: &str,
        trust_policy_document: &str,
        description: &str,
    ) -> Result<(), IamError>;

    async fn update_role(&self, name: &str, description: &str) -> Result<(), IamError>;

    async fn update_assume_role_policy(
        &self,
        name: &str,
        trust_policy_document: &str,
    ) -> Result<(), IamError>;

    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), IamError>;

    async fn delete_role_policy(&self, role_name: &str, policy_name: &str)
        -> Result<(), IamError>;

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError>;

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError>;

    async fn delete_role(&self, name: &str) -> Result<(), IamError>;
}

fn classify<E>(operation: &'static str, err: SdkError<E>) -> IamError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match err.as_service_error().and_then(|e| e.code()) {
        Some("NoSuchEntity") => IamError::NotFound,
        Some("EntityAlreadyExists") => IamError::AlreadyExists,
        _ => IamError::Api {
            operation,
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

/// IamApi backed by the AWS SDK
#[derive(Clone, Debug)]
pub struct AwsIam {
    client: AwsIamClient,
}

impl AwsIam {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: AwsIamClient::new(config),
        }
    }
}

#[async_trait]
impl IamApi for AwsIam {
    async fn get_role(&self, name: &str) -> Result<Role, IamError> {
        let output = self
            .client
            .get_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| classify("GetRole", e))?;
        let role = output.role().ok_or(IamError::NotFound)?;
        Ok(Role {
            name: role.role_name().into(),
            arn: role.arn().into(),
            description: role.description().map(Into::into),
            trust_policy_document: role.assume_role_policy_document().map(Into::into),
        })
    }

    async fn get_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> Result<String, IamError> {
        let output = self
            .client
            .get_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(|e| classify("GetRolePolicy", e))?;
        Ok(output.policy_document().into())
    }

    async fn list_attached_role_policies(&self, role_name: &str) -> Result<Vec<String>, IamError> {
        let mut arns = Vec::new();
        let mut marker = None;
        loop {
            let output = self
                .client
                .list_attached_role_policies()
                .role_name(role_name)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| classify("ListAttachedRolePolicies", e))?;
            arns.extend(
                output
                    .attached_policies()
                    .iter()
                    .filter_map(|p| p.policy_arn().map(String::from)),
            );
            marker = output.marker().map(String::from);
            if !output.is_truncated() || marker.is_none() {
                return Ok(arns);
            }
        }
    }

    async fn create_role(
        &self,
        name: &str,
        trust_policy_document: &str,
        description: &str,
    ) -> Result<(), IamError> {
        self.client
            .create_role()
            .role_name(name)
            .assume_role_policy_document(trust_policy_document)
            .description(description)
            .send()
            .await
            .map_err(|e| classify("CreateRole", e))?;
        Ok(())
    }

    async fn update_role(&self, name: &str, description: &str) -> Result<(), IamError> {
        self.client
            .update_role()
            .role_name(name)
            .description(description)
            .send()
            .await
            .map_err(|e| classify("UpdateRole", e))?;
        Ok(())
    }

    async fn update_assume_role_policy(
        &self,
        name: &str,
        trust_policy_document: &str,
    ) -> Result<(), IamError> {
        self.client
            .update_assume_role_policy()
            .role_name(name)
            .policy_document(trust_policy_document)
            .send()
            .await
            .map_err(|e| classify("UpdateAssumeRolePolicy", e))?;
        Ok(())
    }

    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), IamError> {
        self.client
            .put_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .policy_document(policy_document)
            .send()
            .await
            .map_err(|e| classify("PutRolePolicy", e))?;
        Ok(())
    }

    async fn delete_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> Result<(), IamError> {
        self.client
            .delete_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(|e| classify("DeleteRolePolicy", e))?;
        Ok(())
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError> {
        self.client
            .attach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| classify("AttachRolePolicy", e))?;
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError> {
        self.client
            .detach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| classify("DetachRolePolicy", e))?;
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<(), IamError> {
        self.client
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| classify("DeleteRole", e))?;
        Ok(())
    }
}
