//! Container image repository lookup. Only resolves references; nothing here
//! builds or pushes images.

use async_trait::async_trait;
use aws_sdk_ecr::error::ProvideErrorMetadata;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),
}

#[async_trait]
pub trait RepositoryRegistry: Send + Sync {
    /// The repository URI (without tag), or `None` when no repository with
    /// that name exists.
    async fn repository_uri(&self, name: &str) -> Result<Option<String>, Error>;
}

/// Looks repositories up in ECR.
pub struct EcrRegistry {
    client: aws_sdk_ecr::Client,
}

impl EcrRegistry {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ecr::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl RepositoryRegistry for EcrRegistry {
    async fn repository_uri(&self, name: &str) -> Result<Option<String>, Error> {
        let result = self
            .client
            .describe_repositories()
            .repository_names(name)
            .send()
            .await;

        let output = match result {
            Ok(data) => data,
            Err(err) => {
                return match err.as_service_error() {
                    Some(service) if service.is_repository_not_found_exception() => Ok(None),
                    Some(service) => Err(Error::ServiceError(
                        service.message().unwrap_or("no message").to_string(),
                    )),
                    None => Err(Error::UnknownError(err.to_string())),
                };
            }
        };

        let uri = output
            .repositories()
            .iter()
            .find(|repository| repository.repository_name() == Some(name))
            .and_then(|repository| repository.repository_uri())
            .map(str::to_string);
        tracing::debug!(repository = name, found = uri.is_some(), "looked up repository");

        return Ok(uri);
    }
}

/// Offline stand-in for synthesis without AWS credentials: every repository is
/// assumed to exist in the deploying account and region.
pub struct AssumedRegistry;

#[async_trait]
impl RepositoryRegistry for AssumedRegistry {
    async fn repository_uri(&self, name: &str) -> Result<Option<String>, Error> {
        return Ok(Some(format!(
            "${{AWS::AccountId}}.dkr.ecr.${{AWS::Region}}.${{AWS::URLSuffix}}/{}",
            name
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assumed_registry_builds_a_substitutable_uri() {
        let uri = AssumedRegistry.repository_uri("todo-backend").await.unwrap();

        assert_eq!(
            uri.as_deref(),
            Some("${AWS::AccountId}.dkr.ecr.${AWS::Region}.${AWS::URLSuffix}/todo-backend")
        );
    }
}
