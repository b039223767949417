//! Hands synthesized stacks to CloudFormation. Only submits templates and
//! watches the reported status; diffing and rollback stay with CloudFormation.

use async_trait::async_trait;
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_cloudformation::types::Capability;
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

use crate::deployment::Deployment;
use crate::template::Stack;

const NO_UPDATES: &str = "No updates are to be performed";
const DOES_NOT_EXIST: &str = "does not exist";
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// A failed first create leaves the stack in this state; it can only be
/// deleted, never updated.
const ROLLBACK_COMPLETE: &str = "ROLLBACK_COMPLETE";

/// Stack name to its output key/value pairs.
pub type Outputs = BTreeMap<String, BTreeMap<String, String>>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error("Stack not found: {0}")]
    NotFoundError(String),

    #[error("Stack `{stack}` could not be rendered: {reason}")]
    TemplateError { stack: String, reason: String },

    #[error("Stack `{stack}` ended in {status}: {reason}")]
    Failed {
        stack: String,
        status: String,
        reason: String,
    },

    #[error("Stack `{stack}` is in {status} and cannot be updated; delete it and deploy again")]
    NeedsDeletion { stack: String, status: String },

    #[error("Stacks {0:?} depend on each other")]
    DependencyCycle(Vec<String>),
}

/// Where a stack stands according to its CloudFormation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Done,
    Waiting,
    Failed,
}

pub fn progress(status: &str) -> Progress {
    match status {
        "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE" => Progress::Done,
        status if status.ends_with("_IN_PROGRESS") => Progress::Waiting,
        _ => Progress::Failed,
    }
}

/// One `DescribeStacks` result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackState {
    pub status: String,
    pub reason: Option<String>,
    pub outputs: BTreeMap<String, String>,
}

/// The CloudFormation calls the engine makes. Service-side failures come back
/// as `Error::ServiceError` carrying CloudFormation's message.
#[async_trait]
pub trait StackApi: Send + Sync {
    /// `None` when the call succeeds but returns no stack.
    async fn describe(&self, name: &str) -> Result<Option<StackState>, Error>;

    async fn create(&self, name: &str, body: &str) -> Result<(), Error>;

    async fn update(&self, name: &str, body: &str) -> Result<(), Error>;
}

fn service_error<E, R>(err: aws_sdk_cloudformation::error::SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err.as_service_error() {
        Some(service) => Error::ServiceError(service.message().unwrap_or("no message").to_string()),
        None => Error::UnknownError(DisplayErrorContext(&err).to_string()),
    }
}

/// `StackApi` backed by the AWS SDK.
pub struct CloudFormation {
    client: aws_sdk_cloudformation::Client,
}

impl CloudFormation {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_cloudformation::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl StackApi for CloudFormation {
    async fn describe(&self, name: &str) -> Result<Option<StackState>, Error> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(name)
            .send()
            .await
            .map_err(service_error)?;

        let stack = match result.stacks().first() {
            Some(stack) => stack,
            None => return Ok(None),
        };

        let outputs = stack
            .outputs()
            .iter()
            .filter_map(|output| Some((output.output_key()?.to_string(), output.output_value()?.to_string())))
            .collect();

        return Ok(Some(StackState {
            status: stack
                .stack_status()
                .map(|status| status.as_str().to_string())
                .unwrap_or_else(|| String::from("UNKNOWN")),
            reason: stack.stack_status_reason().map(str::to_string),
            outputs,
        }));
    }

    async fn create(&self, name: &str, body: &str) -> Result<(), Error> {
        self.client
            .create_stack()
            .stack_name(name)
            .template_body(body)
            .capabilities(Capability::CapabilityIam)
            .send()
            .await
            .map_err(service_error)?;

        return Ok(());
    }

    async fn update(&self, name: &str, body: &str) -> Result<(), Error> {
        self.client
            .update_stack()
            .stack_name(name)
            .template_body(body)
            .capabilities(Capability::CapabilityIam)
            .send()
            .await
            .map_err(service_error)?;

        return Ok(());
    }
}

/// Groups stacks so every stack's dependencies sit in an earlier group.
/// Dependencies outside `stacks` are taken to be deployed already.
pub fn waves(stacks: &[Stack]) -> Result<Vec<Vec<&Stack>>, Error> {
    let names: BTreeSet<&str> = stacks.iter().map(Stack::name).collect();
    let mut done: BTreeSet<&str> = BTreeSet::new();
    let mut remaining: Vec<&Stack> = stacks.iter().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&Stack>, Vec<&Stack>) = remaining.into_iter().partition(|stack| {
            stack
                .dependencies()
                .iter()
                .all(|dependency| done.contains(dependency.as_str()) || !names.contains(dependency.as_str()))
        });

        if ready.is_empty() {
            return Err(Error::DependencyCycle(
                blocked.iter().map(|stack| stack.name().to_string()).collect(),
            ));
        }

        done.extend(ready.iter().map(|stack| stack.name()));
        waves.push(ready);
        remaining = blocked;
    }

    return Ok(waves);
}

#[derive(Debug, PartialEq)]
enum Submission {
    Started,
    Unchanged,
}

pub struct Engine<A: StackApi> {
    api: A,
    poll_interval: Duration,
}

impl<A: StackApi> Engine<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Deploys wave by wave; the stacks inside a wave go out concurrently.
    pub async fn deploy(&self, deployment: &Deployment) -> Result<Outputs, Error> {
        self.deploy_stacks(deployment.stacks()).await
    }

    async fn deploy_stacks(&self, stacks: &[Stack]) -> Result<Outputs, Error> {
        let mut outputs = Outputs::new();

        for (index, wave) in waves(stacks)?.into_iter().enumerate() {
            let names: Vec<&str> = wave.iter().map(|stack| stack.name()).collect();
            info!(wave = index + 1, stacks = ?names, "deploying wave");

            let deployed = try_join_all(wave.into_iter().map(|stack| self.deploy_stack(stack))).await?;
            for (name, stack_outputs) in deployed {
                outputs.insert(name, stack_outputs);
            }
        }

        return Ok(outputs);
    }

    async fn deploy_stack(&self, stack: &Stack) -> Result<(String, BTreeMap<String, String>), Error> {
        let name = stack.name();
        let body = stack.to_template_body().map_err(|err| Error::TemplateError {
            stack: name.to_string(),
            reason: err.to_string(),
        })?;

        let submission = match self.status(name).await? {
            Some(status) if status == ROLLBACK_COMPLETE => {
                return Err(Error::NeedsDeletion {
                    stack: name.to_string(),
                    status,
                });
            }
            Some(status) => {
                debug!(stack = name, %status, "updating existing stack");
                self.update(name, &body).await?
            }
            None => {
                debug!(stack = name, "creating stack");
                self.api.create(name, &body).await?;
                Submission::Started
            }
        };

        match submission {
            Submission::Started => self.wait(name).await?,
            Submission::Unchanged => info!(stack = name, "no changes"),
        }

        let outputs = self.outputs(name).await?;
        return Ok((name.to_string(), outputs));
    }

    async fn update(&self, name: &str, body: &str) -> Result<Submission, Error> {
        match self.api.update(name, body).await {
            Ok(()) => Ok(Submission::Started),
            Err(Error::ServiceError(message)) if message.contains(NO_UPDATES) => Ok(Submission::Unchanged),
            Err(err) => Err(err),
        }
    }

    /// The current status, or `None` when the stack does not exist.
    async fn status(&self, name: &str) -> Result<Option<String>, Error> {
        match self.api.describe(name).await {
            Ok(state) => Ok(state.map(|state| state.status)),
            Err(Error::ServiceError(message)) if message.contains(DOES_NOT_EXIST) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn wait(&self, name: &str) -> Result<(), Error> {
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let state = self
                .api
                .describe(name)
                .await?
                .ok_or_else(|| Error::NotFoundError(name.to_string()))?;

            match progress(&state.status) {
                Progress::Done => {
                    info!(stack = name, status = %state.status, "stack deployed");
                    return Ok(());
                }
                Progress::Waiting => debug!(stack = name, status = %state.status, "waiting"),
                Progress::Failed => {
                    return Err(Error::Failed {
                        stack: name.to_string(),
                        status: state.status,
                        reason: state.reason.unwrap_or_else(|| String::from("no reason given")),
                    });
                }
            }
        }
    }

    pub async fn outputs(&self, name: &str) -> Result<BTreeMap<String, String>, Error> {
        let state = self
            .api
            .describe(name)
            .await?
            .ok_or_else(|| Error::NotFoundError(name.to_string()))?;

        return Ok(state.outputs);
    }
}
