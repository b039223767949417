use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{env, fmt, fs, io, path::Path};
use validator::{Validate, ValidationError};

use crate::cidr::{Ipv4Cidr, Ipv6Cidr};

pub const USERNAME_VARIABLE: &str = "RDS_MASTER_USERNAME";
pub const PASSWORD_VARIABLE: &str = "RDS_MASTER_PASSWORD";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors in environment `{0}`: {1}")]
    ValidationError(String, String),

    #[error("Environment `{0}` is not defined in the context file")]
    UnknownEnvironment(String),

    #[error("No service name given on the command line or in the context file")]
    MissingService,

    #[error("Invalid {0} name `{1}`: use letters, digits and hyphens, starting with a letter")]
    InvalidName(&'static str, String),

    #[error("Environment variable {0} must be set to a non-empty value")]
    MissingVariable(&'static str),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

/// The context file: optional service name plus one configuration fragment
/// per named environment.
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextFile {
    pub service: Option<String>,

    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EnvironmentConfig {
    #[validate]
    pub network: NetworkConfig,

    #[validate]
    pub frontend: FrontendConfig,

    #[validate]
    pub backend: BackendConfig,

    #[validate]
    pub rds: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[validate(custom = "validate_vpc_cidr")]
    pub vpc_cidr: String,

    #[validate(range(min = 1, max = 6))]
    pub max_azs: u8,

    #[validate(range(min = 16, max = 28))]
    pub ingress_subnet_cidr_mask: u8,

    #[validate(range(min = 16, max = 28))]
    pub backend_subnet_cidr_mask: u8,

    #[validate(range(min = 16, max = 28))]
    pub rds_subnet_cidr_mask: u8,

    #[validate(custom = "validate_ipv6")]
    pub ipv6: Option<Ipv6Config>,
}

/// A BYOIP IPv6 range; every subnet receives a /64 from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ipv6Config {
    pub cidr: String,
    pub pool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FrontendConfig {
    #[validate(length(min = 3, max = 63))]
    pub bucket_name: String,

    #[serde(default = "default_index_document")]
    #[validate(length(min = 1))]
    pub index_document: String,

    pub error_document: Option<String>,
}

fn default_index_document() -> String {
    String::from("index.html")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RepositoryMode {
    /// The repository must already exist.
    #[default]
    Lookup,
    /// Declare the repository when it does not exist yet.
    CreateIfAbsent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    #[validate(length(min = 2, max = 256))]
    pub repository_name: String,

    #[serde(default)]
    pub repository_mode: RepositoryMode,

    #[serde(default = "default_image_tag")]
    #[validate(length(min = 1, max = 128))]
    pub image_tag: String,

    #[validate]
    pub cluster: ClusterConfig,

    #[validate]
    pub container: ContainerConfig,

    #[validate]
    pub instance: InstanceConfig,

    #[serde(default)]
    #[validate]
    pub health_check: HealthCheckConfig,
}

fn default_image_tag() -> String {
    String::from("latest")
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[validate(length(min = 1, max = 255))]
    pub service_name: String,

    #[validate]
    pub auto_scaling_group: AutoScalingGroupConfig,

    #[validate]
    pub ec2_service: Ec2ServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_capacity"))]
pub struct AutoScalingGroupConfig {
    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,

    pub desired_capacity: u32,

    #[validate(range(min = 1))]
    pub max_capacity: u32,
}

fn default_min_capacity() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Ec2ServiceConfig {
    #[validate(range(max = 1000))]
    pub desired_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(rename = "memoryLimitMiB")]
    #[validate(range(min = 6))]
    pub memory_limit_mib: u32,

    #[validate(range(min = 128, max = 10240))]
    pub cpu: Option<u32>,

    #[validate(length(min = 1), custom = "validate_ports")]
    pub container_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    #[validate(length(min = 1))]
    pub instance_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_health_check"))]
pub struct HealthCheckConfig {
    #[validate(length(min = 1, max = 1024))]
    pub path: String,

    #[validate(range(min = 5, max = 300))]
    pub interval_seconds: u32,

    #[validate(range(min = 2, max = 120))]
    pub timeout_seconds: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: String::from("/health"),
            interval_seconds: 60,
            timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub instance_type: String,

    #[validate(range(min = 1, max = 16))]
    pub instances: u8,

    #[validate(length(min = 1, max = 64))]
    pub default_database_name: String,
}

/// Database master credentials. Only ever read from the environment.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &'static str| match lookup(name) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(Error::MissingVariable(name)),
        };

        return Ok(Self {
            username: read(USERNAME_VARIABLE)?,
            password: read(PASSWORD_VARIABLE)?,
        });
    }
}

/// Everything the builders need for one deployment. Each builder receives
/// only its own tier's section.
#[derive(Debug, Clone)]
pub struct DeploymentParameters {
    pub service: String,
    pub environment: String,
    pub network: NetworkConfig,
    pub frontend: FrontendConfig,
    pub backend: BackendConfig,
    pub rds: DatabaseConfig,
    pub credentials: Credentials,
}

pub fn parse(path: &Path) -> Result<ContextFile, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let context: ContextFile = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    return Ok(context);
}

/// Merges the named environment's fragment with the service and environment
/// names, then overrides the master credentials from the process environment.
pub fn load(
    service: Option<&str>,
    environment: &str,
    context: &ContextFile,
) -> Result<DeploymentParameters, Error> {
    load_with(service, environment, context, Credentials::from_env)
}

pub fn load_with<F>(
    service: Option<&str>,
    environment: &str,
    context: &ContextFile,
    credentials: F,
) -> Result<DeploymentParameters, Error>
where
    F: FnOnce() -> Result<Credentials, Error>,
{
    let service = service
        .map(str::to_string)
        .or_else(|| context.service.clone())
        .ok_or(Error::MissingService)?;
    validate_name("service", &service)?;
    validate_name("environment", environment)?;

    let fragment = context
        .environments
        .get(environment)
        .ok_or_else(|| Error::UnknownEnvironment(environment.to_string()))?;
    if let Err(error) = fragment.validate() {
        return Err(Error::ValidationError(
            environment.to_string(),
            error.to_string(),
        ));
    }

    let credentials = credentials()?;
    tracing::debug!(%service, %environment, "loaded deployment parameters");

    return Ok(DeploymentParameters {
        service,
        environment: environment.to_string(),
        network: fragment.network.clone(),
        frontend: fragment.frontend.clone(),
        backend: fragment.backend.clone(),
        rds: fragment.rds.clone(),
        credentials,
    });
}

// Names end up in stack names, which CloudFormation restricts.
fn validate_name(kind: &'static str, name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
        && name.len() <= 64;
    if !valid {
        return Err(Error::InvalidName(kind, name.to_string()));
    }

    return Ok(());
}

fn validate_vpc_cidr(cidr: &str) -> Result<(), ValidationError> {
    let cidr: Ipv4Cidr = match cidr.parse() {
        Ok(cidr) => cidr,
        Err(_) => return Err(ValidationError::new("vpcCidr must be an IPv4 CIDR block")),
    };
    if !(16..=28).contains(&cidr.prefix()) {
        return Err(ValidationError::new(
            "vpcCidr prefix must be between /16 and /28",
        ));
    }

    return Ok(());
}

fn validate_ipv6(ipv6: &Ipv6Config) -> Result<(), ValidationError> {
    let cidr: Ipv6Cidr = match ipv6.cidr.parse() {
        Ok(cidr) => cidr,
        Err(_) => return Err(ValidationError::new("ipv6.cidr must be an IPv6 CIDR block")),
    };
    if cidr.prefix() > 64 {
        return Err(ValidationError::new("ipv6.cidr must be /64 or larger"));
    }
    if ipv6.pool.is_empty() {
        return Err(ValidationError::new("ipv6.pool must name the BYOIP pool"));
    }

    return Ok(());
}

fn validate_ports(ports: &[u16]) -> Result<(), ValidationError> {
    if ports.iter().any(|port| *port == 0) {
        return Err(ValidationError::new("container ports must be between 1 and 65535"));
    }

    return Ok(());
}

fn validate_capacity(group: &AutoScalingGroupConfig) -> Result<(), ValidationError> {
    if group.min_capacity > group.desired_capacity || group.desired_capacity > group.max_capacity
    {
        return Err(ValidationError::new(
            "autoScalingGroup requires minCapacity <= desiredCapacity <= maxCapacity",
        ));
    }

    return Ok(());
}

fn validate_health_check(check: &HealthCheckConfig) -> Result<(), ValidationError> {
    if check.timeout_seconds >= check.interval_seconds {
        return Err(ValidationError::new(
            "healthCheck timeoutSeconds must be less than intervalSeconds",
        ));
    }

    return Ok(());
}
