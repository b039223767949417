//! Compute tier: EC2 capacity for an ECS cluster, the service's task
//! definition, and the public load balancer in front of it.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{BackendConfig, HealthCheckConfig, RepositoryMode};
use crate::database::DataCluster;
use crate::network::{self, NetworkTopology, SubnetTier};
use crate::registry::{self, RepositoryRegistry};
use crate::template::{self, intrinsic, RemovalPolicy, Resource, ResourceKind, Stack};

pub const CONTAINER_NAME: &str = "AppContainer";
pub const TIMEZONE: &str = "Asia/Tokyo";
pub const LISTENER_PORT: u16 = 80;
pub const LISTENER_PROTOCOL: &str = "HTTP";

/// Host provisioning run on every container instance before it joins the
/// cluster.
pub const BOOTSTRAP_COMMANDS: [&str; 4] = [
    "yum update -y",
    "yum install -y jq",
    "region=$(curl -s http://169.254.169.254/latest/dynamic/instance-identity/document | jq -r .region)",
    "yum install -y https://amazon-ssm-$region.s3.amazonaws.com/latest/linux_amd64/amazon-ssm-agent.rpm",
];

const ECS_OPTIMIZED_AMI: &str =
    "{{resolve:ssm:/aws/service/ecs/optimized-ami/amazon-linux-2/recommended/image_id}}";
const LOAD_BALANCER_NAME_LIMIT: usize = 32;

const INSTANCE_ROLE: &str = "InstanceRole";
const INSTANCE_PROFILE: &str = "InstanceProfile";
const LAUNCH_TEMPLATE: &str = "LaunchTemplate";
const AUTO_SCALING_GROUP: &str = "AutoScalingGroup";
const CLUSTER: &str = "Cluster";
const REPOSITORY: &str = "Repository";
const EXECUTION_ROLE: &str = "TaskExecutionRole";
const TASK_DEFINITION: &str = "TaskDefinition";
const LOAD_BALANCER: &str = "LoadBalancer";
const TARGET_GROUP: &str = "TargetGroup";
const LISTENER: &str = "PublicListenerHttp";
const SERVICE: &str = "Service";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("compute tier: {0}")]
    Network(#[from] network::Error),

    #[error("compute tier: repository `{0}` not found")]
    RepositoryNotFound(String),

    #[error("compute tier: looking up repository `{name}`: {reason}")]
    Registry { name: String, reason: registry::Error },

    #[error("compute tier: health check timeout ({timeout}s) must be less than its interval ({interval}s)")]
    InvalidHealthCheck { interval: u32, timeout: u32 },

    #[error("compute tier: backend.container.containerPorts is empty")]
    NoContainerPorts,

    #[error("compute tier: {0}")]
    Template(#[from] template::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    path: String,
    interval_seconds: u32,
    timeout_seconds: u32,
}

impl HealthCheck {
    pub fn new(path: impl Into<String>, interval_seconds: u32, timeout_seconds: u32) -> Result<Self, Error> {
        if timeout_seconds >= interval_seconds {
            return Err(Error::InvalidHealthCheck {
                interval: interval_seconds,
                timeout: timeout_seconds,
            });
        }

        return Ok(Self {
            path: path.into(),
            interval_seconds,
            timeout_seconds,
        });
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interval_seconds(&self) -> u32 {
        self.interval_seconds
    }

    pub fn timeout_seconds(&self) -> u32 {
        self.timeout_seconds
    }
}

impl TryFrom<&HealthCheckConfig> for HealthCheck {
    type Error = Error;

    fn try_from(config: &HealthCheckConfig) -> Result<Self, Self::Error> {
        HealthCheck::new(&config.path, config.interval_seconds, config.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageReference {
    /// A repository that already exists in the registry.
    Existing { uri: String, tag: String },
    /// A repository declared by this stack.
    Declared { name: String, tag: String },
}

impl ImageReference {
    pub fn to_value(&self) -> Value {
        match self {
            ImageReference::Existing { uri, tag } => intrinsic::sub(&format!("{}:{}", uri, tag)),
            ImageReference::Declared { tag, .. } => intrinsic::join(vec![
                intrinsic::get_att(REPOSITORY, "RepositoryUri"),
                json!(format!(":{}", tag)),
            ]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComputeService {
    pub image: ImageReference,
    pub memory_limit_mib: u32,
    pub cpu: Option<u32>,
    pub container_ports: Vec<u16>,
    pub desired_count: u32,
    pub desired_capacity: u32,
    pub max_capacity: u32,
    pub environment: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct LoadBalancerFront {
    pub listener_port: u16,
    pub protocol: &'static str,
    pub health_check: HealthCheck,
    /// Logical id of the ECS service whose instances form the target set.
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ComputeTier {
    pub service: ComputeService,
    pub front: LoadBalancerFront,
}

/// `service` and `environment` name the cluster and load balancer.
pub async fn build(
    network: &NetworkTopology,
    data: &DataCluster,
    config: &BackendConfig,
    service: &str,
    environment: &str,
    registry: &dyn RepositoryRegistry,
    stack: &mut Stack,
) -> Result<ComputeTier, Error> {
    let health_check = HealthCheck::try_from(&config.health_check)?;
    let target_port = *config
        .container
        .container_ports
        .first()
        .ok_or(Error::NoContainerPorts)?;
    let backend_subnets = network.group(SubnetTier::Backend)?.ids();
    let ingress_subnets = network.group(SubnetTier::Ingress)?.ids();

    let image = resolve_image(config, registry).await?;
    let qualified = format!("{}-{}", service, environment);
    info!(stack = stack.name(), ?image, "building compute tier");
    stack.depend_on(&network.stack);
    stack.depend_on(&data.stack);

    declare_capacity(stack, network, config, backend_subnets)?;

    stack.add(
        CLUSTER,
        Resource::new(ResourceKind::EcsCluster, json!({ "ClusterName": qualified })).qualified_name(),
    )?;

    if let ImageReference::Declared { name, .. } = &image {
        stack.add(
            REPOSITORY,
            Resource::new(ResourceKind::EcrRepository, json!({ "RepositoryName": name }))
                .removal_policy(RemovalPolicy::Retain)
                .qualified_name(),
        )?;
    }

    let mut environment_variables = BTreeMap::new();
    environment_variables.insert(String::from("TZ"), json!(TIMEZONE));
    environment_variables.insert(String::from("ENVIRONMENT"), json!(environment));
    environment_variables.insert(String::from("DATABASE_URL"), data.connection_string());

    let compute = ComputeService {
        image,
        memory_limit_mib: config.container.memory_limit_mib,
        cpu: config.container.cpu,
        container_ports: config.container.container_ports.clone(),
        desired_count: config.cluster.ec2_service.desired_count,
        desired_capacity: config.cluster.auto_scaling_group.desired_capacity,
        max_capacity: config.cluster.auto_scaling_group.max_capacity,
        environment: environment_variables,
    };
    declare_task_definition(stack, &qualified, &compute)?;

    let front = LoadBalancerFront {
        listener_port: LISTENER_PORT,
        protocol: LISTENER_PROTOCOL,
        health_check,
        target: SERVICE.to_string(),
    };
    declare_load_balancer(stack, network, &qualified, &front, ingress_subnets)?;

    stack.add(
        SERVICE,
        Resource::new(
            ResourceKind::EcsService,
            json!({
                "Cluster": intrinsic::reference(CLUSTER),
                "TaskDefinition": intrinsic::reference(TASK_DEFINITION),
                "ServiceName": config.cluster.service_name,
                "LaunchType": "EC2",
                "DesiredCount": compute.desired_count,
                "DeploymentConfiguration": {
                    "MinimumHealthyPercent": 50,
                    "MaximumPercent": 200,
                },
                "LoadBalancers": [{
                    "ContainerName": CONTAINER_NAME,
                    "ContainerPort": target_port,
                    "TargetGroupArn": intrinsic::reference(TARGET_GROUP),
                }],
            }),
        )
        .depends_on(LISTENER),
    )?;

    stack.output(
        "LoadBalancerDnsName",
        intrinsic::get_att(LOAD_BALANCER, "DNSName"),
    );

    return Ok(ComputeTier {
        service: compute,
        front,
    });
}

async fn resolve_image(
    config: &BackendConfig,
    registry: &dyn RepositoryRegistry,
) -> Result<ImageReference, Error> {
    let name = &config.repository_name;
    let uri = registry
        .repository_uri(name)
        .await
        .map_err(|reason| Error::Registry {
            name: name.clone(),
            reason,
        })?;

    let tag = config.image_tag.clone();
    match (uri, config.repository_mode) {
        (Some(uri), _) => Ok(ImageReference::Existing { uri, tag }),
        (None, RepositoryMode::CreateIfAbsent) => {
            debug!(repository = %name, "repository absent, declaring it");
            Ok(ImageReference::Declared {
                name: name.clone(),
                tag,
            })
        }
        (None, RepositoryMode::Lookup) => Err(Error::RepositoryNotFound(name.clone())),
    }
}

fn managed_policy(name: &str) -> Value {
    intrinsic::sub(&format!("arn:${{AWS::Partition}}:iam::aws:policy/{}", name))
}

fn assume_role_policy(service_principal: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service_principal },
            "Action": "sts:AssumeRole",
        }],
    })
}

fn user_data() -> Value {
    let mut lines = vec![json!("#!/bin/bash\n")];
    for command in BOOTSTRAP_COMMANDS {
        lines.push(json!(format!("{}\n", command)));
    }
    lines.push(json!("echo ECS_CLUSTER="));
    lines.push(intrinsic::reference(CLUSTER));
    lines.push(json!(" >> /etc/ecs/ecs.config\n"));

    intrinsic::base64(intrinsic::join(lines))
}

fn declare_capacity(
    stack: &mut Stack,
    network: &NetworkTopology,
    config: &BackendConfig,
    subnets: Vec<Value>,
) -> Result<(), Error> {
    stack.add(
        INSTANCE_ROLE,
        Resource::new(
            ResourceKind::IamRole,
            json!({
                "AssumeRolePolicyDocument": assume_role_policy("ec2.amazonaws.com"),
                "ManagedPolicyArns": [
                    managed_policy("service-role/AmazonEC2ContainerServiceforEC2Role"),
                    managed_policy("AmazonSSMManagedInstanceCore"),
                ],
            }),
        ),
    )?;
    stack.add(
        INSTANCE_PROFILE,
        Resource::new(
            ResourceKind::InstanceProfile,
            json!({ "Roles": [intrinsic::reference(INSTANCE_ROLE)] }),
        ),
    )?;

    stack.add(
        LAUNCH_TEMPLATE,
        Resource::new(
            ResourceKind::LaunchTemplate,
            json!({
                "LaunchTemplateData": {
                    "ImageId": ECS_OPTIMIZED_AMI,
                    "InstanceType": config.instance.instance_type,
                    "IamInstanceProfile": { "Arn": intrinsic::get_att(INSTANCE_PROFILE, "Arn") },
                    "SecurityGroupIds": [network.compute.id],
                    "UserData": user_data(),
                },
            }),
        ),
    )?;

    let capacity = &config.cluster.auto_scaling_group;
    stack.add(
        AUTO_SCALING_GROUP,
        Resource::new(
            ResourceKind::AutoScalingGroup,
            json!({
                "VPCZoneIdentifier": subnets,
                "LaunchTemplate": {
                    "LaunchTemplateId": intrinsic::reference(LAUNCH_TEMPLATE),
                    "Version": intrinsic::get_att(LAUNCH_TEMPLATE, "LatestVersionNumber"),
                },
                "MinSize": capacity.min_capacity.to_string(),
                "MaxSize": capacity.max_capacity.to_string(),
                "DesiredCapacity": capacity.desired_capacity.to_string(),
            }),
        )
        .qualified_name(),
    )?;

    return Ok(());
}

fn declare_task_definition(stack: &mut Stack, family: &str, compute: &ComputeService) -> Result<(), Error> {
    stack.add(
        EXECUTION_ROLE,
        Resource::new(
            ResourceKind::IamRole,
            json!({
                "AssumeRolePolicyDocument": assume_role_policy("ecs-tasks.amazonaws.com"),
                "ManagedPolicyArns": [
                    managed_policy("service-role/AmazonECSTaskExecutionRolePolicy"),
                ],
            }),
        ),
    )?;

    let environment: Vec<Value> = compute
        .environment
        .iter()
        .map(|(name, value)| json!({ "Name": name, "Value": value }))
        .collect();
    // Host port 0 lets ECS pick a free port per task in bridge mode.
    let port_mappings: Vec<Value> = compute
        .container_ports
        .iter()
        .map(|port| json!({ "ContainerPort": port, "HostPort": 0, "Protocol": "tcp" }))
        .collect();

    let mut container = json!({
        "Name": CONTAINER_NAME,
        "Image": compute.image.to_value(),
        "Essential": true,
        "Memory": compute.memory_limit_mib,
        "Environment": environment,
        "PortMappings": port_mappings,
    });
    if let Some(cpu) = compute.cpu {
        container["Cpu"] = json!(cpu);
    }

    stack.add(
        TASK_DEFINITION,
        Resource::new(
            ResourceKind::TaskDefinition,
            json!({
                "Family": family,
                "NetworkMode": "bridge",
                "RequiresCompatibilities": ["EC2"],
                "ExecutionRoleArn": intrinsic::get_att(EXECUTION_ROLE, "Arn"),
                "ContainerDefinitions": [container],
            }),
        ),
    )?;

    return Ok(());
}

fn load_balancer_name(qualified: &str) -> String {
    let mut name: String = qualified.chars().take(LOAD_BALANCER_NAME_LIMIT).collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

fn declare_load_balancer(
    stack: &mut Stack,
    network: &NetworkTopology,
    qualified: &str,
    front: &LoadBalancerFront,
    subnets: Vec<Value>,
) -> Result<(), Error> {
    stack.add(
        LOAD_BALANCER,
        Resource::new(
            ResourceKind::LoadBalancer,
            json!({
                "Name": load_balancer_name(qualified),
                "Type": "application",
                "Scheme": "internet-facing",
                "IpAddressType": "ipv4",
                "Subnets": subnets,
                "SecurityGroups": [network.ingress.id],
            }),
        )
        .qualified_name(),
    )?;

    let check = &front.health_check;
    stack.add(
        TARGET_GROUP,
        Resource::new(
            ResourceKind::TargetGroup,
            json!({
                "Port": front.listener_port,
                "Protocol": front.protocol,
                "TargetType": "instance",
                "VpcId": network.vpc_id,
                "HealthCheckProtocol": front.protocol,
                "HealthCheckPath": check.path(),
                "HealthCheckIntervalSeconds": check.interval_seconds(),
                "HealthCheckTimeoutSeconds": check.timeout_seconds(),
            }),
        ),
    )?;

    stack.add(
        LISTENER,
        Resource::new(
            ResourceKind::Listener,
            json!({
                "LoadBalancerArn": intrinsic::reference(LOAD_BALANCER),
                "Port": front.listener_port,
                "Protocol": front.protocol,
                "DefaultActions": [{
                    "Type": "forward",
                    "TargetGroupArn": intrinsic::reference(TARGET_GROUP),
                }],
            }),
        ),
    )?;

    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::parameters;
    use crate::database::tests::{cluster, network};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeRegistry {
        repositories: HashMap<String, String>,
        broken: bool,
    }

    impl FakeRegistry {
        fn with(name: &str) -> Self {
            let mut repositories = HashMap::new();
            repositories.insert(
                name.to_string(),
                format!("123456789012.dkr.ecr.ap-northeast-1.amazonaws.com/{}", name),
            );
            Self {
                repositories,
                broken: false,
            }
        }

        fn empty() -> Self {
            Self {
                repositories: HashMap::new(),
                broken: false,
            }
        }
    }

    #[async_trait]
    impl RepositoryRegistry for FakeRegistry {
        async fn repository_uri(&self, name: &str) -> Result<Option<String>, registry::Error> {
            if self.broken {
                return Err(registry::Error::ServiceError(String::from("throttled")));
            }
            Ok(self.repositories.get(name).cloned())
        }
    }

    async fn compute(
        config: &BackendConfig,
        registry: &FakeRegistry,
    ) -> (Stack, Result<ComputeTier, Error>, DataCluster) {
        let network = network();
        let (_, data) = cluster(&network, &parameters().rds);
        let mut stack = Stack::new("todo-test-backend", "compute");
        let result = build(&network, &data, config, "todo", "test", registry, &mut stack).await;
        (stack, result, data)
    }

    #[tokio::test]
    async fn builds_the_service_behind_a_load_balancer() {
        let config = parameters().backend;
        let (stack, result, data) = compute(&config, &FakeRegistry::with("todo-backend")).await;
        let tier = result.unwrap();

        for kind in [
            ResourceKind::LaunchTemplate,
            ResourceKind::AutoScalingGroup,
            ResourceKind::EcsCluster,
            ResourceKind::TaskDefinition,
            ResourceKind::EcsService,
            ResourceKind::LoadBalancer,
            ResourceKind::TargetGroup,
            ResourceKind::Listener,
        ] {
            assert_eq!(stack.count(kind), 1, "{:?}", kind);
        }
        assert_eq!(stack.count(ResourceKind::EcrRepository), 0);
        assert_eq!(tier.front.target, SERVICE);
        assert_eq!(tier.front.listener_port, 80);
        assert_eq!(tier.service.environment["TZ"], "Asia/Tokyo");
        assert_eq!(tier.service.environment["ENVIRONMENT"], "test");
        assert_eq!(tier.service.environment["DATABASE_URL"], data.connection_string());
        assert!(stack.dependencies().contains("todo-test-network"));
        assert!(stack.dependencies().contains("todo-test-rds"));
        assert_eq!(
            stack.resource(CLUSTER).unwrap().properties["ClusterName"],
            "todo-test"
        );
    }

    #[tokio::test]
    async fn container_gets_the_connection_string_and_ports() {
        let mut config = parameters().backend;
        config.container.container_ports = vec![3000, 9090];
        config.container.cpu = Some(256);
        let (stack, result, data) = compute(&config, &FakeRegistry::with("todo-backend")).await;
        result.unwrap();

        let task = stack.resource(TASK_DEFINITION).unwrap();
        let container = &task.properties["ContainerDefinitions"][0];
        assert_eq!(container["Name"], CONTAINER_NAME);
        assert_eq!(container["Memory"], 256);
        assert_eq!(container["Cpu"], 256);
        assert_eq!(
            container["Image"],
            json!({ "Fn::Sub": "123456789012.dkr.ecr.ap-northeast-1.amazonaws.com/todo-backend:latest" })
        );
        let database_url = container["Environment"]
            .as_array()
            .unwrap()
            .iter()
            .find(|variable| variable["Name"] == "DATABASE_URL")
            .unwrap();
        assert_eq!(database_url["Value"], data.connection_string());
        let ports: Vec<&Value> = container["PortMappings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|mapping| &mapping["ContainerPort"])
            .collect();
        assert_eq!(ports, vec![&json!(3000), &json!(9090)]);

        let service = stack.resource(SERVICE).unwrap();
        assert_eq!(service.properties["LoadBalancers"][0]["ContainerPort"], 3000);
        assert!(service.depends_on.contains(LISTENER));
    }

    #[tokio::test]
    async fn missing_repository_declares_nothing() {
        let config = parameters().backend;
        let (stack, result, _) = compute(&config, &FakeRegistry::empty()).await;

        assert_eq!(
            result.err(),
            Some(Error::RepositoryNotFound(String::from("todo-backend")))
        );
        assert!(stack.is_empty());
        assert!(stack.dependencies().is_empty());
    }

    #[tokio::test]
    async fn registry_failure_declares_nothing() {
        let config = parameters().backend;
        let mut registry = FakeRegistry::with("todo-backend");
        registry.broken = true;
        let (stack, result, _) = compute(&config, &registry).await;

        assert!(matches!(result, Err(Error::Registry { .. })));
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn creates_the_repository_when_allowed() {
        let mut config = parameters().backend;
        config.repository_mode = RepositoryMode::CreateIfAbsent;
        config.image_tag = String::from("v1");
        let (stack, result, _) = compute(&config, &FakeRegistry::empty()).await;
        let tier = result.unwrap();

        assert_eq!(
            tier.service.image,
            ImageReference::Declared {
                name: String::from("todo-backend"),
                tag: String::from("v1"),
            }
        );
        let repository = stack.resource(REPOSITORY).unwrap();
        assert_eq!(repository.properties["RepositoryName"], "todo-backend");
        assert_eq!(repository.deletion_policy, Some(RemovalPolicy::Retain));
        let image = &stack.resource(TASK_DEFINITION).unwrap().properties["ContainerDefinitions"][0]["Image"];
        assert_eq!(image["Fn::Join"][1][0], intrinsic::get_att(REPOSITORY, "RepositoryUri"));
        assert_eq!(image["Fn::Join"][1][1], ":v1");
    }

    #[tokio::test]
    async fn existing_repository_is_not_redeclared_in_create_mode() {
        let mut config = parameters().backend;
        config.repository_mode = RepositoryMode::CreateIfAbsent;
        let (stack, result, _) = compute(&config, &FakeRegistry::with("todo-backend")).await;
        result.unwrap();

        assert_eq!(stack.count(ResourceKind::EcrRepository), 0);
    }

    #[test]
    fn health_check_timeout_must_be_below_interval() {
        assert!(HealthCheck::new("/health", 60, 5).is_ok());
        assert_eq!(
            HealthCheck::new("/health", 5, 5),
            Err(Error::InvalidHealthCheck {
                interval: 5,
                timeout: 5
            })
        );
        assert!(HealthCheck::new("/health", 5, 10).is_err());
    }

    #[tokio::test]
    async fn invalid_health_check_declares_nothing() {
        let mut config = parameters().backend;
        config.health_check.timeout_seconds = 90;
        let (stack, result, _) = compute(&config, &FakeRegistry::with("todo-backend")).await;

        assert!(matches!(result, Err(Error::InvalidHealthCheck { .. })));
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn target_group_polls_the_health_path() {
        let config = parameters().backend;
        let (stack, result, _) = compute(&config, &FakeRegistry::with("todo-backend")).await;
        result.unwrap();

        let group = stack.resource(TARGET_GROUP).unwrap();
        assert_eq!(group.properties["HealthCheckPath"], "/health");
        assert_eq!(group.properties["HealthCheckIntervalSeconds"], 60);
        assert_eq!(group.properties["HealthCheckTimeoutSeconds"], 5);
        let listener = stack.resource(LISTENER).unwrap();
        assert_eq!(listener.properties["Port"], 80);
        assert_eq!(listener.properties["Protocol"], "HTTP");
    }

    #[tokio::test]
    async fn placement_follows_the_subnet_tiers() {
        let config = parameters().backend;
        let (stack, result, _) = compute(&config, &FakeRegistry::with("todo-backend")).await;
        result.unwrap();
        let network = network();

        let group = stack.resource(AUTO_SCALING_GROUP).unwrap();
        assert_eq!(
            group.properties["VPCZoneIdentifier"],
            json!(network.group(SubnetTier::Backend).unwrap().ids())
        );
        let balancer = stack.resource(LOAD_BALANCER).unwrap();
        assert_eq!(
            balancer.properties["Subnets"],
            json!(network.group(SubnetTier::Ingress).unwrap().ids())
        );
        assert_eq!(balancer.properties["SecurityGroups"], json!([network.ingress.id]));
        let template = stack.resource(LAUNCH_TEMPLATE).unwrap();
        assert_eq!(
            template.properties["LaunchTemplateData"]["SecurityGroupIds"],
            json!([network.compute.id])
        );
    }

    #[tokio::test]
    async fn backend_resources_carry_the_qualified_name() {
        let mut config = parameters().backend;
        config.repository_mode = RepositoryMode::CreateIfAbsent;
        let (stack, result, _) = compute(&config, &FakeRegistry::empty()).await;
        result.unwrap();

        for logical_id in [AUTO_SCALING_GROUP, CLUSTER, REPOSITORY, LOAD_BALANCER] {
            assert!(stack.resource(logical_id).unwrap().qualified_name, "{logical_id}");
        }
        for logical_id in [LAUNCH_TEMPLATE, TASK_DEFINITION, TARGET_GROUP, SERVICE] {
            assert!(!stack.resource(logical_id).unwrap().qualified_name, "{logical_id}");
        }
    }

    #[tokio::test]
    async fn colliding_logical_ids_are_an_error() {
        let network = network();
        let (_, data) = cluster(&network, &parameters().rds);
        let mut stack = Stack::new("todo-test-backend", "compute");
        stack
            .add(CLUSTER, Resource::new(ResourceKind::EcsCluster, json!({})))
            .unwrap();

        let result = build(
            &network,
            &data,
            &parameters().backend,
            "todo",
            "test",
            &FakeRegistry::with("todo-backend"),
            &mut stack,
        )
        .await;
        assert_eq!(
            result.err(),
            Some(Error::Template(template::Error::DuplicateLogicalId {
                stack: String::from("todo-test-backend"),
                logical_id: String::from(CLUSTER),
            }))
        );
    }

    #[test]
    fn user_data_runs_the_fixed_bootstrap_then_joins_the_cluster() {
        let data = user_data();
        let lines = data["Fn::Base64"]["Fn::Join"][1].as_array().unwrap();

        assert_eq!(lines[0], "#!/bin/bash\n");
        assert_eq!(lines[1], "yum update -y\n");
        assert_eq!(lines[2], "yum install -y jq\n");
        assert!(lines[3].as_str().unwrap().starts_with("region=$(curl"));
        assert!(lines[4].as_str().unwrap().contains("amazon-ssm-agent.rpm"));
        assert_eq!(lines[6], intrinsic::reference(CLUSTER));
    }

    #[test]
    fn load_balancer_names_fit_the_limit() {
        assert_eq!(load_balancer_name("todo-test"), "todo-test");
        let long = load_balancer_name("a-very-long-service-name-for-the-production");
        assert!(long.len() <= 32);
        assert!(!long.ends_with('-'));
    }
}
