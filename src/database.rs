use serde_json::{json, Value};
use tracing::info;

use crate::config::{Credentials, DatabaseConfig};
use crate::network::{self, NetworkTopology, SubnetTier};
use crate::template::{self, intrinsic, RemovalPolicy, Resource, ResourceKind, Stack};

pub const ENGINE: &str = "aurora-mysql";
pub const ENGINE_VERSION: &str = "8.0.mysql_aurora.3.05.2";
pub const PARAMETER_GROUP_FAMILY: &str = "aurora-mysql8.0";
pub const MAX_CONNECTIONS: u32 = 100;

/// Driver options appended to every connection string.
pub const CONNECTION_OPTIONS: &str = "loc=Local&collation=utf8mb4_unicode_ci";

const CLUSTER: &str = "DatabaseCluster";
const PARAMETER_GROUP: &str = "ClusterParameterGroup";
const SUBNET_GROUP: &str = "DatabaseClusterSubnets";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("data tier: {0}")]
    Network(#[from] network::Error),

    #[error("data tier: {0}")]
    Template(#[from] template::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub host: Value,
    pub port: Value,
}

#[derive(Debug, Clone)]
pub struct DataCluster {
    /// Name of the stack the cluster was declared in.
    pub stack: String,
    pub engine: &'static str,
    pub credentials: Credentials,
    pub instance_class: String,
    pub instances: u8,
    pub schema: String,
    pub subnet_ids: Vec<Value>,
    pub security_group: Value,
    pub endpoint: Endpoint,
}

impl DataCluster {
    /// `user:password@tcp(host:port)/schema?options`, assembled at deploy time
    /// from the cluster's endpoint so it always follows the live address.
    pub fn connection_string(&self) -> Value {
        intrinsic::join(vec![
            json!(self.credentials.username),
            json!(":"),
            json!(self.credentials.password),
            json!("@tcp("),
            self.endpoint.host.clone(),
            json!(":"),
            self.endpoint.port.clone(),
            json!(")/"),
            json!(self.schema),
            json!("?"),
            json!(CONNECTION_OPTIONS),
        ])
    }
}

fn instance_class(instance_type: &str) -> String {
    match instance_type.starts_with("db.") {
        true => instance_type.to_string(),
        false => format!("db.{}", instance_type),
    }
}

pub fn build(
    network: &NetworkTopology,
    config: &DatabaseConfig,
    credentials: &Credentials,
    stack: &mut Stack,
) -> Result<DataCluster, Error> {
    let placement = network.group(SubnetTier::Data)?;
    let instance_class = instance_class(&config.instance_type);
    info!(
        stack = stack.name(),
        %instance_class,
        instances = config.instances,
        "building data tier"
    );
    stack.depend_on(&network.stack);

    let parameter_group = stack.add(
        PARAMETER_GROUP,
        Resource::new(
            ResourceKind::DbClusterParameterGroup,
            json!({
                "Description": format!("Cluster parameter group for {}", stack.name()),
                "Family": PARAMETER_GROUP_FAMILY,
                "Parameters": { "max_connections": MAX_CONNECTIONS.to_string() },
            }),
        ),
    )?;

    let subnet_ids = placement.ids();
    let subnet_group = stack.add(
        SUBNET_GROUP,
        Resource::new(
            ResourceKind::DbSubnetGroup,
            json!({
                "DBSubnetGroupDescription": format!("Subnets for {}", CLUSTER),
                "SubnetIds": subnet_ids,
            }),
        )
        .labelled("rds"),
    )?;

    let cluster = stack.add(
        CLUSTER,
        Resource::new(
            ResourceKind::DbCluster,
            json!({
                "Engine": ENGINE,
                "EngineVersion": ENGINE_VERSION,
                "MasterUsername": credentials.username,
                "MasterUserPassword": credentials.password,
                "DatabaseName": config.default_database_name,
                "DBClusterParameterGroupName": parameter_group,
                "DBSubnetGroupName": subnet_group,
                "VpcSecurityGroupIds": [network.data.id],
                "Port": network::DATABASE_PORT,
                "StorageEncrypted": true,
                "CopyTagsToSnapshot": true,
            }),
        )
        .removal_policy(RemovalPolicy::Snapshot),
    )?;

    for index in 1..=config.instances {
        stack.add(
            &format!("{}Instance{}", CLUSTER, index),
            Resource::new(
                ResourceKind::DbInstance,
                json!({
                    "Engine": ENGINE,
                    "DBInstanceClass": instance_class,
                    "DBClusterIdentifier": cluster,
                    "DBSubnetGroupName": subnet_group,
                    "PubliclyAccessible": false,
                }),
            )
            .depends_on(CLUSTER),
        )?;
    }

    let host = stack.export(
        "DatabaseEndpointAddress",
        intrinsic::get_att(CLUSTER, "Endpoint.Address"),
    );
    let port = stack.export(
        "DatabaseEndpointPort",
        intrinsic::get_att(CLUSTER, "Endpoint.Port"),
    );

    return Ok(DataCluster {
        stack: stack.name().to_string(),
        engine: ENGINE,
        credentials: credentials.clone(),
        instance_class,
        instances: config.instances,
        schema: config.default_database_name.clone(),
        subnet_ids,
        security_group: network.data.id.clone(),
        endpoint: Endpoint { host, port },
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::parameters;

    pub(crate) fn network() -> NetworkTopology {
        let mut stack = Stack::new("todo-test-network", "network");
        network::build(&parameters().network, &mut stack).unwrap()
    }

    pub(crate) fn cluster(network: &NetworkTopology, config: &DatabaseConfig) -> (Stack, DataCluster) {
        let mut stack = Stack::new("todo-test-rds", "data");
        let cluster = build(network, config, &parameters().credentials, &mut stack).unwrap();
        (stack, cluster)
    }

    #[test]
    fn placed_in_the_isolated_subnets() {
        let network = network();
        let (stack, cluster) = cluster(&network, &parameters().rds);

        assert_eq!(cluster.subnet_ids, network.group(SubnetTier::Data).unwrap().ids());
        assert_eq!(cluster.security_group, network.data.id);
        let subnet_group = stack.resource(SUBNET_GROUP).unwrap();
        assert_eq!(
            subnet_group.properties["SubnetIds"][0],
            json!({ "Fn::ImportValue": "todo-test-network:SubnetRDS1Id" })
        );
        assert!(stack.dependencies().contains("todo-test-network"));
    }

    #[test]
    fn declares_the_configured_instances() {
        let network = network();
        let mut config = parameters().rds;
        config.instances = 3;
        let (stack, cluster) = cluster(&network, &config);

        assert_eq!(stack.count(ResourceKind::DbCluster), 1);
        assert_eq!(stack.count(ResourceKind::DbInstance), 3);
        assert_eq!(cluster.instance_class, "db.t3.small");
        let instance = stack.resource("DatabaseClusterInstance3").unwrap();
        assert_eq!(instance.properties["DBInstanceClass"], "db.t3.small");
        assert_eq!(instance.properties["PubliclyAccessible"], false);
    }

    #[test]
    fn keeps_an_explicit_db_prefix() {
        assert_eq!(instance_class("db.r5.large"), "db.r5.large");
        assert_eq!(instance_class("r5.large"), "db.r5.large");
    }

    #[test]
    fn max_connections_is_fixed() {
        let network = network();
        let mut config = parameters().rds;
        config.instance_type = String::from("r5.2xlarge");
        let (stack, _) = cluster(&network, &config);

        let group = stack.resource(PARAMETER_GROUP).unwrap();
        assert_eq!(group.properties["Family"], PARAMETER_GROUP_FAMILY);
        assert_eq!(group.properties["Parameters"], json!({ "max_connections": "100" }));
    }

    #[test]
    fn credentials_and_schema_reach_the_cluster() {
        let network = network();
        let (stack, _) = cluster(&network, &parameters().rds);

        let resource = stack.resource(CLUSTER).unwrap();
        assert_eq!(resource.properties["MasterUsername"], "admin");
        assert_eq!(resource.properties["MasterUserPassword"], "secret");
        assert_eq!(resource.properties["DatabaseName"], "todo");
        assert_eq!(resource.deletion_policy, Some(RemovalPolicy::Snapshot));
    }

    #[test]
    fn connection_string_follows_the_endpoint() {
        let network = network();
        let (_, cluster) = cluster(&network, &parameters().rds);

        assert_eq!(
            cluster.connection_string(),
            json!({ "Fn::Join": ["", [
                "admin", ":", "secret", "@tcp(",
                { "Fn::ImportValue": "todo-test-rds:DatabaseEndpointAddress" },
                ":",
                { "Fn::ImportValue": "todo-test-rds:DatabaseEndpointPort" },
                ")/", "todo", "?", "loc=Local&collation=utf8mb4_unicode_ci"
            ]] })
        );

        let mut moved = cluster.clone();
        moved.endpoint.host = json!("db.example.internal");
        assert_eq!(
            moved.connection_string()["Fn::Join"][1][4],
            "db.example.internal"
        );
    }

    #[test]
    fn instance_class_does_not_change_the_address() {
        let network = network();
        let (_, small) = cluster(&network, &parameters().rds);
        let mut config = parameters().rds;
        config.instance_type = String::from("r5.large");
        let (_, large) = cluster(&network, &config);

        assert_eq!(small.connection_string(), large.connection_string());
    }

    #[test]
    fn missing_subnet_group_is_a_cross_reference_error() {
        let mut network = network();
        network.subnet_groups.retain(|group| group.tier != SubnetTier::Data);

        let mut stack = Stack::new("todo-test-rds", "data");
        let result = build(&network, &parameters().rds, &parameters().credentials, &mut stack);
        assert_eq!(
            result.err(),
            Some(Error::Network(network::Error::MissingSubnetGroup(SubnetTier::Data)))
        );
        assert!(stack.is_empty());
    }
}
