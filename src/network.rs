//! Network tier: one VPC, three subnet groups and the security groups that
//! chain them together (internet -> ingress -> backend -> rds).

use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, info};

use crate::cidr::{self, Ipv4Allocator, Ipv4Cidr, Ipv6Allocator, Ipv6Cidr};
use crate::config::NetworkConfig;
use crate::template::{self, intrinsic, Resource, ResourceKind, Stack};

pub const DATABASE_PORT: u16 = 3306;
const INGRESS_PORTS: [u16; 2] = [80, 443];

const VPC: &str = "Vpc";
const VPC_IPV6: &str = "VpcIpv6CidrBlock";
const INTERNET_GATEWAY: &str = "InternetGateway";
const GATEWAY_ATTACHMENT: &str = "VpcGatewayAttachment";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("network.vpcCidr: {0}")]
    InvalidCidr(cidr::Error),

    #[error("network.ipv6.cidr: {0}")]
    InvalidIpv6Cidr(cidr::Error),

    #[error("allocating {tier} subnet for zone {zone}: {reason}")]
    Allocation {
        tier: SubnetTier,
        zone: usize,
        reason: cidr::Error,
    },

    #[error("subnet group {0} was not produced by the network builder")]
    MissingSubnetGroup(SubnetTier),

    #[error(transparent)]
    Template(#[from] template::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubnetTier {
    Ingress,
    Backend,
    Data,
}

impl SubnetTier {
    pub const ALL: [SubnetTier; 3] = [SubnetTier::Ingress, SubnetTier::Backend, SubnetTier::Data];

    pub fn group_name(&self) -> &'static str {
        match self {
            SubnetTier::Ingress => "SubnetIngress",
            SubnetTier::Backend => "SubnetBackend",
            SubnetTier::Data => "SubnetRDS",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SubnetTier::Ingress => "ingress",
            SubnetTier::Backend => "backend",
            SubnetTier::Data => "rds",
        }
    }

    pub fn routing(&self) -> Routing {
        match self {
            SubnetTier::Ingress | SubnetTier::Backend => Routing::Public,
            SubnetTier::Data => Routing::Isolated,
        }
    }

    fn mask(&self, config: &NetworkConfig) -> u8 {
        match self {
            SubnetTier::Ingress => config.ingress_subnet_cidr_mask,
            SubnetTier::Backend => config.backend_subnet_cidr_mask,
            SubnetTier::Data => config.rds_subnet_cidr_mask,
        }
    }
}

impl fmt::Display for SubnetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.group_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Default routes to the internet gateway.
    Public,
    /// No route leaves the VPC.
    Isolated,
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub logical_id: String,
    pub cidr: Ipv4Cidr,
    pub ipv6: Option<Ipv6Cidr>,
    /// Index into the region's availability zones.
    pub zone: usize,
    /// Import of the subnet id, for use from other stacks.
    pub id: Value,
}

#[derive(Debug, Clone)]
pub struct SubnetGroup {
    pub tier: SubnetTier,
    pub routing: Routing,
    pub subnets: Vec<Subnet>,
}

impl SubnetGroup {
    pub fn ids(&self) -> Vec<Value> {
        self.subnets.iter().map(|subnet| subnet.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }

    pub fn all() -> Self {
        Self {
            from: 0,
            to: u16::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    AnyIpv4,
    AnyIpv6,
    Ipv4(Ipv4Cidr),
    Ipv6(Ipv6Cidr),
}

/// Ingress rule; this model only ever opens TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupRule {
    pub ports: PortRange,
    pub peer: Peer,
}

impl SecurityGroupRule {
    pub fn tcp(peer: Peer, ports: PortRange) -> Self {
        Self { ports, peer }
    }

    fn to_property(&self) -> Value {
        let mut rule = json!({
            "IpProtocol": "tcp",
            "FromPort": self.ports.from,
            "ToPort": self.ports.to,
        });
        match self.peer {
            Peer::AnyIpv4 => rule["CidrIp"] = json!("0.0.0.0/0"),
            Peer::AnyIpv6 => rule["CidrIpv6"] = json!("::/0"),
            Peer::Ipv4(cidr) => rule["CidrIp"] = json!(cidr.to_string()),
            Peer::Ipv6(cidr) => rule["CidrIpv6"] = json!(cidr.to_string()),
        }

        rule
    }
}

#[derive(Debug, Clone)]
pub struct SecurityGroup {
    pub logical_id: String,
    pub rules: Vec<SecurityGroupRule>,
    /// Import of the group id, for use from other stacks.
    pub id: Value,
}

#[derive(Debug, Clone)]
pub struct NetworkTopology {
    /// Name of the stack the network was declared in.
    pub stack: String,
    pub vpc_id: Value,
    pub cidr: Ipv4Cidr,
    pub subnet_groups: Vec<SubnetGroup>,
    pub ingress: SecurityGroup,
    pub compute: SecurityGroup,
    pub data: SecurityGroup,
}

impl NetworkTopology {
    pub fn group(&self, tier: SubnetTier) -> Result<&SubnetGroup, Error> {
        self.subnet_groups
            .iter()
            .find(|group| group.tier == tier && !group.subnets.is_empty())
            .ok_or(Error::MissingSubnetGroup(tier))
    }

    pub fn subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnet_groups.iter().flat_map(|group| group.subnets.iter())
    }
}

pub fn build(config: &NetworkConfig, stack: &mut Stack) -> Result<NetworkTopology, Error> {
    let cidr: Ipv4Cidr = config.vpc_cidr.parse().map_err(Error::InvalidCidr)?;
    info!(stack = stack.name(), %cidr, zones = config.max_azs, "building network topology");

    let vpc = stack.add(
        VPC,
        Resource::new(
            ResourceKind::Vpc,
            json!({
                "CidrBlock": cidr.to_string(),
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
            }),
        ),
    )?;

    let mut ipv6_allocator = match &config.ipv6 {
        Some(ipv6) => {
            let block: Ipv6Cidr = ipv6.cidr.parse().map_err(Error::InvalidIpv6Cidr)?;
            stack.add(
                VPC_IPV6,
                Resource::new(
                    ResourceKind::VpcCidrBlock,
                    json!({
                        "VpcId": vpc,
                        "Ipv6Pool": ipv6.pool,
                        "Ipv6CidrBlock": block.to_string(),
                    }),
                ),
            )?;
            Some(Ipv6Allocator::new(block).map_err(Error::InvalidIpv6Cidr)?)
        }
        None => None,
    };

    let gateway = stack.add(
        INTERNET_GATEWAY,
        Resource::new(ResourceKind::InternetGateway, json!({})),
    )?;
    stack.add(
        GATEWAY_ATTACHMENT,
        Resource::new(
            ResourceKind::VpcGatewayAttachment,
            json!({ "VpcId": vpc, "InternetGatewayId": gateway }),
        ),
    )?;

    let mut allocator = Ipv4Allocator::new(cidr);
    let mut subnet_groups = Vec::with_capacity(SubnetTier::ALL.len());
    for tier in SubnetTier::ALL {
        let mut subnets = Vec::with_capacity(config.max_azs as usize);
        for zone in 0..config.max_azs as usize {
            let allocation = |reason| Error::Allocation { tier, zone, reason };
            let block = allocator.allocate(tier.mask(config)).map_err(allocation)?;
            let ipv6 = match ipv6_allocator.as_mut() {
                Some(v6) => Some(v6.allocate().map_err(allocation)?),
                None => None,
            };

            let subnet = declare_subnet(stack, tier, zone, block, ipv6, &vpc, &gateway)?;
            debug!(subnet = %subnet.logical_id, cidr = %block, "allocated subnet");
            subnets.push(subnet);
        }
        subnet_groups.push(SubnetGroup {
            tier,
            routing: tier.routing(),
            subnets,
        });
    }

    let group = |tier: SubnetTier| {
        subnet_groups
            .iter()
            .find(|group| group.tier == tier)
            .ok_or(Error::MissingSubnetGroup(tier))
    };

    let mut ingress_rules = Vec::new();
    for port in INGRESS_PORTS {
        ingress_rules.push(SecurityGroupRule::tcp(Peer::AnyIpv4, PortRange::single(port)));
        ingress_rules.push(SecurityGroupRule::tcp(Peer::AnyIpv6, PortRange::single(port)));
    }
    let ingress = declare_security_group(stack, "SecurityGroupIngress", "ingress", &vpc, ingress_rules)?;

    let compute_rules = rules_from(group(SubnetTier::Ingress)?, PortRange::all());
    let compute = declare_security_group(stack, "SecurityGroupBackend", "backend", &vpc, compute_rules)?;

    let data_rules = rules_from(group(SubnetTier::Backend)?, PortRange::single(DATABASE_PORT));
    let data = declare_security_group(stack, "SecurityGroupRDS", "rds", &vpc, data_rules)?;

    let vpc_id = stack.export("VpcId", vpc);

    return Ok(NetworkTopology {
        stack: stack.name().to_string(),
        vpc_id,
        cidr,
        subnet_groups,
        ingress,
        compute,
        data,
    });
}

/// One rule per address family per subnet of `group`. A subnet without an
/// IPv6 block contributes no IPv6 rule at all.
pub fn rules_from(group: &SubnetGroup, ports: PortRange) -> Vec<SecurityGroupRule> {
    let mut rules = Vec::new();
    for subnet in &group.subnets {
        rules.push(SecurityGroupRule::tcp(Peer::Ipv4(subnet.cidr), ports));
        if let Some(ipv6) = subnet.ipv6 {
            rules.push(SecurityGroupRule::tcp(Peer::Ipv6(ipv6), ports));
        }
    }

    rules
}

fn declare_subnet(
    stack: &mut Stack,
    tier: SubnetTier,
    zone: usize,
    block: Ipv4Cidr,
    ipv6: Option<Ipv6Cidr>,
    vpc: &Value,
    gateway: &Value,
) -> Result<Subnet, Error> {
    let logical_id = format!("{}{}", tier.group_name(), zone + 1);
    let public = tier.routing() == Routing::Public;

    let mut properties = json!({
        "VpcId": vpc,
        "CidrBlock": block.to_string(),
        "AvailabilityZone": intrinsic::select(zone, intrinsic::get_azs()),
        "MapPublicIpOnLaunch": public,
    });
    if let Some(ipv6) = ipv6 {
        properties["Ipv6CidrBlock"] = json!(ipv6.to_string());
        properties["AssignIpv6AddressOnCreation"] = json!(false);
    }
    let mut subnet = Resource::new(ResourceKind::Subnet, properties);
    if ipv6.is_some() {
        subnet = subnet.depends_on(VPC_IPV6);
    }
    let subnet_ref = stack.add(&logical_id, subnet.labelled(tier.label()))?;

    let route_table_id = format!("{}RouteTable", logical_id);
    let route_table = stack.add(
        &route_table_id,
        Resource::new(ResourceKind::RouteTable, json!({ "VpcId": vpc })).labelled(tier.label()),
    )?;
    stack.add(
        &format!("{}RouteTableAssociation", logical_id),
        Resource::new(
            ResourceKind::SubnetRouteTableAssociation,
            json!({ "RouteTableId": route_table, "SubnetId": subnet_ref }),
        ),
    )?;

    if public {
        stack.add(
            &format!("{}DefaultRoute", logical_id),
            Resource::new(
                ResourceKind::Route,
                json!({
                    "RouteTableId": route_table,
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": gateway,
                }),
            )
            .depends_on(GATEWAY_ATTACHMENT),
        )?;
        if ipv6.is_some() {
            stack.add(
                &format!("{}DefaultRoute6", logical_id),
                Resource::new(
                    ResourceKind::Route,
                    json!({
                        "RouteTableId": route_table,
                        "DestinationIpv6CidrBlock": "::/0",
                        "GatewayId": gateway,
                    }),
                )
                .depends_on(GATEWAY_ATTACHMENT),
            )?;
        }
    }

    let id = stack.export(&format!("{}Id", logical_id), subnet_ref);

    return Ok(Subnet {
        logical_id,
        cidr: block,
        ipv6,
        zone,
        id,
    });
}

fn declare_security_group(
    stack: &mut Stack,
    logical_id: &str,
    label: &str,
    vpc: &Value,
    rules: Vec<SecurityGroupRule>,
) -> Result<SecurityGroup, Error> {
    let ingress: Vec<Value> = rules.iter().map(SecurityGroupRule::to_property).collect();
    let description = format!("{}/{}", stack.name(), logical_id);
    stack.add(
        logical_id,
        Resource::new(
            ResourceKind::SecurityGroup,
            json!({
                "GroupDescription": description,
                "VpcId": vpc,
                "SecurityGroupIngress": ingress,
                "SecurityGroupEgress": [{ "IpProtocol": "-1", "CidrIp": "0.0.0.0/0" }],
            }),
        )
        .labelled(label),
    )?;
    let id = stack.export(
        &format!("{}Id", logical_id),
        intrinsic::get_att(logical_id, "GroupId"),
    );

    return Ok(SecurityGroup {
        logical_id: logical_id.to_string(),
        rules,
        id,
    });
}
