//! CloudFormation resource graph: resources, stacks, cross-stack exports and
//! the intrinsic functions the builders use to wire them together.

use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Stack `{stack}` already declares a resource `{logical_id}`")]
    DuplicateLogicalId { stack: String, logical_id: String },

    #[error("Properties of `{logical_id}` in stack `{stack}` must be a JSON object")]
    PropertiesNotAnObject { stack: String, logical_id: String },
}

/// How a resource type accepts tags, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStyle {
    Untaggable,
    /// `Tags: [{Key, Value}]`
    Standard,
    /// `Tags: [{Key, Value, PropagateAtLaunch}]`, auto scaling groups only.
    PropagateAtLaunch,
    /// `TagSpecifications: [{ResourceType, Tags: [{Key, Value}]}]`, tagging
    /// the given resource type.
    TagSpecifications(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Vpc,
    VpcCidrBlock,
    InternetGateway,
    VpcGatewayAttachment,
    Subnet,
    RouteTable,
    Route,
    SubnetRouteTableAssociation,
    SecurityGroup,
    DbClusterParameterGroup,
    DbSubnetGroup,
    DbCluster,
    DbInstance,
    EcrRepository,
    IamRole,
    InstanceProfile,
    LaunchTemplate,
    AutoScalingGroup,
    EcsCluster,
    TaskDefinition,
    EcsService,
    LoadBalancer,
    TargetGroup,
    Listener,
    Bucket,
    BucketPolicy,
    Distribution,
}

impl ResourceKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "AWS::EC2::VPC",
            ResourceKind::VpcCidrBlock => "AWS::EC2::VPCCidrBlock",
            ResourceKind::InternetGateway => "AWS::EC2::InternetGateway",
            ResourceKind::VpcGatewayAttachment => "AWS::EC2::VPCGatewayAttachment",
            ResourceKind::Subnet => "AWS::EC2::Subnet",
            ResourceKind::RouteTable => "AWS::EC2::RouteTable",
            ResourceKind::Route => "AWS::EC2::Route",
            ResourceKind::SubnetRouteTableAssociation => "AWS::EC2::SubnetRouteTableAssociation",
            ResourceKind::SecurityGroup => "AWS::EC2::SecurityGroup",
            ResourceKind::DbClusterParameterGroup => "AWS::RDS::DBClusterParameterGroup",
            ResourceKind::DbSubnetGroup => "AWS::RDS::DBSubnetGroup",
            ResourceKind::DbCluster => "AWS::RDS::DBCluster",
            ResourceKind::DbInstance => "AWS::RDS::DBInstance",
            ResourceKind::EcrRepository => "AWS::ECR::Repository",
            ResourceKind::IamRole => "AWS::IAM::Role",
            ResourceKind::InstanceProfile => "AWS::IAM::InstanceProfile",
            ResourceKind::LaunchTemplate => "AWS::EC2::LaunchTemplate",
            ResourceKind::AutoScalingGroup => "AWS::AutoScaling::AutoScalingGroup",
            ResourceKind::EcsCluster => "AWS::ECS::Cluster",
            ResourceKind::TaskDefinition => "AWS::ECS::TaskDefinition",
            ResourceKind::EcsService => "AWS::ECS::Service",
            ResourceKind::LoadBalancer => "AWS::ElasticLoadBalancingV2::LoadBalancer",
            ResourceKind::TargetGroup => "AWS::ElasticLoadBalancingV2::TargetGroup",
            ResourceKind::Listener => "AWS::ElasticLoadBalancingV2::Listener",
            ResourceKind::Bucket => "AWS::S3::Bucket",
            ResourceKind::BucketPolicy => "AWS::S3::BucketPolicy",
            ResourceKind::Distribution => "AWS::CloudFront::Distribution",
        }
    }

    pub fn tag_style(&self) -> TagStyle {
        match self {
            ResourceKind::VpcCidrBlock
            | ResourceKind::VpcGatewayAttachment
            | ResourceKind::Route
            | ResourceKind::SubnetRouteTableAssociation
            | ResourceKind::InstanceProfile
            | ResourceKind::Listener
            | ResourceKind::BucketPolicy => TagStyle::Untaggable,
            ResourceKind::AutoScalingGroup => TagStyle::PropagateAtLaunch,
            ResourceKind::LaunchTemplate => TagStyle::TagSpecifications("launch-template"),
            _ => TagStyle::Standard,
        }
    }
}

impl Serialize for ResourceKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.type_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalPolicy {
    Delete,
    Retain,
    Snapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub kind: ResourceKind,

    /// A JSON object; `Stack::add` rejects anything else.
    #[serde(rename = "Properties")]
    pub properties: Value,

    #[serde(rename = "DependsOn", skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,

    #[serde(rename = "DeletionPolicy", skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<RemovalPolicy>,

    #[serde(rename = "UpdateReplacePolicy", skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<RemovalPolicy>,

    /// Suffix of the `Name` tag, e.g. "ingress" for "svc prod ingress".
    #[serde(skip)]
    pub label: Option<String>,

    /// Name the resource "svc-prod" rather than "svc prod".
    #[serde(skip)]
    pub qualified_name: bool,
}

impl Resource {
    pub fn new(kind: ResourceKind, properties: Value) -> Self {
        Self {
            kind,
            properties,
            depends_on: BTreeSet::new(),
            deletion_policy: None,
            update_replace_policy: None,
            label: None,
            qualified_name: false,
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn qualified_name(mut self) -> Self {
        self.qualified_name = true;
        self
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.insert(logical_id.into());
        self
    }

    /// What happens to the physical resource when it leaves the template or is
    /// replaced.
    pub fn removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self.update_replace_policy = Some(policy);
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// The tag list, wherever this resource type keeps it.
    pub fn tags(&self) -> Option<&Vec<Value>> {
        match self.kind.tag_style() {
            TagStyle::Untaggable => None,
            TagStyle::Standard | TagStyle::PropagateAtLaunch => self.properties.get("Tags")?.as_array(),
            TagStyle::TagSpecifications(resource_type) => self
                .properties
                .get("TagSpecifications")?
                .as_array()?
                .iter()
                .find(|spec| spec.get("ResourceType").and_then(Value::as_str) == Some(resource_type))?
                .get("Tags")?
                .as_array(),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags()?
            .iter()
            .find(|tag| tag.get("Key").and_then(Value::as_str) == Some(key))?
            .get("Value")?
            .as_str()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<Export>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Export {
    pub name: String,
}

/// One CloudFormation template plus the names of the stacks whose exports it
/// imports.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    description: String,
    resources: BTreeMap<String, Resource>,
    outputs: BTreeMap<String, Output>,
    dependencies: BTreeSet<String>,
}

impl Stack {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares a resource and returns a `Ref` to it.
    pub fn add(&mut self, logical_id: &str, resource: Resource) -> Result<Value, Error> {
        if self.resources.contains_key(logical_id) {
            return Err(Error::DuplicateLogicalId {
                stack: self.name.clone(),
                logical_id: logical_id.to_string(),
            });
        }
        if !resource.properties.is_object() {
            return Err(Error::PropertiesNotAnObject {
                stack: self.name.clone(),
                logical_id: logical_id.to_string(),
            });
        }
        self.resources.insert(logical_id.to_string(), resource);

        return Ok(intrinsic::reference(logical_id));
    }

    pub fn output(&mut self, key: &str, value: Value) {
        self.outputs.insert(
            key.to_string(),
            Output {
                value,
                export: None,
            },
        );
    }

    /// Publishes `value` as a stack export and returns the `Fn::ImportValue`
    /// another stack uses to read it.
    pub fn export(&mut self, key: &str, value: Value) -> Value {
        let name = self.export_name(key);
        self.outputs.insert(
            key.to_string(),
            Output {
                value,
                export: Some(Export { name: name.clone() }),
            },
        );

        intrinsic::import_value(&name)
    }

    pub fn export_name(&self, key: &str) -> String {
        format!("{}:{}", self.name, key)
    }

    pub fn depend_on(&mut self, stack_name: &str) {
        if stack_name != self.name {
            self.dependencies.insert(stack_name.to_string());
        }
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.get(logical_id)
    }

    pub fn resources(&self) -> impl Iterator<Item = (&String, &Resource)> {
        self.resources.iter()
    }

    pub fn resources_mut(&mut self) -> impl Iterator<Item = (&String, &mut Resource)> {
        self.resources.iter_mut()
    }

    pub fn outputs(&self) -> &BTreeMap<String, Output> {
        &self.outputs
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.resources.values().filter(|r| r.kind == kind).count()
    }

    pub fn count_type(&self, type_name: &str) -> usize {
        self.resources
            .values()
            .filter(|r| r.kind.type_name() == type_name)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn to_template(&self) -> Value {
        let mut template = json!({
            "AWSTemplateFormatVersion": TEMPLATE_FORMAT_VERSION,
            "Description": self.description,
            "Resources": self.resources,
        });
        if !self.outputs.is_empty() {
            template["Outputs"] = json!(self.outputs);
        }

        template
    }

    pub fn to_template_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_template())
    }
}

/// Constructors for CloudFormation intrinsic functions.
pub mod intrinsic {
    use serde_json::{json, Value};

    pub fn reference(logical_id: &str) -> Value {
        json!({ "Ref": logical_id })
    }

    pub fn get_att(logical_id: &str, attribute: &str) -> Value {
        json!({ "Fn::GetAtt": [logical_id, attribute] })
    }

    pub fn import_value(export_name: &str) -> Value {
        json!({ "Fn::ImportValue": export_name })
    }

    pub fn join(parts: Vec<Value>) -> Value {
        json!({ "Fn::Join": ["", parts] })
    }

    pub fn select(index: usize, list: Value) -> Value {
        json!({ "Fn::Select": [index.to_string(), list] })
    }

    pub fn get_azs() -> Value {
        json!({ "Fn::GetAZs": "" })
    }

    pub fn base64(value: Value) -> Value {
        json!({ "Fn::Base64": value })
    }

    pub fn sub(template: &str) -> Value {
        json!({ "Fn::Sub": template })
    }
}
