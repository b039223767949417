//! Static frontend: a public website bucket served through CloudFront.

use serde_json::{json, Value};
use tracing::info;

use crate::config::FrontendConfig;
use crate::template::{self, intrinsic, RemovalPolicy, Resource, ResourceKind, Stack};

pub const PRICE_CLASS: &str = "PriceClass_100";
pub const VIEWER_PROTOCOL_POLICY: &str = "redirect-to-https";

const BUCKET: &str = "WebsiteBucket";
const BUCKET_POLICY: &str = "WebsiteBucketPolicy";
const DISTRIBUTION: &str = "Distribution";
const ORIGIN: &str = "WebsiteBucketOrigin";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("static site: distribution has no default behavior")]
    NoDefaultBehavior,

    #[error("static site: distribution has {0} default behaviors, expected exactly one")]
    MultipleDefaultBehaviors(usize),

    #[error("static site: behavior targets unknown origin `{0}`")]
    UnknownOrigin(String),

    #[error("static site: {0}")]
    Template(#[from] template::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub id: String,
    pub domain_name: Value,
}

impl Origin {
    fn to_property(&self) -> Value {
        json!({
            "Id": self.id,
            "DomainName": self.domain_name,
            "S3OriginConfig": { "OriginAccessIdentity": "" },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheBehavior {
    /// `None` for the default behavior.
    pub path_pattern: Option<String>,
    pub origin: String,
}

impl CacheBehavior {
    pub fn default_for(origin: &str) -> Self {
        Self {
            path_pattern: None,
            origin: origin.to_string(),
        }
    }

    fn to_property(&self) -> Value {
        let mut behavior = json!({
            "TargetOriginId": self.origin,
            "ViewerProtocolPolicy": VIEWER_PROTOCOL_POLICY,
            "AllowedMethods": ["GET", "HEAD"],
            "CachedMethods": ["GET", "HEAD"],
            "Compress": true,
            "ForwardedValues": { "QueryString": false },
        });
        if let Some(pattern) = &self.path_pattern {
            behavior["PathPattern"] = json!(pattern);
        }
        behavior
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    origins: Vec<Origin>,
    default_behavior: CacheBehavior,
    behaviors: Vec<CacheBehavior>,
}

impl Distribution {
    /// Exactly one of `behaviors` must be a default behavior, and every
    /// behavior must target one of `origins`.
    pub fn new(origins: Vec<Origin>, behaviors: Vec<CacheBehavior>) -> Result<Self, Error> {
        if let Some(unknown) = behaviors
            .iter()
            .find(|behavior| !origins.iter().any(|origin| origin.id == behavior.origin))
        {
            return Err(Error::UnknownOrigin(unknown.origin.clone()));
        }

        let (mut defaults, behaviors): (Vec<_>, Vec<_>) = behaviors
            .into_iter()
            .partition(|behavior| behavior.path_pattern.is_none());

        let default_behavior = match defaults.len() {
            0 => return Err(Error::NoDefaultBehavior),
            1 => defaults.remove(0),
            n => return Err(Error::MultipleDefaultBehaviors(n)),
        };

        return Ok(Self {
            origins,
            default_behavior,
            behaviors,
        });
    }

    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    pub fn default_behavior(&self) -> &CacheBehavior {
        &self.default_behavior
    }

    pub fn behaviors(&self) -> &[CacheBehavior] {
        &self.behaviors
    }

    fn to_properties(&self, default_root_object: &str) -> Value {
        let mut config = json!({
            "Enabled": true,
            "HttpVersion": "http2",
            "PriceClass": PRICE_CLASS,
            "DefaultRootObject": default_root_object,
            "Origins": self.origins.iter().map(Origin::to_property).collect::<Vec<_>>(),
            "DefaultCacheBehavior": self.default_behavior.to_property(),
        });
        if !self.behaviors.is_empty() {
            config["CacheBehaviors"] = self
                .behaviors
                .iter()
                .map(CacheBehavior::to_property)
                .collect();
        }

        json!({ "DistributionConfig": config })
    }
}

#[derive(Debug, Clone)]
pub struct StaticSite {
    pub bucket_name: String,
    pub index_document: String,
    pub error_document: Option<String>,
    pub distribution: Distribution,
}

pub fn build(config: &FrontendConfig, stack: &mut Stack) -> Result<StaticSite, Error> {
    let distribution = Distribution::new(
        vec![Origin {
            id: ORIGIN.to_string(),
            domain_name: intrinsic::get_att(BUCKET, "RegionalDomainName"),
        }],
        vec![CacheBehavior::default_for(ORIGIN)],
    )?;
    info!(stack = stack.name(), bucket = %config.bucket_name, "building static site");

    let mut website = json!({ "IndexDocument": config.index_document });
    if let Some(error_document) = &config.error_document {
        website["ErrorDocument"] = json!(error_document);
    }

    let bucket = stack.add(
        BUCKET,
        Resource::new(
            ResourceKind::Bucket,
            json!({
                "BucketName": config.bucket_name,
                "WebsiteConfiguration": website,
                "PublicAccessBlockConfiguration": {
                    "BlockPublicAcls": false,
                    "BlockPublicPolicy": false,
                    "IgnorePublicAcls": false,
                    "RestrictPublicBuckets": false,
                },
            }),
        )
        .removal_policy(RemovalPolicy::Retain),
    )?;

    stack.add(
        BUCKET_POLICY,
        Resource::new(
            ResourceKind::BucketPolicy,
            json!({
                "Bucket": bucket,
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": "*",
                        "Action": "s3:GetObject",
                        "Resource": intrinsic::join(vec![
                            intrinsic::get_att(BUCKET, "Arn"),
                            json!("/*"),
                        ]),
                    }],
                },
            }),
        ),
    )?;

    stack.add(
        DISTRIBUTION,
        Resource::new(
            ResourceKind::Distribution,
            distribution.to_properties(&config.index_document),
        ),
    )?;

    stack.output("BucketName", bucket);
    stack.output(
        "DistributionDomainName",
        intrinsic::get_att(DISTRIBUTION, "DomainName"),
    );

    return Ok(StaticSite {
        bucket_name: config.bucket_name.clone(),
        index_document: config.index_document.clone(),
        error_document: config.error_document.clone(),
        distribution,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::parameters;

    fn origin(id: &str) -> Origin {
        Origin {
            id: id.to_string(),
            domain_name: json!("bucket.s3.ap-northeast-1.amazonaws.com"),
        }
    }

    #[test]
    fn builds_a_public_website() {
        let mut stack = Stack::new("todo-test-frontend", "site");
        let site = build(&parameters().frontend, &mut stack).unwrap();

        assert_eq!(site.bucket_name, "todo-test-web");
        assert_eq!(stack.count(ResourceKind::Bucket), 1);
        assert_eq!(stack.count(ResourceKind::BucketPolicy), 1);
        assert_eq!(stack.count(ResourceKind::Distribution), 1);
        assert!(stack.dependencies().is_empty());

        let bucket = stack.resource(BUCKET).unwrap();
        assert_eq!(bucket.properties["BucketName"], "todo-test-web");
        assert_eq!(
            bucket.properties["WebsiteConfiguration"],
            json!({ "IndexDocument": "index.html" })
        );
        assert_eq!(
            bucket.properties["PublicAccessBlockConfiguration"]["BlockPublicPolicy"],
            false
        );

        let policy = stack.resource(BUCKET_POLICY).unwrap();
        let statement = &policy.properties["PolicyDocument"]["Statement"][0];
        assert_eq!(statement["Principal"], "*");
        assert_eq!(statement["Action"], "s3:GetObject");
    }

    #[test]
    fn distribution_redirects_to_https_from_the_bucket() {
        let mut stack = Stack::new("todo-test-frontend", "site");
        build(&parameters().frontend, &mut stack).unwrap();

        let config = &stack.resource(DISTRIBUTION).unwrap().properties["DistributionConfig"];
        assert_eq!(config["Origins"].as_array().unwrap().len(), 1);
        assert_eq!(
            config["Origins"][0]["DomainName"],
            intrinsic::get_att(BUCKET, "RegionalDomainName")
        );
        assert_eq!(
            config["DefaultCacheBehavior"]["ViewerProtocolPolicy"],
            "redirect-to-https"
        );
        assert_eq!(config["DefaultCacheBehavior"]["TargetOriginId"], ORIGIN);
        assert!(config.get("CacheBehaviors").is_none());
        assert!(stack.outputs().contains_key("DistributionDomainName"));
        assert!(stack.outputs().contains_key("BucketName"));
    }

    #[test]
    fn error_document_is_optional() {
        let mut config = parameters().frontend;
        config.error_document = Some(String::from("404.html"));
        let mut stack = Stack::new("todo-test-frontend", "site");
        build(&config, &mut stack).unwrap();

        let bucket = stack.resource(BUCKET).unwrap();
        assert_eq!(bucket.properties["WebsiteConfiguration"]["ErrorDocument"], "404.html");
    }

    #[test]
    fn exactly_one_default_behavior() {
        assert_eq!(
            Distribution::new(vec![origin("a")], vec![]),
            Err(Error::NoDefaultBehavior)
        );
        assert_eq!(
            Distribution::new(
                vec![origin("a")],
                vec![CacheBehavior::default_for("a"), CacheBehavior::default_for("a")]
            ),
            Err(Error::MultipleDefaultBehaviors(2))
        );

        let distribution = Distribution::new(
            vec![origin("a")],
            vec![
                CacheBehavior {
                    path_pattern: Some(String::from("/assets/*")),
                    origin: String::from("a"),
                },
                CacheBehavior::default_for("a"),
            ],
        )
        .unwrap();
        assert_eq!(distribution.default_behavior(), &CacheBehavior::default_for("a"));
        assert_eq!(distribution.behaviors().len(), 1);
        let properties = distribution.to_properties("index.html");
        assert_eq!(
            properties["DistributionConfig"]["CacheBehaviors"][0]["PathPattern"],
            "/assets/*"
        );
    }

    #[test]
    fn behaviors_must_target_a_known_origin() {
        assert_eq!(
            Distribution::new(vec![origin("a")], vec![CacheBehavior::default_for("b")]),
            Err(Error::UnknownOrigin(String::from("b")))
        );
    }
}
