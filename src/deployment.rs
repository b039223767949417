//! Assembles the selected tiers into stacks, in dependency order, and tags
//! everything once at the end.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::config::{self, ContextFile, DeploymentParameters};
use crate::registry::RepositoryRegistry;
use crate::tags::{missing_tags, TagAspect};
use crate::template::Stack;
use crate::{compute, database, network, site};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),

    #[error(transparent)]
    Network(#[from] network::Error),

    #[error(transparent)]
    Data(#[from] database::Error),

    #[error(transparent)]
    Compute(#[from] compute::Error),

    #[error(transparent)]
    Site(#[from] site::Error),

    #[error("Unknown tier `{0}`, expected one of network, data, compute, site")]
    UnknownTier(String),

    #[error("The {tier} tier needs the {requires} tier, which was not built")]
    MissingTier { tier: Tier, requires: Tier },

    #[error("Resource `{logical_id}` in stack `{stack}` is missing tags {missing:?}")]
    MissingTags {
        stack: String,
        logical_id: String,
        missing: Vec<&'static str>,
    },
}

/// Declaration order is build order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Network,
    Data,
    Site,
    Compute,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Network, Tier::Data, Tier::Site, Tier::Compute];

    /// Tiers whose resources this tier imports.
    pub fn requires(&self) -> &'static [Tier] {
        match self {
            Tier::Network | Tier::Site => &[],
            Tier::Data => &[Tier::Network],
            Tier::Compute => &[Tier::Network, Tier::Data],
        }
    }

    /// Suffix of the stack name, `{service}-{environment}-{suffix}`.
    pub fn stack_suffix(&self) -> &'static str {
        match self {
            Tier::Network => "network",
            Tier::Data => "rds",
            Tier::Site => "frontend",
            Tier::Compute => "backend",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Tier::Network => "VPC, subnets and security groups",
            Tier::Data => "Aurora MySQL cluster",
            Tier::Site => "Static website bucket and CloudFront distribution",
            Tier::Compute => "ECS service on EC2 behind an application load balancer",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Network => "network",
            Tier::Data => "data",
            Tier::Site => "site",
            Tier::Compute => "compute",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(Tier::Network),
            "data" | "rds" => Ok(Tier::Data),
            "compute" | "backend" => Ok(Tier::Compute),
            "site" | "frontend" => Ok(Tier::Site),
            other => Err(Error::UnknownTier(other.to_string())),
        }
    }
}

/// The selected tiers plus everything they depend on. An empty selection
/// means every tier.
pub fn closure(selected: &[Tier]) -> BTreeSet<Tier> {
    let mut tiers = BTreeSet::new();
    let mut pending: Vec<Tier> = match selected.is_empty() {
        true => Tier::ALL.to_vec(),
        false => selected.to_vec(),
    };

    while let Some(tier) = pending.pop() {
        if tiers.insert(tier) {
            pending.extend_from_slice(tier.requires());
        }
    }

    tiers
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub service: String,
    pub environment: String,
    stacks: Vec<Stack>,
}

impl Deployment {
    /// Stacks in build order; every stack comes after the stacks it depends on.
    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|stack| stack.name() == name)
    }

    pub fn stack_for(&self, tier: Tier) -> Option<&Stack> {
        self.stack(&stack_name(&self.service, &self.environment, tier))
    }
}

pub fn stack_name(service: &str, environment: &str, tier: Tier) -> String {
    format!("{}-{}-{}", service, environment, tier.stack_suffix())
}

/// Loads parameters for `environment` (credentials from the environment
/// variables) and synthesizes the selected tiers.
pub async fn synthesize(
    context: &ContextFile,
    service: Option<&str>,
    environment: &str,
    tiers: &[Tier],
    registry: &dyn RepositoryRegistry,
) -> Result<Deployment, Error> {
    let parameters = config::load(service, environment, context)?;
    build(&parameters, tiers, registry).await
}

pub async fn build(
    parameters: &DeploymentParameters,
    tiers: &[Tier],
    registry: &dyn RepositoryRegistry,
) -> Result<Deployment, Error> {
    let tiers = closure(tiers);
    info!(
        service = %parameters.service,
        environment = %parameters.environment,
        ?tiers,
        "synthesizing deployment"
    );

    let service = parameters.service.as_str();
    let environment = parameters.environment.as_str();
    let new_stack = |tier: Tier| Stack::new(stack_name(service, environment, tier), tier.description());

    let mut stacks = Vec::with_capacity(tiers.len());
    let mut topology = None;
    let mut cluster = None;

    for tier in tiers {
        let mut stack = new_stack(tier);
        match tier {
            Tier::Network => {
                topology = Some(network::build(&parameters.network, &mut stack)?);
            }
            Tier::Data => {
                let network = topology.as_ref().ok_or(Error::MissingTier {
                    tier,
                    requires: Tier::Network,
                })?;
                cluster = Some(database::build(
                    network,
                    &parameters.rds,
                    &parameters.credentials,
                    &mut stack,
                )?);
            }
            Tier::Site => {
                site::build(&parameters.frontend, &mut stack)?;
            }
            Tier::Compute => {
                let network = topology.as_ref().ok_or(Error::MissingTier {
                    tier,
                    requires: Tier::Network,
                })?;
                let data = cluster.as_ref().ok_or(Error::MissingTier {
                    tier,
                    requires: Tier::Data,
                })?;
                compute::build(
                    network,
                    data,
                    &parameters.backend,
                    service,
                    environment,
                    registry,
                    &mut stack,
                )
                .await?;
            }
        }
        info!(stack = stack.name(), "stack synthesized");
        stacks.push(stack);
    }

    let aspect = TagAspect::new(service, environment);
    for stack in stacks.iter_mut() {
        aspect.apply(stack);
    }
    for stack in &stacks {
        for (logical_id, resource) in stack.resources() {
            let missing = missing_tags(resource);
            if !missing.is_empty() {
                return Err(Error::MissingTags {
                    stack: stack.name().to_string(),
                    logical_id: logical_id.clone(),
                    missing,
                });
            }
        }
    }

    return Ok(Deployment {
        service: service.to_string(),
        environment: environment.to_string(),
        stacks,
    });
}
