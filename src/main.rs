use anyhow::Context;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

pub mod cidr;
pub mod compute;
pub mod config;
pub mod database;
pub mod deployment;
pub mod engine;
pub mod network;
pub mod registry;
pub mod site;
pub mod tags;
pub mod template;
pub mod writer;

use deployment::Tier;
use registry::{AssumedRegistry, EcrRegistry, RepositoryRegistry};

/// Declare and deploy a network, database, backend and frontend topology as
/// CloudFormation stacks.
#[derive(Debug, Parser)]
#[command(name = "cfn-topology", version, about)]
struct Cli {
    /// YAML file with one configuration fragment per environment
    #[arg(long, default_value = "./context.yaml")]
    context: PathBuf,

    /// Service name; defaults to the context file's `service` key
    #[arg(long, env = "TOPOLOGY_SERVICE")]
    service: Option<String>,

    #[arg(long, env = "TOPOLOGY_ENVIRONMENT")]
    environment: String,

    /// AWS region; defaults to the usual provider chain
    #[arg(long, global = true)]
    region: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write templates and a manifest without touching CloudFormation
    Synth {
        #[arg(long, default_value = "cdk.out")]
        out: PathBuf,

        /// Tiers to synthesize (network, data, compute, site); all when omitted
        #[arg(long = "tier")]
        tiers: Vec<Tier>,

        /// Assume image repositories exist instead of asking ECR
        #[arg(long)]
        no_lookup: bool,
    },
    /// Synthesize, then create or update the stacks
    Deploy {
        #[arg(long, default_value = "cdk.out")]
        out: PathBuf,

        #[arg(long, default_value = "outputs.json")]
        outputs: PathBuf,

        #[arg(long = "tier")]
        tiers: Vec<Tier>,
    },
}

async fn sdk_config(region: Option<String>) -> aws_config::SdkConfig {
    let region = RegionProviderChain::first_try(region.map(Region::new)).or_default_provider();

    return aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .load()
        .await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let context = config::parse(&cli.context)
        .with_context(|| format!("loading {}", cli.context.display()))?;

    match cli.command {
        Command::Synth {
            out,
            tiers,
            no_lookup,
        } => {
            let registry: Box<dyn RepositoryRegistry> = match no_lookup {
                true => Box::new(AssumedRegistry),
                false => Box::new(EcrRegistry::new(&sdk_config(cli.region).await)),
            };
            let deployment = deployment::synthesize(
                &context,
                cli.service.as_deref(),
                &cli.environment,
                &tiers,
                registry.as_ref(),
            )
            .await
            .context("synthesizing deployment")?;

            writer::write_templates(&out, &deployment)
                .with_context(|| format!("writing templates to {}", out.display()))?;
        }
        Command::Deploy { out, outputs, tiers } => {
            let sdk_config = sdk_config(cli.region).await;
            let registry = EcrRegistry::new(&sdk_config);
            let deployment = deployment::synthesize(
                &context,
                cli.service.as_deref(),
                &cli.environment,
                &tiers,
                &registry,
            )
            .await
            .context("synthesizing deployment")?;

            writer::write_templates(&out, &deployment)
                .with_context(|| format!("writing templates to {}", out.display()))?;

            let stack_outputs = engine::Engine::new(engine::CloudFormation::new(&sdk_config))
                .deploy(&deployment)
                .await
                .context("deploying stacks")?;

            writer::write_outputs(&outputs, &stack_outputs)
                .with_context(|| format!("writing outputs to {}", outputs.display()))?;
        }
    }

    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_repeated_tiers() {
        let cli = Cli::try_parse_from([
            "cfn-topology",
            "--environment",
            "test",
            "synth",
            "--tier",
            "compute",
            "--tier",
            "site",
            "--no-lookup",
        ])
        .unwrap();

        match cli.command {
            Command::Synth {
                tiers, no_lookup, ..
            } => {
                assert_eq!(tiers, vec![Tier::Compute, Tier::Site]);
                assert!(no_lookup);
            }
            _ => panic!("Expected `synth` command"),
        }
    }

    #[test]
    fn rejects_unknown_tiers() {
        let result = Cli::try_parse_from([
            "cfn-topology",
            "--environment",
            "test",
            "synth",
            "--tier",
            "cache",
        ]);

        assert!(result.is_err());
    }
}
