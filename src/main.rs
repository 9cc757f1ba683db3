use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use autospot::config::DEFAULT_SECTION;
use autospot::ec2::{Ec2Session, SessionSettings};
use autospot::{IniConfig, Orchestrator, PollPolicy, ProvisioningConfig, RetryPolicy};

#[derive(Parser)]
#[command(name = "autospot", version, about = "Provision and tear down a single EC2 spot instance")]
struct Cli {
    /// AWS profile to load credentials from
    #[arg(long, env = "AWSACC", global = true)]
    profile: Option<String>,

    /// AWS region, defaults to AWS_DEFAULT_REGION / AWS_REGION
    #[arg(long, global = true)]
    region: Option<String>,

    /// Role ARN to assume before talking to EC2
    #[arg(long, global = true)]
    assume_role: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// INI file holding the provisioning settings
    #[arg(long, default_value = "config.ini")]
    config: PathBuf,

    /// Section of the INI file to read
    #[arg(long, default_value = DEFAULT_SECTION)]
    section: String,
}

#[derive(Subcommand)]
enum Command {
    /// Request a spot instance if the current price is within the bid
    Create {
        #[command(flatten)]
        config: ConfigArgs,

        /// Plain-text user data passed to the instance, if the file exists
        #[arg(long, default_value = autospot::DEFAULT_USER_DATA)]
        user_data: PathBuf,

        /// Give up waiting for allocation after this many polls
        #[arg(long)]
        max_polls: Option<u32>,

        /// Give up associating the address after this many attempts
        #[arg(long)]
        max_address_attempts: Option<u32>,
    },
    /// Terminate an instance and drop its Name tag
    Destroy { instance_id: String },
    /// List the non-terminated instances in the account
    List,
    /// Show the current spot price against the configured bid
    Price {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let session = Ec2Session::connect(&SessionSettings {
        profile: cli.profile,
        region: cli.region,
        assume_role: cli.assume_role,
    })
    .context("failed to set up EC2 session")?;
    let mut orchestrator = Orchestrator::new(session);

    match cli.command {
        Command::Create {
            config,
            user_data,
            max_polls,
            max_address_attempts,
        } => {
            let source = IniConfig::load(&config.config, &config.section)
                .with_context(|| format!("failed to read {}", config.config.display()))?;
            let mut orchestrator = orchestrator
                .with_user_data(user_data)
                .with_poll_policy(PollPolicy::default().with_max_polls(max_polls))
                .with_retry_policy(RetryPolicy::default().with_max_attempts(max_address_attempts));
            orchestrator.refresh_inventory().await?;

            match orchestrator.create(&source).await? {
                Some(record) => println!(
                    "{}\t{}\t{}\t{}",
                    record.instance_id,
                    record.instance_type,
                    record.public_ip.as_deref().unwrap_or("-"),
                    record.name.as_deref().unwrap_or("-"),
                ),
                None => println!("Spot price above bid, no instance created"),
            }
        }
        Command::Destroy { instance_id } => {
            orchestrator.refresh_inventory().await?;
            orchestrator.destroy(&instance_id).await;
        }
        Command::List => {
            for record in orchestrator.refresh_inventory().await?.iter() {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    record.instance_id,
                    record.instance_type,
                    record.state,
                    record.public_ip.as_deref().unwrap_or("-"),
                    record.name.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Price { config } => {
            let source = IniConfig::load(&config.config, &config.section)
                .with_context(|| format!("failed to read {}", config.config.display()))?;
            let settings = ProvisioningConfig::from_source(&source)?;
            let price = orchestrator.get_spot_price(&settings).await?;
            println!(
                "{} ({}): ${price} per hour, bid ${}",
                settings.instance_type, settings.product_description, settings.max_bid
            );
        }
    }
    Ok(())
}
