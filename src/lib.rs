use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::time::sleep;

pub mod cloud;
pub mod config;
pub mod ec2;
pub mod error;
pub mod inventory;
pub mod policy;

pub use cloud::{AddressAssociation, CloudCompute, CloudError, InstanceDescription, Tag};
pub use crate::config::{ConfigSource, IniConfig, ProvisioningConfig};
pub use error::{Error, Result};
pub use inventory::{InstanceRecord, InstanceState, Inventory};
pub use policy::{PollPolicy, RetryPolicy};

use cloud::SpotLaunch;

/// Looked up relative to the working directory.
pub const DEFAULT_USER_DATA: &str = "userdata.txt";

const PRICE_HISTORY_DEPTH: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    /// Already logged; carries the reason for callers that want it.
    Failed(String),
}

/// Drives a single spot instance through its lifecycle against an injected
/// compute API.
pub struct Orchestrator<C> {
    cloud: C,
    inventory: Inventory,
    poll: PollPolicy,
    retry: RetryPolicy,
    user_data: PathBuf,
}

impl<C: CloudCompute> Orchestrator<C> {
    /// Starts with an empty inventory; call [`Orchestrator::refresh_inventory`]
    /// before relying on it.
    pub fn new(cloud: C) -> Self {
        Orchestrator {
            cloud,
            inventory: Inventory::default(),
            poll: PollPolicy::default(),
            retry: RetryPolicy::default(),
            user_data: PathBuf::from(DEFAULT_USER_DATA),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_user_data(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_data = path.into();
        self
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Replaces the stored inventory with every non-terminated instance in
    /// the account.
    pub async fn refresh_inventory(&mut self) -> Result<&Inventory> {
        let descriptions = self.cloud.describe_instances(Vec::new()).await?;
        self.inventory = Inventory::from_descriptions(&descriptions);
        tracing::debug!(
            described = descriptions.len(),
            kept = self.inventory.len(),
            "refreshed inventory"
        );
        Ok(&self.inventory)
    }

    /// Newest spot price for the configured instance type and product.
    pub async fn get_spot_price(&self, config: &ProvisioningConfig) -> Result<f64> {
        let history = self
            .cloud
            .describe_spot_price_history(
                &config.instance_type,
                &config.product_description,
                PRICE_HISTORY_DEPTH,
            )
            .await
            .map_err(|e| Error::UpstreamQuery(e.to_string()))?;

        let newest = history.first().ok_or_else(|| {
            Error::UpstreamQuery(format!(
                "no spot price history for {} ({})",
                config.instance_type, config.product_description
            ))
        })?;
        newest
            .price
            .trim()
            .parse()
            .map_err(|_| Error::UpstreamQuery(format!("unparseable spot price `{}`", newest.price)))
    }

    /// Attaches `public_ip` to `instance_id`. Client errors are retried per the
    /// retry policy (forever by default); a non-200 answer is fatal at once.
    pub async fn associate_address(
        &self,
        instance_id: &str,
        public_ip: &str,
    ) -> Result<Option<AddressAssociation>> {
        if instance_id.is_empty() || public_ip.is_empty() {
            return Ok(None);
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.cloud.associate_address(instance_id, public_ip).await {
                Ok(association) if association.status == 200 => {
                    tracing::info!(instance_id, public_ip, attempts, "address associated");
                    return Ok(Some(association));
                }
                Ok(association) => {
                    return Err(Error::UnexpectedStatus {
                        status: association.status,
                    })
                }
                Err(CloudError::Client(message)) => {
                    if !self.retry.should_retry(attempts) {
                        return Err(Error::RetriesExhausted {
                            attempts,
                            source: CloudError::Client(message),
                        });
                    }
                    tracing::warn!(
                        instance_id,
                        public_ip,
                        attempts,
                        error = %message,
                        "address association failed, retrying in {:?}",
                        self.retry.delay
                    );
                    sleep(self.retry.delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Requests one spot instance, waits until it is allocated and tags it.
    pub async fn provision_instance(
        &self,
        config: &ProvisioningConfig,
    ) -> Result<InstanceDescription> {
        let user_data = read_user_data(&self.user_data).await?;
        tracing::debug!(path = %self.user_data.display(), %user_data, "user data");

        let launch = SpotLaunch {
            security_group: config.security_group.clone(),
            image_id: config.ami.clone(),
            instance_type: config.instance_type.clone(),
            key_name: config.key_pair.clone(),
            availability_zone: config.availability_zone.clone(),
            subnet_id: config.subnet_id.clone(),
            user_data: STANDARD.encode(user_data.as_bytes()),
            iam_instance_profile_arn: config.iam_role.clone(),
            spot_price: config.max_bid.to_string(),
        };
        let request = self.cloud.request_spot_instance(&launch).await?;
        tracing::info!(
            request_id = %request.request_id,
            state = %request.state,
            "spot request created, waiting for allocation"
        );

        let instance_id = self.wait_for_allocation(&request.request_id).await?;
        let instance = self
            .cloud
            .describe_instances(vec![instance_id.clone()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::Response(format!("instance {instance_id} not described")))?;

        self.cloud
            .create_tags(
                &instance_id,
                vec![
                    Tag::new("Name", &config.tag),
                    Tag::new("CreatedBy", &config.created_by),
                    Tag::new("Team", &config.team),
                    Tag::new("Application", &config.application),
                ],
            )
            .await?;
        tracing::info!(%instance_id, name = %config.tag, "instance tagged");
        Ok(instance)
    }

    /// Polls the spot request until it turns active and returns the allocated
    /// instance id. Failed or cancelled requests are not treated specially.
    async fn wait_for_allocation(&self, request_id: &str) -> Result<String> {
        let mut polls = 0;
        loop {
            if !self.poll.allows(polls + 1) {
                // An open request can still be filled after we stop watching it.
                match self.cloud.cancel_spot_request(request_id).await {
                    Ok(()) => tracing::warn!(request_id, polls, "spot request not active, cancelled"),
                    Err(err) => {
                        tracing::error!(request_id, polls, error = %err, "failed to cancel spot request")
                    }
                }
                return Err(Error::PollLimit {
                    request_id: request_id.to_string(),
                    polls,
                });
            }
            sleep(self.poll.interval).await;
            polls += 1;

            match self.cloud.describe_spot_request(request_id).await {
                Ok(current) if current.is_active() => {
                    let instance_id = current
                        .instance_id
                        .ok_or_else(|| Error::MissingInstance(request_id.to_string()))?;
                    tracing::info!(request_id, %instance_id, polls, "instance allocated");
                    return Ok(instance_id);
                }
                Ok(current) => {
                    tracing::info!(request_id, state = %current.state, polls, "waiting...");
                }
                // New requests take a moment to become visible to describe calls.
                Err(CloudError::Client(message)) if message.contains("does not exist") => {
                    tracing::debug!(request_id, "spot request not visible yet");
                }
                Err(err) => return Err(err.into()),
            }
            sleep(self.poll.pending_delay).await;
        }
    }

    /// Terminates `instance_id` and removes its recorded Name tag. Failures
    /// are logged and reported in the outcome, never returned as errors.
    pub async fn destroy_instance(&self, instance_id: &str) -> DestroyOutcome {
        match self.terminate_and_untag(instance_id).await {
            Ok(()) => DestroyOutcome::Destroyed,
            Err(err) => {
                tracing::error!(instance_id, error = %err, "failed to terminate");
                DestroyOutcome::Failed(err.to_string())
            }
        }
    }

    async fn terminate_and_untag(&self, instance_id: &str) -> Result<()> {
        let name = self.inventory.name_of(instance_id).map(str::to_string);

        tracing::info!(instance_id, "terminating");
        self.cloud
            .terminate_instances(vec![instance_id.to_string()])
            .await?;
        tracing::info!(instance_id, "termination complete");

        if let Some(name) = name {
            self.cloud
                .delete_tags(instance_id, vec![Tag::new("Name", &name)])
                .await?;
        }
        Ok(())
    }

    /// `Ok(None)` when the current spot price is above the configured bid.
    pub async fn create(&self, source: &dyn ConfigSource) -> Result<Option<InstanceRecord>> {
        let config = ProvisioningConfig::from_source(source)?;

        let price = self.get_spot_price(&config).await?;
        tracing::info!(price, max_bid = config.max_bid, "current spot price");
        if price > config.max_bid {
            tracing::info!("spot price more than bid, not creating an instance");
            return Ok(None);
        }

        let instance = self.provision_instance(&config).await?;
        let association = self
            .associate_address(&instance.instance_id, &config.public_ip_address)
            .await?;

        let state = instance
            .state
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(InstanceState::Pending);
        Ok(Some(InstanceRecord {
            public_ip: match association {
                Some(_) => Some(config.public_ip_address),
                None => instance.public_ip,
            },
            instance_type: instance.instance_type.unwrap_or(config.instance_type),
            instance_id: instance.instance_id,
            state,
            name: Some(config.tag),
        }))
    }

    /// Best-effort teardown followed by an inventory refresh. Nothing is
    /// reported back; failures only show up in the logs.
    pub async fn destroy(&mut self, instance_id: &str) {
        let outcome = self.destroy_instance(instance_id).await;
        tracing::debug!(instance_id, ?outcome, "destroy finished");
        if let Err(err) = self.refresh_inventory().await {
            tracing::warn!(error = %err, "failed to refresh inventory after destroy");
        }
    }
}

/// Missing file means no user data.
async fn read_user_data(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => Ok(data),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(Error::UserData {
            path: path.display().to_string(),
            source,
        }),
    }
}
