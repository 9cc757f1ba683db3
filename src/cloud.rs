//! The compute API the orchestrator drives, reduced to the calls it makes.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Self {
        Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// One instance as reported by the provider, before any filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub instance_type: Option<String>,
    pub public_ip: Option<String>,
    pub state: Option<String>,
    pub tags: Vec<Tag>,
}

impl InstanceDescription {
    /// Value of the first tag with `key`.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotPricePoint {
    pub price: String,
    pub timestamp: Option<String>,
}

/// Launch specification for a one-time, single-instance spot request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpotLaunch {
    pub security_group: String,
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub availability_zone: String,
    pub subnet_id: String,
    /// Already base64 encoded.
    pub user_data: String,
    pub iam_instance_profile_arn: String,
    pub spot_price: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotRequest {
    pub request_id: String,
    pub state: String,
    pub instance_id: Option<String>,
}

impl SpotRequest {
    pub fn is_active(&self) -> bool {
        self.state == "active"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddressAssociation {
    /// HTTP status of the response that carried the association.
    pub status: u16,
    pub association_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum CloudError {
    /// The provider (or the transport to it) refused the call. Retryable.
    #[error("client error: {0}")]
    Client(String),

    /// A response arrived but could not be understood.
    #[error("malformed response: {0}")]
    Response(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudCompute: Send + Sync {
    /// Describe the given instances, or every instance when `instance_ids` is empty.
    async fn describe_instances(
        &self,
        instance_ids: Vec<String>,
    ) -> Result<Vec<InstanceDescription>, CloudError>;

    /// Most recent price points first.
    async fn describe_spot_price_history(
        &self,
        instance_type: &str,
        product_description: &str,
        max_results: i64,
    ) -> Result<Vec<SpotPricePoint>, CloudError>;

    async fn request_spot_instance(&self, launch: &SpotLaunch) -> Result<SpotRequest, CloudError>;

    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequest, CloudError>;

    async fn cancel_spot_request(&self, request_id: &str) -> Result<(), CloudError>;

    async fn create_tags(&self, resource_id: &str, tags: Vec<Tag>) -> Result<(), CloudError>;

    async fn delete_tags(&self, resource_id: &str, tags: Vec<Tag>) -> Result<(), CloudError>;

    async fn associate_address(
        &self,
        instance_id: &str,
        public_ip: &str,
    ) -> Result<AddressAssociation, CloudError>;

    async fn terminate_instances(&self, instance_ids: Vec<String>) -> Result<(), CloudError>;
}
