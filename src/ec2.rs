use std::str::FromStr;

use async_trait::async_trait;
use rusoto_core::credential::{AutoRefreshingProvider, ChainProvider, CredentialsError, ProfileProvider};
use rusoto_core::request::TlsError;
use rusoto_core::{HttpClient, Region, RusotoError};
use rusoto_ec2::{
    AssociateAddressRequest, CancelSpotInstanceRequestsRequest, CreateTagsRequest, DeleteTagsRequest, DescribeInstancesRequest,
    DescribeSpotInstanceRequestsRequest, DescribeSpotPriceHistoryRequest, Ec2, Ec2Client,
    IamInstanceProfileSpecification, Instance, RequestSpotInstancesRequest,
    RequestSpotLaunchSpecification, SpotInstanceRequest, SpotPlacement, TerminateInstancesRequest,
};
use rusoto_sts::{StsAssumeRoleSessionCredentialsProvider, StsClient};
use thiserror::Error;

use crate::cloud::{
    AddressAssociation, CloudCompute, CloudError, InstanceDescription, SpotLaunch, SpotPricePoint,
    SpotRequest, Tag,
};

const SESSION_NAME: &str = "autospot";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid region: {0}")]
    Region(String),

    #[error("failed to resolve credentials: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("failed to create HTTP client: {0}")]
    Tls(#[from] TlsError),
}

/// How to reach EC2: which account profile, which region, which role.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub profile: Option<String>,
    pub region: Option<String>,
    pub assume_role: Option<String>,
}

/// A connected EC2 client, created once and reused for every call.
pub struct Ec2Session {
    client: Ec2Client,
}

impl Ec2Session {
    pub fn connect(settings: &SessionSettings) -> Result<Self, SessionError> {
        let region = match &settings.region {
            Some(name) => Region::from_str(name).map_err(|e| SessionError::Region(e.to_string()))?,
            None => Region::default(),
        };

        let chain = match &settings.profile {
            Some(name) => {
                let mut profile = ProfileProvider::new()?;
                profile.set_profile(name.as_str());
                ChainProvider::with_profile_provider(profile)
            }
            None => ChainProvider::new(),
        };
        let base = AutoRefreshingProvider::new(chain)?;

        let client = match &settings.assume_role {
            Some(role_arn) => {
                let sts = StsClient::new_with(HttpClient::new()?, base, region.clone());
                let provider = StsAssumeRoleSessionCredentialsProvider::new(
                    sts,
                    role_arn.clone(),
                    SESSION_NAME.to_string(),
                    None,
                    None,
                    None,
                    None,
                );
                let provider = AutoRefreshingProvider::new(provider)?;
                Ec2Client::new_with(HttpClient::new()?, provider, region.clone())
            }
            None => Ec2Client::new_with(HttpClient::new()?, base, region.clone()),
        };

        tracing::debug!(
            region = region.name(),
            profile = ?settings.profile,
            assume_role = ?settings.assume_role,
            "connected to EC2"
        );
        Ok(Ec2Session { client })
    }
}

/// Anything the provider answered with, and anything lost on the way, is a
/// client error; a response we could not make sense of is not.
fn classify<E: std::error::Error + 'static>(err: RusotoError<E>) -> CloudError {
    match err {
        RusotoError::Service(_)
        | RusotoError::HttpDispatch(_)
        | RusotoError::Credentials(_)
        | RusotoError::Unknown(_) => CloudError::Client(err.to_string()),
        RusotoError::Validation(_) | RusotoError::ParseError(_) | RusotoError::Blocking => {
            CloudError::Response(err.to_string())
        }
    }
}

fn describe(instance: Instance) -> InstanceDescription {
    InstanceDescription {
        instance_id: instance.instance_id.unwrap_or_default(),
        instance_type: instance.instance_type,
        public_ip: instance.public_ip_address,
        state: instance.state.and_then(|s| s.name),
        tags: instance
            .tags
            .unwrap_or_default()
            .into_iter()
            .filter_map(|t| {
                Some(Tag {
                    key: t.key?,
                    value: t.value.unwrap_or_default(),
                })
            })
            .collect(),
    }
}

fn spot_request(sir: SpotInstanceRequest) -> Result<SpotRequest, CloudError> {
    let request_id = sir
        .spot_instance_request_id
        .ok_or_else(|| CloudError::Response("spot request without an id".to_string()))?;
    Ok(SpotRequest {
        request_id,
        state: sir.state.unwrap_or_default(),
        instance_id: sir.instance_id,
    })
}

fn ec2_tags(tags: Vec<Tag>) -> Vec<rusoto_ec2::Tag> {
    tags.into_iter()
        .map(|t| rusoto_ec2::Tag {
            key: Some(t.key),
            value: Some(t.value),
        })
        .collect()
}

#[async_trait]
impl CloudCompute for Ec2Session {
    async fn describe_instances(
        &self,
        instance_ids: Vec<String>,
    ) -> Result<Vec<InstanceDescription>, CloudError> {
        let mut req = DescribeInstancesRequest::default();
        if !instance_ids.is_empty() {
            req.instance_ids = Some(instance_ids);
        }

        let mut instances = Vec::new();
        loop {
            let res = self
                .client
                .describe_instances(req.clone())
                .await
                .map_err(classify)?;
            for reservation in res.reservations.unwrap_or_default() {
                instances.extend(reservation.instances.unwrap_or_default().into_iter().map(describe));
            }
            match res.next_token {
                Some(token) if !token.is_empty() => req.next_token = Some(token),
                _ => break,
            }
        }
        Ok(instances)
    }

    async fn describe_spot_price_history(
        &self,
        instance_type: &str,
        product_description: &str,
        max_results: i64,
    ) -> Result<Vec<SpotPricePoint>, CloudError> {
        let req = DescribeSpotPriceHistoryRequest {
            instance_types: Some(vec![instance_type.to_string()]),
            product_descriptions: Some(vec![product_description.to_string()]),
            max_results: Some(max_results),
            ..Default::default()
        };
        let res = self
            .client
            .describe_spot_price_history(req)
            .await
            .map_err(classify)?;
        Ok(res
            .spot_price_history
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| {
                Some(SpotPricePoint {
                    price: p.spot_price?,
                    timestamp: p.timestamp,
                })
            })
            .collect())
    }

    async fn request_spot_instance(&self, launch: &SpotLaunch) -> Result<SpotRequest, CloudError> {
        let spec = RequestSpotLaunchSpecification {
            security_groups: Some(vec![launch.security_group.clone()]),
            image_id: Some(launch.image_id.clone()),
            instance_type: Some(launch.instance_type.clone()),
            key_name: Some(launch.key_name.clone()),
            placement: Some(SpotPlacement {
                availability_zone: Some(launch.availability_zone.clone()),
                ..Default::default()
            }),
            subnet_id: Some(launch.subnet_id.clone()),
            user_data: Some(launch.user_data.clone()),
            iam_instance_profile: Some(IamInstanceProfileSpecification {
                arn: Some(launch.iam_instance_profile_arn.clone()),
                name: None,
            }),
            ..Default::default()
        };
        let req = RequestSpotInstancesRequest {
            instance_count: Some(1),
            type_: Some("one-time".to_string()),
            instance_interruption_behavior: Some("terminate".to_string()),
            launch_specification: Some(spec),
            spot_price: Some(launch.spot_price.clone()),
            ..Default::default()
        };
        let res = self
            .client
            .request_spot_instances(req)
            .await
            .map_err(classify)?;
        res.spot_instance_requests
            .and_then(|reqs| reqs.into_iter().next())
            .ok_or_else(|| CloudError::Response("no spot request returned".to_string()))
            .and_then(spot_request)
    }

    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequest, CloudError> {
        let req = DescribeSpotInstanceRequestsRequest {
            spot_instance_request_ids: Some(vec![request_id.to_string()]),
            ..Default::default()
        };
        let res = self
            .client
            .describe_spot_instance_requests(req)
            .await
            .map_err(classify)?;
        res.spot_instance_requests
            .and_then(|reqs| reqs.into_iter().next())
            .ok_or_else(|| CloudError::Response(format!("spot request {request_id} not described")))
            .and_then(spot_request)
    }

    async fn cancel_spot_request(&self, request_id: &str) -> Result<(), CloudError> {
        let req = CancelSpotInstanceRequestsRequest {
            spot_instance_request_ids: vec![request_id.to_string()],
            ..Default::default()
        };
        self.client
            .cancel_spot_instance_requests(req)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn create_tags(&self, resource_id: &str, tags: Vec<Tag>) -> Result<(), CloudError> {
        let req = CreateTagsRequest {
            resources: vec![resource_id.to_string()],
            tags: ec2_tags(tags),
            ..Default::default()
        };
        self.client.create_tags(req).await.map_err(classify)
    }

    async fn delete_tags(&self, resource_id: &str, tags: Vec<Tag>) -> Result<(), CloudError> {
        let req = DeleteTagsRequest {
            resources: vec![resource_id.to_string()],
            tags: Some(ec2_tags(tags)),
            ..Default::default()
        };
        self.client.delete_tags(req).await.map_err(classify)
    }

    async fn associate_address(
        &self,
        instance_id: &str,
        public_ip: &str,
    ) -> Result<AddressAssociation, CloudError> {
        let req = AssociateAddressRequest {
            instance_id: Some(instance_id.to_string()),
            public_ip: Some(public_ip.to_string()),
            ..Default::default()
        };
        let res = self
            .client
            .associate_address(req)
            .await
            .map_err(classify)?;
        // rusoto only hands back parsed bodies for 2xx answers, and this call answers 200.
        Ok(AddressAssociation {
            status: 200,
            association_id: res.association_id,
        })
    }

    async fn terminate_instances(&self, instance_ids: Vec<String>) -> Result<(), CloudError> {
        let req = TerminateInstancesRequest {
            instance_ids,
            ..Default::default()
        };
        self.client
            .terminate_instances(req)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusoto_core::request::HttpDispatchError;
    use rusoto_ec2::{InstanceState, TerminateInstancesError};

    #[test]
    fn dispatch_failures_are_client_errors() {
        let err = RusotoError::<TerminateInstancesError>::HttpDispatch(HttpDispatchError::new(
            "connection reset".to_string(),
        ));
        assert!(matches!(classify(err), CloudError::Client(_)));
    }

    #[test]
    fn unparseable_responses_are_not_retryable() {
        let err = RusotoError::<TerminateInstancesError>::ParseError("bad xml".to_string());
        assert!(matches!(classify(err), CloudError::Response(_)));

        let err = RusotoError::<TerminateInstancesError>::Validation("no ids".to_string());
        assert!(matches!(classify(err), CloudError::Response(_)));
    }

    #[test]
    fn flattens_instance_fields() {
        let instance = Instance {
            instance_id: Some("i-0abc".to_string()),
            instance_type: Some("t3.micro".to_string()),
            public_ip_address: Some("198.51.100.4".to_string()),
            state: Some(InstanceState {
                code: Some(16),
                name: Some("running".to_string()),
            }),
            tags: Some(vec![
                rusoto_ec2::Tag {
                    key: Some("Name".to_string()),
                    value: Some("worker".to_string()),
                },
                rusoto_ec2::Tag {
                    key: None,
                    value: Some("orphan".to_string()),
                },
            ]),
            ..Default::default()
        };
        let desc = describe(instance);
        assert_eq!(desc.instance_id, "i-0abc");
        assert_eq!(desc.state.as_deref(), Some("running"));
        assert_eq!(desc.public_ip.as_deref(), Some("198.51.100.4"));
        assert_eq!(desc.tags, vec![Tag::new("Name", "worker")]);
    }

    #[test]
    fn spot_request_needs_an_id() {
        let sir = SpotInstanceRequest {
            state: Some("open".to_string()),
            ..Default::default()
        };
        assert!(matches!(spot_request(sir), Err(CloudError::Response(_))));

        let sir = SpotInstanceRequest {
            spot_instance_request_id: Some("sir-1".to_string()),
            state: Some("active".to_string()),
            instance_id: Some("i-1".to_string()),
            ..Default::default()
        };
        let req = spot_request(sir).unwrap();
        assert!(req.is_active());
        assert_eq!(req.instance_id.as_deref(), Some("i-1"));
    }
}
