//! SDK-backed implementation of the cloud services facade
//!
//! The only module that imports vendor SDK symbols. Credentials come from
//! the SDK's default provider chain (environment, shared config, instance
//! role), loaded once; region-scoped clients are derived from that shared
//! config on demand.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::Filter;
use tracing::warn;

use nimbus_cloud::{Error, Result};

use crate::metadata::{HttpMetadataResolver, MetadataResolver};
use crate::services::{
    BlockDeviceMapping, CloudInstance, CloudServices, CloudVolume, ComputeService,
    CreateLoadBalancerSpec, IngressRule, InstanceFilter, Listener, LoadBalancer,
    LoadBalancingService, SecurityGroup, Subnet, VolumeAttachment, Vpc, retain_alive,
};

/// Facade backed by the AWS SDK
pub struct SdkCloudServices {
    shared: aws_config::SdkConfig,
    metadata: Arc<dyn MetadataResolver>,
}

impl SdkCloudServices {
    /// Load shared SDK configuration through the default credential chain
    pub async fn load() -> Result<Self> {
        let shared = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let metadata = Arc::new(HttpMetadataResolver::new()?);
        Ok(Self { shared, metadata })
    }
}

impl CloudServices for SdkCloudServices {
    fn compute(&self, region: &str) -> Result<Arc<dyn ComputeService>> {
        let config = aws_sdk_ec2::config::Builder::from(&self.shared)
            .region(Region::new(region.to_string()))
            .build();
        Ok(Arc::new(SdkCompute {
            client: aws_sdk_ec2::Client::from_conf(config),
        }))
    }

    fn load_balancing(&self, region: &str) -> Result<Arc<dyn LoadBalancingService>> {
        let config = aws_sdk_elasticloadbalancing::config::Builder::from(&self.shared)
            .region(Region::new(region.to_string()))
            .build();
        Ok(Arc::new(SdkLoadBalancing {
            client: aws_sdk_elasticloadbalancing::Client::from_conf(config),
        }))
    }

    fn metadata(&self) -> Arc<dyn MetadataResolver> {
        Arc::clone(&self.metadata)
    }
}

fn api_err(context: &'static str, err: impl std::error::Error) -> Error {
    Error::api(context, format!("{}", DisplayErrorContext(err)))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// EC2-backed compute operations
pub struct SdkCompute {
    client: aws_sdk_ec2::Client,
}

fn convert_instance(instance: &aws_sdk_ec2::types::Instance) -> CloudInstance {
    let mut tags = BTreeMap::new();
    for tag in instance.tags() {
        if let (Some(key), Some(value)) = (tag.key(), tag.value()) {
            tags.insert(key.to_string(), value.to_string());
        }
    }

    let mut block_device_mappings = Vec::new();
    for mapping in instance.block_device_mappings() {
        let volume_id = mapping.ebs().and_then(|ebs| ebs.volume_id());
        if let (Some(device), Some(volume)) = (mapping.device_name(), volume_id) {
            block_device_mappings.push(BlockDeviceMapping {
                device_name: device.to_string(),
                volume_id: volume.to_string(),
            });
        }
    }

    CloudInstance {
        instance_id: instance.instance_id().unwrap_or_default().to_string(),
        private_dns_name: non_empty(instance.private_dns_name()),
        private_ip_address: non_empty(instance.private_ip_address()),
        public_ip_address: non_empty(instance.public_ip_address()),
        availability_zone: instance
            .placement()
            .and_then(|p| p.availability_zone())
            .map(str::to_string),
        state: instance
            .state()
            .and_then(|s| s.name())
            .map(|n| n.as_str().to_string()),
        instance_type: instance.instance_type().map(|t| t.as_str().to_string()),
        block_device_mappings,
        tags,
    }
}

fn convert_attachment(
    state: Option<&aws_sdk_ec2::types::VolumeAttachmentState>,
    instance_id: Option<&str>,
    device: Option<&str>,
) -> VolumeAttachment {
    VolumeAttachment {
        state: state.map(|s| s.as_str().to_string()),
        instance_id: non_empty(instance_id),
        device: non_empty(device),
    }
}

fn convert_volume(volume: &aws_sdk_ec2::types::Volume) -> CloudVolume {
    CloudVolume {
        volume_id: volume.volume_id().unwrap_or_default().to_string(),
        availability_zone: non_empty(volume.availability_zone()),
        attachments: volume
            .attachments()
            .iter()
            .map(|a| convert_attachment(a.state(), a.instance_id(), a.device()))
            .collect(),
    }
}

fn convert_security_group(group: &aws_sdk_ec2::types::SecurityGroup) -> SecurityGroup {
    SecurityGroup {
        group_id: group.group_id().unwrap_or_default().to_string(),
        group_name: non_empty(group.group_name()),
        ingress_rules: group
            .ip_permissions()
            .iter()
            .map(|permission| IngressRule {
                ip_protocol: non_empty(permission.ip_protocol()),
                from_port: permission.from_port(),
                to_port: permission.to_port(),
                ip_ranges: permission
                    .ip_ranges()
                    .iter()
                    .filter_map(|range| range.cidr_ip())
                    .map(str::to_string)
                    .collect(),
            })
            .collect(),
    }
}

#[async_trait]
impl ComputeService for SdkCompute {
    async fn instances(
        &self,
        instance_ids: &[String],
        filter: Option<&InstanceFilter>,
    ) -> Result<Vec<CloudInstance>> {
        let mut fetched = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self.client.describe_instances();
            if !instance_ids.is_empty() {
                request = request.set_instance_ids(Some(instance_ids.to_vec()));
            }
            if let Some(dns_name) = filter.and_then(|f| f.private_dns_name.as_deref()) {
                request = request.filters(
                    Filter::builder()
                        .name("private-dns-name")
                        .values(dns_name)
                        .build(),
                );
            }
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| api_err("describe instances", e))?;

            for reservation in response.reservations() {
                fetched.extend(reservation.instances().iter().map(convert_instance));
            }

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(retain_alive(fetched))
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment> {
        let response = self
            .client
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(|e| api_err("attach volume", e))?;

        Ok(convert_attachment(
            response.state(),
            response.instance_id(),
            response.device(),
        ))
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<Option<VolumeAttachment>> {
        let response = self
            .client
            .detach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .send()
            .await
            .map_err(|e| api_err("detach volume", e))?;

        if response.state().is_none()
            && response.instance_id().is_none()
            && response.device().is_none()
        {
            return Ok(None);
        }
        Ok(Some(convert_attachment(
            response.state(),
            response.instance_id(),
            response.device(),
        )))
    }

    async fn volumes(&self, volume_ids: &[String]) -> Result<Vec<CloudVolume>> {
        let mut request = self.client.describe_volumes();
        if !volume_ids.is_empty() {
            request = request.set_volume_ids(Some(volume_ids.to_vec()));
        }
        let response = request
            .send()
            .await
            .map_err(|e| api_err("describe volumes", e))?;

        Ok(response.volumes().iter().map(convert_volume).collect())
    }

    async fn create_volume(&self, availability_zone: &str, size_gb: i64) -> Result<CloudVolume> {
        let response = self
            .client
            .create_volume()
            .availability_zone(availability_zone)
            .size(size_gb as i32)
            .send()
            .await
            .map_err(|e| api_err("create volume", e))?;

        Ok(CloudVolume {
            volume_id: response.volume_id().unwrap_or_default().to_string(),
            availability_zone: non_empty(response.availability_zone()),
            attachments: Vec::new(),
        })
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|e| api_err("delete volume", e))?;
        Ok(())
    }

    async fn security_groups(
        &self,
        group_ids: &[String],
        filter_name: Option<&str>,
        filter_vpc_id: Option<&str>,
    ) -> Result<Vec<SecurityGroup>> {
        let mut request = self.client.describe_security_groups();
        if !group_ids.is_empty() {
            request = request.set_group_ids(Some(group_ids.to_vec()));
        }
        if let Some(name) = filter_name {
            request = request.filters(Filter::builder().name("group-name").values(name).build());
        }
        if let Some(vpc_id) = filter_vpc_id {
            request = request.filters(Filter::builder().name("vpc-id").values(vpc_id).build());
        }

        let response = request
            .send()
            .await
            .map_err(|e| api_err("describe security groups", e))?;

        Ok(response
            .security_groups()
            .iter()
            .map(convert_security_group)
            .collect())
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
    ) -> Result<String> {
        let response = self
            .client
            .create_security_group()
            .vpc_id(vpc_id)
            .group_name(name)
            .description(description)
            .send()
            .await
            .map_err(|e| api_err("create security group", e))?;

        response
            .group_id()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::protocol("created security group, but no id was returned"))
    }

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        rules: &[IngressRule],
    ) -> Result<()> {
        let mut permissions = Vec::with_capacity(rules.len());
        for rule in rules {
            let mut builder = aws_sdk_ec2::types::IpPermission::builder();
            if let Some(protocol) = &rule.ip_protocol {
                builder = builder.ip_protocol(protocol);
            }
            if let Some(from_port) = rule.from_port {
                builder = builder.from_port(from_port);
            }
            if let Some(to_port) = rule.to_port {
                builder = builder.to_port(to_port);
            }
            for cidr in &rule.ip_ranges {
                builder = builder
                    .ip_ranges(aws_sdk_ec2::types::IpRange::builder().cidr_ip(cidr).build());
            }
            permissions.push(builder.build());
        }

        self.client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(permissions))
            .send()
            .await
            .map_err(|e| api_err("authorize security group ingress", e))?;
        Ok(())
    }

    async fn vpcs_by_name_tag(&self, name: &str) -> Result<Vec<Vpc>> {
        let response = self
            .client
            .describe_vpcs()
            .filters(Filter::builder().name("tag:Name").values(name).build())
            .send()
            .await
            .map_err(|e| api_err("describe VPCs", e))?;

        Ok(response
            .vpcs()
            .iter()
            .map(|vpc| Vpc {
                vpc_id: vpc.vpc_id().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>> {
        let response = self
            .client
            .describe_subnets()
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .send()
            .await
            .map_err(|e| api_err("describe subnets", e))?;

        Ok(response
            .subnets()
            .iter()
            .map(|subnet| Subnet {
                subnet_id: subnet.subnet_id().unwrap_or_default().to_string(),
                availability_zone: non_empty(subnet.availability_zone()),
            })
            .collect())
    }
}

/// Classic-ELB-backed load balancing operations
pub struct SdkLoadBalancing {
    client: aws_sdk_elasticloadbalancing::Client,
}

#[async_trait]
impl LoadBalancingService for SdkLoadBalancing {
    async fn create_load_balancer(&self, spec: &CreateLoadBalancerSpec) -> Result<String> {
        let mut listeners = Vec::with_capacity(spec.listeners.len());
        for listener in &spec.listeners {
            listeners.push(convert_listener(listener)?);
        }

        let response = self
            .client
            .create_load_balancer()
            .load_balancer_name(&spec.name)
            .set_listeners(Some(listeners))
            .set_subnets(Some(spec.subnet_ids.clone()))
            .set_security_groups(Some(spec.security_group_ids.clone()))
            .send()
            .await
            .map_err(|e| api_err("create load balancer", e))?;

        response
            .dns_name()
            .filter(|dns| !dns.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::protocol("created load balancer, but no DNS name was returned"))
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<()> {
        self.client
            .delete_load_balancer()
            .load_balancer_name(name)
            .send()
            .await
            .map_err(|e| api_err("delete load balancer", e))?;
        Ok(())
    }

    async fn describe_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>> {
        let response = match self
            .client
            .describe_load_balancers()
            .load_balancer_names(name)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_access_point_not_found_exception() {
                    return Ok(None);
                }
                return Err(api_err("describe load balancer", service_err));
            }
        };

        let mut found: Option<LoadBalancer> = None;
        for description in response.load_balancer_descriptions() {
            if found.is_some() {
                warn!(name = %name, "Found multiple load balancers with the same name");
            }
            found = Some(LoadBalancer {
                name: description.load_balancer_name().unwrap_or(name).to_string(),
                dns_name: non_empty(description.dns_name()),
                instance_ids: description
                    .instances()
                    .iter()
                    .filter_map(|i| i.instance_id())
                    .map(str::to_string)
                    .collect(),
            });
        }
        Ok(found)
    }

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        self.client
            .register_instances_with_load_balancer()
            .load_balancer_name(name)
            .set_instances(Some(convert_backend_instances(instance_ids)))
            .send()
            .await
            .map_err(|e| api_err("register instances with load balancer", e))?;
        Ok(())
    }

    async fn deregister_instances(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        self.client
            .deregister_instances_from_load_balancer()
            .load_balancer_name(name)
            .set_instances(Some(convert_backend_instances(instance_ids)))
            .send()
            .await
            .map_err(|e| api_err("deregister instances from load balancer", e))?;
        Ok(())
    }
}

fn convert_listener(
    listener: &Listener,
) -> Result<aws_sdk_elasticloadbalancing::types::Listener> {
    aws_sdk_elasticloadbalancing::types::Listener::builder()
        .protocol(&listener.protocol)
        .load_balancer_port(listener.load_balancer_port)
        .instance_protocol(&listener.protocol)
        .instance_port(listener.instance_port)
        .build()
        .map_err(|e| Error::api("build load balancer listener", e))
}

fn convert_backend_instances(
    instance_ids: &[String],
) -> Vec<aws_sdk_elasticloadbalancing::types::Instance> {
    instance_ids
        .iter()
        .map(|id| {
            aws_sdk_elasticloadbalancing::types::Instance::builder()
                .instance_id(id)
                .build()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::{
        EbsInstanceBlockDevice, Instance, InstanceBlockDeviceMapping, InstanceState,
        InstanceStateName, Placement, Tag,
    };

    #[test]
    fn converts_instance_fields() {
        let instance = Instance::builder()
            .instance_id("i-0123")
            .private_dns_name("ip-10-0-0-7.ec2.internal")
            .private_ip_address("10.0.0.7")
            .public_ip_address("54.1.2.3")
            .placement(Placement::builder().availability_zone("us-east-1a").build())
            .state(
                InstanceState::builder()
                    .name(InstanceStateName::Running)
                    .build(),
            )
            .tags(Tag::builder().key("Name").value("worker-1").build())
            .block_device_mappings(
                InstanceBlockDeviceMapping::builder()
                    .device_name("/dev/sdf")
                    .ebs(EbsInstanceBlockDevice::builder().volume_id("vol-aaa").build())
                    .build(),
            )
            .build();

        let converted = convert_instance(&instance);
        assert_eq!(converted.instance_id, "i-0123");
        assert_eq!(
            converted.private_dns_name.as_deref(),
            Some("ip-10-0-0-7.ec2.internal")
        );
        assert_eq!(converted.availability_zone.as_deref(), Some("us-east-1a"));
        assert_eq!(converted.state.as_deref(), Some("running"));
        assert_eq!(converted.tags.get("Name").map(String::as_str), Some("worker-1"));
        assert_eq!(converted.block_device_mappings.len(), 1);
        assert_eq!(converted.block_device_mappings[0].volume_id, "vol-aaa");
    }

    #[test]
    fn empty_addresses_become_none() {
        let instance = Instance::builder()
            .instance_id("i-0123")
            .private_dns_name("")
            .public_ip_address("")
            .build();

        let converted = convert_instance(&instance);
        assert!(converted.private_dns_name.is_none());
        assert!(converted.public_ip_address.is_none());
    }

    #[test]
    fn listener_conversion_carries_protocol_to_both_sides() {
        let listener = convert_listener(&Listener {
            load_balancer_port: 80,
            instance_port: 30080,
            protocol: "tcp".to_string(),
        })
        .unwrap();

        assert_eq!(listener.protocol(), "tcp");
        assert_eq!(listener.instance_protocol(), Some("tcp"));
        assert_eq!(listener.load_balancer_port(), 80);
        assert_eq!(listener.instance_port(), 30080);
    }
}
