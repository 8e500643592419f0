//! Instance resolution and node capabilities
//!
//! Nodes are identified by their private DNS name; every operation resolves
//! that name to exactly one live instance. The instance-type capacity table
//! is a fixed program constant because the cloud offers no API for it.

use std::net::IpAddr;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use nimbus_cloud::provider::Instances;
use nimbus_cloud::types::{NodeAddress, NodeAddressKind, NodeResources};
use nimbus_cloud::{Error, Result};

use crate::provider::AwsCloud;
use crate::services::{CloudInstance, ComputeService, InstanceFilter};

const GIB: f64 = (1u64 << 30) as f64;

/// Resolve a private DNS name to the unique live instance carrying it
pub(crate) async fn find_instance_by_dns_name(
    compute: &dyn ComputeService,
    name: &str,
) -> Result<CloudInstance> {
    let filter = InstanceFilter::by_private_dns_name(name);
    let instances = compute.instances(&[], Some(&filter)).await?;

    // The filter should have done this already; drop anything that slipped
    // through an incompletely-filtered response.
    let mut matching: Vec<CloudInstance> = instances
        .into_iter()
        .filter(|instance| instance.private_dns_name.as_deref() == Some(name))
        .collect();

    match matching.len() {
        0 => Err(Error::not_found("instance", name)),
        1 => Ok(matching.remove(0)),
        _ => Err(Error::ambiguous("instance", name)),
    }
}

/// Resolve each host name to its instance, failing if any is missing
pub(crate) async fn find_instances_by_dns_names(
    compute: &dyn ComputeService,
    names: &[String],
) -> Result<Vec<CloudInstance>> {
    let mut instances = Vec::with_capacity(names.len());
    for name in names {
        instances.push(find_instance_by_dns_name(compute, name).await?);
    }
    Ok(instances)
}

fn make_resources(cpu_ecus: f64, memory_gib: f64) -> Option<NodeResources> {
    Some(NodeResources {
        milli_cpu: (cpu_ecus * 1000.0) as i64,
        memory_bytes: (memory_gib * GIB) as i64,
    })
}

/// Capacity of a cloud instance type, in ECUs and binary GiB
///
/// There is no API for this; the table mirrors the published instance
/// matrix. Unknown types return `None` so new instance families degrade to
/// "no capacity information" instead of failing node registration.
pub fn resources_for_instance_type(instance_type: &str) -> Option<NodeResources> {
    match instance_type {
        // t1/t2: burstable; the ECU figures are nominal
        "t1.micro" => make_resources(0.125, 0.615),
        "t2.micro" => make_resources(0.25, 1.0),
        "t2.small" => make_resources(0.5, 2.0),
        "t2.medium" => make_resources(1.0, 4.0),
        // c1: compute optimized
        "c1.medium" => make_resources(5.0, 1.7),
        "c1.xlarge" => make_resources(20.0, 7.0),
        // cc2: cluster compute
        "cc2.8xlarge" => make_resources(88.0, 60.5),
        // cg1: GPU
        "cg1.4xlarge" => make_resources(33.5, 22.5),
        // cr1: memory optimized
        "cr1.8xlarge" => make_resources(88.0, 244.0),
        // c3: compute optimized
        "c3.large" => make_resources(7.0, 3.75),
        "c3.xlarge" => make_resources(14.0, 7.5),
        "c3.2xlarge" => make_resources(28.0, 15.0),
        "c3.4xlarge" => make_resources(55.0, 30.0),
        "c3.8xlarge" => make_resources(108.0, 60.0),
        // c4: compute optimized
        "c4.large" => make_resources(8.0, 3.75),
        "c4.xlarge" => make_resources(16.0, 7.5),
        "c4.2xlarge" => make_resources(31.0, 15.0),
        "c4.4xlarge" => make_resources(62.0, 30.0),
        "c4.8xlarge" => make_resources(132.0, 60.0),
        // g2: GPU
        "g2.2xlarge" => make_resources(26.0, 15.0),
        // hi1: storage optimized (SSD)
        "hi1.4xlarge" => make_resources(35.0, 60.5),
        // hs1: storage optimized (HDD)
        "hs1.8xlarge" => make_resources(35.0, 117.0),
        // d2: dense storage
        "d2.xlarge" => make_resources(14.0, 30.5),
        "d2.2xlarge" => make_resources(28.0, 61.0),
        "d2.4xlarge" => make_resources(56.0, 122.0),
        "d2.8xlarge" => make_resources(116.0, 244.0),
        // m1: general purpose
        "m1.small" => make_resources(1.0, 1.7),
        "m1.medium" => make_resources(2.0, 3.75),
        "m1.large" => make_resources(4.0, 7.5),
        "m1.xlarge" => make_resources(8.0, 15.0),
        // m2: memory optimized
        "m2.xlarge" => make_resources(6.5, 17.1),
        "m2.2xlarge" => make_resources(13.0, 34.2),
        "m2.4xlarge" => make_resources(26.0, 68.4),
        // m3: general purpose
        "m3.medium" => make_resources(3.0, 3.75),
        "m3.large" => make_resources(6.5, 7.5),
        "m3.xlarge" => make_resources(13.0, 15.0),
        "m3.2xlarge" => make_resources(26.0, 30.0),
        // i2: storage optimized (SSD)
        "i2.xlarge" => make_resources(14.0, 30.5),
        "i2.2xlarge" => make_resources(27.0, 61.0),
        "i2.4xlarge" => make_resources(53.0, 122.0),
        "i2.8xlarge" => make_resources(104.0, 244.0),
        // r3: memory optimized
        "r3.large" => make_resources(6.5, 15.0),
        "r3.xlarge" => make_resources(13.0, 30.5),
        "r3.2xlarge" => make_resources(26.0, 61.0),
        "r3.4xlarge" => make_resources(52.0, 122.0),
        "r3.8xlarge" => make_resources(104.0, 244.0),
        other => {
            warn!(instance_type = %other, "Unknown instance type");
            None
        }
    }
}

fn parse_address(
    instance_id: &str,
    role: &str,
    address: &str,
) -> Result<IpAddr> {
    address.parse().map_err(|_| {
        Error::protocol(format!(
            "instance {instance_id} reported an invalid {role} address: {address}"
        ))
    })
}

#[async_trait]
impl Instances for AwsCloud {
    async fn node_addresses(&self, name: &str) -> Result<Vec<NodeAddress>> {
        let instance = find_instance_by_dns_name(self.compute.as_ref(), name).await?;

        let mut addresses = Vec::new();
        if let Some(private_ip) = &instance.private_ip_address {
            let ip = parse_address(&instance.instance_id, "private", private_ip)?;
            addresses.push(NodeAddress::new(NodeAddressKind::InternalIp, ip.to_string()));
            // Older agents key on the legacy tag; report the same address
            // under both.
            addresses.push(NodeAddress::new(
                NodeAddressKind::LegacyHostIp,
                ip.to_string(),
            ));
        }
        if let Some(public_ip) = &instance.public_ip_address {
            let ip = parse_address(&instance.instance_id, "public", public_ip)?;
            addresses.push(NodeAddress::new(NodeAddressKind::ExternalIp, ip.to_string()));
        }

        Ok(addresses)
    }

    async fn external_id(&self, name: &str) -> Result<String> {
        let instance = find_instance_by_dns_name(self.compute.as_ref(), name).await?;
        Ok(instance.instance_id)
    }

    async fn instance_id(&self, name: &str) -> Result<String> {
        let instance = find_instance_by_dns_name(self.compute.as_ref(), name).await?;
        Ok(format!(
            "/{}/{}",
            instance.availability_zone.as_deref().unwrap_or_default(),
            instance.instance_id
        ))
    }

    async fn list(&self, name_filter: &str) -> Result<Vec<String>> {
        let instances = self.compute.instances(&[], None).await?;
        if instances.is_empty() {
            return Err(Error::not_found("instances", name_filter));
        }

        let mut pattern = name_filter;
        if pattern.len() >= 2 && pattern.starts_with('\'') && pattern.ends_with('\'') {
            debug!(pattern = %pattern, "Stripping quotes around instance name filter");
            pattern = &pattern[1..pattern.len() - 1];
        }
        let regex = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid instance name filter: {e}")))?;

        let mut matching = Vec::new();
        for instance in &instances {
            // Only fully-ready instances are listed; a by-name lookup will
            // still find a pending one.
            if instance.state.as_deref() == Some("pending") {
                debug!(instance_id = %instance.instance_id, "Skipping pending instance");
                continue;
            }
            let Some(private_dns_name) = &instance.private_dns_name else {
                debug!(instance_id = %instance.instance_id, "Skipping instance with no private DNS name");
                continue;
            };
            if let Some(name_tag) = instance.tags.get("Name") {
                if regex.is_match(name_tag) {
                    matching.push(private_dns_name.clone());
                }
            }
        }

        debug!(count = matching.len(), "Matched instances by name filter");
        Ok(matching)
    }

    async fn node_resources(&self, name: &str) -> Result<Option<NodeResources>> {
        let instance = find_instance_by_dns_name(self.compute.as_ref(), name).await?;
        Ok(resources_for_instance_type(
            instance.instance_type.as_deref().unwrap_or_default(),
        ))
    }
}
