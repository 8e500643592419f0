//! Cloud services facade
//!
//! The capability boundary between the provider and the remote cloud. Code
//! above this module speaks only the domain types defined here; vendor SDK
//! symbols are confined to the SDK-backed implementation in [`crate::sdk`],
//! and tests drive the same traits through [`crate::mock`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use nimbus_cloud::Result;

use crate::metadata::MetadataResolver;

/// Lifecycle states in which an instance is considered alive
///
/// Anything else (`shutting-down`, `terminated`, `stopping`, `stopped`) is
/// treated as gone; unknown states are logged and treated as gone too.
const ALIVE_STATES: &[&str] = &["pending", "running"];

const KNOWN_DEAD_STATES: &[&str] = &["shutting-down", "terminated", "stopping", "stopped"];

/// Filter for instance listing
#[derive(Clone, Debug, Default)]
pub struct InstanceFilter {
    /// Select instances with exactly this private DNS name
    pub private_dns_name: Option<String>,
}

impl InstanceFilter {
    /// Filter on a private DNS name
    pub fn by_private_dns_name(name: impl Into<String>) -> Self {
        Self {
            private_dns_name: Some(name.into()),
        }
    }
}

/// A compute instance as seen through the facade
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudInstance {
    /// Cloud-side instance id (`i-…`)
    pub instance_id: String,
    /// Private DNS name; the orchestrator's node name
    pub private_dns_name: Option<String>,
    /// Private IPv4 address
    pub private_ip_address: Option<String>,
    /// Public IPv4 address, when one is associated
    pub public_ip_address: Option<String>,
    /// Availability zone the instance is placed in
    pub availability_zone: Option<String>,
    /// Lifecycle state name as reported by the cloud
    pub state: Option<String>,
    /// Cloud instance type string (e.g. `m3.large`)
    pub instance_type: Option<String>,
    /// Attached block devices, device name → volume id
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    /// Instance tags
    pub tags: BTreeMap<String, String>,
}

/// One entry of an instance's block device map
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDeviceMapping {
    /// Device name on the instance (e.g. `/dev/sdf`)
    pub device_name: String,
    /// Volume attached at that device
    pub volume_id: String,
}

/// One attachment of a volume to an instance
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeAttachment {
    /// Attachment state (`attaching`, `attached`, `detaching`, `detached`)
    pub state: Option<String>,
    /// Instance the volume is attached to
    pub instance_id: Option<String>,
    /// Device name of the attachment
    pub device: Option<String>,
}

/// A block volume as seen through the facade
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudVolume {
    /// Cloud-side volume id (`vol-…`)
    pub volume_id: String,
    /// Availability zone the volume is bound to
    pub availability_zone: Option<String>,
    /// Current attachments; at most one in practice
    pub attachments: Vec<VolumeAttachment>,
}

/// One ingress permission of a security group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressRule {
    /// Lowercase protocol name
    pub ip_protocol: Option<String>,
    /// First port of the permitted range
    pub from_port: Option<i32>,
    /// Last port of the permitted range
    pub to_port: Option<i32>,
    /// Source CIDR blocks
    pub ip_ranges: Vec<String>,
}

impl IngressRule {
    /// A single-port, single-source rule
    pub fn single(protocol: impl Into<String>, port: i32, cidr: impl Into<String>) -> Self {
        Self {
            ip_protocol: Some(protocol.into()),
            from_port: Some(port),
            to_port: Some(port),
            ip_ranges: vec![cidr.into()],
        }
    }
}

/// A security group as seen through the facade
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityGroup {
    /// Cloud-side group id (`sg-…`)
    pub group_id: String,
    /// Group name
    pub group_name: Option<String>,
    /// Current ingress permissions
    pub ingress_rules: Vec<IngressRule>,
}

/// A VPC as seen through the facade
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vpc {
    /// Cloud-side VPC id (`vpc-…`)
    pub vpc_id: String,
}

/// A subnet as seen through the facade
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subnet {
    /// Cloud-side subnet id (`subnet-…`)
    pub subnet_id: String,
    /// Availability zone the subnet is bound to
    pub availability_zone: Option<String>,
}

/// A load balancer as seen through the facade
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancer {
    /// Cluster-unique load balancer name
    pub name: String,
    /// Externally visible DNS name
    pub dns_name: Option<String>,
    /// Instance ids currently registered as backends
    pub instance_ids: Vec<String>,
}

/// One L4 listener of a load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    /// Externally visible port
    pub load_balancer_port: i32,
    /// Backend instance port
    pub instance_port: i32,
    /// Lowercase protocol, applied to both sides
    pub protocol: String,
}

/// Everything needed to create a load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateLoadBalancerSpec {
    /// Cluster-unique name
    pub name: String,
    /// L4 listeners
    pub listeners: Vec<Listener>,
    /// One subnet per availability zone
    pub subnet_ids: Vec<String>,
    /// Security groups guarding the listener ports
    pub security_group_ids: Vec<String>,
}

/// Compute-side operations (instances, volumes, security groups, network)
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Query instances by explicit id list and/or filter
    ///
    /// Pagination is consumed transparently; instances whose lifecycle
    /// state is not alive are never returned.
    async fn instances(
        &self,
        instance_ids: &[String],
        filter: Option<&InstanceFilter>,
    ) -> Result<Vec<CloudInstance>>;

    /// Attach a volume to an instance at the given device name
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment>;

    /// Detach a volume from an instance
    ///
    /// Returns `None` when the cloud produced no attachment description;
    /// callers treat that as a protocol error.
    async fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<Option<VolumeAttachment>>;

    /// Describe volumes by id
    async fn volumes(&self, volume_ids: &[String]) -> Result<Vec<CloudVolume>>;

    /// Create a volume in the given zone with the given size in GB
    async fn create_volume(&self, availability_zone: &str, size_gb: i64) -> Result<CloudVolume>;

    /// Delete a volume
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    /// Describe security groups by id list and/or name + VPC filters
    async fn security_groups(
        &self,
        group_ids: &[String],
        filter_name: Option<&str>,
        filter_vpc_id: Option<&str>,
    ) -> Result<Vec<SecurityGroup>>;

    /// Create a security group and return its id
    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
    ) -> Result<String>;

    /// Add ingress permissions to a security group
    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        rules: &[IngressRule],
    ) -> Result<()>;

    /// Describe VPCs carrying the given `Name` tag
    async fn vpcs_by_name_tag(&self, name: &str) -> Result<Vec<Vpc>>;

    /// Describe the subnets of a VPC
    async fn subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>>;
}

/// Load-balancing-side operations
#[async_trait]
pub trait LoadBalancingService: Send + Sync {
    /// Create a load balancer and return its DNS name
    async fn create_load_balancer(&self, spec: &CreateLoadBalancerSpec) -> Result<String>;

    /// Delete a load balancer by name
    async fn delete_load_balancer(&self, name: &str) -> Result<()>;

    /// Describe a load balancer by name
    ///
    /// A cloud-reported "load balancer not found" is folded to `None`
    /// rather than an error.
    async fn describe_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>>;

    /// Register instances as backends
    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> Result<()>;

    /// Deregister instances
    async fn deregister_instances(&self, name: &str, instance_ids: &[String]) -> Result<()>;
}

/// Factory for region-scoped service clients plus the metadata resolver
pub trait CloudServices: Send + Sync {
    /// Compute client for the given region
    fn compute(&self, region: &str) -> Result<Arc<dyn ComputeService>>;

    /// Load balancing client for the given region
    fn load_balancing(&self, region: &str) -> Result<Arc<dyn LoadBalancingService>>;

    /// The instance metadata resolver
    fn metadata(&self) -> Arc<dyn MetadataResolver>;
}

/// Whether an instance's lifecycle state counts as alive
///
/// Unknown states and missing state fields are logged and treated as dead.
pub fn is_alive(instance: &CloudInstance) -> bool {
    match instance.state.as_deref() {
        None => {
            warn!(instance_id = %instance.instance_id, "Instance state was unexpectedly missing");
            false
        }
        Some(state) if ALIVE_STATES.contains(&state) => true,
        Some(state) if KNOWN_DEAD_STATES.contains(&state) => false,
        Some(state) => {
            warn!(instance_id = %instance.instance_id, state = %state, "Unknown instance lifecycle state");
            false
        }
    }
}

/// Drop instances whose lifecycle state is not alive
///
/// Both facade implementations apply this before returning instances, so
/// nothing above the facade ever sees a terminated or stopping instance.
pub fn retain_alive(mut instances: Vec<CloudInstance>) -> Vec<CloudInstance> {
    instances.retain(is_alive);
    instances
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_in_state(state: Option<&str>) -> CloudInstance {
        CloudInstance {
            instance_id: "i-0001".to_string(),
            state: state.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn pending_and_running_are_alive() {
        assert!(is_alive(&instance_in_state(Some("pending"))));
        assert!(is_alive(&instance_in_state(Some("running"))));
    }

    #[test]
    fn dead_states_are_not_alive() {
        for state in ["shutting-down", "terminated", "stopping", "stopped"] {
            assert!(!is_alive(&instance_in_state(Some(state))), "{state}");
        }
    }

    #[test]
    fn unknown_and_missing_states_are_not_alive() {
        assert!(!is_alive(&instance_in_state(Some("rebooting-maybe"))));
        assert!(!is_alive(&instance_in_state(None)));
    }

    #[test]
    fn retain_alive_filters_in_place() {
        let instances = vec![
            instance_in_state(Some("running")),
            instance_in_state(Some("terminated")),
            instance_in_state(Some("pending")),
        ];
        let alive = retain_alive(instances);
        assert_eq!(alive.len(), 2);
    }

    #[test]
    fn single_port_rule_shape() {
        let rule = IngressRule::single("tcp", 80, "0.0.0.0/0");
        assert_eq!(rule.from_port, Some(80));
        assert_eq!(rule.to_port, Some(80));
        assert_eq!(rule.ip_ranges, vec!["0.0.0.0/0".to_string()]);
    }
}
