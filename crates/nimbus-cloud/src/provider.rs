//! Capability traits implemented by cloud provider integrations
//!
//! A provider exposes each capability as an optional trait handle; a
//! capability the cloud cannot offer is reported by returning `None` from
//! its accessor, and the orchestrator degrades accordingly.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::types::{
    LoadBalancerStatus, NodeAddress, NodeResources, ServiceAffinity, ServicePort, VolumeOptions,
    Zone,
};
use crate::Result;

/// Top-level handle to a cloud provider integration
pub trait CloudProvider: Send + Sync {
    /// The provider's registered identifier (e.g. `"aws"`)
    fn provider_name(&self) -> &'static str;

    /// Instance discovery and metadata, if supported
    fn instances(&self) -> Option<&dyn Instances>;

    /// Zone/region placement, if supported
    fn zones(&self) -> Option<&dyn Zones>;

    /// External L4 load balancers, if supported
    fn tcp_load_balancer(&self) -> Option<&dyn TcpLoadBalancer>;

    /// Persistent block volumes, if supported
    fn volumes(&self) -> Option<&dyn Volumes>;
}

/// Instance discovery keyed by logical node name
///
/// The node name is the cloud-assigned private DNS name of the instance;
/// every operation resolves it to exactly one live instance or fails.
#[async_trait]
pub trait Instances: Send + Sync {
    /// All addresses of the named node, internal address first
    async fn node_addresses(&self, name: &str) -> Result<Vec<NodeAddress>>;

    /// The raw cloud-side instance id of the named node
    async fn external_id(&self, name: &str) -> Result<String>;

    /// The provider-scoped instance identity, `/<zone>/<instance-id>`
    async fn instance_id(&self, name: &str) -> Result<String>;

    /// Node names of all ready instances whose `Name` tag matches the
    /// given regular expression
    async fn list(&self, name_filter: &str) -> Result<Vec<String>>;

    /// Allocatable resources of the named node, or `None` when the cloud
    /// instance type is not in the provider's capacity table
    async fn node_resources(&self, name: &str) -> Result<Option<NodeResources>>;
}

/// Zone/region placement of the running provider
pub trait Zones: Send + Sync {
    /// The availability zone and region this provider operates in
    fn zone(&self) -> Zone;
}

/// Lifecycle of external L4 load balancers
///
/// All operations are idempotent and scoped to `(region, name)`.
#[async_trait]
pub trait TcpLoadBalancer: Send + Sync {
    /// Create the load balancer, or adopt an existing one with the same
    /// name, and register the given backend hosts
    async fn create(
        &self,
        region: &str,
        name: &str,
        public_ip: Option<IpAddr>,
        ports: &[ServicePort],
        hosts: &[String],
        affinity: ServiceAffinity,
    ) -> Result<LoadBalancerStatus>;

    /// Current status of the named load balancer, or `None` when it does
    /// not exist
    async fn get(&self, region: &str, name: &str) -> Result<Option<LoadBalancerStatus>>;

    /// Whether the named load balancer exists
    async fn exists(&self, region: &str, name: &str) -> Result<bool>;

    /// Reconcile the registered backend set to exactly `hosts`
    async fn update(&self, region: &str, name: &str, hosts: &[String]) -> Result<()>;

    /// Delete the named load balancer; succeeds when it is already gone
    async fn ensure_deleted(&self, region: &str, name: &str) -> Result<()>;
}

/// Lifecycle of persistent block volumes
///
/// Volume names are the provider's canonical URL-like identifiers; an empty
/// instance name means "the instance this process runs on".
#[async_trait]
pub trait Volumes: Send + Sync {
    /// Attach the volume and return the in-guest device path
    async fn attach_disk(
        &self,
        instance_name: &str,
        volume_name: &str,
        read_only: bool,
    ) -> Result<String>;

    /// Detach the volume from the instance it is attached to
    async fn detach_disk(&self, instance_name: &str, volume_name: &str) -> Result<()>;

    /// Create a volume and return its canonical name
    async fn create_volume(&self, options: &VolumeOptions) -> Result<String>;

    /// Delete the named volume
    async fn delete_volume(&self, volume_name: &str) -> Result<()>;
}
