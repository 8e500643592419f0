//! Data model shared between the orchestrator and cloud providers
//!
//! These are the only volume, address, and load-balancer shapes that cross
//! the capability boundary. Providers translate their vendor types into
//! these at the facade.

use serde::{Deserialize, Serialize};

/// Kind of address reported for a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeAddressKind {
    /// Cluster-internal IPv4 address
    InternalIp,
    /// The internal address duplicated under its legacy tag, kept for
    /// older agents that still key on it
    LegacyHostIp,
    /// Publicly routable IPv4 address, when the node has one
    ExternalIp,
}

/// One address of a node, tagged with its kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    /// What role this address plays
    pub kind: NodeAddressKind,
    /// The address itself, in canonical textual form
    pub address: String,
}

impl NodeAddress {
    /// Create a new address of the given kind
    pub fn new(kind: NodeAddressKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }
}

/// Allocatable resources of a node
///
/// CPU is reported in milli-units of the cloud's CPU equivalents; memory is
/// reported in bytes using binary units (GiB = 2^30).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    /// Milli-CPU-equivalents
    pub milli_cpu: i64,
    /// Memory capacity in bytes
    pub memory_bytes: i64,
}

/// Placement of the provider within the cloud's failure domains
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Availability zone (e.g. `us-east-1a`)
    pub failure_domain: String,
    /// Region the zone belongs to (e.g. `us-east-1`)
    pub region: String,
}

/// Transport protocol of a service port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl Protocol {
    /// Lowercase wire form used by load balancer listeners
    pub fn lowercase(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// One port a service exposes through a load balancer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Externally visible port on the load balancer
    pub port: i32,
    /// Port the backend instances listen on; 0 means no backend port has
    /// been allocated yet and the port cannot be forwarded
    pub node_port: i32,
    /// Transport protocol, applied to both sides of the listener
    pub protocol: Protocol,
}

/// Session affinity requested for a load-balanced service
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceAffinity {
    /// No affinity; any backend may serve any connection
    #[default]
    None,
    /// Route a client's connections to the same backend
    ClientIp,
}

impl std::fmt::Display for ServiceAffinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceAffinity::None => write!(f, "None"),
            ServiceAffinity::ClientIp => write!(f, "ClientIP"),
        }
    }
}

/// Externally visible identity of a provisioned load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerStatus {
    /// Ingress points, in provider order
    pub ingress: Vec<LoadBalancerIngress>,
}

/// One ingress point of a load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerIngress {
    /// IP address, for providers that hand out raw addresses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// DNS hostname, for providers that hand out names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl LoadBalancerStatus {
    /// Status with a single hostname ingress
    pub fn hostname(hostname: impl Into<String>) -> Self {
        Self {
            ingress: vec![LoadBalancerIngress {
                ip: None,
                hostname: Some(hostname.into()),
            }],
        }
    }
}

/// Options for creating a persistent block volume
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOptions {
    /// Requested capacity in megabytes; providers round up to their
    /// allocation granularity
    pub capacity_mb: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_lowercase() {
        assert_eq!(Protocol::Tcp.lowercase(), "tcp");
        assert_eq!(Protocol::Udp.lowercase(), "udp");
    }

    #[test]
    fn affinity_display() {
        assert_eq!(ServiceAffinity::None.to_string(), "None");
        assert_eq!(ServiceAffinity::ClientIp.to_string(), "ClientIP");
    }

    #[test]
    fn status_hostname_helper() {
        let status = LoadBalancerStatus::hostname("abc.elb.amazonaws.com");
        assert_eq!(status.ingress.len(), 1);
        assert_eq!(
            status.ingress[0].hostname.as_deref(),
            Some("abc.elb.amazonaws.com")
        );
        assert!(status.ingress[0].ip.is_none());
    }
}
