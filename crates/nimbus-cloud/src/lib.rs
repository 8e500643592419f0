//! Cloud provider capability surface for the nimbus orchestrator
//!
//! A cloud provider adapts one public cloud (instances, block volumes,
//! external load balancers) to the narrow set of capabilities the
//! orchestrator's controllers consume. Integrations implement the traits in
//! [`provider`] and announce themselves through [`registry`]; everything the
//! orchestrator sees crosses this crate's types, never a vendor SDK's.

pub mod error;
pub mod provider;
pub mod registry;
pub mod types;

pub use error::Error;
pub use provider::{CloudProvider, Instances, TcpLoadBalancer, Volumes, Zones};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
