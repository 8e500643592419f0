//! AWS cloud provider integration for the nimbus orchestrator
//!
//! Adapts EC2 instances, EBS volumes, and classic ELB load balancers to the
//! capability surface in [`nimbus_cloud`]. The integration is layered: a
//! narrow [`services`] facade hides the vendor SDK (with an SDK-backed
//! implementation in [`sdk`] and an in-memory double behind the `mock`
//! feature), and the [`provider::AwsCloud`] composition implements the
//! orchestrator-facing traits on top of it.
//!
//! Construct a provider directly with [`provider::AwsCloud::new`], or call
//! [`register`] once at startup and let the orchestrator build it from the
//! provider registry under the name `"aws"`.

use std::sync::Arc;

use nimbus_cloud::provider::CloudProvider;
use nimbus_cloud::registry::{self, ProviderFuture};

pub mod config;
pub mod instances;
pub mod load_balancer;
pub mod metadata;
pub mod provider;
pub mod sdk;
pub mod services;
pub mod volumes;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::CloudConfig;
pub use provider::AwsCloud;

/// The provider identifier this integration registers under
pub const PROVIDER_NAME: &str = "aws";

/// The tag name used to differentiate multiple logically independent
/// clusters running in the same availability zone
pub const CLUSTER_TAG_NAME: &str = "KubernetesCluster";

fn aws_factory(config_document: Option<String>) -> ProviderFuture {
    Box::pin(async move {
        let services = Arc::new(sdk::SdkCloudServices::load().await?);
        let cloud = AwsCloud::new(config_document.as_deref(), services).await?;
        Ok(Arc::new(cloud) as Arc<dyn CloudProvider>)
    })
}

/// Install the AWS provider factory into the process-global registry
pub fn register() {
    registry::register(PROVIDER_NAME, aws_factory);
}
