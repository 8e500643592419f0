//! The AWS cloud provider composition
//!
//! `AwsCloud` owns the config, the facade handles, and the provider-level
//! mutable state: the region → load-balancing-client map and the registry
//! of per-instance handles (including the lazily resolved "self" instance).
//! The capability trait implementations live next to their subject matter
//! (`instances`, `volumes`, `load_balancer`); this module wires them
//! together.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use nimbus_cloud::provider::{
    CloudProvider, Instances, TcpLoadBalancer, Volumes, Zones,
};
use nimbus_cloud::types::Zone;
use nimbus_cloud::Result;

use crate::config::{region_for_zone, CloudConfig};
use crate::instances::find_instance_by_dns_name;
use crate::metadata::{MetadataResolver, INSTANCE_ID_KEY};
use crate::services::{CloudServices, ComputeService, LoadBalancingService};
use crate::volumes::{InstanceHandle, PollPolicy};
use crate::{CLUSTER_TAG_NAME, PROVIDER_NAME};

#[derive(Default)]
struct ProviderState {
    /// Load-balancing clients by region, created on first use
    lb_clients: HashMap<String, Arc<dyn LoadBalancingService>>,
    /// Per-instance handles keyed by cloud instance id; entries are never
    /// evicted for the lifetime of the process because they carry the
    /// device-mapping cache
    instances: HashMap<String, Arc<InstanceHandle>>,
    /// Cloud instance id of the instance this process runs on, resolved
    /// from the metadata service on first use
    self_instance_id: Option<String>,
}

/// AWS implementation of the orchestrator's cloud capabilities
pub struct AwsCloud {
    pub(crate) services: Arc<dyn CloudServices>,
    pub(crate) compute: Arc<dyn ComputeService>,
    pub(crate) availability_zone: String,
    pub(crate) region: String,
    pub(crate) volume_poll: PollPolicy,

    config: CloudConfig,
    filter_tags: BTreeMap<String, String>,
    state: Mutex<ProviderState>,
}

impl AwsCloud {
    /// Build a provider from an optional config document and a cloud
    /// services facade
    ///
    /// Reads the config (querying the metadata service for the zone when
    /// absent), derives and validates the region, and resolves the cluster
    /// tag filter, copying the self instance's `KubernetesCluster` tag when
    /// the config does not carry one.
    pub async fn new(
        config_document: Option<&str>,
        services: Arc<dyn CloudServices>,
    ) -> Result<Self> {
        let metadata = services.metadata();
        let config = CloudConfig::load(config_document, metadata.as_ref()).await?;

        let availability_zone = config.zone.clone();
        let region = region_for_zone(&availability_zone)?;
        let compute = services.compute(&region)?;

        let cloud = Self {
            services,
            compute,
            availability_zone,
            region,
            volume_poll: PollPolicy::default(),
            config,
            filter_tags: BTreeMap::new(),
            state: Mutex::new(ProviderState::default()),
        };

        let mut filter_tags = BTreeMap::new();
        match &cloud.config.cluster_tag {
            Some(tag) => {
                filter_tags.insert(CLUSTER_TAG_NAME.to_string(), tag.clone());
            }
            None => {
                let self_handle = cloud.self_instance().await?;
                let info = self_handle.describe().await?;
                if let Some(tag) = info.tags.get(CLUSTER_TAG_NAME) {
                    filter_tags.insert(CLUSTER_TAG_NAME.to_string(), tag.clone());
                }
            }
        }

        if filter_tags.is_empty() {
            info!("AWS cloud - no cluster tag filtering");
        } else {
            info!(tags = ?filter_tags, "AWS cloud filtering on tags");
        }

        Ok(Self {
            filter_tags,
            ..cloud
        })
    }

    /// Tags scoping this provider's resources to one logical cluster
    pub fn filter_tags(&self) -> &BTreeMap<String, String> {
        &self.filter_tags
    }

    /// Load-balancing client for the given region, created on first use
    pub(crate) async fn elb_client(&self, region: &str) -> Result<Arc<dyn LoadBalancingService>> {
        let mut state = self.state.lock().await;
        if let Some(client) = state.lb_clients.get(region) {
            return Ok(Arc::clone(client));
        }
        let client = self.services.load_balancing(region)?;
        state
            .lb_clients
            .insert(region.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Handle for the given instance id, created on first use and kept for
    /// the lifetime of the process
    pub(crate) async fn instance_handle(&self, instance_id: &str) -> Arc<InstanceHandle> {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.instances.get(instance_id) {
            return Arc::clone(handle);
        }
        let handle = Arc::new(InstanceHandle::new(instance_id, Arc::clone(&self.compute)));
        state
            .instances
            .insert(instance_id.to_string(), Arc::clone(&handle));
        handle
    }

    /// Handle for the instance this process runs on
    pub(crate) async fn self_instance(&self) -> Result<Arc<InstanceHandle>> {
        let instance_id = {
            let mut state = self.state.lock().await;
            match &state.self_instance_id {
                Some(id) => id.clone(),
                None => {
                    let id = self.services.metadata().get(INSTANCE_ID_KEY).await?;
                    state.self_instance_id = Some(id.clone());
                    id
                }
            }
        };
        Ok(self.instance_handle(&instance_id).await)
    }

    /// Handle for the named instance; the empty name means "self"
    pub(crate) async fn instance_for_name(
        &self,
        instance_name: &str,
    ) -> Result<Arc<InstanceHandle>> {
        if instance_name.is_empty() {
            return self.self_instance().await;
        }
        let instance = find_instance_by_dns_name(self.compute.as_ref(), instance_name).await?;
        Ok(self.instance_handle(&instance.instance_id).await)
    }
}

impl CloudProvider for AwsCloud {
    fn provider_name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn instances(&self) -> Option<&dyn Instances> {
        Some(self)
    }

    fn zones(&self) -> Option<&dyn Zones> {
        Some(self)
    }

    fn tcp_load_balancer(&self) -> Option<&dyn TcpLoadBalancer> {
        Some(self)
    }

    fn volumes(&self) -> Option<&dyn Volumes> {
        Some(self)
    }
}

impl Zones for AwsCloud {
    fn zone(&self) -> Zone {
        assert!(!self.availability_zone.is_empty(), "availability zone not set");
        Zone {
            failure_domain: self.availability_zone.clone(),
            region: self.region.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{running_instance, FakeCloudServices};

    const CONFIG_WITH_TAG: &str = "[Global]\nZone = us-east-1a\nKubernetesClusterTag = test\n";

    async fn cloud_with(services: &FakeCloudServices) -> AwsCloud {
        AwsCloud::new(Some(CONFIG_WITH_TAG), Arc::new(services.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn provider_name_is_aws() {
        let services = FakeCloudServices::new();
        let cloud = cloud_with(&services).await;
        assert_eq!(cloud.provider_name(), "aws");
        assert!(cloud.instances().is_some());
        assert!(cloud.zones().is_some());
        assert!(cloud.tcp_load_balancer().is_some());
        assert!(cloud.volumes().is_some());
    }

    #[tokio::test]
    async fn zone_reports_failure_domain_and_region() {
        let services = FakeCloudServices::new();
        let cloud = cloud_with(&services).await;
        let zone = cloud.zone();
        assert_eq!(zone.failure_domain, "us-east-1a");
        assert_eq!(zone.region, "us-east-1");
    }

    #[tokio::test]
    async fn cluster_tag_from_config_wins() {
        let services = FakeCloudServices::new();
        let cloud = cloud_with(&services).await;
        assert_eq!(
            cloud.filter_tags().get(CLUSTER_TAG_NAME).map(String::as_str),
            Some("test")
        );
    }

    #[tokio::test]
    async fn cluster_tag_copied_from_self_instance_when_config_omits_it() {
        let mut instance = running_instance("i-self", "ip-10-0-0-1.ec2.internal", "us-east-1a");
        instance
            .tags
            .insert(CLUSTER_TAG_NAME.to_string(), "prod".to_string());
        let services = FakeCloudServices::with_self_instance("us-east-1a", instance);

        let cloud = AwsCloud::new(
            Some("[Global]\nZone = us-east-1a\n"),
            Arc::new(services.clone()),
        )
        .await
        .unwrap();

        assert_eq!(
            cloud.filter_tags().get(CLUSTER_TAG_NAME).map(String::as_str),
            Some("prod")
        );
    }

    #[tokio::test]
    async fn untagged_self_instance_leaves_filter_empty() {
        let instance = running_instance("i-self", "ip-10-0-0-1.ec2.internal", "us-east-1a");
        let services = FakeCloudServices::with_self_instance("us-east-1a", instance);

        let cloud = AwsCloud::new(
            Some("[Global]\nZone = us-east-1a\n"),
            Arc::new(services.clone()),
        )
        .await
        .unwrap();

        assert!(cloud.filter_tags().is_empty());
    }

    #[tokio::test]
    async fn elb_clients_are_cached_per_region() {
        let services = FakeCloudServices::new();
        let cloud = cloud_with(&services).await;

        cloud.elb_client("us-east-1").await.unwrap();
        cloud.elb_client("us-east-1").await.unwrap();
        cloud.elb_client("us-west-2").await.unwrap();

        assert_eq!(
            services.load_balancing_regions(),
            vec!["us-east-1".to_string(), "us-west-2".to_string()]
        );
    }

    #[tokio::test]
    async fn instance_handles_are_shared_per_id() {
        let services = FakeCloudServices::new();
        let cloud = cloud_with(&services).await;

        let first = cloud.instance_handle("i-abc").await;
        let second = cloud.instance_handle("i-abc").await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn self_instance_is_resolved_once_and_reused() {
        let instance = running_instance("i-self", "ip-10-0-0-1.ec2.internal", "us-east-1a");
        let services = FakeCloudServices::with_self_instance("us-east-1a", instance);
        let cloud = cloud_with(&services).await;

        let first = cloud.self_instance().await.unwrap();
        let second = cloud.self_instance().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.instance_id, "i-self");
    }
}
