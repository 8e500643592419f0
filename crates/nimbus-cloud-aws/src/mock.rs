//! In-memory double for the cloud services facade
//!
//! Backs the same traits as the SDK implementation with a shared in-memory
//! state so the provider can be driven without credentials or network.
//! Mutating operations are recorded so tests can assert on exactly which
//! remote calls were issued.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use nimbus_cloud::{Error, Result};

use crate::metadata::MetadataResolver;
use crate::services::{
    CloudInstance, CloudServices, CloudVolume, ComputeService, CreateLoadBalancerSpec,
    IngressRule, InstanceFilter, LoadBalancer, LoadBalancingService, SecurityGroup, Subnet,
    VolumeAttachment, Vpc, retain_alive,
};

#[derive(Default)]
struct FakeState {
    instances: Vec<CloudInstance>,
    volumes: HashMap<String, CloudVolume>,
    security_groups: Vec<SecurityGroup>,
    vpcs: Vec<(String, Vpc)>,
    subnets: Vec<(String, Subnet)>,
    load_balancers: HashMap<String, LoadBalancer>,
    metadata: HashMap<String, String>,

    next_volume_seq: u32,
    next_group_seq: u32,

    // Behavior knobs
    fail_attach: bool,
    attach_result_state: Option<String>,
    detach_returns_none: bool,

    // Call records
    attach_requests: Vec<(String, String, String)>,
    create_load_balancer_calls: usize,
    create_security_group_calls: usize,
    authorize_calls: Vec<(String, Vec<IngressRule>)>,
    register_calls: Vec<(String, Vec<String>)>,
    deregister_calls: Vec<(String, Vec<String>)>,
    compute_regions: Vec<String>,
    load_balancing_regions: Vec<String>,
    describe_load_balancer_names: Vec<String>,
}

/// Facade double sharing one mutable state across all derived clients
#[derive(Clone, Default)]
pub struct FakeCloudServices {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCloudServices {
    /// Empty cloud
    pub fn new() -> Self {
        Self::default()
    }

    /// Cloud pre-seeded with a metadata identity for the given self instance
    pub fn with_self_instance(availability_zone: &str, instance: CloudInstance) -> Self {
        let services = Self::new();
        services.set_metadata("instance-id", &instance.instance_id);
        services.set_metadata("placement/availability-zone", availability_zone);
        services.add_instance(instance);
        services
    }

    /// Store a metadata key/value pair
    pub fn set_metadata(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .metadata
            .insert(key.to_string(), value.to_string());
    }

    /// Add an instance to the cloud
    pub fn add_instance(&self, instance: CloudInstance) {
        self.state.lock().unwrap().instances.push(instance);
    }

    /// Add a pre-existing volume bound to the given zone
    pub fn add_volume(&self, volume_id: &str, availability_zone: &str) {
        self.state.lock().unwrap().volumes.insert(
            volume_id.to_string(),
            CloudVolume {
                volume_id: volume_id.to_string(),
                availability_zone: Some(availability_zone.to_string()),
                attachments: Vec::new(),
            },
        );
    }

    /// Add a VPC discoverable under the given `Name` tag
    pub fn add_vpc(&self, name_tag: &str, vpc_id: &str) {
        self.state.lock().unwrap().vpcs.push((
            name_tag.to_string(),
            Vpc {
                vpc_id: vpc_id.to_string(),
            },
        ));
    }

    /// Add a subnet to a VPC
    pub fn add_subnet(&self, vpc_id: &str, subnet_id: &str, availability_zone: &str) {
        self.state.lock().unwrap().subnets.push((
            vpc_id.to_string(),
            Subnet {
                subnet_id: subnet_id.to_string(),
                availability_zone: Some(availability_zone.to_string()),
            },
        ));
    }

    /// Add a pre-existing load balancer
    pub fn add_load_balancer(&self, name: &str, dns_name: &str) {
        self.state.lock().unwrap().load_balancers.insert(
            name.to_string(),
            LoadBalancer {
                name: name.to_string(),
                dns_name: Some(dns_name.to_string()),
                instance_ids: Vec::new(),
            },
        );
    }

    /// Make every attach call fail with a cloud API error
    pub fn fail_attach(&self) {
        self.state.lock().unwrap().fail_attach = true;
    }

    /// Freeze attachments in the given state instead of completing them
    pub fn attach_remains(&self, state: &str) {
        self.state.lock().unwrap().attach_result_state = Some(state.to_string());
    }

    /// Make detach produce no attachment description
    pub fn detach_returns_none(&self) {
        self.state.lock().unwrap().detach_returns_none = true;
    }

    /// Pretend the volume is already attached, without recording a call
    ///
    /// Mirrors remote state that existed before the provider started: the
    /// volume carries an `attached` attachment and the instance's block
    /// device map carries the corresponding entry.
    pub fn attach_existing(&self, volume_id: &str, instance_id: &str, device: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(volume) = state.volumes.get_mut(volume_id) {
            volume.attachments = vec![VolumeAttachment {
                state: Some("attached".to_string()),
                instance_id: Some(instance_id.to_string()),
                device: Some(device.to_string()),
            }];
        }
        if let Some(instance) = state
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
        {
            instance
                .block_device_mappings
                .push(crate::services::BlockDeviceMapping {
                    device_name: device.to_string(),
                    volume_id: volume_id.to_string(),
                });
        }
    }

    /// Number of remote attach calls issued
    pub fn attach_volume_calls(&self) -> usize {
        self.state.lock().unwrap().attach_requests.len()
    }

    /// Recorded attach calls: (volume id, instance id, device)
    pub fn attach_requests(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().attach_requests.clone()
    }

    /// Number of remote create-load-balancer calls issued
    pub fn create_load_balancer_calls(&self) -> usize {
        self.state.lock().unwrap().create_load_balancer_calls
    }

    /// Number of remote create-security-group calls issued
    pub fn create_security_group_calls(&self) -> usize {
        self.state.lock().unwrap().create_security_group_calls
    }

    /// Recorded authorize-ingress calls: (group id, rules)
    pub fn authorize_calls(&self) -> Vec<(String, Vec<IngressRule>)> {
        self.state.lock().unwrap().authorize_calls.clone()
    }

    /// Recorded register calls: (load balancer name, instance ids)
    pub fn register_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().register_calls.clone()
    }

    /// Recorded deregister calls: (load balancer name, instance ids)
    pub fn deregister_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().deregister_calls.clone()
    }

    /// Regions compute clients were requested for
    pub fn compute_regions(&self) -> Vec<String> {
        self.state.lock().unwrap().compute_regions.clone()
    }

    /// Regions load-balancing clients were requested for
    pub fn load_balancing_regions(&self) -> Vec<String> {
        self.state.lock().unwrap().load_balancing_regions.clone()
    }

    /// Names passed to describe-load-balancer
    pub fn describe_load_balancer_names(&self) -> Vec<String> {
        self.state.lock().unwrap().describe_load_balancer_names.clone()
    }

    /// Current ingress permissions of a security group
    pub fn security_group_rules(&self, group_id: &str) -> Vec<IngressRule> {
        self.state
            .lock()
            .unwrap()
            .security_groups
            .iter()
            .find(|g| g.group_id == group_id)
            .map(|g| g.ingress_rules.clone())
            .unwrap_or_default()
    }

    /// Security group id registered under the given name, if any
    pub fn security_group_id_by_name(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .security_groups
            .iter()
            .find(|g| g.group_name.as_deref() == Some(name))
            .map(|g| g.group_id.clone())
    }

    /// Instance ids currently registered with a load balancer
    pub fn registered_instances(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .load_balancers
            .get(name)
            .map(|lb| lb.instance_ids.clone())
            .unwrap_or_default()
    }
}

impl CloudServices for FakeCloudServices {
    fn compute(&self, region: &str) -> Result<Arc<dyn ComputeService>> {
        self.state
            .lock()
            .unwrap()
            .compute_regions
            .push(region.to_string());
        Ok(Arc::new(FakeCompute {
            state: Arc::clone(&self.state),
        }))
    }

    fn load_balancing(&self, region: &str) -> Result<Arc<dyn LoadBalancingService>> {
        self.state
            .lock()
            .unwrap()
            .load_balancing_regions
            .push(region.to_string());
        Ok(Arc::new(FakeLoadBalancing {
            state: Arc::clone(&self.state),
        }))
    }

    fn metadata(&self) -> Arc<dyn MetadataResolver> {
        Arc::new(FakeMetadata {
            state: Arc::clone(&self.state),
        })
    }
}

struct FakeMetadata {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl MetadataResolver for FakeMetadata {
    async fn get(&self, key: &str) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .metadata
            .get(key)
            .cloned()
            .ok_or_else(|| Error::metadata(key, "no such metadata key"))
    }
}

struct FakeCompute {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl ComputeService for FakeCompute {
    async fn instances(
        &self,
        instance_ids: &[String],
        filter: Option<&InstanceFilter>,
    ) -> Result<Vec<CloudInstance>> {
        let state = self.state.lock().unwrap();
        let selected = state
            .instances
            .iter()
            .filter(|instance| {
                instance_ids.is_empty() || instance_ids.contains(&instance.instance_id)
            })
            .filter(|instance| match filter.and_then(|f| f.private_dns_name.as_deref()) {
                Some(dns_name) => instance.private_dns_name.as_deref() == Some(dns_name),
                None => true,
            })
            .cloned()
            .collect();
        Ok(retain_alive(selected))
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment> {
        let mut state = self.state.lock().unwrap();
        state.attach_requests.push((
            volume_id.to_string(),
            instance_id.to_string(),
            device.to_string(),
        ));

        if state.fail_attach {
            return Err(Error::api("attach volume", "injected attach failure"));
        }

        let result_state = state
            .attach_result_state
            .clone()
            .unwrap_or_else(|| "attached".to_string());
        let attachment = VolumeAttachment {
            state: Some(result_state),
            instance_id: Some(instance_id.to_string()),
            device: Some(device.to_string()),
        };

        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::api("attach volume", format!("no such volume: {volume_id}")))?;
        volume.attachments = vec![attachment.clone()];
        Ok(attachment)
    }

    async fn detach_volume(
        &self,
        volume_id: &str,
        _instance_id: &str,
    ) -> Result<Option<VolumeAttachment>> {
        let mut state = self.state.lock().unwrap();
        if state.detach_returns_none {
            return Ok(None);
        }
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::api("detach volume", format!("no such volume: {volume_id}")))?;
        let previous = volume.attachments.first().cloned();
        volume.attachments = Vec::new();
        Ok(Some(VolumeAttachment {
            state: Some("detaching".to_string()),
            ..previous.unwrap_or_default()
        }))
    }

    async fn volumes(&self, volume_ids: &[String]) -> Result<Vec<CloudVolume>> {
        let state = self.state.lock().unwrap();
        if volume_ids.is_empty() {
            return Ok(state.volumes.values().cloned().collect());
        }
        volume_ids
            .iter()
            .map(|id| {
                state
                    .volumes
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::api("describe volumes", format!("no such volume: {id}")))
            })
            .collect()
    }

    async fn create_volume(&self, availability_zone: &str, size_gb: i64) -> Result<CloudVolume> {
        let mut state = self.state.lock().unwrap();
        state.next_volume_seq += 1;
        let _ = size_gb;
        let volume = CloudVolume {
            volume_id: format!("vol-{:08x}", state.next_volume_seq),
            availability_zone: Some(availability_zone.to_string()),
            attachments: Vec::new(),
        };
        state
            .volumes
            .insert(volume.volume_id.clone(), volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .volumes
            .remove(volume_id)
            .map(|_| ())
            .ok_or_else(|| Error::api("delete volume", format!("no such volume: {volume_id}")))
    }

    async fn security_groups(
        &self,
        group_ids: &[String],
        filter_name: Option<&str>,
        filter_vpc_id: Option<&str>,
    ) -> Result<Vec<SecurityGroup>> {
        // The fake keeps all groups in one VPC; the VPC filter only scopes
        // the name lookup the way the real API does.
        let _ = filter_vpc_id;
        let state = self.state.lock().unwrap();
        Ok(state
            .security_groups
            .iter()
            .filter(|group| group_ids.is_empty() || group_ids.contains(&group.group_id))
            .filter(|group| match filter_name {
                Some(name) => group.group_name.as_deref() == Some(name),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn create_security_group(
        &self,
        _vpc_id: &str,
        name: &str,
        _description: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.create_security_group_calls += 1;
        state.next_group_seq += 1;
        let group_id = format!("sg-{:08x}", state.next_group_seq);
        state.security_groups.push(SecurityGroup {
            group_id: group_id.clone(),
            group_name: Some(name.to_string()),
            ingress_rules: Vec::new(),
        });
        Ok(group_id)
    }

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        rules: &[IngressRule],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .authorize_calls
            .push((group_id.to_string(), rules.to_vec()));
        let group = state
            .security_groups
            .iter_mut()
            .find(|g| g.group_id == group_id)
            .ok_or_else(|| {
                Error::api("authorize ingress", format!("no such security group: {group_id}"))
            })?;
        group.ingress_rules.extend(rules.iter().cloned());
        Ok(())
    }

    async fn vpcs_by_name_tag(&self, name: &str) -> Result<Vec<Vpc>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .vpcs
            .iter()
            .filter(|(tag, _)| tag == name)
            .map(|(_, vpc)| vpc.clone())
            .collect())
    }

    async fn subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .subnets
            .iter()
            .filter(|(owner, _)| owner == vpc_id)
            .map(|(_, subnet)| subnet.clone())
            .collect())
    }
}

struct FakeLoadBalancing {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl LoadBalancingService for FakeLoadBalancing {
    async fn create_load_balancer(&self, spec: &CreateLoadBalancerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.create_load_balancer_calls += 1;
        let dns_name = format!("{}.elb.amazonaws.com", spec.name);
        state.load_balancers.insert(
            spec.name.clone(),
            LoadBalancer {
                name: spec.name.clone(),
                dns_name: Some(dns_name.clone()),
                instance_ids: Vec::new(),
            },
        );
        Ok(dns_name)
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .load_balancers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::api("delete load balancer", format!("no such load balancer: {name}")))
    }

    async fn describe_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>> {
        let mut state = self.state.lock().unwrap();
        state.describe_load_balancer_names.push(name.to_string());
        Ok(state.load_balancers.get(name).cloned())
    }

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .register_calls
            .push((name.to_string(), instance_ids.to_vec()));
        let balancer = state.load_balancers.get_mut(name).ok_or_else(|| {
            Error::api("register instances", format!("no such load balancer: {name}"))
        })?;
        for id in instance_ids {
            if !balancer.instance_ids.contains(id) {
                balancer.instance_ids.push(id.clone());
            }
        }
        Ok(())
    }

    async fn deregister_instances(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .deregister_calls
            .push((name.to_string(), instance_ids.to_vec()));
        let balancer = state.load_balancers.get_mut(name).ok_or_else(|| {
            Error::api("deregister instances", format!("no such load balancer: {name}"))
        })?;
        balancer
            .instance_ids
            .retain(|id| !instance_ids.contains(id));
        Ok(())
    }
}

/// A running instance with the given id, DNS name, and zone
///
/// Convenience for tests; fields not covered by the arguments are empty.
pub fn running_instance(instance_id: &str, private_dns_name: &str, zone: &str) -> CloudInstance {
    CloudInstance {
        instance_id: instance_id.to_string(),
        private_dns_name: Some(private_dns_name.to_string()),
        availability_zone: Some(zone.to_string()),
        state: Some("running".to_string()),
        tags: BTreeMap::new(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instances_filter_by_dns_name_and_liveness() {
        let services = FakeCloudServices::new();
        services.add_instance(running_instance("i-1", "node-a.internal", "us-east-1a"));
        let mut stopped = running_instance("i-2", "node-b.internal", "us-east-1a");
        stopped.state = Some("stopped".to_string());
        services.add_instance(stopped);

        let compute = services.compute("us-east-1").unwrap();
        let all = compute.instances(&[], None).await.unwrap();
        assert_eq!(all.len(), 1);

        let filter = InstanceFilter::by_private_dns_name("node-a.internal");
        let found = compute.instances(&[], Some(&filter)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_id, "i-1");
    }

    #[tokio::test]
    async fn attach_updates_volume_state_and_counts() {
        let services = FakeCloudServices::new();
        services.add_volume("vol-aaa", "us-east-1a");

        let compute = services.compute("us-east-1").unwrap();
        compute
            .attach_volume("vol-aaa", "i-1", "/dev/sdf")
            .await
            .unwrap();

        assert_eq!(services.attach_volume_calls(), 1);
        let volumes = compute.volumes(&["vol-aaa".to_string()]).await.unwrap();
        assert_eq!(volumes[0].attachments.len(), 1);
        assert_eq!(volumes[0].attachments[0].state.as_deref(), Some("attached"));
    }

    #[tokio::test]
    async fn load_balancer_lifecycle_round_trip() {
        let services = FakeCloudServices::new();
        let elb = services.load_balancing("us-east-1").unwrap();

        assert!(elb.describe_load_balancer("svc-a").await.unwrap().is_none());

        let dns = elb
            .create_load_balancer(&CreateLoadBalancerSpec {
                name: "svc-a".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(dns, "svc-a.elb.amazonaws.com");

        elb.register_instances("svc-a", &["i-1".to_string()])
            .await
            .unwrap();
        assert_eq!(services.registered_instances("svc-a"), vec!["i-1"]);

        elb.delete_load_balancer("svc-a").await.unwrap();
        assert!(elb.describe_load_balancer("svc-a").await.unwrap().is_none());
    }
}
