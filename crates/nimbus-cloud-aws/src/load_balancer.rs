//! TCP load balancer lifecycle
//!
//! All operations are idempotent and scoped to `(region, name)`. Creation
//! is a multi-step mutation (find VPC → ensure security group → authorize
//! ingress → create → register backends) that tolerates pre-existing
//! partial state: an existing load balancer with the same name is adopted
//! rather than recreated.

use async_trait::async_trait;
use std::net::IpAddr;
use tracing::{debug, error, info, warn};

use nimbus_cloud::provider::TcpLoadBalancer;
use nimbus_cloud::types::{LoadBalancerStatus, ServiceAffinity, ServicePort};
use nimbus_cloud::{Error, Result};

use crate::instances::find_instances_by_dns_names;
use crate::provider::AwsCloud;
use crate::services::{
    ComputeService, CreateLoadBalancerSpec, IngressRule, Listener, LoadBalancer,
    LoadBalancingService,
};

/// `Name` tag identifying the cluster's VPC
const VPC_NAME_TAG: &str = "kubernetes-vpc";

/// Name prefix of the security groups owned by load balancers
const SECURITY_GROUP_PREFIX: &str = "k8s-elb-";

/// Source admitted by load balancer security groups
const OPEN_CIDR: &str = "0.0.0.0/0";

impl AwsCloud {
    /// Find the cluster VPC by its `Name` tag
    async fn find_cluster_vpc(&self) -> Result<crate::services::Vpc> {
        let mut vpcs = self.compute.vpcs_by_name_tag(VPC_NAME_TAG).await?;
        match vpcs.len() {
            0 => Err(Error::not_found("VPC", VPC_NAME_TAG)),
            1 => Ok(vpcs.remove(0)),
            _ => Err(Error::ambiguous("VPC", VPC_NAME_TAG)),
        }
    }

    /// Subnet ids of the VPC, verifying every subnet's zone is in-region
    async fn region_subnet_ids(&self, vpc_id: &str, region: &str) -> Result<Vec<String>> {
        let subnets = self.compute.subnets(vpc_id).await?;
        let mut subnet_ids = Vec::with_capacity(subnets.len());
        for subnet in subnets {
            let zone = subnet.availability_zone.unwrap_or_default();
            if !zone.starts_with(region) {
                error!(
                    subnet_id = %subnet.subnet_id,
                    zone = %zone,
                    region = %region,
                    "Subnet availability zone does not match region"
                );
                return Err(Error::config(format!(
                    "subnet {} is in zone {zone}, outside region {region}",
                    subnet.subnet_id
                )));
            }
            subnet_ids.push(subnet.subnet_id);
        }
        Ok(subnet_ids)
    }

    /// Ensure the `k8s-elb-<name>` security group exists in the VPC
    async fn ensure_load_balancer_security_group(
        &self,
        vpc_id: &str,
        lb_name: &str,
    ) -> Result<String> {
        let group_name = format!("{SECURITY_GROUP_PREFIX}{lb_name}");
        let groups = self
            .compute
            .security_groups(&[], Some(&group_name), Some(vpc_id))
            .await?;

        match groups.len() {
            0 => {
                let description = format!("Security group for Kubernetes ELB {lb_name}");
                let group_id = self
                    .compute
                    .create_security_group(vpc_id, &group_name, &description)
                    .await?;
                info!(group_id = %group_id, group_name = %group_name, "Created security group");
                Ok(group_id)
            }
            1 => Ok(groups[0].group_id.clone()),
            _ => Err(Error::ambiguous("security group", group_name)),
        }
    }

    /// Make sure the security group admits ingress on every port
    ///
    /// Existing permissions are compared as whole
    /// `(from_port, to_port, protocol, single-CIDR source)` tuples; missing
    /// ones are added in a single authorize call. Returns whether anything
    /// was added.
    pub(crate) async fn ensure_security_group_ingress(
        &self,
        group_id: &str,
        source_cidr: &str,
        ports: &[ServicePort],
    ) -> Result<bool> {
        let groups = self.compute.security_groups(&[group_id.to_string()], None, None).await?;
        if groups.is_empty() {
            return Err(Error::not_found("security group", group_id));
        }
        if groups.len() != 1 {
            // Ids are unique; this indicates a confused response.
            return Err(Error::ambiguous("security group", group_id));
        }
        let group = &groups[0];

        let mut new_rules = Vec::new();
        for port in ports {
            let protocol = port.protocol.lowercase();
            let found = group.ingress_rules.iter().any(|rule| {
                rule.from_port == Some(port.port)
                    && rule.to_port == Some(port.port)
                    && rule.ip_protocol.as_deref() == Some(protocol)
                    && rule.ip_ranges.len() == 1
                    && rule.ip_ranges[0] == source_cidr
            });
            if !found {
                new_rules.push(IngressRule::single(protocol, port.port, source_cidr));
            }
        }

        if new_rules.is_empty() {
            return Ok(false);
        }

        debug!(group_id = %group_id, rules = new_rules.len(), "Authorizing security group ingress");
        self.compute
            .authorize_security_group_ingress(group_id, &new_rules)
            .await?;
        Ok(true)
    }
}

/// Build the listener set from service ports
///
/// Ports without an allocated node port cannot be forwarded and are skipped
/// with a warning.
fn build_listeners(ports: &[ServicePort]) -> Vec<Listener> {
    let mut listeners = Vec::with_capacity(ports.len());
    for port in ports {
        if port.node_port == 0 {
            warn!(port = port.port, "Ignoring port without a node port");
            continue;
        }
        listeners.push(Listener {
            load_balancer_port: port.port,
            instance_port: port.node_port,
            protocol: port.protocol.lowercase().to_string(),
        });
    }
    listeners
}

fn status_for(balancer: &LoadBalancer) -> LoadBalancerStatus {
    match &balancer.dns_name {
        Some(dns_name) => LoadBalancerStatus::hostname(dns_name),
        None => LoadBalancerStatus::default(),
    }
}

#[async_trait]
impl TcpLoadBalancer for AwsCloud {
    async fn create(
        &self,
        region: &str,
        name: &str,
        public_ip: Option<IpAddr>,
        ports: &[ServicePort],
        hosts: &[String],
        affinity: ServiceAffinity,
    ) -> Result<LoadBalancerStatus> {
        debug!(name = %name, region = %region, hosts = hosts.len(), "Ensuring load balancer");

        let elb = self.elb_client(region).await?;

        if affinity != ServiceAffinity::None {
            // The cloud supports sticky sessions, but only for HTTP/HTTPS
            // listeners.
            return Err(Error::UnsupportedAffinity {
                affinity: affinity.to_string(),
            });
        }
        if public_ip.is_some() {
            return Err(Error::PublicIpNotSupported);
        }

        let instances = find_instances_by_dns_names(self.compute.as_ref(), hosts).await?;

        let vpc = self.find_cluster_vpc().await?;
        let subnet_ids = self.region_subnet_ids(&vpc.vpc_id, region).await?;

        let dns_name = match elb.describe_load_balancer(name).await? {
            Some(existing) => {
                // Adopt without reconfiguring.
                // TODO: verify the adopted listeners, subnets, and security
                // groups against the requested spec and reconcile drift.
                existing.dns_name.ok_or_else(|| {
                    Error::protocol(format!("load balancer {name} has no DNS name"))
                })?
            }
            None => {
                let listeners = build_listeners(ports);
                let group_id = self
                    .ensure_load_balancer_security_group(&vpc.vpc_id, name)
                    .await?;
                self.ensure_security_group_ingress(&group_id, OPEN_CIDR, ports)
                    .await?;

                info!(name = %name, "Creating load balancer");
                elb.create_load_balancer(&CreateLoadBalancerSpec {
                    name: name.to_string(),
                    listeners,
                    subnet_ids,
                    security_group_ids: vec![group_id],
                })
                .await?
            }
        };

        let instance_ids: Vec<String> = instances
            .iter()
            .map(|instance| instance.instance_id.clone())
            .collect();
        if let Err(err) = elb.register_instances(name, &instance_ids).await {
            // Not fatal: the next reconciliation pass will converge the
            // backend set.
            warn!(name = %name, error = %err, "Failed to register instances with load balancer");
        } else {
            info!(name = %name, instances = instance_ids.len(), "Registered instances with load balancer");
        }

        info!(name = %name, dns_name = %dns_name, "Load balancer ready");
        Ok(LoadBalancerStatus::hostname(dns_name))
    }

    async fn get(&self, region: &str, name: &str) -> Result<Option<LoadBalancerStatus>> {
        let elb = self.elb_client(region).await?;
        Ok(elb
            .describe_load_balancer(name)
            .await?
            .map(|balancer| status_for(&balancer)))
    }

    async fn exists(&self, region: &str, name: &str) -> Result<bool> {
        let elb = self.elb_client(region).await?;
        Ok(elb.describe_load_balancer(name).await?.is_some())
    }

    async fn update(&self, region: &str, name: &str, hosts: &[String]) -> Result<()> {
        let instances = find_instances_by_dns_names(self.compute.as_ref(), hosts).await?;

        let elb = self.elb_client(region).await?;
        let balancer = elb
            .describe_load_balancer(name)
            .await?
            .ok_or_else(|| Error::not_found("load balancer", name))?;

        let wanted: Vec<String> = instances
            .iter()
            .map(|instance| instance.instance_id.clone())
            .collect();

        let additions: Vec<String> = wanted
            .iter()
            .filter(|id| !balancer.instance_ids.contains(id))
            .cloned()
            .collect();
        let removals: Vec<String> = balancer
            .instance_ids
            .iter()
            .filter(|id| !wanted.contains(id))
            .cloned()
            .collect();

        if !additions.is_empty() {
            elb.register_instances(name, &additions).await?;
        }
        if !removals.is_empty() {
            elb.deregister_instances(name, &removals).await?;
        }

        debug!(
            name = %name,
            added = additions.len(),
            removed = removals.len(),
            "Reconciled load balancer backends"
        );
        Ok(())
    }

    async fn ensure_deleted(&self, region: &str, name: &str) -> Result<()> {
        // TODO: delete the load balancer's k8s-elb security group as well;
        // today it is left behind.
        let elb = self.elb_client(region).await?;

        match elb.describe_load_balancer(name).await? {
            None => {
                info!(name = %name, "Load balancer already deleted");
                Ok(())
            }
            Some(balancer) => {
                elb.delete_load_balancer(&balancer.name).await?;
                info!(name = %name, "Deleted load balancer");
                Ok(())
            }
        }
    }
}
