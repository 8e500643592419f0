//! Block volume lifecycle
//!
//! Volumes cross the provider boundary as canonical `aws://<az>/<vol-id>`
//! names. Device letters are assigned from a fixed per-instance range under
//! the instance's own lock; the local device map is an over-approximation
//! of remote state: it may hold a reservation before the remote attach
//! completes, and the reservation is released if the attach ultimately
//! fails.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use nimbus_cloud::provider::Volumes;
use nimbus_cloud::types::VolumeOptions;
use nimbus_cloud::{Error, Result};

use crate::provider::AwsCloud;
use crate::services::{CloudInstance, CloudVolume, ComputeService};

/// Device names available for volume attachments, in assignment order
///
/// The range matches the cloud's recommended device letters for secondary
/// block devices.
pub const DEVICE_NAMES: [&str; 11] = [
    "/dev/sdf", "/dev/sdg", "/dev/sdh", "/dev/sdi", "/dev/sdj", "/dev/sdk", "/dev/sdl",
    "/dev/sdm", "/dev/sdn", "/dev/sdo", "/dev/sdp",
];

/// Attachment state reported by the cloud when a volume is fully attached
const STATE_ATTACHED: &str = "attached";

/// Attachment state reported (or assumed) when a volume has no attachment
const STATE_DETACHED: &str = "detached";

/// Polling budget for the attach/detach state watchers
#[derive(Clone, Copy, Debug)]
pub(crate) struct PollPolicy {
    pub(crate) attempts: u32,
    pub(crate) interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

/// Canonical volume name, `aws://<availability-zone>/<volume-id>`
///
/// The only volume identifier that crosses the provider boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeName {
    /// Availability zone the volume is bound to
    pub availability_zone: String,
    /// Cloud-side volume id (`vol-…`)
    pub volume_id: String,
}

impl VolumeName {
    /// Parse a canonical volume name
    pub fn parse(name: &str) -> Result<Self> {
        let parsed = url::Url::parse(name)
            .map_err(|e| Error::config(format!("invalid volume name ({name}): {e}")))?;
        if parsed.scheme() != "aws" {
            return Err(Error::config(format!(
                "invalid scheme for volume name ({name})"
            )));
        }

        let availability_zone = parsed.host_str().unwrap_or_default();
        if availability_zone.is_empty() {
            return Err(Error::config(format!(
                "volume name has no availability zone ({name})"
            )));
        }

        let path = parsed.path();
        let volume_id = path.strip_prefix('/').unwrap_or(path);
        if volume_id.contains('/') || !volume_id.starts_with("vol-") {
            return Err(Error::config(format!(
                "invalid volume id in volume name ({name})"
            )));
        }

        Ok(Self {
            availability_zone: availability_zone.to_string(),
            volume_id: volume_id.to_string(),
        })
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aws://{}/{}", self.availability_zone, self.volume_id)
    }
}

/// Result of a device assignment
pub(crate) struct DeviceAssignment {
    /// The assigned device name (e.g. `/dev/sdf`)
    pub(crate) device: String,
    /// True when the volume already held an assignment; the caller must
    /// not submit a remote attach in that case
    pub(crate) already_attached: bool,
}

/// Per-instance registry entry carrying the device-mapping cache
///
/// The cache exists because a second attach request can arrive before the
/// first remote attach is visible in the instance description; without it
/// both would pick the same device letter.
pub struct InstanceHandle {
    /// Cloud-side instance id
    pub instance_id: String,
    compute: Arc<dyn ComputeService>,
    /// device name → volume id; `None` until populated from the instance
    /// description on first use
    device_mappings: Mutex<Option<HashMap<String, String>>>,
}

impl InstanceHandle {
    pub(crate) fn new(instance_id: &str, compute: Arc<dyn ComputeService>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            compute,
            device_mappings: Mutex::new(None),
        }
    }

    /// Fetch the full instance description from the cloud
    pub(crate) async fn describe(&self) -> Result<CloudInstance> {
        let ids = [self.instance_id.clone()];
        let mut instances = self.compute.instances(&ids, None).await?;
        match instances.len() {
            0 => Err(Error::not_found("instance", &self.instance_id)),
            1 => Ok(instances.remove(0)),
            _ => Err(Error::ambiguous("instance", &self.instance_id)),
        }
    }

    /// Assign an unused device name for the volume
    ///
    /// Populates the device map from the instance description on first use,
    /// then either returns the volume's existing device
    /// (`already_attached = true`) or reserves the first free name from
    /// [`DEVICE_NAMES`]. The reservation is recorded before any remote
    /// attach is submitted.
    pub(crate) async fn assign_device(&self, volume_id: &str) -> Result<DeviceAssignment> {
        let mut mappings = self.device_mappings.lock().await;
        if mappings.is_none() {
            let info = self.describe().await?;
            let populated: HashMap<String, String> = info
                .block_device_mappings
                .iter()
                .map(|m| (m.device_name.clone(), m.volume_id.clone()))
                .collect();
            *mappings = Some(populated);
        }
        let map = mappings.get_or_insert_with(HashMap::new);

        if let Some((device, _)) = map.iter().find(|(_, mapped)| *mapped == volume_id) {
            warn!(
                instance_id = %self.instance_id,
                volume_id = %volume_id,
                device = %device,
                "Assignment requested for an already-assigned volume"
            );
            return Ok(DeviceAssignment {
                device: device.clone(),
                already_attached: true,
            });
        }

        let Some(device) = DEVICE_NAMES.iter().copied().find(|d| !map.contains_key(*d)) else {
            warn!(
                instance_id = %self.instance_id,
                mappings = map.len(),
                "Could not assign a device name; all in use"
            );
            return Err(Error::NoDeviceAvailable {
                instance_id: self.instance_id.clone(),
            });
        };

        map.insert(device.to_string(), volume_id.to_string());
        debug!(
            instance_id = %self.instance_id,
            device = %device,
            volume_id = %volume_id,
            "Assigned device to volume"
        );
        Ok(DeviceAssignment {
            device: device.to_string(),
            already_attached: false,
        })
    }

    /// Release a reservation made by [`assign_device`]
    ///
    /// The entry is erased only when it still maps to the given volume id;
    /// anything else indicates the caller lost a race and is logged rather
    /// than acted on.
    pub(crate) async fn release_device(&self, volume_id: &str, device: &str) {
        let mut mappings = self.device_mappings.lock().await;
        let Some(map) = mappings.as_mut() else {
            warn!(device = %device, "Release of a device before the map was populated");
            return;
        };
        match map.get(device) {
            None => {
                warn!(device = %device, "Release of a device that was never assigned");
            }
            Some(existing) if existing != volume_id => {
                warn!(
                    device = %device,
                    volume_id = %volume_id,
                    assigned = %existing,
                    "Release of a device assigned to a different volume"
                );
            }
            Some(_) => {
                debug!(device = %device, volume_id = %volume_id, "Released device mapping");
                map.remove(device);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn cached_mappings(&self) -> Option<HashMap<String, String>> {
        self.device_mappings.lock().await.clone()
    }
}

/// Handle on one volume, resolved from its canonical name
struct VolumeHandle {
    compute: Arc<dyn ComputeService>,
    name: VolumeName,
}

impl VolumeHandle {
    fn new(compute: Arc<dyn ComputeService>, name: VolumeName) -> Self {
        Self { compute, name }
    }

    async fn describe(&self) -> Result<CloudVolume> {
        let ids = [self.name.volume_id.clone()];
        let mut volumes = self.compute.volumes(&ids).await?;
        match volumes.len() {
            0 => Err(Error::not_found("volume", &self.name.volume_id)),
            1 => Ok(volumes.remove(0)),
            _ => Err(Error::ambiguous("volume", &self.name.volume_id)),
        }
    }

    /// Poll the volume description until its attachment reaches the
    /// desired state or the budget expires
    async fn wait_for_attachment_state(&self, desired: &str, poll: PollPolicy) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let info = self.describe().await?;

            let mut state: Option<String> = None;
            for attachment in &info.attachments {
                if state.is_some() {
                    warn!(volume_id = %self.name.volume_id, "Found multiple attachments for volume");
                }
                match &attachment.state {
                    Some(s) => state = Some(s.clone()),
                    None => {
                        warn!(volume_id = %self.name.volume_id, "Ignoring attachment with missing state");
                    }
                }
            }
            let state = state.unwrap_or_else(|| STATE_DETACHED.to_string());
            if state == desired {
                return Ok(());
            }

            debug!(
                volume_id = %self.name.volume_id,
                actual = %state,
                desired = %desired,
                "Waiting for volume attachment state"
            );

            attempt += 1;
            if attempt >= poll.attempts {
                warn!(
                    volume_id = %self.name.volume_id,
                    actual = %state,
                    desired = %desired,
                    "Timeout waiting for volume attachment state"
                );
                return Err(Error::timeout(format!(
                    "volume {} to become {desired}",
                    self.name.volume_id
                )));
            }
            tokio::time::sleep(poll.interval).await;
        }
    }
}

/// Translate an attachment device name to its in-guest form
///
/// A device attached as `/dev/sdX` shows up as `/dev/xvdX` inside the
/// guest.
fn guest_device_name(device: &str) -> String {
    match device.strip_prefix("/dev/sd") {
        Some(suffix) => format!("/dev/xvd{suffix}"),
        None => device.to_string(),
    }
}

#[async_trait]
impl Volumes for AwsCloud {
    async fn attach_disk(
        &self,
        instance_name: &str,
        volume_name: &str,
        read_only: bool,
    ) -> Result<String> {
        let name = VolumeName::parse(volume_name)?;

        if read_only {
            return Err(Error::ReadOnlyUnsupported);
        }

        let instance = self.instance_for_name(instance_name).await?;
        let assignment = instance.assign_device(&name.volume_id).await?;
        let volume = VolumeHandle::new(Arc::clone(&self.compute), name.clone());

        let attach_result: Result<()> = async {
            if !assignment.already_attached {
                let response = self
                    .compute
                    .attach_volume(&name.volume_id, &instance.instance_id, &assignment.device)
                    .await?;
                debug!(
                    volume_id = %name.volume_id,
                    instance_id = %instance.instance_id,
                    state = ?response.state,
                    "Attach volume submitted"
                );
            }
            volume
                .wait_for_attachment_state(STATE_ATTACHED, self.volume_poll)
                .await
        }
        .await;

        if let Err(err) = attach_result {
            instance
                .release_device(&name.volume_id, &assignment.device)
                .await;
            return Err(err);
        }

        Ok(guest_device_name(&assignment.device))
    }

    async fn detach_disk(&self, instance_name: &str, volume_name: &str) -> Result<()> {
        let name = VolumeName::parse(volume_name)?;
        let instance = self.instance_for_name(instance_name).await?;

        let response = self
            .compute
            .detach_volume(&name.volume_id, &instance.instance_id)
            .await?;
        if response.is_none() {
            return Err(Error::protocol("no response from detach volume"));
        }

        let volume = VolumeHandle::new(Arc::clone(&self.compute), name);
        volume
            .wait_for_attachment_state(STATE_DETACHED, self.volume_poll)
            .await
    }

    async fn create_volume(&self, options: &VolumeOptions) -> Result<String> {
        // The cloud allocates in whole GB; round the requested size up.
        let size_gb = (options.capacity_mb + 1023) / 1024;
        let volume = self
            .compute
            .create_volume(&self.availability_zone, size_gb)
            .await?;

        let name = VolumeName {
            availability_zone: volume.availability_zone.unwrap_or_default(),
            volume_id: volume.volume_id,
        };
        Ok(name.to_string())
    }

    async fn delete_volume(&self, volume_name: &str) -> Result<()> {
        let name = VolumeName::parse(volume_name)?;
        self.compute.delete_volume(&name.volume_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{running_instance, FakeCloudServices};

    const CONFIG: &str = "[Global]\nZone = us-east-1a\nKubernetesClusterTag = test\n";

    async fn cloud_with(services: &FakeCloudServices) -> AwsCloud {
        let mut cloud = AwsCloud::new(Some(CONFIG), Arc::new(services.clone()))
            .await
            .unwrap();
        // Keep the pollers fast; production uses 60 x 1 s.
        cloud.volume_poll = PollPolicy {
            attempts: 10,
            interval: Duration::from_millis(1),
        };
        cloud
    }

    fn services_with_self_instance() -> FakeCloudServices {
        FakeCloudServices::with_self_instance(
            "us-east-1a",
            running_instance("i-1", "node-a.internal", "us-east-1a"),
        )
    }

    mod volume_names {
        use super::*;

        #[test]
        fn parse_accepts_canonical_names() {
            let name = VolumeName::parse("aws://us-east-1a/vol-abc123").unwrap();
            assert_eq!(name.availability_zone, "us-east-1a");
            assert_eq!(name.volume_id, "vol-abc123");
        }

        #[test]
        fn parse_format_round_trips() {
            for raw in ["aws://us-east-1a/vol-abc123", "aws://eu-west-1b/vol-0"] {
                let name = VolumeName::parse(raw).unwrap();
                assert_eq!(name.to_string(), raw);
            }
        }

        #[test]
        fn parse_rejects_malformed_names() {
            for raw in [
                "gce://us-east-1a/vol-abc",
                "aws:///vol-abc",
                "aws://us-east-1a/disk-abc",
                "aws://us-east-1a//vol-abc",
                "not a url at all",
            ] {
                let err = VolumeName::parse(raw).unwrap_err();
                assert!(matches!(err, Error::Config { .. }), "{raw}");
            }
        }
    }

    mod device_assignment {
        use super::*;

        #[tokio::test]
        async fn first_attach_uses_first_device() {
            let services = services_with_self_instance();
            services.add_volume("vol-aaa", "us-east-1a");
            let cloud = cloud_with(&services).await;

            let device = cloud
                .attach_disk("", "aws://us-east-1a/vol-aaa", false)
                .await
                .unwrap();

            assert_eq!(device, "/dev/xvdf");
            assert_eq!(
                services.attach_requests(),
                vec![(
                    "vol-aaa".to_string(),
                    "i-1".to_string(),
                    "/dev/sdf".to_string()
                )]
            );
        }

        #[tokio::test]
        async fn already_attached_volume_skips_the_remote_call() {
            let services = services_with_self_instance();
            services.add_volume("vol-bbb", "us-east-1a");
            services.attach_existing("vol-bbb", "i-1", "/dev/sdg");
            let cloud = cloud_with(&services).await;

            let device = cloud
                .attach_disk("", "aws://us-east-1a/vol-bbb", false)
                .await
                .unwrap();

            assert_eq!(device, "/dev/xvdg");
            assert_eq!(services.attach_volume_calls(), 0);
        }

        #[tokio::test]
        async fn exhausted_devices_fail_without_touching_the_cache() {
            let services = FakeCloudServices::new();
            let mut instance = running_instance("i-1", "node-a.internal", "us-east-1a");
            for (i, device) in DEVICE_NAMES.iter().enumerate() {
                instance
                    .block_device_mappings
                    .push(crate::services::BlockDeviceMapping {
                        device_name: device.to_string(),
                        volume_id: format!("vol-used-{i}"),
                    });
            }
            services.set_metadata("instance-id", "i-1");
            services.add_instance(instance);
            services.add_volume("vol-new", "us-east-1a");
            let cloud = cloud_with(&services).await;

            let err = cloud
                .attach_disk("", "aws://us-east-1a/vol-new", false)
                .await
                .unwrap_err();

            assert!(matches!(err, Error::NoDeviceAvailable { .. }));
            assert_eq!(services.attach_volume_calls(), 0);

            let handle = cloud.instance_handle("i-1").await;
            let cached = handle.cached_mappings().await.unwrap();
            assert_eq!(cached.len(), DEVICE_NAMES.len());
            assert!(!cached.values().any(|v| v == "vol-new"));
        }

        #[tokio::test]
        async fn concurrent_attaches_get_distinct_devices() {
            let services = services_with_self_instance();
            services.add_volume("vol-one", "us-east-1a");
            services.add_volume("vol-two", "us-east-1a");
            let cloud = Arc::new(cloud_with(&services).await);

            let (first, second) = tokio::join!(
                cloud.attach_disk("", "aws://us-east-1a/vol-one", false),
                cloud.attach_disk("", "aws://us-east-1a/vol-two", false),
            );

            let first = first.unwrap();
            let second = second.unwrap();
            assert_ne!(first, second);
            assert!(first.starts_with("/dev/xvd"));
            assert!(second.starts_with("/dev/xvd"));
        }

        #[tokio::test]
        async fn concurrent_attaches_of_one_volume_submit_once() {
            let services = services_with_self_instance();
            services.add_volume("vol-aaa", "us-east-1a");
            let cloud = Arc::new(cloud_with(&services).await);

            let (first, second) = tokio::join!(
                cloud.attach_disk("", "aws://us-east-1a/vol-aaa", false),
                cloud.attach_disk("", "aws://us-east-1a/vol-aaa", false),
            );

            assert_eq!(first.unwrap(), "/dev/xvdf");
            assert_eq!(second.unwrap(), "/dev/xvdf");
            assert_eq!(services.attach_volume_calls(), 1);
        }
    }

    mod attach_failures {
        use super::*;

        #[tokio::test]
        async fn read_only_is_refused() {
            let services = services_with_self_instance();
            services.add_volume("vol-aaa", "us-east-1a");
            let cloud = cloud_with(&services).await;

            let err = cloud
                .attach_disk("", "aws://us-east-1a/vol-aaa", true)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::ReadOnlyUnsupported));
            assert_eq!(services.attach_volume_calls(), 0);
        }

        #[tokio::test]
        async fn remote_failure_releases_the_reservation() {
            let services = services_with_self_instance();
            services.add_volume("vol-aaa", "us-east-1a");
            services.fail_attach();
            let cloud = cloud_with(&services).await;

            let err = cloud
                .attach_disk("", "aws://us-east-1a/vol-aaa", false)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Api { .. }));

            let handle = cloud.instance_handle("i-1").await;
            let cached = handle.cached_mappings().await.unwrap();
            assert!(cached.is_empty());
        }

        #[tokio::test]
        async fn poll_timeout_releases_the_reservation() {
            let services = services_with_self_instance();
            services.add_volume("vol-aaa", "us-east-1a");
            services.attach_remains("attaching");
            let mut cloud = AwsCloud::new(Some(CONFIG), Arc::new(services.clone()))
                .await
                .unwrap();
            cloud.volume_poll = PollPolicy {
                attempts: 3,
                interval: Duration::from_millis(1),
            };

            let err = cloud
                .attach_disk("", "aws://us-east-1a/vol-aaa", false)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Timeout { .. }));

            let handle = cloud.instance_handle("i-1").await;
            let cached = handle.cached_mappings().await.unwrap();
            assert!(cached.is_empty());
        }
    }

    mod detach {
        use super::*;

        #[tokio::test]
        async fn detach_waits_for_detached_state() {
            let services = services_with_self_instance();
            services.add_volume("vol-aaa", "us-east-1a");
            services.attach_existing("vol-aaa", "i-1", "/dev/sdf");
            let cloud = cloud_with(&services).await;

            cloud
                .detach_disk("", "aws://us-east-1a/vol-aaa")
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn missing_detach_response_is_a_protocol_error() {
            let services = services_with_self_instance();
            services.add_volume("vol-aaa", "us-east-1a");
            services.detach_returns_none();
            let cloud = cloud_with(&services).await;

            let err = cloud
                .detach_disk("", "aws://us-east-1a/vol-aaa")
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Protocol { .. }));
        }
    }

    mod create_delete {
        use super::*;

        #[tokio::test]
        async fn create_returns_a_canonical_name_in_the_provider_zone() {
            let services = services_with_self_instance();
            let cloud = cloud_with(&services).await;

            let name = cloud
                .create_volume(&VolumeOptions { capacity_mb: 1025 })
                .await
                .unwrap();

            let parsed = VolumeName::parse(&name).unwrap();
            assert_eq!(parsed.availability_zone, "us-east-1a");
            assert!(parsed.volume_id.starts_with("vol-"));
        }

        #[tokio::test]
        async fn create_then_delete_round_trips() {
            let services = services_with_self_instance();
            let cloud = cloud_with(&services).await;

            let name = cloud
                .create_volume(&VolumeOptions { capacity_mb: 1024 })
                .await
                .unwrap();
            cloud.delete_volume(&name).await.unwrap();

            // Deleting again fails: the volume is gone.
            assert!(cloud.delete_volume(&name).await.is_err());
        }

        #[test]
        fn capacity_rounds_up_to_whole_gb() {
            assert_eq!((1i64 + 1023) / 1024, 1);
            assert_eq!((1024i64 + 1023) / 1024, 1);
            assert_eq!((1025i64 + 1023) / 1024, 2);
        }
    }

    #[test]
    fn guest_device_translation() {
        assert_eq!(guest_device_name("/dev/sdf"), "/dev/xvdf");
        assert_eq!(guest_device_name("/dev/sdp"), "/dev/xvdp");
        assert_eq!(guest_device_name("/dev/nvme0n1"), "/dev/nvme0n1");
    }

    #[test]
    fn device_names_cover_f_through_p() {
        assert_eq!(DEVICE_NAMES.len(), 11);
        assert_eq!(DEVICE_NAMES[0], "/dev/sdf");
        assert_eq!(DEVICE_NAMES[10], "/dev/sdp");
    }
}
