//! Cloud provider configuration
//!
//! The config document is a small INI-style file with a single `[Global]`
//! section. The zone is the only mandatory value, and even it can be
//! auto-discovered from the instance metadata service when the document
//! omits it.
//!
//! ```text
//! [Global]
//! Zone = us-east-1a
//! KubernetesClusterTag = prod
//! ```

use tracing::{info, warn};

use nimbus_cloud::{Error, Result};

use crate::metadata::{MetadataResolver, AVAILABILITY_ZONE_KEY};

/// Regions this integration knows how to operate in
///
/// A zone whose derived region is not in this list is rejected at startup;
/// extending the list is a code change by design.
pub const KNOWN_REGIONS: &[&str] = &[
    "us-east-1",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-northeast-1",
    "sa-east-1",
];

/// Parsed provider configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudConfig {
    /// Availability zone the provider operates in (e.g. `us-east-1a`)
    pub zone: String,
    /// Optional label scoping all resources to one logical cluster
    pub cluster_tag: Option<String>,
}

impl CloudConfig {
    /// Parse a config document without filling in defaults
    pub fn parse(document: &str) -> Result<Self> {
        let mut config = CloudConfig::default();
        let mut in_global = false;

        for (lineno, raw_line) in document.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let section = &line[1..line.len() - 1];
                in_global = section.eq_ignore_ascii_case("global");
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::config(format!("malformed config line {}: {line}", lineno + 1))
            })?;
            if !in_global {
                continue;
            }

            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("Zone") {
                config.zone = value.to_string();
            } else if key.eq_ignore_ascii_case("KubernetesClusterTag") {
                if !value.is_empty() {
                    config.cluster_tag = Some(value.to_string());
                }
            } else {
                warn!(key = %key, "Ignoring unrecognized config key");
            }
        }

        Ok(config)
    }

    /// Read the configuration, querying the metadata service for the zone
    /// when the document does not provide one
    pub async fn load(
        document: Option<&str>,
        metadata: &dyn MetadataResolver,
    ) -> Result<Self> {
        let mut config = match document {
            Some(doc) => Self::parse(doc)?,
            None => CloudConfig::default(),
        };

        if config.zone.is_empty() {
            info!("Zone not specified in configuration; querying the metadata service");
            let zone = metadata.get(AVAILABILITY_ZONE_KEY).await?;
            if zone.is_empty() {
                return Err(Error::config(
                    "unable to determine availability zone from instance metadata",
                ));
            }
            config.zone = zone;
        }

        Ok(config)
    }
}

/// Derive the region from an availability zone and validate it
///
/// The region is the zone with its trailing AZ letter stripped; it must be
/// one of [`KNOWN_REGIONS`].
pub fn region_for_zone(zone: &str) -> Result<String> {
    if zone.len() <= 1 {
        return Err(Error::config(format!("invalid availability zone: {zone:?}")));
    }
    let region = &zone[..zone.len() - 1];
    if !KNOWN_REGIONS.contains(&region) {
        return Err(Error::config(format!(
            "not a known region: {region} (from zone {zone})"
        )));
    }
    Ok(region.to_string())
}
