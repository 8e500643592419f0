//! Client for the EC2 instance metadata service
//!
//! The metadata service lives at a fixed link-local address and answers
//! plain-text values for well-known keys. This layer does no retries and no
//! caching; callers decide what to remember.

use async_trait::async_trait;
use std::time::Duration;

use nimbus_cloud::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Fixed link-local endpoint of the instance metadata service
pub const METADATA_BASE_URL: &str = "http://169.254.169.254/latest/meta-data";

/// Metadata key for the running instance's id
pub const INSTANCE_ID_KEY: &str = "instance-id";

/// Metadata key for the running instance's availability zone
pub const AVAILABILITY_ZONE_KEY: &str = "placement/availability-zone";

/// Per-request deadline for metadata queries
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolver for instance-local metadata keys
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Fetch the raw value stored under the given metadata key
    async fn get(&self, key: &str) -> Result<String>;
}

/// HTTP-backed resolver targeting the link-local metadata endpoint
pub struct HttpMetadataResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetadataResolver {
    /// Build a resolver against the standard metadata endpoint
    pub fn new() -> Result<Self> {
        Self::with_base_url(METADATA_BASE_URL)
    }

    /// Build a resolver against an alternate endpoint
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::api("build metadata http client", e))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl MetadataResolver for HttpMetadataResolver {
    async fn get(&self, key: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, key);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::metadata(key, e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::metadata(
                key,
                format!("status {} returned for {}", status.as_u16(), url),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| Error::metadata(key, e.to_string()))
    }
}
