//! Error types for cloud provider integrations
//!
//! One taxonomy shared by every provider so the orchestrator's reconcilers
//! can classify failures (retry, back off, fail permanently) without knowing
//! which cloud produced them.

use thiserror::Error;

/// Main error type for cloud provider operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or rejected provider configuration (bad zone, unknown
    /// region, malformed volume name, invalid name filter)
    #[error("invalid cloud configuration: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// The instance metadata service returned non-200 or failed at the
    /// transport level
    #[error("cloud metadata unavailable for {key}: {message}")]
    MetadataUnavailable {
        /// Metadata key being queried
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Exactly one match was required but none was found
    #[error("{resource} not found: {name}")]
    NotFound {
        /// Resource kind (instance, load balancer, security group, VPC)
        resource: &'static str,
        /// The identifier that matched nothing
        name: String,
    },

    /// Exactly one match was required but several were found
    #[error("multiple {resource} matches for: {name}")]
    Ambiguous {
        /// Resource kind (instance, load balancer, security group, VPC)
        resource: &'static str,
        /// The identifier that matched more than once
        name: String,
    },

    /// Unclassified failure from the underlying cloud API, passed through
    /// with a context prefix
    #[error("cloud API error [{context}]: {message}")]
    Api {
        /// Operation that failed (e.g. "describe instances")
        context: String,
        /// The underlying error text
        message: String,
    },

    /// A bounded poll on remote state expired before reaching the desired
    /// state
    #[error("timed out waiting for {message}")]
    Timeout {
        /// What was being waited for
        message: String,
    },

    /// The cloud returned a structurally unexpected response
    #[error("unexpected cloud response: {message}")]
    Protocol {
        /// Description of the malformed response
        message: String,
    },

    /// Read-only volume attachment was requested but is not supported
    #[error("read-only volume attachment is not supported")]
    ReadOnlyUnsupported,

    /// Every device name on the instance already maps to a volume
    #[error("no free block device names on instance {instance_id}")]
    NoDeviceAvailable {
        /// Instance whose device letters are exhausted
        instance_id: String,
    },

    /// The requested session affinity cannot be provided by an L4 load
    /// balancer
    #[error("unsupported load balancer affinity: {affinity}")]
    UnsupportedAffinity {
        /// The affinity that was requested
        affinity: String,
    },

    /// A caller-supplied public IP cannot be honored
    #[error("public IP addresses cannot be assigned to this load balancer")]
    PublicIpNotSupported,
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a metadata error for the given key
    pub fn metadata(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MetadataUnavailable {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given resource kind
    pub fn not_found(resource: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            name: name.into(),
        }
    }

    /// Create an ambiguity error for the given resource kind
    pub fn ambiguous(resource: &'static str, name: impl Into<String>) -> Self {
        Self::Ambiguous {
            resource,
            name: name.into(),
        }
    }

    /// Create a cloud API error with an operation context
    pub fn api(context: impl Into<String>, msg: impl ToString) -> Self {
        Self::Api {
            context: context.into(),
            message: msg.to_string(),
        }
    }

    /// Create a timeout error describing what was being waited for
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout {
            message: msg.into(),
        }
    }

    /// Create a protocol error for a structurally unexpected response
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration errors and capability refusals require a spec change
    /// and are never retryable. Transport-level and remote-state failures
    /// may recover on a later reconciliation attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Config { .. } => false,
            Error::MetadataUnavailable { .. } => true,
            Error::NotFound { .. } => true,
            Error::Ambiguous { .. } => false,
            Error::Api { .. } => true,
            Error::Timeout { .. } => true,
            Error::Protocol { .. } => true,
            Error::ReadOnlyUnsupported => false,
            Error::NoDeviceAvailable { .. } => false,
            Error::UnsupportedAffinity { .. } => false,
            Error::PublicIpNotSupported => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::api("describe instances", "throttled");
        assert!(err.to_string().contains("describe instances"));
        assert!(err.to_string().contains("throttled"));

        let err = Error::not_found("instance", "ip-10-0-0-1.ec2.internal");
        assert!(err.to_string().contains("instance not found"));
        assert!(err.to_string().contains("ip-10-0-0-1.ec2.internal"));

        let err = Error::metadata("instance-id", "connection refused");
        assert!(err.to_string().contains("instance-id"));
    }

    #[test]
    fn constructors_produce_matching_variants() {
        assert!(matches!(Error::config("x"), Error::Config { .. }));
        assert!(matches!(Error::timeout("x"), Error::Timeout { .. }));
        assert!(matches!(Error::protocol("x"), Error::Protocol { .. }));
        assert!(matches!(
            Error::ambiguous("load balancer", "svc-a"),
            Error::Ambiguous { .. }
        ));
    }

    #[test]
    fn retryability_classification() {
        // Caller must fix the config; retrying is pointless.
        assert!(!Error::config("unknown region").is_retryable());
        assert!(!Error::ReadOnlyUnsupported.is_retryable());
        assert!(!Error::PublicIpNotSupported.is_retryable());
        assert!(!Error::ambiguous("instance", "dup").is_retryable());

        // Remote state can change between reconciliation attempts.
        assert!(Error::api("attach volume", "throttled").is_retryable());
        assert!(Error::timeout("volume attachment").is_retryable());
        assert!(Error::not_found("instance", "gone").is_retryable());
        assert!(Error::metadata("instance-id", "503").is_retryable());
    }
}
