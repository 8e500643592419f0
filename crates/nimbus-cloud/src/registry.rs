//! Process-global registry of cloud provider factories
//!
//! Integrations register a factory under their provider name at startup;
//! the orchestrator then constructs the configured provider by name,
//! passing through the raw config document when one was supplied.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use tracing::info;

use crate::provider::CloudProvider;
use crate::{Error, Result};

/// Future returned by a provider factory
pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn CloudProvider>>> + Send>>;

/// Constructor for a provider, given the optional raw config document
pub type ProviderFactory = fn(Option<String>) -> ProviderFuture;

static REGISTRY: Lazy<RwLock<BTreeMap<String, ProviderFactory>>> =
    Lazy::new(|| RwLock::new(BTreeMap::new()));

/// Register a provider factory under the given name
///
/// Re-registering a name replaces the previous factory; the last
/// registration wins.
pub fn register(name: &str, factory: ProviderFactory) {
    let mut registry = REGISTRY.write().expect("provider registry poisoned");
    if registry.insert(name.to_string(), factory).is_some() {
        info!(provider = %name, "Replacing registered cloud provider factory");
    } else {
        info!(provider = %name, "Registered cloud provider factory");
    }
}

/// Names of all registered providers, sorted
pub fn registered() -> Vec<String> {
    let registry = REGISTRY.read().expect("provider registry poisoned");
    registry.keys().cloned().collect()
}

/// Construct the named provider from its registered factory
pub async fn init(name: &str, config: Option<String>) -> Result<Arc<dyn CloudProvider>> {
    let factory = {
        let registry = REGISTRY.read().expect("provider registry poisoned");
        registry
            .get(name)
            .copied()
            .ok_or_else(|| Error::config(format!("unknown cloud provider: {name}")))?
    };
    factory(config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Instances, TcpLoadBalancer, Volumes, Zones};
    use crate::types::Zone;

    struct NullProvider;

    impl CloudProvider for NullProvider {
        fn provider_name(&self) -> &'static str {
            "null"
        }
        fn instances(&self) -> Option<&dyn Instances> {
            None
        }
        fn zones(&self) -> Option<&dyn Zones> {
            None
        }
        fn tcp_load_balancer(&self) -> Option<&dyn TcpLoadBalancer> {
            None
        }
        fn volumes(&self) -> Option<&dyn Volumes> {
            None
        }
    }

    fn null_factory(_config: Option<String>) -> ProviderFuture {
        Box::pin(async { Ok(Arc::new(NullProvider) as Arc<dyn CloudProvider>) })
    }

    #[tokio::test]
    async fn registers_and_constructs_by_name() {
        register("null", null_factory);
        assert!(registered().contains(&"null".to_string()));

        let provider = init("null", None).await.unwrap();
        assert_eq!(provider.provider_name(), "null");
        assert!(provider.zones().is_none());
    }

    #[tokio::test]
    async fn unknown_provider_is_a_config_error() {
        let err = match init("no-such-cloud", None).await {
            Ok(_) => panic!("expected unknown provider to be a config error"),
            Err(err) => err,
        };
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("no-such-cloud"));
    }

    #[test]
    fn zone_type_is_plain_data() {
        let zone = Zone {
            failure_domain: "us-east-1a".to_string(),
            region: "us-east-1".to_string(),
        };
        assert_eq!(zone.failure_domain, "us-east-1a");
    }
}
