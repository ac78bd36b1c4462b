//! Wiring from configuration to resolver and transport

use anyhow::{Context, Result};
use rpc_config::{ResolverKind, ResponderConfig};
use rpc_core::{
    CachedResolver, ConnectionDescriptor, ConnectionResolver, Connector, ConnectorRegistry,
    EnvResolver, KeyVaultResolver, MemoryBroker, QueueNames, StaticResolver,
};
use std::sync::Arc;
use tracing::info;

/// Scheme served by the in-process broker
pub const MEMORY_SCHEME: &str = "memory";

/// Resolver selected by `resolver.kind`
pub fn build_resolver(config: &ResponderConfig) -> Result<Arc<dyn ConnectionResolver>> {
    let resolver: Arc<dyn ConnectionResolver> = match config.resolver.kind {
        ResolverKind::KeyVault => {
            let key_vault = KeyVaultResolver::new(config.key_vault_config())
                .context("Failed to create key vault client")?;
            Arc::new(CachedResolver::new(key_vault))
        }
        ResolverKind::Env => Arc::new(CachedResolver::new(EnvResolver::with_fallback(
            config.resolver.env_var.clone(),
        ))),
        ResolverKind::Static => {
            let raw = config
                .resolver
                .connection_string
                .as_deref()
                .context("resolver.connection_string is required for the static resolver")?;
            Arc::new(StaticResolver::parse(raw).context("Invalid static connection string")?)
        }
    };
    info!("Using {:?} connection resolver", config.resolver.kind);
    Ok(resolver)
}

/// Connector for the resolved endpoint, plus the in-process broker when the
/// endpoint is `memory://`
pub struct Transport {
    pub connector: Arc<dyn Connector>,
    pub broker: Option<MemoryBroker>,
}

/// Register the built-in connectors and pick the one for `descriptor`
///
/// For `memory://` endpoints the request and response queues are provisioned
/// up front.
pub fn build_transport(
    config: &ResponderConfig,
    descriptor: &ConnectionDescriptor,
    queues: &QueueNames,
) -> Result<Transport> {
    let mut registry = ConnectorRegistry::new();
    let mut broker = None;

    if descriptor.scheme() == MEMORY_SCHEME {
        let memory = MemoryBroker::with_queues(
            config.broker_config(descriptor.namespace()),
            [&queues.requests, &queues.responses],
        );
        info!(
            "Provisioned in-process queues {} and {} on {}",
            queues.requests, queues.responses, descriptor
        );
        registry.register(MEMORY_SCHEME, Arc::new(memory.clone()));
        broker = Some(memory);
    }

    registry
        .connector_for(descriptor)
        .with_context(|| format!("No transport available for {}", descriptor))?;

    Ok(Transport {
        connector: Arc::new(registry),
        broker,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_config::ConfigLoader;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> ResponderConfig {
        ConfigLoader::new()
            .with_env(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<HashMap<_, _>>(),
            )
            .load()
            .unwrap()
    }

    #[tokio::test]
    async fn test_static_resolver_from_config() {
        let config = config_with(&[
            ("RPC__RESOLVER__KIND", "static"),
            ("RPC__RESOLVER__CONNECTION_STRING", "Endpoint=memory://devbus"),
        ]);
        let resolver = build_resolver(&config).unwrap();
        let descriptor = resolver.resolve("sharkfinkv").await.unwrap();
        assert_eq!(descriptor.namespace(), "devbus");
    }

    #[test]
    fn test_key_vault_resolver_builds() {
        let config = config_with(&[]);
        assert!(build_resolver(&config).is_ok());
    }

    #[tokio::test]
    async fn test_memory_transport_provisions_queues() {
        let config = config_with(&[]);
        let descriptor = ConnectionDescriptor::memory("devbus");
        let queues = QueueNames::for_simulation("sim7");

        let transport = build_transport(&config, &descriptor, &queues).unwrap();
        let broker = transport.broker.unwrap();
        assert!(broker.queue_exists("sim7_requests"));
        assert!(broker.queue_exists("sim7_responses"));

        let connection = transport.connector.connect(&descriptor).await.unwrap();
        assert_eq!(connection.namespace(), "devbus");
        connection.close().await.unwrap();
    }

    #[test]
    fn test_unknown_scheme_fails_at_startup() {
        let config = config_with(&[]);
        let descriptor = ConnectionDescriptor::parse(
            "Endpoint=sb://example.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=c2VjcmV0",
        )
        .unwrap();
        let queues = QueueNames::for_simulation("sim7");

        let err = build_transport(&config, &descriptor, &queues)
            .err()
            .unwrap();
        let message = format!("{:#}", err);
        assert!(message.contains("No transport available"));
        assert!(!message.contains("c2VjcmV0"));
    }
}
