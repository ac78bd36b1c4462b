//! # Connection Resolution
//!
//! A [`ConnectionResolver`] turns a logical vault name into the bus
//! [`ConnectionDescriptor`]. Resolution happens at startup; failure is fatal
//! and surfaces as [`RpcError::SecretUnavailable`]. Resolvers never retry
//! internally and never log the secret value.
//!
//! - [`KeyVaultResolver`]: reads the secret from an Azure Key Vault over HTTPS,
//!   authenticating with a configured token or the host's managed identity
//! - [`EnvResolver`]: reads `<VAULT>_CONNECTION_STRING` / `RPC_CONNECTION_STRING`
//! - [`StaticResolver`]: a fixed descriptor (local runs, tests)
//! - [`CachedResolver`]: wraps any resolver so each vault resolves once per
//!   process, with concurrent callers sharing the in-flight lookup

use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Secret name the connection string is stored under
pub const DEFAULT_SECRET_NAME: &str = "sharkfinMQconnectionstring";

/// Key Vault REST API version
pub const KEY_VAULT_API_VERSION: &str = "7.4";

/// Env var consulted for the Key Vault bearer token when none is configured
pub const ACCESS_TOKEN_ENV: &str = "AZURE_ACCESS_TOKEN";

/// Azure instance metadata endpoint issuing managed identity tokens
pub const MANAGED_IDENTITY_ENDPOINT: &str =
    "http://169.254.169.254/metadata/identity/oauth2/token";

const MANAGED_IDENTITY_API_VERSION: &str = "2018-02-01";
const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";
const MANAGED_IDENTITY_TIMEOUT: Duration = Duration::from_secs(2);

/// Fallback env var for [`EnvResolver`]
pub const DEFAULT_CONNECTION_ENV: &str = "RPC_CONNECTION_STRING";

/// Obtains the bus connection descriptor from a secret store
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self, vault_name: &str) -> Result<ConnectionDescriptor>;
}

#[async_trait]
impl<R: ConnectionResolver + ?Sized> ConnectionResolver for Arc<R> {
    async fn resolve(&self, vault_name: &str) -> Result<ConnectionDescriptor> {
        (**self).resolve(vault_name).await
    }
}

/// Settings for [`KeyVaultResolver`]
#[derive(Debug, Clone)]
pub struct KeyVaultConfig {
    /// Name of the secret holding the connection string
    pub secret_name: String,
    /// Vault URI template; `{vault}` is replaced with the vault name
    pub base_url: String,
    /// Bearer token for the Key Vault resource; falls back to `AZURE_ACCESS_TOKEN`
    pub access_token: Option<String>,
    /// Token endpoint tried when no bearer token is configured; `None` disables it
    pub managed_identity_endpoint: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for KeyVaultConfig {
    fn default() -> Self {
        Self {
            secret_name: DEFAULT_SECRET_NAME.to_string(),
            base_url: "https://{vault}.vault.azure.net".to_string(),
            access_token: None,
            managed_identity_endpoint: Some(MANAGED_IDENTITY_ENDPOINT.to_string()),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SecretBundle {
    value: String,
}

#[derive(Deserialize)]
struct ManagedIdentityToken {
    access_token: String,
}

/// Reads the connection string from Azure Key Vault
#[derive(Debug, Clone)]
pub struct KeyVaultResolver {
    client: reqwest::Client,
    config: KeyVaultConfig,
}

impl KeyVaultResolver {
    pub fn new(config: KeyVaultConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RpcError::invalid_config(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Vault URI for a vault name
    pub fn vault_uri(&self, vault_name: &str) -> Result<String> {
        validate_vault_name(vault_name)?;
        Ok(self
            .config
            .base_url
            .replace("{vault}", vault_name)
            .trim_end_matches('/')
            .to_string())
    }

    /// Full secret URL for a vault name
    pub fn secret_url(&self, vault_name: &str) -> Result<String> {
        Ok(format!(
            "{}/secrets/{}?api-version={}",
            self.vault_uri(vault_name)?,
            self.config.secret_name,
            KEY_VAULT_API_VERSION
        ))
    }

    fn configured_token(&self) -> Option<String> {
        self.config
            .access_token
            .clone()
            .or_else(|| std::env::var(ACCESS_TOKEN_ENV).ok())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Configured token, else one minted by the managed identity endpoint
    async fn bearer_token(&self, vault_name: &str) -> Result<String> {
        if let Some(token) = self.configured_token() {
            return Ok(token);
        }
        let Some(endpoint) = &self.config.managed_identity_endpoint else {
            return Err(RpcError::secret_unavailable(
                vault_name,
                format!("no access token configured (set {ACCESS_TOKEN_ENV})"),
            ));
        };

        debug!("Requesting managed identity token from {}", endpoint);
        let unavailable = |reason: String| {
            RpcError::secret_unavailable(
                vault_name,
                format!("no access token configured and managed identity failed: {reason}"),
            )
        };
        let response = self
            .client
            .get(endpoint)
            .query(&[
                ("api-version", MANAGED_IDENTITY_API_VERSION),
                ("resource", KEY_VAULT_RESOURCE),
            ])
            .header("Metadata", "true")
            .timeout(MANAGED_IDENTITY_TIMEOUT)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("token endpoint returned {status}")));
        }
        let token: ManagedIdentityToken = response
            .json()
            .await
            .map_err(|e| unavailable(format!("bad token payload: {e}")))?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl ConnectionResolver for KeyVaultResolver {
    async fn resolve(&self, vault_name: &str) -> Result<ConnectionDescriptor> {
        let url = self.secret_url(vault_name)?;
        info!(
            "Retrieving bus endpoint from key vault: {}",
            self.vault_uri(vault_name)?
        );

        let token = self.bearer_token(vault_name).await?;

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RpcError::secret_unavailable(vault_name, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = match status.as_u16() {
                401 | 403 => format!("authentication failed ({status})"),
                404 => format!("secret '{}' not found", self.config.secret_name),
                _ => format!("key vault returned {status}"),
            };
            return Err(RpcError::secret_unavailable(vault_name, reason));
        }

        let bundle: SecretBundle = response
            .json()
            .await
            .map_err(|e| RpcError::secret_unavailable(vault_name, format!("bad secret payload: {e}")))?;

        let descriptor = ConnectionDescriptor::parse(bundle.value)?;
        debug!("Resolved descriptor for {}: {}", vault_name, descriptor);
        Ok(descriptor)
    }
}

/// Azure vault names: 3-24 characters, alphanumerics and hyphens
fn validate_vault_name(vault_name: &str) -> Result<()> {
    let valid_len = (3..=24).contains(&vault_name.len());
    let valid_chars = vault_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(RpcError::invalid_config(format!(
            "invalid vault name '{vault_name}'"
        )))
    }
}

/// Reads the connection string from the environment
#[derive(Debug, Clone, Default)]
pub struct EnvResolver {
    fallback_var: Option<String>,
}

impl EnvResolver {
    pub fn new() -> Self {
        Self {
            fallback_var: Some(DEFAULT_CONNECTION_ENV.to_string()),
        }
    }

    /// Use a different fallback variable (or none)
    pub fn with_fallback(fallback_var: Option<String>) -> Self {
        Self { fallback_var }
    }

    /// `my-vault` → `MY_VAULT_CONNECTION_STRING`
    pub fn var_for(vault_name: &str) -> String {
        format!(
            "{}_CONNECTION_STRING",
            vault_name.to_ascii_uppercase().replace('-', "_")
        )
    }
}

#[async_trait]
impl ConnectionResolver for EnvResolver {
    async fn resolve(&self, vault_name: &str) -> Result<ConnectionDescriptor> {
        let primary = Self::var_for(vault_name);
        let candidates = std::iter::once(primary.clone()).chain(self.fallback_var.clone());

        for var in candidates {
            if let Ok(value) = std::env::var(&var) {
                if !value.trim().is_empty() {
                    debug!("Connection string for {} read from ${}", vault_name, var);
                    return ConnectionDescriptor::parse(value.trim());
                }
            }
        }

        Err(RpcError::secret_unavailable(
            vault_name,
            format!("environment variable {primary} not set"),
        ))
    }
}

/// Always returns the same descriptor
#[derive(Debug, Clone)]
pub struct StaticResolver {
    descriptor: ConnectionDescriptor,
}

impl StaticResolver {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn parse(connection_string: &str) -> Result<Self> {
        Ok(Self::new(ConnectionDescriptor::parse(connection_string)?))
    }
}

#[async_trait]
impl ConnectionResolver for StaticResolver {
    async fn resolve(&self, vault_name: &str) -> Result<ConnectionDescriptor> {
        debug!("Using static descriptor for {}", vault_name);
        Ok(self.descriptor.clone())
    }
}

/// Resolves each vault at most once per process
///
/// Successful resolutions are cached; failures are not, so the next call
/// tries again. Concurrent callers for the same vault wait on a single
/// lookup.
pub struct CachedResolver<R: ConnectionResolver> {
    inner: R,
    cells: Mutex<HashMap<String, Arc<OnceCell<ConnectionDescriptor>>>>,
}

impl<R: ConnectionResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cell_for(&self, vault_name: &str) -> Arc<OnceCell<ConnectionDescriptor>> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            cells
                .entry(vault_name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Descriptor already resolved for a vault, if any
    pub fn cached(&self, vault_name: &str) -> Option<ConnectionDescriptor> {
        self.cell_for(vault_name).get().cloned()
    }
}

#[async_trait]
impl<R: ConnectionResolver> ConnectionResolver for CachedResolver<R> {
    async fn resolve(&self, vault_name: &str) -> Result<ConnectionDescriptor> {
        let cell = self.cell_for(vault_name);
        cell.get_or_try_init(|| self.inner.resolve(vault_name))
            .await
            .cloned()
    }
}

impl<R: ConnectionResolver> std::fmt::Debug for CachedResolver<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedResolver").finish_non_exhaustive()
    }
}
