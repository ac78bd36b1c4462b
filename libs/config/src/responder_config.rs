//! Responder Configuration Module
//!
//! Built-in defaults, then an optional TOML file, then `RPC__` environment
//! variables (`RPC__RESPONDER__CONCURRENCY_LIMIT=4`). Command-line flags are
//! applied by the binary on top of the loaded value.

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use rpc_core::{
    FinalMessagePolicy, KeyVaultConfig, MemoryBrokerConfig, ProcessorConfig, PublisherConfig,
    SenderMode, DEFAULT_MAX_DELIVERY_COUNT, DEFAULT_MAX_MESSAGE_SIZE,
};
use rpc_core::resolver::MANAGED_IDENTITY_ENDPOINT;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "RPC";

/// Separator between prefix, section and key in environment overrides
pub const ENV_SEPARATOR: &str = "__";

/// Main responder configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct ResponderConfig {
    pub responder: ResponderSettings,
    pub resolver: ResolverSettings,
    pub logging: LoggingSettings,
    pub broker: BrokerSettings,
}

/// Request processing settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ResponderSettings {
    /// Logical vault holding the bus connection string
    pub vault_name: String,
    pub secret_name: String,
    pub concurrency_limit: usize,
    pub final_message_policy: FinalMessagePolicy,
    pub sender_mode: SenderMode,
    pub receive_backoff_ms: u64,
    pub max_message_size: usize,
}

impl Default for ResponderSettings {
    fn default() -> Self {
        Self {
            vault_name: "sharkfinkv".to_string(),
            secret_name: rpc_core::resolver::DEFAULT_SECRET_NAME.to_string(),
            concurrency_limit: 1,
            final_message_policy: FinalMessagePolicy::Continue,
            sender_mode: SenderMode::PerCall,
            receive_backoff_ms: 2_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Where the connection string comes from
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    #[default]
    KeyVault,
    Env,
    Static,
}

#[derive(Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ResolverSettings {
    pub kind: ResolverKind,
    /// Bearer token for the key vault (falls back to `AZURE_ACCESS_TOKEN`)
    pub access_token: Option<String>,
    /// Vault URI template; `{vault}` is replaced by the vault name
    pub key_vault_base_url: String,
    /// Ask the host's managed identity for a token when none is configured
    pub managed_identity: bool,
    /// Fallback variable for the env resolver
    pub env_var: Option<String>,
    /// Connection string for the static resolver
    pub connection_string: Option<String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            kind: ResolverKind::KeyVault,
            access_token: None,
            key_vault_base_url: KeyVaultConfig::default().base_url,
            managed_identity: true,
            env_var: Some(rpc_core::resolver::DEFAULT_CONNECTION_ENV.to_string()),
            connection_string: None,
        }
    }
}

impl fmt::Debug for ResolverSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ResolverSettings")
            .field("kind", &self.kind)
            .field("access_token", &redact(&self.access_token))
            .field("key_vault_base_url", &self.key_vault_base_url)
            .field("managed_identity", &self.managed_identity)
            .field("env_var", &self.env_var)
            .field("connection_string", &redact(&self.connection_string))
            .finish()
    }
}

/// Log output format
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{}' (expected text or json)", other),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Settings for the in-process broker behind `memory://` descriptors
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BrokerSettings {
    pub max_delivery_count: u32,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
        }
    }
}

/// Builds a [`ResponderConfig`] from its layers
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    file_required: bool,
    env: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this TOML file; a missing file is an error
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self.file_required = true;
        self
    }

    /// Read this TOML file if it exists
    pub fn with_optional_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self.file_required = false;
        self
    }

    /// Use these variables instead of the process environment
    pub fn with_env(mut self, vars: HashMap<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    /// Layers that will be read, lowest precedence first
    ///
    /// Lets a caller report where its settings came from once logging is up.
    pub fn sources(&self) -> Vec<String> {
        let mut sources = vec!["defaults".to_string()];
        if let Some(path) = self.file.as_ref().filter(|path| path.exists()) {
            sources.push(path.display().to_string());
        }
        sources.push(match self.env {
            Some(_) => "injected environment".to_string(),
            None => format!("{ENV_PREFIX}{ENV_SEPARATOR}* environment"),
        });
        sources
    }

    pub fn load(self) -> Result<ResponderConfig> {
        let defaults =
            Config::try_from(&ResponderConfig::default()).context("Failed to encode defaults")?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = &self.file {
            if path.exists() {
                info!("Loading responder config: {:?}", path);
            } else {
                debug!("Responder config not found: {:?}", path);
            }
            builder = builder.add_source(File::from(path.as_path()).required(self.file_required));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(self.env),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let config: ResponderConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }
}

impl ResponderConfig {
    /// Load from an optional file plus the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let loader = match path {
            Some(path) => ConfigLoader::new().with_file(path),
            None => ConfigLoader::new(),
        };
        loader.load()
    }

    pub fn validate(&self) -> Result<()> {
        if self.responder.concurrency_limit == 0 {
            bail!("responder.concurrency_limit must be at least 1");
        }
        if self.responder.vault_name.trim().is_empty() {
            bail!("responder.vault_name must not be empty");
        }
        if self.responder.secret_name.trim().is_empty() {
            bail!("responder.secret_name must not be empty");
        }
        if self.responder.max_message_size == 0 {
            bail!("responder.max_message_size must be positive");
        }
        if self.broker.max_delivery_count == 0 {
            bail!("broker.max_delivery_count must be at least 1");
        }
        if self.resolver.kind == ResolverKind::Static
            && self
                .resolver
                .connection_string
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            bail!("resolver.connection_string is required for the static resolver");
        }
        Ok(())
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            concurrency_limit: self.responder.concurrency_limit,
            receive_backoff: Duration::from_millis(self.responder.receive_backoff_ms),
            final_message_policy: self.responder.final_message_policy,
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            mode: self.responder.sender_mode,
            max_message_size: self.responder.max_message_size,
        }
    }

    pub fn key_vault_config(&self) -> KeyVaultConfig {
        KeyVaultConfig {
            secret_name: self.responder.secret_name.clone(),
            base_url: self.resolver.key_vault_base_url.clone(),
            access_token: self.resolver.access_token.clone(),
            managed_identity_endpoint: self
                .resolver
                .managed_identity
                .then(|| MANAGED_IDENTITY_ENDPOINT.to_string()),
            ..Default::default()
        }
    }

    /// In-process broker settings for a `memory://<namespace>` descriptor
    pub fn broker_config(&self, namespace: &str) -> MemoryBrokerConfig {
        MemoryBrokerConfig {
            namespace: namespace.to_string(),
            max_delivery_count: self.broker.max_delivery_count,
            max_message_size: self.responder.max_message_size,
            ..Default::default()
        }
    }

    /// Effective configuration as TOML with secrets removed
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut redacted = self.clone();
        if redacted.resolver.access_token.is_some() {
            redacted.resolver.access_token = Some("<redacted>".to_string());
        }
        if redacted.resolver.connection_string.is_some() {
            redacted.resolver.connection_string = Some("<redacted>".to_string());
        }
        toml::to_string_pretty(&redacted).context("Failed to render configuration")
    }
}
