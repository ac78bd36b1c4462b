//! # Connection Descriptor
//!
//! The resolved connection string for the message bus. The raw value carries a
//! shared access key, so the type never prints it: `Debug` and `Display` show
//! the parsed endpoint only, and the raw string is reachable solely through
//! [`ConnectionDescriptor::expose_secret`].
//!
//! Accepted format (semicolon separated, keys case-insensitive):
//!
//! ```text
//! Endpoint=sb://example.servicebus.windows.net/;SharedAccessKeyName=app;SharedAccessKey=...
//! Endpoint=memory://local
//! ```

use crate::error::{Result, RpcError};
use std::fmt;

/// Parsed, secret-free view of a connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// URI scheme (`sb`, `memory`, ...)
    pub scheme: String,
    /// Fully qualified namespace, e.g. `example.servicebus.windows.net`
    pub namespace: String,
    /// Shared access policy name, if present
    pub key_name: Option<String>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.namespace)
    }
}

/// Immutable connection descriptor, shared read-only for the process lifetime
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    raw: String,
    endpoint: Endpoint,
}

impl ConnectionDescriptor {
    /// Parse a connection string
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let endpoint = parse_endpoint(&raw)?;
        Ok(Self { raw, endpoint })
    }

    /// Descriptor for an in-process broker namespace
    pub fn memory(namespace: &str) -> Self {
        Self {
            raw: format!("Endpoint=memory://{namespace}"),
            endpoint: Endpoint {
                scheme: "memory".to_string(),
                namespace: namespace.to_string(),
                key_name: None,
            },
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn scheme(&self) -> &str {
        &self.endpoint.scheme
    }

    pub fn namespace(&self) -> &str {
        &self.endpoint.namespace
    }

    /// The raw connection string, including the access key. Hand it to the
    /// transport client only; never log it.
    pub fn expose_secret(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("endpoint", &self.endpoint)
            .field("raw", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.endpoint.fmt(f)
    }
}

fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    let mut endpoint_uri = None;
    let mut key_name = None;

    for (index, part) in raw
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .enumerate()
    {
        // Segment content may be the key itself, so only the position is reported
        let Some((key, value)) = part.split_once('=') else {
            return Err(RpcError::InvalidDescriptor(format!(
                "segment {index} has no '='"
            )));
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "endpoint" => endpoint_uri = Some(value.trim().to_string()),
            "sharedaccesskeyname" => key_name = Some(value.trim().to_string()),
            _ => {}
        }
    }

    let uri = endpoint_uri
        .ok_or_else(|| RpcError::InvalidDescriptor("missing Endpoint segment".to_string()))?;
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| RpcError::InvalidDescriptor(format!("endpoint without scheme: {uri}")))?;
    let namespace = rest.trim_end_matches('/');

    if scheme.is_empty() || namespace.is_empty() {
        return Err(RpcError::InvalidDescriptor(format!(
            "incomplete endpoint: {uri}"
        )));
    }

    Ok(Endpoint {
        scheme: scheme.to_ascii_lowercase(),
        namespace: namespace.to_string(),
        key_name,
    })
}
