//! Limiter identity.

use std::fmt;
use std::time::Duration;

/// Identifies exactly one limiter instance.
///
/// Two checks share a limiter if and only if they agree on every field.
/// Quota and window are part of the key, so editing a rule yields a new key
/// and a new limiter while the old one is simply no longer looked up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    /// The tenant's API key
    pub api_key: String,
    /// The endpoint the rule covers
    pub endpoint: String,
    /// Node address chosen by the shard selector
    pub shard: String,
    /// Requests allowed per window
    pub limit: u64,
    pub window: Duration,
}

impl ConfigKey {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        shard: impl Into<String>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            shard: shard.into(),
            limit,
            window,
        }
    }

    /// Compact string form used in logs.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}:{}@{}[{}/{}s]",
            self.api_key,
            self.endpoint,
            self.shard,
            self.limit,
            self.window.as_secs()
        )
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
