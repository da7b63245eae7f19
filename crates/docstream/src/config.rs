//! Connection options and their TOML representation.
//!
//! ```toml
//! collection = "events"
//! max_retries = 3
//! idle_close_delay = "10m"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of connect attempts per acquire batch.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default grace period before an unused client is closed.
pub const DEFAULT_IDLE_CLOSE_DELAY: Duration = Duration::from_secs(10 * 60);

/// Options recognized by [`ConnectionPool::connect`](crate::ConnectionPool::connect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Collection every cursor of the logical connection operates on (required).
    #[serde(default)]
    pub collection: Option<String>,
    /// Total connect attempts when the driver reports a timeout (default: 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How long an unused client stays open (default: 10 minutes).
    #[serde(default = "default_idle_close_delay", with = "duration_str")]
    pub idle_close_delay: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_idle_close_delay() -> Duration {
    DEFAULT_IDLE_CLOSE_DELAY
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            collection: None,
            max_retries: DEFAULT_MAX_RETRIES,
            idle_close_delay: DEFAULT_IDLE_CLOSE_DELAY,
        }
    }
}

impl ConnectOptions {
    /// Options bound to `collection` with every other field at its default.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            ..Self::default()
        }
    }

    /// Builder method: set the connect attempt budget.
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Builder method: set the idle close delay.
    pub fn with_idle_close_delay(self, idle_close_delay: Duration) -> Self {
        Self {
            idle_close_delay,
            ..self
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Check the options and return the collection name.
    pub fn validate(&self) -> Result<&str> {
        let collection = self
            .collection
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Config("options.collection is required".to_string()))?;
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        Ok(collection)
    }
}

/// Parse a duration string such as `"250ms"`, `"30s"`, `"10m"` or `"1h"`.
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration: {s:?}")))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(Error::Config(format!("unknown duration unit {other:?} in {s:?}"))),
    }
}

fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        format!("{millis}ms")
    } else {
        let secs = d.as_secs();
        if secs % 3600 == 0 && secs > 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 && secs > 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => super::parse_duration(&s).map_err(de::Error::custom),
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}
