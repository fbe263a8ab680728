//! Registry configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::Registry;
use crate::tracer::{NoopTracer, Tracer};

/// Retention settings of a [`Registry`].
///
/// Durations are written as milliseconds when serialized, and missing fields
/// take their defaults:
///
/// ```
/// # use memo_flow::CacheConfig;
/// # use std::time::Duration;
/// let config: CacheConfig = serde_json::from_str(r#"{ "keep_alive": 250 }"#).unwrap();
/// assert_eq!(config.keep_alive, Duration::from_millis(250));
/// assert_eq!(config.sweep_interval, CacheConfig::default().sweep_interval);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an unread value stays cached after its last read.
    #[serde(with = "millis")]
    pub keep_alive: Duration,
    /// Minimum time between two sweeps triggered by top-level reads.
    ///
    /// `None` disables automatic sweeps; [`Registry::sweep`] can still be called.
    #[serde(with = "opt_millis")]
    pub sweep_interval: Option<Duration>,
}

impl CacheConfig {
    /// Default keep-alive window.
    pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(1);
    /// Default interval between automatic sweeps.
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_alive: Self::DEFAULT_KEEP_ALIVE,
            sweep_interval: Some(Self::DEFAULT_SWEEP_INTERVAL),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

/// Builder for [`Registry`] with customizable settings.
///
/// # Example
///
/// ```
/// use memo_flow::{NoopTracer, Registry};
/// use std::time::Duration;
///
/// let registry = Registry::builder()
///     .keep_alive(Duration::from_secs(30))
///     .sweep_interval(None)
///     .tracer(NoopTracer)
///     .build();
/// assert_eq!(registry.config().keep_alive, Duration::from_secs(30));
/// ```
pub struct RegistryBuilder {
    config: CacheConfig,
    tracer: Arc<dyn Tracer>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how long an unread value stays cached.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Set the minimum time between automatic sweeps, or disable them with `None`.
    pub fn sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the tracer receiving cache events.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Build the registry.
    pub fn build(self) -> Registry {
        Registry::from_parts(self.config, self.tracer)
    }
}
