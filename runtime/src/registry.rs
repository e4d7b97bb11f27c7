//! Registry of token buckets keyed by resource name.
//!
//! Provider adapters name the resource they are about to spend against
//! ("search", "browser", ...). The registry creates that resource's bucket on
//! first use and hands the same bucket to every later caller. Buckets are
//! never removed or replaced.
//!
//! A process-wide registry is available through [`global`]; install a
//! configured one with [`init_global`] before anything touches it.

use crate::bucket::TokenBucket;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use toolgate_core::config::{BucketConfig, LimitsConfig};
use toolgate_core::environment::{Clock, SystemClock};
use toolgate_core::error::{AdmissionError, ConfigError, RegistryError};
use tracing::{info, warn};

static GLOBAL: OnceCell<BucketRegistry> = OnceCell::new();

/// Process-wide registry, created with default bucket settings on first use.
pub fn global() -> &'static BucketRegistry {
    GLOBAL.get_or_init(BucketRegistry::default)
}

/// Install `registry` as the process-wide registry.
///
/// # Errors
///
/// Returns [`RegistryError::AlreadyInitialized`] if [`global`] or
/// `init_global` already ran.
pub fn init_global(registry: BucketRegistry) -> Result<&'static BucketRegistry, RegistryError> {
    GLOBAL
        .set(registry)
        .map_err(|_| RegistryError::AlreadyInitialized)?;
    Ok(global())
}

/// Maps resource names to their [`TokenBucket`].
#[derive(Debug)]
pub struct BucketRegistry {
    defaults: BucketConfig,
    configs: RwLock<HashMap<String, BucketConfig>>,
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    clock: Arc<dyn Clock>,
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::from_parts(BucketConfig::default(), HashMap::new())
    }
}

impl BucketRegistry {
    /// Registry that creates every bucket from `defaults`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `defaults` is invalid (its name is ignored).
    pub fn new(defaults: BucketConfig) -> Result<Self, ConfigError> {
        defaults.for_resource("defaults").validate()?;
        Ok(Self::from_parts(defaults, HashMap::new()))
    }

    /// Registry built from a loaded configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any bucket in `config` is invalid.
    pub fn from_config(config: &LimitsConfig) -> Result<Self, ConfigError> {
        config.defaults.for_resource("defaults").validate()?;
        let configs = config
            .configured_resources()
            .map(|name| {
                let bucket = config.bucket_config(name);
                bucket.validate().map(|()| (name.to_string(), bucket))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self::from_parts(config.defaults.clone(), configs))
    }

    fn from_parts(defaults: BucketConfig, configs: HashMap<String, BucketConfig>) -> Self {
        Self {
            defaults,
            configs: RwLock::new(configs),
            buckets: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Drive buckets created from now on with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register settings for one resource.
    ///
    /// Returns `Ok(false)` without changing anything if the resource's bucket
    /// already exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    pub fn configure(&self, config: BucketConfig) -> Result<bool, ConfigError> {
        config.validate()?;

        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        if buckets.contains_key(&config.name) {
            warn!(
                resource = %config.name,
                "Bucket already created, ignoring new configuration"
            );
            return Ok(false);
        }

        // Holding the bucket read lock keeps a concurrent first use from
        // creating the bucket with the old settings in between.
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.name.clone(), config);
        Ok(true)
    }

    /// Bucket for `name`, created on first use.
    pub fn bucket(&self, name: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(buckets.entry(name.to_string()).or_insert_with(|| {
            let config = self
                .configs
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.defaults.for_resource(name));
            info!(
                resource = name,
                max_tokens = config.max_tokens,
                refill_rate = config.refill_rate,
                "Created token bucket"
            );
            Arc::new(TokenBucket::from_validated(config, Arc::clone(&self.clock)))
        }))
    }

    /// Acquire `cost` tokens on `resource`. See [`TokenBucket::acquire`].
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] if the bucket does not admit the request.
    pub async fn acquire(&self, resource: &str, cost: u32) -> Result<(), AdmissionError> {
        self.bucket(resource).acquire(cost).await
    }

    /// Take `cost` tokens on `resource` if available right now.
    pub fn try_acquire(&self, resource: &str, cost: u32) -> bool {
        self.bucket(resource).try_acquire(cost)
    }

    /// Tokens currently available on `resource`.
    pub fn available_tokens(&self, resource: &str) -> f64 {
        self.bucket(resource).available_tokens()
    }

    /// Names of the buckets created so far, sorted.
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Settings used for resources without their own configuration.
    #[must_use]
    pub const fn defaults(&self) -> &BucketConfig {
        &self.defaults
    }
}
