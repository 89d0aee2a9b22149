//! Named instance registries
//!
//! A [`Registry`] hands out one shared instance per name. Instances are built
//! lazily from the registry's default configuration, from a named
//! configuration added up front, or from an explicit config.

use crate::adaptive::AdaptiveBulkhead;
use crate::adaptive::config::AdaptiveBulkheadConfig;
use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::errors::ConfigError;
use crate::events::{Event, EventPublisher};
use crate::ratelimiter::{RateLimiter, RateLimiterConfig};
use crate::retry::{Retry, RetryConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Something a [`Registry`] can build from a name and a config
pub trait Registrable: Sized + Send + Sync + 'static {
    type Config: Clone + Send + Sync + 'static;

    fn create(name: &str, config: Self::Config) -> Result<Self, ConfigError>;
}

impl Registrable for CircuitBreaker {
    type Config = CircuitBreakerConfig;

    fn create(name: &str, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        CircuitBreaker::new(name, config)
    }
}

impl Registrable for AdaptiveBulkhead {
    type Config = AdaptiveBulkheadConfig;

    fn create(name: &str, config: AdaptiveBulkheadConfig) -> Result<Self, ConfigError> {
        AdaptiveBulkhead::new(name, config)
    }
}

impl Registrable for Bulkhead {
    type Config = BulkheadConfig;

    fn create(name: &str, config: BulkheadConfig) -> Result<Self, ConfigError> {
        Bulkhead::new(name, config)
    }
}

impl Registrable for Retry {
    type Config = RetryConfig;

    fn create(name: &str, config: RetryConfig) -> Result<Self, ConfigError> {
        Retry::new(name, config)
    }
}

impl Registrable for RateLimiter {
    type Config = RateLimiterConfig;

    fn create(name: &str, config: RateLimiterConfig) -> Result<Self, ConfigError> {
        RateLimiter::new(name, config)
    }
}

#[cfg(feature = "tokio")]
impl Registrable for crate::timelimiter::TimeLimiter {
    type Config = crate::timelimiter::TimeLimiterConfig;

    fn create(name: &str, config: Self::Config) -> Result<Self, ConfigError> {
        crate::timelimiter::TimeLimiter::new(name, config)
    }
}

pub type CircuitBreakerRegistry = Registry<CircuitBreaker>;
pub type AdaptiveBulkheadRegistry = Registry<AdaptiveBulkhead>;
pub type BulkheadRegistry = Registry<Bulkhead>;
pub type RetryRegistry = Registry<Retry>;
pub type RateLimiterRegistry = Registry<RateLimiter>;
#[cfg(feature = "tokio")]
pub type TimeLimiterRegistry = Registry<crate::timelimiter::TimeLimiter>;

/// Changes to the set of registered entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    EntryAdded { name: String },
    EntryRemoved { name: String },
    EntryReplaced { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEventKind {
    EntryAdded,
    EntryRemoved,
    EntryReplaced,
}

impl Event for RegistryEvent {
    type Kind = RegistryEventKind;

    fn kind(&self) -> RegistryEventKind {
        match self {
            RegistryEvent::EntryAdded { .. } => RegistryEventKind::EntryAdded,
            RegistryEvent::EntryRemoved { .. } => RegistryEventKind::EntryRemoved,
            RegistryEvent::EntryReplaced { .. } => RegistryEventKind::EntryReplaced,
        }
    }
}

pub struct Registry<T: Registrable> {
    default_config: T::Config,
    configs: RwLock<HashMap<String, T::Config>>,
    entries: RwLock<HashMap<String, Arc<T>>>,
    events: EventPublisher<RegistryEvent>,
}

impl<T: Registrable> Registry<T> {
    pub fn new(default_config: T::Config) -> Self {
        Self {
            default_config,
            configs: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            events: EventPublisher::new("registry"),
        }
    }

    pub fn of_defaults() -> Self
    where
        T::Config: Default,
    {
        Self::new(T::Config::default())
    }

    pub fn default_config(&self) -> &T::Config {
        &self.default_config
    }

    pub fn events(&self) -> &EventPublisher<RegistryEvent> {
        &self.events
    }

    /// Register a named configuration for later `get_with_config_name` calls
    pub fn add_configuration(&self, config_name: impl Into<String>, config: T::Config) {
        self.configs.write().insert(config_name.into(), config);
    }

    pub fn configuration(&self, config_name: &str) -> Option<T::Config> {
        self.configs.read().get(config_name).cloned()
    }

    /// The entry for `name`, created from the default config if absent
    pub fn get(&self, name: &str) -> Result<Arc<T>, ConfigError> {
        self.get_or_insert_with(name, || T::create(name, self.default_config.clone()))
    }

    /// The entry for `name`, created from a registered configuration if absent
    pub fn get_with_config_name(&self, name: &str, config_name: &str) -> Result<Arc<T>, ConfigError> {
        self.get_or_insert_with(name, || {
            let config = self.configuration(config_name).ok_or_else(|| {
                ConfigError::invalid("config_name", format!("no configuration named '{config_name}'"))
            })?;
            T::create(name, config)
        })
    }

    /// The entry for `name`, created from `config` if absent
    pub fn get_with_config(&self, name: &str, config: T::Config) -> Result<Arc<T>, ConfigError> {
        self.get_or_insert_with(name, || T::create(name, config))
    }

    /// The entry for `name`, or the result of `create` stored under it
    ///
    /// Concurrent callers for the same name all receive the same instance.
    pub fn get_or_insert_with<F>(&self, name: &str, create: F) -> Result<Arc<T>, ConfigError>
    where
        F: FnOnce() -> Result<T, ConfigError>,
    {
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(name) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(create()?);
        entries.insert(name.to_string(), Arc::clone(&created));
        drop(entries);

        tracing::debug!(name, "registry entry added");
        self.events.publish(RegistryEvent::EntryAdded {
            name: name.to_string(),
        });
        Ok(created)
    }

    pub fn find(&self, name: &str) -> Option<Arc<T>> {
        self.entries.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<T>> {
        let removed = self.entries.write().remove(name);
        if removed.is_some() {
            self.events.publish(RegistryEvent::EntryRemoved {
                name: name.to_string(),
            });
        }
        removed
    }

    /// Swap the entry for `name`; returns the previous one, if any
    pub fn replace(&self, name: &str, entry: T) -> Option<Arc<T>> {
        let previous = self
            .entries
            .write()
            .insert(name.to_string(), Arc::new(entry));
        let name = name.to_string();
        self.events.publish(match previous {
            Some(_) => RegistryEvent::EntryReplaced { name },
            None => RegistryEvent::EntryAdded { name },
        });
        previous
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T: Registrable> Default for Registry<T>
where
    T::Config: Default,
{
    fn default() -> Self {
        Self::of_defaults()
    }
}

impl<T: Registrable> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names())
            .finish()
    }
}
