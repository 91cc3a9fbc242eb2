//! Process-wide performance-counter registry.
//!
//! Counters are named gauges backed by closures. The scheduler's master
//! worker installs its queue-length counters here; an embedding process can
//! share one registry across components and poll values by name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// A gauge callback. Must be cheap and lock-light; it is polled by readers.
pub type CounterFn = Box<dyn Fn() -> i64 + Send + Sync>;

/// Returned when installing a counter under a name that is already taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallError {
    pub name: String,
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "counter '{}' is already installed", self.name)
    }
}

impl std::error::Error for InstallError {}

/// Registry of named counters.
#[derive(Default)]
pub struct CounterRegistry {
    counters: Mutex<HashMap<String, CounterFn>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, name: &str, counter: CounterFn) -> Result<(), InstallError> {
        let mut counters = self.counters.lock();
        if counters.contains_key(name) {
            return Err(InstallError {
                name: name.to_owned(),
            });
        }
        counters.insert(name.to_owned(), counter);
        Ok(())
    }

    /// Removes a counter; returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.counters.lock().remove(name).is_some()
    }

    /// Polls a counter by name.
    pub fn value(&self, name: &str) -> Option<i64> {
        let counters = self.counters.lock();
        counters.get(name).map(|counter| counter())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counters.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for CounterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// RAII handle for an installed counter; uninstalls on drop so a counter
/// never outlives the component backing it.
pub struct ManagedCounter {
    registry: Arc<CounterRegistry>,
    name: String,
}

impl ManagedCounter {
    pub fn install(
        registry: &Arc<CounterRegistry>,
        name: &str,
        counter: CounterFn,
    ) -> Result<Self, InstallError> {
        registry.install(name, counter)?;
        Ok(Self {
            registry: Arc::clone(registry),
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ManagedCounter {
    fn drop(&mut self) {
        self.registry.remove(&self.name);
    }
}
