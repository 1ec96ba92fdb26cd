use std::collections::BTreeMap;
use std::sync::Arc;

use crate::delegate::command::{CommandDelegate, DelegateConfig};
use crate::delegate::traits::Delegate;
use crate::error::Result;

/// Delegates addressable by name.
#[derive(Clone, Default)]
pub struct DelegateRegistry {
    delegates: BTreeMap<String, Arc<dyn Delegate>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command delegates for every `[[delegates]]` entry.
    pub fn from_configs(configs: &[DelegateConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(Arc::new(CommandDelegate::from_config(config)?));
        }
        Ok(registry)
    }

    /// Register a delegate under its own name, replacing any previous one.
    pub fn register(&mut self, delegate: Arc<dyn Delegate>) {
        self.delegates.insert(delegate.name().to_string(), delegate);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Delegate>> {
        self.delegates.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.delegates.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.delegates.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

impl std::fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateRegistry")
            .field("delegates", &self.names())
            .finish()
    }
}
