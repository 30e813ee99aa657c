//! Name-to-builder registries used to construct components from specs.

use crate::error::{EngineError, Result};
use std::collections::BTreeMap;

/// Case-insensitive map from type names to builders.
///
/// Names are validated when registered, so a typo in a spec surfaces as a
/// `Configuration` error at build time rather than mid-run.
pub struct Registry<B> {
    kind: &'static str,
    builders: BTreeMap<String, B>,
}

impl<B> std::fmt::Debug for Registry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<B> Registry<B> {
    /// Create an empty registry; `kind` names the component in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self { kind, builders: BTreeMap::new() }
    }

    fn key(name: &str) -> String {
        name.trim().to_lowercase()
    }

    /// Register a builder under `name`.
    ///
    /// # Errors
    /// Returns `Configuration` if the name is empty or already taken.
    pub fn register(&mut self, name: &str, builder: B) -> Result<()> {
        let key = Self::key(name);
        if key.is_empty() {
            return Err(EngineError::configuration(format!("{} name must not be empty", self.kind)));
        }
        if self.builders.contains_key(&key) {
            return Err(EngineError::configuration(format!(
                "{} '{}' is already registered",
                self.kind, name
            )));
        }
        self.builders.insert(key, builder);
        Ok(())
    }

    /// Register or replace a built-in builder.
    pub(crate) fn insert(&mut self, name: &str, builder: B) {
        self.builders.insert(Self::key(name), builder);
    }

    /// Look up the builder registered under `name`.
    ///
    /// # Errors
    /// Returns `Configuration` for an unknown name.
    pub fn get(&self, name: &str) -> Result<&B> {
        self.builders.get(&Self::key(name)).ok_or_else(|| {
            EngineError::configuration(format!("unknown {} type '{}'", self.kind, name))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(&Self::key(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}
