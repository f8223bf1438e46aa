//! Environment variable provider module.
//!
//! The coordinator honors a handful of environment variables
//! (`TASKFORGE_PORT`, `TASKFORGE_LOW_PORT`, `TASKFORGE_HIGH_PORT`,
//! `TASKFORGE_NAME`, `TASKFORGE_PRIORITY`, `TASKFORGE_CATALOG_HOSTS`).
//! Access goes through a provider trait so tests can inject a mapping
//! instead of mutating the process environment.

use std::collections::HashMap;

/// Environment variable provider trait.
///
/// Abstracts environment variable access, allowing mock implementations to
/// be injected during testing.
pub trait EnvironmentProvider: Send + Sync {
    /// Get the value of the specified environment variable.
    ///
    /// Returns `Some(value)` if the environment variable exists, otherwise
    /// `None`.
    fn get_var(&self, key: &str) -> Option<String>;

    /// Check if an environment variable exists.
    fn has_var(&self, key: &str) -> bool {
        self.get_var(key).is_some()
    }
}

/// System environment variable provider implementation.
///
/// Reads the real process environment; used in production.
#[derive(Debug, Default)]
pub struct SystemEnvironmentProvider;

impl SystemEnvironmentProvider {
    /// Create a new system environment variable provider.
    pub fn new() -> Self {
        Self
    }
}

impl EnvironmentProvider for SystemEnvironmentProvider {
    fn get_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Test environment variable provider implementation.
///
/// Uses a predefined variable mapping for complete isolation in tests.
#[derive(Debug, Default)]
pub struct TestEnvironmentProvider {
    variables: HashMap<String, String>,
}

impl TestEnvironmentProvider {
    /// Create an empty test provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a test provider containing the specified variables.
    pub fn with_variables(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    /// Set an environment variable.
    pub fn set_var(&mut self, key: &str, value: &str) {
        self.variables.insert(key.to_string(), value.to_string());
    }

    /// Remove an environment variable.
    pub fn remove_var(&mut self, key: &str) {
        self.variables.remove(key);
    }
}

impl EnvironmentProvider for TestEnvironmentProvider {
    fn get_var(&self, key: &str) -> Option<String> {
        self.variables.get(key).cloned()
    }
}
