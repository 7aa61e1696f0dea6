//! Registry mapping driver kinds to factory functions.

use crate::driver::Driver;
use crate::error::{LabError, LabResult};
use std::collections::HashMap;

type DriverFactory = Box<dyn Fn(&str) -> Box<dyn Driver> + Send + Sync>;

/// Creates driver instances by kind name.
///
/// The instrument server looks up each configured driver's `kind` here at
/// startup. Deployments register additional kinds before starting the server.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Registry preloaded with the built-in simulated drivers.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("sim_laser", |name| {
            Box::new(crate::driver::sim::SimLaser::new(name))
        });
        registry.register("sim_wavemeter", |name| {
            Box::new(crate::driver::sim::SimWavemeter::new(name))
        });
        registry.register("sim_pulsegen", |name| {
            Box::new(crate::driver::sim::SimPulseGen::new(name))
        });
        registry
    }

    /// An empty registry, for deployments that supply every driver kind.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers a factory for `kind`, replacing any previous registration.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&str) -> Box<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    /// Instantiates a driver of `kind` named `name`.
    pub fn create(&self, kind: &str, name: &str) -> LabResult<Box<dyn Driver>> {
        self.factories
            .get(kind)
            .map(|factory| factory(name))
            .ok_or_else(|| {
                LabError::Configuration(format!("driver kind '{kind}' is not registered"))
            })
    }

    /// Registered kind names, for diagnostics.
    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let registry = DriverRegistry::new();
        let driver = registry.create("sim_laser", "cwave").unwrap();
        assert_eq!(driver.name(), "cwave");
    }

    #[test]
    fn test_unknown_kind_is_configuration_error() {
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.create("warp_core", "x").err(),
            Some(LabError::Configuration(_))
        ));
    }
}
