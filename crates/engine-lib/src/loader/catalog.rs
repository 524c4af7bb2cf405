//! Detector catalog
//!
//! Maps exported type names to constructors for detector code linked into
//! this host. A module image can only be instantiated when every type it
//! names as an entry point has a registered constructor here.

use crate::detector::Detector;
use std::collections::BTreeMap;
use std::sync::Arc;

type Constructor = Arc<dyn Fn() -> Arc<dyn Detector> + Send + Sync>;

#[derive(Default, Clone)]
pub struct DetectorCatalog {
    constructors: BTreeMap<String, Constructor>,
}

impl DetectorCatalog {
    /// Capability interface every entry point must implement
    pub const CAPABILITY: &'static str = "IDetector";

    pub fn new() -> Self {
        Self::default()
    }

    /// Register a detector type constructed through `Default`
    pub fn register<D>(&mut self, type_name: impl Into<String>) -> Result<(), String>
    where
        D: Detector + Default + 'static,
    {
        self.register_with(type_name, || Arc::new(D::default()))
    }

    /// Register a detector type with a custom constructor
    pub fn register_with<F>(
        &mut self,
        type_name: impl Into<String>,
        constructor: F,
    ) -> Result<(), String>
    where
        F: Fn() -> Arc<dyn Detector> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        if self.constructors.contains_key(&type_name) {
            return Err(format!("detector type already registered: {type_name}"));
        }
        self.constructors.insert(type_name, Arc::new(constructor));
        Ok(())
    }

    pub fn instantiate(&self, type_name: &str) -> Option<Arc<dyn Detector>> {
        self.constructors.get(type_name).map(|ctor| ctor())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}
