//! Dependency resolution for module images
//!
//! Each load builds its own [`ModuleResolver`] over the package contents,
//! so concurrent loads of different packages never share lookup state.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

/// Resolver of modules provided by the host environment
pub trait AmbientResolver: Send + Sync {
    /// Returns `None` when the module is unknown to the host
    fn resolve(&self, module_name: &str) -> Option<Vec<u8>>;
}

/// Module name of the detector SDK every host provides
pub const SDK_MODULE: &str = "Monitoring.Detector.Sdk";

/// Ambient resolver backed by a fixed set of module names
#[derive(Debug, Clone)]
pub struct StaticAmbientResolver {
    modules: HashSet<String>,
}

impl StaticAmbientResolver {
    pub fn new<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            modules: modules.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolver that only knows the SDK module
    pub fn sdk_only() -> Self {
        Self::new([SDK_MODULE])
    }
}

impl Default for StaticAmbientResolver {
    fn default() -> Self {
        Self::sdk_only()
    }
}

impl AmbientResolver for StaticAmbientResolver {
    fn resolve(&self, module_name: &str) -> Option<Vec<u8>> {
        self.modules
            .iter()
            .any(|m| m.eq_ignore_ascii_case(module_name))
            .then(Vec::new)
    }
}

/// Where a resolved module came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSource {
    Package,
    Ambient,
}

/// Load-scoped lookup over a package's modules with ambient fallback
pub struct ModuleResolver<'a> {
    content: &'a HashMap<String, Vec<u8>>,
    ambient: &'a dyn AmbientResolver,
}

impl<'a> ModuleResolver<'a> {
    pub fn new(content: &'a HashMap<String, Vec<u8>>, ambient: &'a dyn AmbientResolver) -> Self {
        Self { content, ambient }
    }

    /// Serve a module from the package, else from the ambient resolver.
    /// Returns `None` when neither knows it.
    pub fn resolve(&self, module_name: &str) -> Option<(ModuleSource, Cow<'a, [u8]>)> {
        if let Some(bytes) = self.lookup_package(module_name) {
            return Some((ModuleSource::Package, Cow::Borrowed(bytes.as_slice())));
        }
        self.ambient
            .resolve(module_name)
            .map(|bytes| (ModuleSource::Ambient, Cow::Owned(bytes)))
    }

    fn lookup_package(&self, module_name: &str) -> Option<&'a Vec<u8>> {
        self.content.get(module_name).or_else(|| {
            self.content
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(module_name))
                .map(|(_, bytes)| bytes)
        })
    }
}
