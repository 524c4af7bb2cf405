//! Detector plugin loading
//!
//! Validates a detector package against the module image it ships and
//! instantiates the entry point from the host's [`DetectorCatalog`].
//! Validation fails fast, in order:
//! 1. the package contains the manifest's entry module
//! 2. the module exports the entry point type
//! 3. the type implements the detector capability
//! 4. the type is not abstract
//! 5. the type is not an open generic definition
//! 6. the type has a public zero-argument constructor

mod catalog;
mod image;
mod resolver;

pub use catalog::DetectorCatalog;
pub use image::{Constructor, ModuleImage, TypeExport, Visibility};
pub use resolver::{
    AmbientResolver, ModuleResolver, ModuleSource, StaticAmbientResolver, SDK_MODULE,
};

use crate::detector::Detector;
use crate::models::{DetectorManifest, DetectorPackage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Reason a package failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadFailure {
    #[error("package does not contain entry module '{module}'")]
    MissingEntryModule { module: String },

    #[error("entry module '{module}' is not a valid module image: {message}")]
    MalformedModule { module: String, message: String },

    #[error("entry module does not export type '{type_name}'")]
    EntryPointNotFound { type_name: String },

    #[error("type '{type_name}' does not implement {capability}")]
    MissingCapability {
        type_name: String,
        capability: String,
    },

    #[error("type '{type_name}' is abstract")]
    AbstractType { type_name: String },

    #[error("type '{type_name}' is an open generic definition")]
    OpenGenericType { type_name: String },

    #[error("type '{type_name}' has no public parameterless constructor")]
    NoDefaultConstructor { type_name: String },

    #[error("dependency '{module}' could not be resolved")]
    UnresolvedDependency { module: String },

    #[error("type '{type_name}' is not available in this host")]
    NotInstantiable { type_name: String },
}

/// A package failed to load
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("failed to load detector {detector_id}: {failure}")]
pub struct LoadError {
    pub detector_id: String,
    pub failure: LoadFailure,
}

/// A validated, constructed detector
#[derive(Clone)]
pub struct LoadedDetector {
    pub manifest: DetectorManifest,
    pub detector: Arc<dyn Detector>,
}

impl std::fmt::Debug for LoadedDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedDetector")
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

/// Loads detector packages
pub struct PluginLoader {
    catalog: Arc<DetectorCatalog>,
    ambient: Arc<dyn AmbientResolver>,
}

impl PluginLoader {
    pub fn new(catalog: Arc<DetectorCatalog>, ambient: Arc<dyn AmbientResolver>) -> Self {
        Self { catalog, ambient }
    }

    /// Loader resolving only the SDK from the host
    pub fn with_catalog(catalog: DetectorCatalog) -> Self {
        Self::new(Arc::new(catalog), Arc::new(StaticAmbientResolver::sdk_only()))
    }

    pub fn catalog(&self) -> &DetectorCatalog {
        &self.catalog
    }

    pub fn load(&self, package: &DetectorPackage) -> Result<LoadedDetector, LoadError> {
        let manifest = &package.manifest;
        let fail = |failure: LoadFailure| LoadError {
            detector_id: manifest.id.clone(),
            failure,
        };

        let image = Self::entry_image(package).map_err(fail)?;
        let export = Self::validate_entry_point(&image, &manifest.entry_point_ref).map_err(fail)?;

        let resolver = ModuleResolver::new(&package.content, self.ambient.as_ref());
        for reference in &image.references {
            match resolver.resolve(reference) {
                Some((source, _)) => {
                    debug!(
                        detector_id = %manifest.id,
                        module = %reference,
                        source = ?source,
                        "Resolved detector dependency"
                    );
                }
                None => {
                    return Err(fail(LoadFailure::UnresolvedDependency {
                        module: reference.clone(),
                    }))
                }
            }
        }

        let detector = self.catalog.instantiate(&export.name).ok_or_else(|| {
            fail(LoadFailure::NotInstantiable {
                type_name: export.name.clone(),
            })
        })?;

        Ok(LoadedDetector {
            manifest: manifest.clone(),
            detector,
        })
    }

    fn entry_image(package: &DetectorPackage) -> Result<ModuleImage, LoadFailure> {
        let module = &package.manifest.assembly_ref;
        let bytes = package
            .content
            .get(module)
            .ok_or_else(|| LoadFailure::MissingEntryModule {
                module: module.clone(),
            })?;

        ModuleImage::parse(bytes).map_err(|e| LoadFailure::MalformedModule {
            module: module.clone(),
            message: e.to_string(),
        })
    }

    fn validate_entry_point<'i>(
        image: &'i ModuleImage,
        entry_point: &str,
    ) -> Result<&'i TypeExport, LoadFailure> {
        let export = image
            .find_type(entry_point)
            .ok_or_else(|| LoadFailure::EntryPointNotFound {
                type_name: entry_point.to_string(),
            })?;

        let type_name = export.name.clone();
        if !export.implements(DetectorCatalog::CAPABILITY) {
            return Err(LoadFailure::MissingCapability {
                type_name,
                capability: DetectorCatalog::CAPABILITY.to_string(),
            });
        }
        if export.is_abstract {
            return Err(LoadFailure::AbstractType { type_name });
        }
        if export.is_open_generic() {
            return Err(LoadFailure::OpenGenericType { type_name });
        }
        if !export.has_public_default_constructor() {
            return Err(LoadFailure::NoDefaultConstructor { type_name });
        }
        Ok(export)
    }
}

#[cfg(test)]
mod tests;
