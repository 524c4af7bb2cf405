//! Validation tests for the plugin loader

use super::*;
use crate::detector::{AnalysisContext, AnalysisRequest, ModuleError};
use crate::models::ResourceType;
use crate::presentation::RawAlert;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::thread;
use std::time::Duration;

const MODULE: &str = "Acme.Detectors";
const ENTRY: &str = "Acme.Detectors.Quiet";

#[derive(Default)]
struct QuietDetector;

#[async_trait]
impl Detector for QuietDetector {
    async fn analyze(
        &self,
        _request: AnalysisRequest,
        _ctx: AnalysisContext,
    ) -> Result<Vec<Box<dyn RawAlert>>, ModuleError> {
        Ok(Vec::new())
    }
}

fn manifest() -> DetectorManifest {
    DetectorManifest {
        id: "quiet".to_string(),
        name: "Quiet".to_string(),
        description: String::new(),
        version: semver::Version::new(1, 0, 0),
        assembly_ref: MODULE.to_string(),
        entry_point_ref: ENTRY.to_string(),
        supported_resource_types: BTreeSet::from([ResourceType::VirtualMachine]),
        supported_cadences: BTreeSet::from([Duration::from_secs(300)]),
    }
}

fn image_with(export: TypeExport) -> ModuleImage {
    ModuleImage {
        name: MODULE.to_string(),
        version: None,
        exports: vec![export],
        references: vec![SDK_MODULE.to_string()],
    }
}

fn package_with(image: &ModuleImage) -> DetectorPackage {
    let mut content = HashMap::new();
    content.insert(MODULE.to_string(), image.to_bytes());
    DetectorPackage {
        manifest: manifest(),
        content,
    }
}

fn valid_export() -> TypeExport {
    TypeExport::concrete(ENTRY, DetectorCatalog::CAPABILITY)
}

fn loader() -> PluginLoader {
    let mut catalog = DetectorCatalog::new();
    catalog.register::<QuietDetector>(ENTRY).unwrap();
    PluginLoader::with_catalog(catalog)
}

fn failure_of(package: &DetectorPackage) -> LoadFailure {
    let err = loader().load(package).unwrap_err();
    assert_eq!(err.detector_id, "quiet");
    err.failure
}

#[test]
fn test_valid_package_loads() {
    let loaded = loader().load(&package_with(&image_with(valid_export()))).unwrap();
    assert_eq!(loaded.manifest.id, "quiet");
}

#[test]
fn test_missing_entry_module() {
    let mut package = package_with(&image_with(valid_export()));
    package.content.clear();

    assert!(matches!(
        failure_of(&package),
        LoadFailure::MissingEntryModule { .. }
    ));
}

#[test]
fn test_malformed_entry_module() {
    let mut package = package_with(&image_with(valid_export()));
    package
        .content
        .insert(MODULE.to_string(), b"\x7fELF not json".to_vec());

    assert!(matches!(
        failure_of(&package),
        LoadFailure::MalformedModule { .. }
    ));
}

#[test]
fn test_entry_point_not_exported() {
    let mut export = valid_export();
    export.name = "Acme.Detectors.Other".to_string();

    assert!(matches!(
        failure_of(&package_with(&image_with(export))),
        LoadFailure::EntryPointNotFound { .. }
    ));
}

#[test]
fn test_missing_capability() {
    let mut export = valid_export();
    export.interfaces = vec!["IDisposable".to_string()];

    assert!(matches!(
        failure_of(&package_with(&image_with(export))),
        LoadFailure::MissingCapability { .. }
    ));
}

#[test]
fn test_abstract_type_rejected() {
    let mut export = valid_export();
    export.is_abstract = true;

    assert!(matches!(
        failure_of(&package_with(&image_with(export))),
        LoadFailure::AbstractType { .. }
    ));
}

#[test]
fn test_open_generic_rejected() {
    let mut export = valid_export();
    export.generic_parameters = vec!["TAlert".to_string()];

    assert!(matches!(
        failure_of(&package_with(&image_with(export))),
        LoadFailure::OpenGenericType { .. }
    ));
}

#[test]
fn test_missing_default_constructor_rejected() {
    let mut export = valid_export();
    export.constructors = vec![Constructor {
        visibility: Visibility::Public,
        parameters: vec!["System.String".to_string()],
    }];

    assert!(matches!(
        failure_of(&package_with(&image_with(export))),
        LoadFailure::NoDefaultConstructor { .. }
    ));
}

#[test]
fn test_validation_order_is_fail_fast() {
    // Abstract and missing a constructor: the abstract check comes first
    let mut export = valid_export();
    export.is_abstract = true;
    export.constructors.clear();

    assert!(matches!(
        failure_of(&package_with(&image_with(export))),
        LoadFailure::AbstractType { .. }
    ));
}

#[test]
fn test_dependencies_resolved_from_package_or_ambient() {
    let mut image = image_with(valid_export());
    image.references.push("Acme.Shared".to_string());

    let mut package = package_with(&image);
    assert!(matches!(
        failure_of(&package),
        LoadFailure::UnresolvedDependency { module } if module == "Acme.Shared"
    ));

    package
        .content
        .insert("Acme.Shared".to_string(), b"{}".to_vec());
    assert!(loader().load(&package).is_ok());
}

#[test]
fn test_type_without_registered_constructor() {
    let package = package_with(&image_with(valid_export()));
    let loader = PluginLoader::with_catalog(DetectorCatalog::new());

    let err = loader.load(&package).unwrap_err();
    assert!(matches!(err.failure, LoadFailure::NotInstantiable { .. }));
}

#[test]
fn test_concurrent_loads_are_independent() {
    let loader = Arc::new(loader());
    let good = package_with(&image_with(valid_export()));
    let mut bad_image = image_with(valid_export());
    bad_image.references.push("Only.In.Good".to_string());
    let bad = package_with(&bad_image);
    let mut good_with_dep = package_with(&bad_image);
    good_with_dep
        .content
        .insert("Only.In.Good".to_string(), Vec::new());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let loader = loader.clone();
            let package = if i % 2 == 0 {
                good_with_dep.clone()
            } else {
                bad.clone()
            };
            thread::spawn(move || loader.load(&package).is_ok())
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), i % 2 == 0);
    }
    assert!(loader.load(&good).is_ok());
}

#[test]
fn test_load_error_round_trips_as_json() {
    let err = LoadError {
        detector_id: "quiet".to_string(),
        failure: LoadFailure::AbstractType {
            type_name: ENTRY.to_string(),
        },
    };
    let json = serde_json::to_string(&err).unwrap();
    let back: LoadError = serde_json::from_str(&json).unwrap();
    assert_eq!(back, err);
    assert!(err.to_string().contains("abstract"));
}
