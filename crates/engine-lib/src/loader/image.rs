//! Module image format
//!
//! A module image is the descriptor shipped as a package's entry assembly.
//! It lists the types the module exports with the shape information the
//! loader validates, and the names of the modules it depends on.

use serde::{Deserialize, Serialize};

/// Marker used in type names for generic arity (`List`1`)
const GENERIC_ARITY_MARKER: char = '`';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Internal,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constructor {
    pub visibility: Visibility,
    #[serde(default)]
    pub parameters: Vec<String>,
}

impl Constructor {
    pub fn public_default() -> Self {
        Self {
            visibility: Visibility::Public,
            parameters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeExport {
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub generic_parameters: Vec<String>,
    #[serde(default)]
    pub constructors: Vec<Constructor>,
}

impl TypeExport {
    /// A concrete type implementing `interface` with a public default constructor
    pub fn concrete(name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: vec![interface.into()],
            is_abstract: false,
            generic_parameters: Vec::new(),
            constructors: vec![Constructor::public_default()],
        }
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }

    pub fn is_open_generic(&self) -> bool {
        !self.generic_parameters.is_empty() || self.name.contains(GENERIC_ARITY_MARKER)
    }

    pub fn has_public_default_constructor(&self) -> bool {
        self.constructors
            .iter()
            .any(|c| c.visibility == Visibility::Public && c.parameters.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleImage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub exports: Vec<TypeExport>,
    #[serde(default)]
    pub references: Vec<String>,
}

impl ModuleImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing plain strings and vectors cannot fail
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    pub fn find_type(&self, name: &str) -> Option<&TypeExport> {
        self.exports.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_image() {
        let json = br#"{
            "name": "Cpu.Detector",
            "exports": [{ "name": "Cpu.Detector.HighCpu", "interfaces": ["IDetector"],
                          "constructors": [{ "visibility": "public" }] }]
        }"#;
        let image = ModuleImage::parse(json).unwrap();
        let export = image.find_type("Cpu.Detector.HighCpu").unwrap();

        assert!(export.implements("IDetector"));
        assert!(!export.is_abstract);
        assert!(!export.is_open_generic());
        assert!(export.has_public_default_constructor());
        assert!(image.references.is_empty());
    }

    #[test]
    fn test_open_generic_detection() {
        let mut export = TypeExport::concrete("Wrapper`1", "IDetector");
        assert!(export.is_open_generic());

        export.name = "Wrapper".to_string();
        export.generic_parameters = vec!["T".to_string()];
        assert!(export.is_open_generic());
    }

    #[test]
    fn test_constructor_requirements() {
        let mut export = TypeExport::concrete("A", "IDetector");
        export.constructors = vec![Constructor {
            visibility: Visibility::Public,
            parameters: vec!["ILogger".to_string()],
        }];
        assert!(!export.has_public_default_constructor());

        export.constructors = vec![Constructor {
            visibility: Visibility::Internal,
            parameters: Vec::new(),
        }];
        assert!(!export.has_public_default_constructor());
    }
}
