//! Alert field metadata declared by detector modules
//!
//! Detector alert structs implement [`AlertRecord`], which pairs a static
//! field schema with the instance's field values. The blanket impl turns
//! every record into the object-safe [`RawAlert`] the engine consumes.

use crate::models::{PropertySection, ResourceIdentifier};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Sortable universal timestamp format used when rendering fields
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";

/// A typed field value of a raw alert
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Render the value as text; `Null` renders empty
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// How a presentation field is displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationSpec {
    pub section: PropertySection,
    /// Display title; `{FieldName}` placeholders are interpolated
    pub title: &'static str,
    /// Optional help text; interpolated like `title`
    pub info: Option<&'static str>,
    pub order: u32,
}

/// Metadata for one alert field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: &'static str,
    pub predicate: bool,
    pub presentation: Option<PresentationSpec>,
}

impl FieldSchema {
    /// An untagged field, kept only in the raw properties
    pub const fn plain(name: &'static str) -> Self {
        Self {
            name,
            predicate: false,
            presentation: None,
        }
    }

    /// A field used for correlation
    pub const fn predicate(name: &'static str) -> Self {
        Self {
            name,
            predicate: true,
            presentation: None,
        }
    }

    /// A displayed field
    pub const fn presented(
        name: &'static str,
        section: PropertySection,
        title: &'static str,
        order: u32,
    ) -> Self {
        Self {
            name,
            predicate: false,
            presentation: Some(PresentationSpec {
                section,
                title,
                info: None,
                order,
            }),
        }
    }

    /// Also use this field for correlation
    pub const fn and_predicate(mut self) -> Self {
        self.predicate = true;
        self
    }

    /// Attach info text to a presented field
    pub const fn with_info(mut self, info: &'static str) -> Self {
        if let Some(mut spec) = self.presentation {
            spec.info = Some(info);
            self.presentation = Some(spec);
        }
        self
    }
}

/// Alert type emitted by detector code
pub trait AlertRecord: Serialize + Send + Sync + 'static {
    /// Stable type name, used in alert ids and metrics
    const TYPE_NAME: &'static str;

    fn title(&self) -> String;

    fn resource_identifier(&self) -> &ResourceIdentifier;

    /// Field metadata, identical for every instance of the type
    fn schema() -> &'static [FieldSchema];

    /// Field values of this instance keyed by field name
    fn fields(&self) -> Vec<(&'static str, FieldValue)>;
}

/// Object-safe view of a raw alert
pub trait RawAlert: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn title(&self) -> String;

    fn resource_identifier(&self) -> &ResourceIdentifier;

    fn schema(&self) -> &'static [FieldSchema];

    fn fields(&self) -> Vec<(&'static str, FieldValue)>;

    /// Stable JSON serialization of the instance
    fn serialized(&self) -> serde_json::Result<String>;
}

impl<T: AlertRecord> RawAlert for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn title(&self) -> String {
        AlertRecord::title(self)
    }

    fn resource_identifier(&self) -> &ResourceIdentifier {
        AlertRecord::resource_identifier(self)
    }

    fn schema(&self) -> &'static [FieldSchema] {
        T::schema()
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        AlertRecord::fields(self)
    }

    fn serialized(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Debug for dyn RawAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawAlert")
            .field("type_name", &self.type_name())
            .field("resource", &self.resource_identifier().to_string())
            .finish()
    }
}
