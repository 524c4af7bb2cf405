//! Serializable form of orchestrator errors
//!
//! Errors cross the isolation child's stdout and the HTTP endpoint as a
//! [`FaultDescriptor`]. Module faults only carry the original error's type
//! name and message, so the receiving side never needs that type.

use super::OrchestratorError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultDescriptor {
    /// Human-readable rendering of `error`
    pub message: String,
    /// HTTP status the error maps to
    pub status: u16,
    pub error: OrchestratorError,
}

impl FaultDescriptor {
    pub fn into_error(self) -> OrchestratorError {
        self.error
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.error, OrchestratorError::Canceled)
    }
}

/// Error body of the orchestrator endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultDescriptor>,
}

impl From<&OrchestratorError> for ErrorResponse {
    fn from(error: &OrchestratorError) -> Self {
        Self {
            error: error.to_string(),
            fault: Some(error.into()),
        }
    }
}

impl From<&OrchestratorError> for FaultDescriptor {
    fn from(error: &OrchestratorError) -> Self {
        Self {
            message: error.to_string(),
            status: error.status_code(),
            error: error.clone(),
        }
    }
}

impl From<OrchestratorError> for FaultDescriptor {
    fn from(error: OrchestratorError) -> Self {
        Self {
            message: error.to_string(),
            status: error.status_code(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::IsolationError;
    use crate::loader::{LoadError, LoadFailure};
    use crate::models::{PropertySection, ResourceType};
    use crate::presentation::PresentationError;

    fn round_trip(error: OrchestratorError) -> OrchestratorError {
        let json = serde_json::to_string(&FaultDescriptor::from(&error)).unwrap();
        let back: FaultDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, error.status_code());
        back.into_error()
    }

    #[test]
    fn test_every_variant_survives_the_boundary() {
        let errors = vec![
            OrchestratorError::InvalidRequest {
                message: "no resources".to_string(),
            },
            OrchestratorError::PackageNotFound {
                detector_id: "cpu".to_string(),
            },
            OrchestratorError::Repository {
                message: "disk full".to_string(),
            },
            OrchestratorError::Load(LoadError {
                detector_id: "cpu".to_string(),
                failure: LoadFailure::OpenGenericType {
                    type_name: "Acme.Gen`1".to_string(),
                },
            }),
            OrchestratorError::Presentation(PresentationError::MissingQueryRunInfo {
                alert_type: "A".to_string(),
                field: "Chart".to_string(),
                section: PropertySection::Chart,
            }),
            OrchestratorError::IncompatibleResourceTypes {
                resource_id: "/subscriptions/s".to_string(),
                requested: ResourceType::Subscription,
                supported: vec![ResourceType::AppService],
            },
            OrchestratorError::UnidentifiedAlertResource {
                alert_type: "A".to_string(),
                resource_id: "/subscriptions/other".to_string(),
            },
            OrchestratorError::ModuleFault {
                type_name: "std::io::Error".to_string(),
                message: "connection reset".to_string(),
            },
            OrchestratorError::Canceled,
            OrchestratorError::Isolation(IsolationError::ChildProcess {
                exit_code: Some(134),
                stderr: "abort".to_string(),
            }),
        ];

        for error in errors {
            assert_eq!(round_trip(error.clone()), error);
        }
    }

    #[test]
    fn test_module_fault_wire_shape() {
        let fault = FaultDescriptor::from(OrchestratorError::ModuleFault {
            type_name: "acme::QuotaExceeded".to_string(),
            message: "quota exceeded".to_string(),
        });
        let json = serde_json::to_value(&fault).unwrap();

        assert_eq!(json["status"], 500);
        assert_eq!(json["error"]["kind"], "module_fault");
        assert_eq!(json["error"]["type_name"], "acme::QuotaExceeded");
        assert!(!fault.is_canceled());
        assert!(FaultDescriptor::from(OrchestratorError::Canceled).is_canceled());
    }
}
