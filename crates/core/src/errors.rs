use thiserror::Error;

use crate::audit::AuditError;
use crate::config::ConfigError;
use crate::memory::MemoryError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown tool `{0}`")]
    ToolNotFound(String),
    #[error("principal `{principal_id}` may not use `{resource}`")]
    PermissionDenied { principal_id: String, resource: String },
    #[error("capability `{0}` is not supported by the configured backend")]
    Unsupported(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<MemoryError> for ApplicationError {
    fn from(value: MemoryError) -> Self {
        match value {
            MemoryError::Unsupported(capability) => {
                Self::Domain(DomainError::Unsupported(capability.to_string()))
            }
            MemoryError::InvalidInput(message) => {
                Self::Domain(DomainError::InvariantViolation(message))
            }
            MemoryError::Embedding(message) => Self::Integration(message),
            MemoryError::Backend(message) => Self::Persistence(message),
        }
    }
}

impl From<AuditError> for ApplicationError {
    fn from(value: AuditError) -> Self {
        match value {
            AuditError::Unsupported(capability) => {
                Self::Domain(DomainError::Unsupported(capability.to_string()))
            }
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<ConfigError> for ApplicationError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You do not have access to this operation.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::PermissionDenied { .. }) => Self::Forbidden {
                message: "access denied".to_owned(),
                correlation_id: unassigned(),
            },
            ApplicationError::Domain(DomainError::ToolNotFound(_))
            | ApplicationError::Domain(DomainError::InvariantViolation(_)) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: unassigned(),
            },
            ApplicationError::Domain(DomainError::Unsupported(capability)) => {
                Self::ServiceUnavailable {
                    message: format!("{capability} unsupported"),
                    correlation_id: unassigned(),
                }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{ApplicationError, DomainError, InterfaceError};
    use crate::memory::MemoryError;

    #[test]
    fn invariant_violation_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(DomainError::InvariantViolation(
            "missing required field".to_owned(),
        ))
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn permission_denied_maps_to_forbidden_without_leaking_resource() {
        let interface = ApplicationError::from(DomainError::PermissionDenied {
            principal_id: "u-7".to_owned(),
            resource: "export_all_data".to_owned(),
        })
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::Forbidden { .. }));
        assert_eq!(interface.correlation_id(), "req-2");
        assert!(!interface.user_message().contains("export_all_data"));
    }

    #[test]
    fn unsupported_memory_capability_is_distinct_from_backend_failure() {
        let unsupported = ApplicationError::from(MemoryError::Unsupported("recent_text"));
        let backend = ApplicationError::from(MemoryError::Backend("disk full".to_owned()));

        assert_eq!(unsupported, ApplicationError::Domain(DomainError::Unsupported(
            "recent_text".to_owned()
        )));
        assert_eq!(backend, ApplicationError::Persistence("disk full".to_owned()));
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface = ApplicationError::Configuration("invalid signing key".to_owned())
            .into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}
