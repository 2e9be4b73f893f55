//! System service requirements checked at the end of bootstrap.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::service::ServiceRegistry;

/// How badly the kernel needs a well-known service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceCriticality {
    /// Missing at bootstrap is fatal
    Required,
    /// Missing at bootstrap degrades the kernel with a warning
    Core,
    /// Never checked
    Optional,
}

impl fmt::Display for ServiceCriticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceCriticality::Required => write!(f, "required"),
            ServiceCriticality::Core => write!(f, "core"),
            ServiceCriticality::Optional => write!(f, "optional"),
        }
    }
}

/// Well-known service names and their criticality. Names not listed are
/// optional.
pub const SYSTEM_SERVICE_REQUIREMENTS: &[(&str, ServiceCriticality)] = &[
    ("metadata", ServiceCriticality::Required),
    ("data", ServiceCriticality::Required),
    ("auth", ServiceCriticality::Core),
    ("cache", ServiceCriticality::Core),
    ("queue", ServiceCriticality::Core),
    ("job", ServiceCriticality::Core),
    ("realtime", ServiceCriticality::Core),
];

/// Criticality of `name` according to [`SYSTEM_SERVICE_REQUIREMENTS`].
pub fn criticality(name: &str) -> ServiceCriticality {
    SYSTEM_SERVICE_REQUIREMENTS
        .iter()
        .find(|(service, _)| *service == name)
        .map(|(_, level)| *level)
        .unwrap_or(ServiceCriticality::Optional)
}

/// Missing well-known services, grouped by criticality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub missing_required: Vec<String>,
    pub missing_core: Vec<String>,
}

impl ValidationReport {
    pub fn is_fatal(&self) -> bool {
        !self.missing_required.is_empty()
    }
}

pub fn validate_system_services(registry: &ServiceRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (name, level) in SYSTEM_SERVICE_REQUIREMENTS {
        if registry.has(name) {
            continue;
        }
        match level {
            ServiceCriticality::Required => report.missing_required.push(name.to_string()),
            ServiceCriticality::Core => report.missing_core.push(name.to_string()),
            ServiceCriticality::Optional => {}
        }
    }
    report
}
