//! Patient identity as seen by the context bridge.

use serde_json::Value;

use crate::facts::{ClinicalFact, ContextId, PatientFact};

/// Display name used when a patient has no `name` entries
pub const UNKNOWN_NAME: &str = "Unknown Name";

/// The in-context patient, derived once per Patient read.
///
/// `id` is the only field that takes part in change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientIdentity {
    pub id: String,
    pub display_name: String,
    pub gender: Option<String>,
    pub birth_date: Option<String>,
}

impl PatientIdentity {
    /// Build from a raw FHIR Patient resource
    pub fn from_resource(resource: &Value) -> Self {
        let names = resource["name"].as_array().map(Vec::as_slice);

        Self {
            id: resource["id"].as_str().unwrap_or("").to_string(),
            display_name: patient_display_name(names),
            gender: resource["gender"].as_str().map(str::to_string),
            birth_date: resource["birthDate"].as_str().map(str::to_string),
        }
    }

    /// Same patient, regardless of how the other fields compare
    pub fn is_same_patient(&self, other: &PatientIdentity) -> bool {
        self.id == other.id
    }

    pub fn to_fact(&self) -> ClinicalFact {
        ClinicalFact::Patient(PatientFact {
            id: ContextId::new(self.id.clone()),
            name: self.display_name.clone(),
        })
    }
}

/// Resolve a FHIR `HumanName` list to a display string.
///
/// Prefers the `official` entry, falling back to the first. Given names are
/// space-joined and followed by the family name; either part may be empty.
pub fn patient_display_name(names: Option<&[Value]>) -> String {
    let names = match names {
        Some(names) if !names.is_empty() => names,
        _ => return UNKNOWN_NAME.to_string(),
    };

    let chosen = names
        .iter()
        .find(|n| n["use"].as_str() == Some("official"))
        .unwrap_or(&names[0]);

    let given = chosen["given"]
        .as_array()
        .map(|g| g.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    let family = chosen["family"].as_str().unwrap_or("");

    format!("{} {}", given, family)
}
