//! FDC3 context records built from FHIR resources.
//!
//! Serializing a [`ClinicalFact`] yields the exact broadcast payload, with the
//! `type` tag selecting the context kind. Optional fields absent from the
//! source resource are omitted from the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource mapping failures
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("{resource} is missing {field}")]
    MissingField {
        resource: &'static str,
        field: &'static str,
    },

    #[error("{0} response has an unexpected shape")]
    UnexpectedShape(&'static str),
}

/// FDC3 identifier wrapper: `{ "value": "..." }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextId {
    pub value: String,
}

impl ContextId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// One normalized clinical record, ready to broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClinicalFact {
    #[serde(rename = "fdc3.patient")]
    Patient(PatientFact),
    #[serde(rename = "fdc3.appointment")]
    Appointment(AppointmentFact),
    #[serde(rename = "fdc3.condition")]
    Condition(ConditionFact),
    #[serde(rename = "fdc3.diagnosticReport")]
    DiagnosticReport(DiagnosticReportFact),
}

impl ClinicalFact {
    /// The FDC3 context type
    pub fn context_type(&self) -> &'static str {
        match self {
            ClinicalFact::Patient(_) => "fdc3.patient",
            ClinicalFact::Appointment(_) => "fdc3.appointment",
            ClinicalFact::Condition(_) => "fdc3.condition",
            ClinicalFact::DiagnosticReport(_) => "fdc3.diagnosticReport",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ClinicalFact::Patient(f) => &f.id.value,
            ClinicalFact::Appointment(f) => &f.id.value,
            ClinicalFact::Condition(f) => &f.id.value,
            ClinicalFact::DiagnosticReport(f) => &f.id.value,
        }
    }

    /// Serialize to the wire payload
    pub fn to_context(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientFact {
    pub id: ContextId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentFact {
    pub id: ContextId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionFact {
    pub id: ContextId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encounter: Option<String>,
    #[serde(rename = "recordedDate", default, skip_serializing_if = "Option::is_none")]
    pub recorded_date: Option<String>,
}

/// First coding of a report's `code`, plus its `text`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReportFact {
    pub id: ContextId,
    pub code: ReportCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encounter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Present and not JSON `null`
fn object_field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key).filter(|v| !v.is_null())
}

fn resource_id(resource: &Value) -> ContextId {
    ContextId::new(str_field(resource, "id").unwrap_or_default())
}

impl AppointmentFact {
    pub fn from_resource(resource: &Value) -> Self {
        Self {
            id: resource_id(resource),
            status: str_field(resource, "status"),
            start: str_field(resource, "start"),
            end: str_field(resource, "end"),
        }
    }
}

impl ConditionFact {
    /// `code` and `encounter` must be present; their `text` / `reference`
    /// may not be.
    pub fn from_resource(resource: &Value) -> Result<Self, MappingError> {
        let code = object_field(resource, "code").ok_or(MappingError::MissingField {
            resource: "Condition",
            field: "code",
        })?;
        let encounter = object_field(resource, "encounter").ok_or(MappingError::MissingField {
            resource: "Condition",
            field: "encounter",
        })?;

        Ok(Self {
            id: resource_id(resource),
            code: str_field(code, "text"),
            encounter: str_field(encounter, "reference"),
            recorded_date: str_field(resource, "recordedDate"),
        })
    }
}

impl DiagnosticReportFact {
    pub fn from_resource(resource: &Value) -> Result<Self, MappingError> {
        let missing = |field| MappingError::MissingField {
            resource: "DiagnosticReport",
            field,
        };

        let code = object_field(resource, "code").ok_or_else(|| missing("code"))?;
        let coding = code
            .get("coding")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .filter(|c| !c.is_null())
            .ok_or_else(|| missing("code.coding[0]"))?;
        let encounter = object_field(resource, "encounter").ok_or_else(|| missing("encounter"))?;

        Ok(Self {
            id: resource_id(resource),
            code: ReportCode {
                system: str_field(coding, "system"),
                code: str_field(coding, "code"),
                display: str_field(coding, "display"),
                text: str_field(code, "text"),
            },
            encounter: str_field(encounter, "reference"),
            status: str_field(resource, "status"),
        })
    }
}
