//! The authorized launch session and the queries issued through it.

use async_trait::async_trait;
use serde_json::Value;

use crate::storage::StoreError;

/// Errors raised by session reads and queries
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No patient in launch context")]
    NoPatientContext,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Access denied to resource: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Failed to save session state: {0}")]
    Storage(#[from] StoreError),
}

/// How one clinical resource kind is queried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceQuerySpec {
    pub resource_type: &'static str,
    /// Maximum number of result pages to fetch; 0 means all
    pub page_limit: u32,
    /// Return the entries' resources as one flat array instead of bundles
    pub flat: bool,
}

pub const APPOINTMENT_QUERY: ResourceQuerySpec = ResourceQuerySpec {
    resource_type: "Appointment",
    page_limit: 1,
    flat: false,
};

pub const CONDITION_QUERY: ResourceQuerySpec = ResourceQuerySpec {
    resource_type: "Condition",
    page_limit: 1,
    flat: true,
};

pub const DIAGNOSTIC_REPORT_QUERY: ResourceQuerySpec = ResourceQuerySpec {
    resource_type: "DiagnosticReport",
    page_limit: 1,
    flat: false,
};

/// An authorized, patient-scoped session.
///
/// Produced by the authorization helper and owned by the launch controller;
/// everything downstream borrows it.
#[async_trait]
pub trait LaunchSession: Send + Sync {
    /// Patient id granted by the launch context
    fn patient_id(&self) -> Option<&str>;

    /// Read the in-context Patient resource
    async fn read_patient(&self) -> Result<Value, SessionError>;

    /// Search `query.resource_type` within the patient compartment
    async fn request(&self, query: &ResourceQuerySpec) -> Result<Value, SessionError>;

    /// Serializable snapshot of the session (server, client, token response)
    async fn state(&self) -> Value;
}
