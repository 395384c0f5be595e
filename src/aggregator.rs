//! Clinical data aggregation for the in-context patient.
//!
//! A pass runs four steps strictly one after another: patient, appointments,
//! conditions, diagnostic reports. Each step logs its own failure and hands
//! it back, and the pass stops at the first one. Later resource kinds are not
//! queried once an earlier step has failed.

use serde_json::Value;
use tracing::{debug, error, info};

use crate::broadcast::{BroadcastGateway, BusError};
use crate::facts::{
    AppointmentFact, ClinicalFact, ConditionFact, DiagnosticReportFact, MappingError,
};
use crate::patient::PatientIdentity;
use crate::session::{
    LaunchSession, SessionError, APPOINTMENT_QUERY, CONDITION_QUERY, DIAGNOSTIC_REPORT_QUERY,
};

/// The named steps of a pass, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStep {
    Patient,
    Appointments,
    Conditions,
    DiagnosticReports,
}

impl std::fmt::Display for PassStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PassStep::Patient => "patient",
            PassStep::Appointments => "appointments",
            PassStep::Conditions => "conditions",
            PassStep::DiagnosticReports => "diagnostic reports",
        };
        f.write_str(name)
    }
}

/// A failed step; the rest of the pass was skipped
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("Error fetching {step}: {source}")]
    Query {
        step: PassStep,
        #[source]
        source: SessionError,
    },

    #[error("Error reading {step}: {source}")]
    Mapping {
        step: PassStep,
        #[source]
        source: MappingError,
    },

    #[error("Error broadcasting {step}: {source}")]
    Broadcast {
        step: PassStep,
        #[source]
        source: BusError,
    },
}

impl PassError {
    pub fn step(&self) -> PassStep {
        match self {
            PassError::Query { step, .. }
            | PassError::Mapping { step, .. }
            | PassError::Broadcast { step, .. } => *step,
        }
    }
}

/// Facts broadcast by a completed pass, per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub patients: usize,
    pub appointments: usize,
    pub conditions: usize,
    pub diagnostic_reports: usize,
}

impl PassSummary {
    pub fn total(&self) -> usize {
        self.patients + self.appointments + self.conditions + self.diagnostic_reports
    }
}

pub struct ClinicalDataAggregator {
    gateway: BroadcastGateway,
}

impl ClinicalDataAggregator {
    pub fn new(gateway: BroadcastGateway) -> Self {
        Self { gateway }
    }

    /// Run one pass for `identity`.
    pub async fn run_pass(
        &self,
        session: &dyn LaunchSession,
        identity: &PatientIdentity,
    ) -> Result<PassSummary, PassError> {
        let patients = self.broadcast_patient(identity).await.inspect_err(log_failure)?;
        let appointments = self.check_appointments(session).await.inspect_err(log_failure)?;
        let conditions = self.check_conditions(session).await.inspect_err(log_failure)?;
        let diagnostic_reports = self
            .check_diagnostic_reports(session)
            .await
            .inspect_err(log_failure)?;

        let summary = PassSummary {
            patients,
            appointments,
            conditions,
            diagnostic_reports,
        };
        info!("Broadcast {} facts for patient {}", summary.total(), identity.id);
        Ok(summary)
    }

    async fn broadcast_patient(&self, identity: &PatientIdentity) -> Result<usize, PassError> {
        self.send(PassStep::Patient, &identity.to_fact()).await?;
        Ok(1)
    }

    async fn check_appointments(&self, session: &dyn LaunchSession) -> Result<usize, PassError> {
        let step = PassStep::Appointments;
        info!("Fetching appointments for the current patient...");
        let response = query(step, session.request(&APPOINTMENT_QUERY).await)?;
        debug!("Response from Appointment request: {}", response);

        // Map every entry before broadcasting any of them
        let appointments = bundle_resources(&response, "Appointment", false)
            .map_err(|source| PassError::Mapping { step, source })?
            .into_iter()
            .map(|r| ClinicalFact::Appointment(AppointmentFact::from_resource(r)))
            .collect::<Vec<_>>();

        for appointment in &appointments {
            self.send(step, appointment).await?;
        }
        Ok(appointments.len())
    }

    async fn check_conditions(&self, session: &dyn LaunchSession) -> Result<usize, PassError> {
        let step = PassStep::Conditions;
        info!("Fetching conditions for the current patient...");
        let response = query(step, session.request(&CONDITION_QUERY).await)?;
        debug!("Response from Condition request: {}", response);

        let conditions = response
            .as_array()
            .ok_or(PassError::Mapping {
                step,
                source: MappingError::UnexpectedShape("Condition"),
            })?;

        for resource in conditions {
            let fact = ConditionFact::from_resource(resource)
                .map_err(|source| PassError::Mapping { step, source })?;
            self.send(step, &ClinicalFact::Condition(fact)).await?;
        }
        Ok(conditions.len())
    }

    async fn check_diagnostic_reports(&self, session: &dyn LaunchSession) -> Result<usize, PassError> {
        let step = PassStep::DiagnosticReports;
        info!("Fetching diagnostic reports for the current patient...");
        let response = query(step, session.request(&DIAGNOSTIC_REPORT_QUERY).await)?;

        let reports = bundle_resources(&response, "DiagnosticReport", true)
            .map_err(|source| PassError::Mapping { step, source })?;

        for resource in &reports {
            let fact = DiagnosticReportFact::from_resource(resource)
                .map_err(|source| PassError::Mapping { step, source })?;
            self.send(step, &ClinicalFact::DiagnosticReport(fact)).await?;
        }
        debug!("Response from DiagnosticReport request: {}", response);
        Ok(reports.len())
    }

    async fn send(&self, step: PassStep, fact: &ClinicalFact) -> Result<(), PassError> {
        self.gateway
            .send(fact)
            .await
            .map_err(|source| PassError::Broadcast { step, source })
    }
}

fn log_failure(e: &PassError) {
    error!("{}", e);
}

fn query(step: PassStep, result: Result<Value, SessionError>) -> Result<Value, PassError> {
    result.map_err(|source| PassError::Query { step, source })
}

/// `entry[].resource` of a search bundle.
///
/// With `require_entry` unset a bundle without `entry` is an empty result.
fn bundle_resources<'a>(
    bundle: &'a Value,
    resource: &'static str,
    require_entry: bool,
) -> Result<Vec<&'a Value>, MappingError> {
    let entries = match bundle.get("entry").filter(|e| !e.is_null()) {
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(MappingError::UnexpectedShape(resource)),
        None if require_entry => {
            return Err(MappingError::MissingField {
                resource,
                field: "entry",
            })
        }
        None => return Ok(Vec::new()),
    };

    entries
        .iter()
        .map(|entry| {
            entry
                .get("resource")
                .filter(|r| !r.is_null())
                .ok_or(MappingError::MissingField {
                    resource,
                    field: "entry.resource",
                })
        })
        .collect()
}
