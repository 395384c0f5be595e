//! SMART on FHIR launch client that republishes the in-context patient's
//! clinical data as FDC3 contexts.
//!
//! The flow is driven by [`pipeline::LaunchPipeline`]: complete the SMART
//! handshake (or start one), read the Patient, then broadcast the patient and
//! their appointments, conditions and diagnostic reports once per patient.

pub mod aggregator;
pub mod broadcast;
pub mod config;
pub mod context;
pub mod facts;
pub mod launch;
pub mod patient;
pub mod pipeline;
pub mod session;
pub mod smart;
pub mod storage;

#[cfg(test)]
mod test_support;


pub use config::Config;
pub use pipeline::{LaunchPipeline, LaunchReport, PipelineError, RunOutcome};
