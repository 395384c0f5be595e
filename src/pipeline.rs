//! End-to-end launch pipeline: handshake, patient read, context broadcast.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::aggregator::{ClinicalDataAggregator, PassError};
use crate::broadcast::{BroadcastGateway, ContextBus};
use crate::config::Config;
use crate::context::{Observation, PatientContextManager, ResetError};
use crate::launch::{AuthorizationHelper, LaunchController, LaunchError, LaunchOutcome, Navigator};
use crate::patient::PatientIdentity;
use crate::session::SessionError;
use crate::storage::SessionStore;

/// Fatal pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Failed to read patient: {0}")]
    PatientFetch(#[source] SessionError),
}

/// What a launched process has to show
#[derive(Debug)]
pub struct LaunchReport {
    pub identity: PatientIdentity,
    /// Serialized session state
    pub launch_context: Value,
    /// Outcome of the broadcast pass; its failure does not affect `identity`
    pub pass: Result<Observation, PassError>,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// A new launch started; this process is done
    Redirected(Url),
    Ready(LaunchReport),
}

pub struct LaunchPipeline {
    controller: LaunchController,
    context: PatientContextManager,
}

impl LaunchPipeline {
    pub fn new(controller: LaunchController, context: PatientContextManager) -> Self {
        Self { controller, context }
    }

    /// Wire up a pipeline for the page at `location`
    pub fn from_config(
        location: Url,
        config: &Config,
        helper: Arc<dyn AuthorizationHelper>,
        store: Arc<dyn SessionStore>,
        navigator: Arc<dyn Navigator>,
        bus: Option<Arc<dyn ContextBus>>,
    ) -> Self {
        let controller = LaunchController::new(location.clone(), helper, store.clone(), navigator.clone())
            .with_client(&config.client_id, &config.scope);
        let aggregator = ClinicalDataAggregator::new(BroadcastGateway::new(bus));
        let context = PatientContextManager::new(location, aggregator, store, navigator)
            .with_standalone_launch(&config.standalone_iss, &config.standalone_launch);

        Self::new(controller, context)
    }

    pub fn context(&self) -> &PatientContextManager {
        &self.context
    }

    /// Complete (or restart) the launch and broadcast the patient's context.
    ///
    /// A failed patient read is fatal. A failed broadcast pass is reported in
    /// the [`LaunchReport`] and does not fail the run.
    pub async fn run(&mut self) -> Result<RunOutcome, PipelineError> {
        let session = match self.controller.complete_or_relaunch().await? {
            LaunchOutcome::Redirected(url) => return Ok(RunOutcome::Redirected(url)),
            LaunchOutcome::Ready(session) => session,
        };

        let raw = session
            .read_patient()
            .await
            .map_err(PipelineError::PatientFetch)?;
        debug!("Read Patient data: {}", raw);

        let identity = PatientIdentity::from_resource(&raw);
        info!("Patient in context: {} ({})", identity.display_name, identity.id);

        let pass = self
            .context
            .on_patient_observed(session.as_ref(), identity.clone())
            .await;
        if let Err(e) = &pass {
            warn!("Broadcast pass incomplete: {}", e);
        }

        Ok(RunOutcome::Ready(LaunchReport {
            identity,
            launch_context: session.state().await,
            pass,
        }))
    }

    /// See [`PatientContextManager::reset_session`]
    pub fn reset_session(&mut self) -> Result<Url, ResetError> {
        self.context.reset_session()
    }
}
