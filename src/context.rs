//! Patient context tracking.
//!
//! [`PatientContextManager`] remembers which patient was last broadcast and
//! runs an aggregator pass only when the patient id changes.

use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::aggregator::{ClinicalDataAggregator, PassError, PassSummary};
use crate::launch::{redirect_uri, Navigator};
use crate::patient::PatientIdentity;
use crate::session::LaunchSession;
use crate::storage::{SessionStore, StoreError};

/// Issuer of the standalone demo launch used by reset
pub const STANDALONE_ISS: &str = "https://launch.smarthealthit.org/v/r4/fhir";

/// Launch token of the standalone demo launch used by reset
pub const STANDALONE_LAUNCH: &str =
    "WzAsIiIsIiIsIkFVVE8iLDAsMCwwLCIiLCIiLCIiLCIiLCIiLCIiLCIiLDAsMSwiIl0";

/// What happened to an observed patient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Same id as the stored patient; nothing ran
    Unchanged,
    /// New patient; one pass ran to completion
    Broadcast(PassSummary),
}

pub struct PatientContextManager {
    location: Url,
    current: Option<PatientIdentity>,
    aggregator: ClinicalDataAggregator,
    store: Arc<dyn SessionStore>,
    navigator: Arc<dyn Navigator>,
    standalone_iss: String,
    standalone_launch: String,
}

impl PatientContextManager {
    pub fn new(
        location: Url,
        aggregator: ClinicalDataAggregator,
        store: Arc<dyn SessionStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            location,
            current: None,
            aggregator,
            store,
            navigator,
            standalone_iss: STANDALONE_ISS.to_string(),
            standalone_launch: STANDALONE_LAUNCH.to_string(),
        }
    }

    /// Override the launch that `reset_session` re-enters
    pub fn with_standalone_launch(mut self, iss: &str, launch: &str) -> Self {
        self.standalone_iss = iss.to_string();
        self.standalone_launch = launch.to_string();
        self
    }

    /// The last patient handed to the aggregator
    pub fn current(&self) -> Option<&PatientIdentity> {
        self.current.as_ref()
    }

    /// Record `identity` and run a pass if it is a different patient.
    ///
    /// The identity is stored before the pass starts, so a failed pass is not
    /// re-run for the same id.
    pub async fn on_patient_observed(
        &mut self,
        session: &dyn LaunchSession,
        identity: PatientIdentity,
    ) -> Result<Observation, PassError> {
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.is_same_patient(&identity))
        {
            debug!("Patient {} unchanged, skipping broadcast", identity.id);
            return Ok(Observation::Unchanged);
        }

        info!("Patient context changed to {}", identity.id);
        let identity = self.current.insert(identity);
        let summary = self.aggregator.run_pass(session, identity).await?;
        Ok(Observation::Broadcast(summary))
    }

    /// Destination of a reset: this page, re-entering the standalone launch
    pub fn standalone_launch_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&redirect_uri(&self.location))?;
        url.query_pairs_mut()
            .append_pair("iss", &self.standalone_iss)
            .append_pair("launch", &self.standalone_launch);
        Ok(url)
    }

    /// Wipe session storage, forget the patient and navigate to the
    /// standalone launch. Returns the destination.
    pub fn reset_session(&mut self) -> Result<Url, ResetError> {
        info!("Session reset requested, clearing current patient");
        self.current = None;
        self.store.clear()?;

        let url = self.standalone_launch_url()?;
        self.navigator.navigate(&url);
        Ok(url)
    }
}

/// Reset errors
#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("Failed to clear session storage: {0}")]
    Storage(#[from] StoreError),

    #[error("Invalid reset URL: {0}")]
    UrlError(#[from] url::ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastGateway;
    use crate::storage::MemoryStore;
    use crate::test_support::{FakeSession, RecordingBus, RecordingNavigator};

    struct Fixture {
        manager: PatientContextManager,
        bus: Arc<RecordingBus>,
        store: Arc<MemoryStore>,
        navigator: Arc<RecordingNavigator>,
    }

    fn fixture(location: &str) -> Fixture {
        let bus = Arc::new(RecordingBus::new());
        let store = Arc::new(MemoryStore::new());
        let navigator = Arc::new(RecordingNavigator::new());
        let aggregator = ClinicalDataAggregator::new(BroadcastGateway::new(Some(bus.clone())));
        let manager = PatientContextManager::new(
            Url::parse(location).unwrap(),
            aggregator,
            store.clone(),
            navigator.clone(),
        );
        Fixture { manager, bus, store, navigator }
    }

    fn identity(id: &str, name: &str) -> PatientIdentity {
        PatientIdentity {
            id: id.to_string(),
            display_name: name.to_string(),
            gender: None,
            birth_date: None,
        }
    }

    #[tokio::test]
    async fn test_first_observation_runs_pass() {
        let mut f = fixture("http://localhost:3000/");
        let session = FakeSession::new("123");

        let observation = f
            .manager
            .on_patient_observed(&session, identity("123", "Jane Doe"))
            .await
            .unwrap();

        assert!(matches!(observation, Observation::Broadcast(s) if s.patients == 1));
        assert_eq!(f.manager.current().map(|p| p.id.as_str()), Some("123"));
        assert_eq!(session.queried_types().len(), 3);
    }

    #[tokio::test]
    async fn test_same_id_twice_runs_one_pass() {
        let mut f = fixture("http://localhost:3000/");
        let session = FakeSession::new("123");

        f.manager
            .on_patient_observed(&session, identity("123", "Jane Doe"))
            .await
            .unwrap();
        let second = f
            .manager
            .on_patient_observed(&session, identity("123", "Jane Q. Doe"))
            .await
            .unwrap();

        assert_eq!(second, Observation::Unchanged);
        assert_eq!(session.queried_types().len(), 3);
        assert_eq!(f.bus.sent().len(), 1);
        // The stored identity is the one that was broadcast
        assert_eq!(f.manager.current().unwrap().display_name, "Jane Doe");
    }

    #[tokio::test]
    async fn test_new_id_runs_another_pass() {
        let mut f = fixture("http://localhost:3000/");
        let session = FakeSession::new("123");

        f.manager.on_patient_observed(&session, identity("123", "Jane Doe")).await.unwrap();
        f.manager.on_patient_observed(&session, identity("456", "John Roe")).await.unwrap();

        assert_eq!(session.queried_types().len(), 6);
        assert_eq!(f.manager.current().unwrap().id, "456");
    }

    #[tokio::test]
    async fn test_failed_pass_keeps_identity() {
        let mut f = fixture("http://localhost:3000/");
        let session = FakeSession::new("123").with_failure("Appointment");

        let first = f.manager.on_patient_observed(&session, identity("123", "Jane Doe")).await;
        assert!(first.is_err());
        assert_eq!(f.manager.current().unwrap().id, "123");

        let second = f.manager.on_patient_observed(&session, identity("123", "Jane Doe")).await;
        assert_eq!(second.unwrap(), Observation::Unchanged);
        assert_eq!(session.queried_types(), vec!["Appointment"]);
    }

    #[tokio::test]
    async fn test_reset_clears_state_and_navigates() {
        let mut f = fixture("http://localhost:3000/app?code=abc&state=xyz");
        let session = FakeSession::new("123");
        f.store.set("SMART_KEY", "xyz").unwrap();
        f.manager.on_patient_observed(&session, identity("123", "Jane Doe")).await.unwrap();

        let url = f.manager.reset_session().unwrap();

        assert!(f.manager.current().is_none());
        assert!(f.store.is_empty());
        assert_eq!(f.navigator.visits(), vec![url.clone()]);

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("iss".to_string(), STANDALONE_ISS.to_string()),
                ("launch".to_string(), STANDALONE_LAUNCH.to_string()),
            ]
        );
        assert!(url.as_str().starts_with("http://localhost:3000/app?"));
        assert!(url.as_str().contains("launch.smarthealthit.org"));
    }

    #[tokio::test]
    async fn test_reset_then_same_patient_broadcasts_again() {
        let mut f = fixture("http://localhost:3000/");
        let session = FakeSession::new("123");

        f.manager.on_patient_observed(&session, identity("123", "Jane Doe")).await.unwrap();
        f.manager.reset_session().unwrap();
        let again = f.manager.on_patient_observed(&session, identity("123", "Jane Doe")).await.unwrap();

        assert!(matches!(again, Observation::Broadcast(_)));
    }
}
