//! Fakes shared by the unit and pipeline tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::broadcast::{BusError, ContextBus};
use crate::launch::{AuthError, AuthorizationHelper, AuthorizeParams, Navigator, ReadyError};
use crate::session::{LaunchSession, ResourceQuerySpec, SessionError};
use crate::storage::SessionStore;

/// Serve `app` on an ephemeral local port, returning its base URL
pub async fn spawn_server(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

/// In-memory session with canned responses per resource type.
///
/// Unconfigured resource types return an empty result of the right shape.
pub struct FakeSession {
    patient_id: String,
    patient: Option<Value>,
    responses: HashMap<&'static str, Value>,
    failures: Vec<&'static str>,
    queries: Mutex<Vec<ResourceQuerySpec>>,
}

impl FakeSession {
    pub fn new(patient_id: &str) -> Self {
        let mut responses = HashMap::new();
        responses.insert("Appointment", json!({"resourceType": "Bundle"}));
        responses.insert("Condition", json!([]));
        responses.insert("DiagnosticReport", json!({"resourceType": "Bundle", "entry": []}));

        Self {
            patient_id: patient_id.to_string(),
            patient: Some(json!({"resourceType": "Patient", "id": patient_id})),
            responses,
            failures: Vec::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_patient(mut self, patient: Value) -> Self {
        self.patient = Some(patient);
        self
    }

    /// Patient reads fail with 404
    pub fn without_patient(mut self) -> Self {
        self.patient = None;
        self
    }

    pub fn with_response(mut self, resource_type: &'static str, response: Value) -> Self {
        self.responses.insert(resource_type, response);
        self
    }

    pub fn with_failure(mut self, resource_type: &'static str) -> Self {
        self.failures.push(resource_type);
        self
    }

    pub fn queries(&self) -> Vec<ResourceQuerySpec> {
        self.queries.lock().unwrap().clone()
    }

    pub fn queried_types(&self) -> Vec<&'static str> {
        self.queries().iter().map(|q| q.resource_type).collect()
    }
}

#[async_trait]
impl LaunchSession for FakeSession {
    fn patient_id(&self) -> Option<&str> {
        Some(self.patient_id.as_str())
    }

    async fn read_patient(&self) -> Result<Value, SessionError> {
        self.patient
            .clone()
            .ok_or_else(|| SessionError::NotFound(format!("Patient/{}", self.patient_id)))
    }

    async fn request(&self, query: &ResourceQuerySpec) -> Result<Value, SessionError> {
        self.queries.lock().unwrap().push(*query);
        if self.failures.contains(&query.resource_type) {
            return Err(SessionError::UnexpectedResponse(format!(
                "500: {} search failed",
                query.resource_type
            )));
        }
        Ok(self
            .responses
            .get(query.resource_type)
            .cloned()
            .unwrap_or_else(|| json!({"resourceType": "Bundle"})))
    }

    async fn state(&self) -> Value {
        json!({"serverUrl": "https://fhir.test", "tokenResponse": {"patient": self.patient_id}})
    }
}

/// Bus that records every context; optionally rejects one context type
pub struct RecordingBus {
    sent: Mutex<Vec<Value>>,
    reject_type: Option<String>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reject_type: None,
        }
    }

    pub fn failing_on(context_type: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reject_type: Some(context_type.to_string()),
        }
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContextBus for RecordingBus {
    async fn broadcast(&self, context: &Value) -> Result<(), BusError> {
        if self.reject_type.is_some() && self.reject_type.as_deref() == context["type"].as_str() {
            return Err(BusError::Rejected("channel closed".to_string()));
        }
        self.sent.lock().unwrap().push(context.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    visits: Mutex<Vec<Url>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visits(&self) -> Vec<Url> {
        self.visits.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, url: &Url) {
        self.visits.lock().unwrap().push(url.clone());
    }
}

/// Authorization helper with a fixed ready-check result
pub struct FakeHelper {
    session: Option<Arc<dyn LaunchSession>>,
    fail_authorize: bool,
    authorize_calls: Mutex<Vec<AuthorizeParams>>,
}

impl FakeHelper {
    pub fn ready_with(session: Arc<dyn LaunchSession>) -> Self {
        Self {
            session: Some(session),
            fail_authorize: false,
            authorize_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn not_ready() -> Self {
        Self {
            session: None,
            fail_authorize: false,
            authorize_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_authorize_error(mut self) -> Self {
        self.fail_authorize = true;
        self
    }

    pub fn authorize_calls(&self) -> Vec<AuthorizeParams> {
        self.authorize_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthorizationHelper for FakeHelper {
    async fn ready(
        &self,
        _location: &Url,
        _store: Arc<dyn SessionStore>,
    ) -> Result<Arc<dyn LaunchSession>, ReadyError> {
        self.session.clone().ok_or(ReadyError::NoPendingHandshake)
    }

    async fn authorize(
        &self,
        params: &AuthorizeParams,
        _store: &dyn SessionStore,
    ) -> Result<Url, AuthError> {
        self.authorize_calls.lock().unwrap().push(params.clone());
        if self.fail_authorize {
            return Err(AuthError::MissingIssuer);
        }

        let mut url = Url::parse("https://auth.test/authorize").unwrap();
        url.query_pairs_mut()
            .append_pair("client_id", &params.client_id)
            .append_pair("aud", &params.iss);
        Ok(url)
    }
}
