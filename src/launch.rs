//! SMART launch orchestration.
//!
//! [`LaunchController`] either finishes the authorization handshake the
//! current URL belongs to, or starts a fresh one by navigating away. There is
//! no unauthenticated resting state: a failed ready-check always ends in a
//! navigation to the authorization server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::session::LaunchSession;
use crate::storage::{SessionStore, StoreError};

/// Client identifier registered with the EHR
pub const CLIENT_ID: &str = "6f57f594-597d-466a-ac4f-2d308fc38410";

/// Scopes requested on every launch
pub const LAUNCH_SCOPE: &str = "launch openid fhirUser patient/Patient.read";

/// Authorization errors raised by the helper
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No issuer (iss) given for the launch")]
    MissingIssuer,

    #[error("Authorization denied: {0}")]
    Denied(String),

    #[error("Authorization response is missing state")]
    MissingState,

    #[error("No pending authorization for state {0}")]
    UnknownState(String),

    #[error("SMART configuration discovery failed: {0}")]
    Discovery(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Session storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Why the ready-check did not produce a session
#[derive(Debug, thiserror::Error)]
pub enum ReadyError {
    #[error("No authorization handshake in progress")]
    NoPendingHandshake,

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<StoreError> for ReadyError {
    fn from(e: StoreError) -> Self {
        ReadyError::Auth(AuthError::Storage(e))
    }
}

/// Parameters of a new authorization request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeParams {
    pub client_id: String,
    pub scope: String,
    pub redirect_uri: String,
    /// FHIR server issuer; empty when the URL carried none
    pub iss: String,
    /// Opaque EHR launch token, passed through untouched
    pub launch: Option<String>,
}

/// The OAuth2 side of a SMART launch, kept out of the pipeline
#[async_trait]
pub trait AuthorizationHelper: Send + Sync {
    /// Finish a pending handshake (or restore a completed one) for `location`.
    ///
    /// The returned session may hold on to `store` to save refreshed tokens.
    async fn ready(
        &self,
        location: &Url,
        store: Arc<dyn SessionStore>,
    ) -> Result<Arc<dyn LaunchSession>, ReadyError>;

    /// Prepare a new authorization request and return the URL to navigate to
    async fn authorize(
        &self,
        params: &AuthorizeParams,
        store: &dyn SessionStore,
    ) -> Result<Url, AuthError>;
}

/// Full-page navigation. After `navigate` the current process is done.
pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &Url);
}

/// Launch controller errors
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to start authorization: {0}")]
    Authorize(#[from] AuthError),
}

/// Result of [`LaunchController::complete_or_relaunch`]
pub enum LaunchOutcome {
    /// Handshake complete; the session is ready for patient reads
    Ready(Arc<dyn LaunchSession>),
    /// A new launch was started by navigating to this URL
    Redirected(Url),
}

impl std::fmt::Debug for LaunchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchOutcome::Ready(session) => f
                .debug_tuple("Ready")
                .field(&session.patient_id())
                .finish(),
            LaunchOutcome::Redirected(url) => f.debug_tuple("Redirected").field(url).finish(),
        }
    }
}

/// `origin + path` of the page, as registered with the EHR
pub fn redirect_uri(location: &Url) -> String {
    format!("{}{}", location.origin().ascii_serialization(), location.path())
}

fn query_param(location: &Url, name: &str) -> Option<String> {
    location
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub struct LaunchController {
    location: Url,
    client_id: String,
    scope: String,
    helper: Arc<dyn AuthorizationHelper>,
    store: Arc<dyn SessionStore>,
    navigator: Arc<dyn Navigator>,
    session: Option<Arc<dyn LaunchSession>>,
}

impl LaunchController {
    pub fn new(
        location: Url,
        helper: Arc<dyn AuthorizationHelper>,
        store: Arc<dyn SessionStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            location,
            client_id: CLIENT_ID.to_string(),
            scope: LAUNCH_SCOPE.to_string(),
            helper,
            store,
            navigator,
            session: None,
        }
    }

    /// Override the registered client id and requested scope
    pub fn with_client(mut self, client_id: &str, scope: &str) -> Self {
        self.client_id = client_id.to_string();
        self.scope = scope.to_string();
        self
    }

    /// The active session, if the handshake has completed
    pub fn session(&self) -> Option<&Arc<dyn LaunchSession>> {
        self.session.as_ref()
    }

    /// Parameters for a fresh authorization request from the current URL
    pub fn authorize_params(&self) -> AuthorizeParams {
        AuthorizeParams {
            client_id: self.client_id.clone(),
            scope: self.scope.clone(),
            redirect_uri: redirect_uri(&self.location),
            iss: query_param(&self.location, "iss").unwrap_or_default(),
            launch: query_param(&self.location, "launch"),
        }
    }

    /// Finish the handshake, or start a new launch if there is none.
    ///
    /// A rejected ready-check is never surfaced: it is logged and replaced by
    /// a navigation to the authorization server. Only a failure to build that
    /// authorization request is returned as an error.
    pub async fn complete_or_relaunch(&mut self) -> Result<LaunchOutcome, LaunchError> {
        match self.helper.ready(&self.location, self.store.clone()).await {
            Ok(session) => {
                info!(
                    "Authorization complete for patient {:?}",
                    session.patient_id()
                );
                self.session = Some(session.clone());
                Ok(LaunchOutcome::Ready(session))
            }
            Err(e) => {
                warn!("Authorization ready-check failed: {}", e);
                self.session = None;

                let params = self.authorize_params();
                info!(
                    "Starting launch: iss={:?} launch={:?} redirect_uri={}",
                    params.iss, params.launch, params.redirect_uri
                );
                let url = self.helper.authorize(&params, self.store.as_ref()).await?;
                self.navigator.navigate(&url);
                Ok(LaunchOutcome::Redirected(url))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::test_support::{FakeHelper, FakeSession, RecordingNavigator};

    fn controller(location: &str, helper: Arc<FakeHelper>, navigator: Arc<RecordingNavigator>) -> LaunchController {
        LaunchController::new(
            Url::parse(location).unwrap(),
            helper,
            Arc::new(MemoryStore::new()),
            navigator,
        )
    }

    #[test]
    fn test_authorize_params_from_location() {
        let c = controller(
            "http://localhost:3000/app/?iss=https%3A%2F%2Fehr.example%2Ffhir&launch=abc123",
            Arc::new(FakeHelper::not_ready()),
            Arc::new(RecordingNavigator::new()),
        );
        let params = c.authorize_params();

        assert_eq!(params.client_id, CLIENT_ID);
        assert_eq!(params.scope, "launch openid fhirUser patient/Patient.read");
        assert_eq!(params.redirect_uri, "http://localhost:3000/app/");
        assert_eq!(params.iss, "https://ehr.example/fhir");
        assert_eq!(params.launch.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_missing_iss_defaults_to_empty() {
        let c = controller(
            "https://app.example/",
            Arc::new(FakeHelper::not_ready()),
            Arc::new(RecordingNavigator::new()),
        );
        let params = c.authorize_params();
        assert_eq!(params.iss, "");
        assert_eq!(params.launch, None);
        assert_eq!(params.redirect_uri, "https://app.example/");
    }

    #[tokio::test]
    async fn test_ready_session_is_kept() {
        let session = Arc::new(FakeSession::new("123"));
        let helper = Arc::new(FakeHelper::ready_with(session));
        let navigator = Arc::new(RecordingNavigator::new());
        let mut c = controller("http://localhost:3000/?code=x&state=y", helper.clone(), navigator.clone());

        let outcome = c.complete_or_relaunch().await.unwrap();

        assert!(matches!(outcome, LaunchOutcome::Ready(_)));
        assert_eq!(c.session().and_then(|s| s.patient_id()), Some("123"));
        assert!(navigator.visits().is_empty());
        assert!(helper.authorize_calls().is_empty());
    }

    #[tokio::test]
    async fn test_not_ready_relaunches() {
        let helper = Arc::new(FakeHelper::not_ready());
        let navigator = Arc::new(RecordingNavigator::new());
        let mut c = controller(
            "http://localhost:3000/?iss=https%3A%2F%2Fehr.example%2Ffhir",
            helper.clone(),
            navigator.clone(),
        );

        let outcome = c.complete_or_relaunch().await.unwrap();

        let url = match outcome {
            LaunchOutcome::Redirected(url) => url,
            other => panic!("expected redirect, got {other:?}"),
        };
        assert_eq!(navigator.visits(), vec![url]);
        assert!(c.session().is_none());

        let calls = helper.authorize_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].iss, "https://ehr.example/fhir");
        assert_eq!(calls[0].redirect_uri, "http://localhost:3000/");
    }

    #[tokio::test]
    async fn test_authorize_failure_is_returned() {
        let helper = Arc::new(FakeHelper::not_ready().with_authorize_error());
        let navigator = Arc::new(RecordingNavigator::new());
        let mut c = controller("http://localhost:3000/", helper, navigator.clone());

        let err = c.complete_or_relaunch().await.unwrap_err();
        assert!(matches!(err, LaunchError::Authorize(AuthError::MissingIssuer)));
        assert!(navigator.visits().is_empty());
    }

    #[test]
    fn test_redirect_uri_drops_query_and_fragment() {
        let url = Url::parse("https://app.example:8443/launch/index.html?code=1#top").unwrap();
        assert_eq!(redirect_uri(&url), "https://app.example:8443/launch/index.html");
    }
}
