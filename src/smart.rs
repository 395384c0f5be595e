//! SMART App Launch authorization helper
//!
//! Implements the OAuth 2.0 authorization-code flow with PKCE against a
//! SMART-enabled FHIR server, and the bearer-token FHIR session it yields.
//! Handshake state lives in session storage between the redirect and the
//! return to the app.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::launch::{AuthError, AuthorizationHelper, AuthorizeParams, ReadyError};
use crate::session::{LaunchSession, ResourceQuerySpec, SessionError};
use crate::storage::SessionStore;

/// Session storage key holding the key of the active client state
pub const SMART_KEY: &str = "SMART_KEY";

/// HTTP client timeout for SMART requests
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Tokens this close to expiry are refreshed before use
const EXPIRY_BUFFER_SECS: i64 = 300;

/// Endpoints from `.well-known/smart-configuration`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartConfiguration {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

/// OAuth token response, with the SMART launch-context fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub id_token: Option<String>,
    pub patient: Option<String>,
    pub encounter: Option<String>,
}

/// Client state kept in session storage under the PKCE `state` key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    pub server_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub token_uri: String,
    pub code_verifier: Option<String>,
    pub token_response: Option<TokenResponse>,
    /// Unix timestamp
    pub expires_at: Option<i64>,
}

impl ClientState {
    pub fn is_authorized(&self) -> bool {
        self.token_response.is_some()
    }

    /// Check if the access token is expired (with 5-minute buffer)
    pub fn is_token_expired(&self) -> bool {
        match self.expires_at {
            Some(expiry) => Utc::now().timestamp() >= expiry.saturating_sub(EXPIRY_BUFFER_SECS),
            None => false,
        }
    }

    fn apply_token_response(&mut self, token: TokenResponse) {
        let now = Utc::now().timestamp();
        // Saturate lifetimes that overflow a timestamp
        self.expires_at = token.expires_in.map(|secs| {
            i64::try_from(secs)
                .ok()
                .and_then(|secs| now.checked_add(secs))
                .unwrap_or(i64::MAX)
        });
        self.code_verifier = None;
        self.token_response = Some(token);
    }
}

/// PKCE (Proof Key for Code Exchange) data
#[derive(Debug, Clone)]
pub struct PkceData {
    pub code_verifier: String,
    pub code_challenge: String,
    pub state: String,
}

impl PkceData {
    /// Generate new PKCE codes using S256 method
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let verifier_bytes: [u8; 32] = rng.gen();
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        // S256: base64url(sha256(verifier))
        let mut hasher = Sha256::new();
        hasher.update(code_verifier.as_bytes());
        let code_challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        let state_bytes: [u8; 16] = rng.gen();
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        Self {
            code_verifier,
            code_challenge,
            state,
        }
    }
}

impl Default for PkceData {
    fn default() -> Self {
        Self::new()
    }
}

fn load_state(store: &dyn SessionStore, key: &str) -> Result<Option<ClientState>, AuthError> {
    match store.get(key)? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn save_state(store: &dyn SessionStore, key: &str, state: &ClientState) -> Result<(), AuthError> {
    store.set(key, &serde_json::to_string(state)?)?;
    Ok(())
}

/// Authorization helper for SMART-enabled FHIR servers
#[derive(Debug, Clone)]
pub struct SmartAuthorizer {
    http_client: reqwest::Client,
}

impl SmartAuthorizer {
    pub fn new() -> Result<Self, AuthError> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: std::time::Duration) -> Result<Self, AuthError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { http_client })
    }

    /// Fetch the server's SMART configuration
    async fn discover(&self, server_url: &str) -> Result<SmartConfiguration, AuthError> {
        let url = format!("{}/.well-known/smart-configuration", server_url);
        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(AuthError::Discovery(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Exchange an authorization code for tokens
    async fn exchange_code(&self, state: &ClientState, code: &str) -> Result<TokenResponse, AuthError> {
        let code_verifier = state.code_verifier.as_deref().unwrap_or_default();
        let response = self
            .http_client
            .post(&state.token_uri)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", state.redirect_uri.as_str()),
                ("client_id", state.client_id.as_str()),
                ("code_verifier", code_verifier),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange(format!("{}: {}", status, body)));
        }
        Ok(response.json().await?)
    }

    fn session(&self, state: ClientState, store: Arc<dyn SessionStore>, key: &str) -> Arc<dyn LaunchSession> {
        Arc::new(SmartSession::new(self.http_client.clone(), state).with_store(store, key))
    }
}

#[async_trait]
impl AuthorizationHelper for SmartAuthorizer {
    async fn ready(
        &self,
        location: &Url,
        store: Arc<dyn SessionStore>,
    ) -> Result<Arc<dyn LaunchSession>, ReadyError> {
        let params: HashMap<String, String> = location.query_pairs().into_owned().collect();

        if let Some(error) = params.get("error") {
            let description = params.get("error_description").map(String::as_str).unwrap_or("");
            return Err(AuthError::Denied(format!("{} {}", error, description).trim().to_string()).into());
        }

        if let Some(code) = params.get("code") {
            let key = params.get("state").ok_or(AuthError::MissingState)?;
            let mut state =
                load_state(store.as_ref(), key)?.ok_or_else(|| AuthError::UnknownState(key.clone()))?;

            // Reloading the redirect URL must not replay the code
            if !state.is_authorized() {
                let token = self.exchange_code(&state, code).await?;
                info!("Token exchange complete, patient context {:?}", token.patient);
                state.apply_token_response(token);
                save_state(store.as_ref(), key, &state)?;
            }
            store.set(SMART_KEY, key)?;
            return Ok(self.session(state, store.clone(), key));
        }

        let Some(key) = store.get(SMART_KEY)? else {
            return Err(ReadyError::NoPendingHandshake);
        };
        match load_state(store.as_ref(), &key)? {
            Some(state) if state.is_authorized() => {
                debug!("Restored authorized session from storage");
                Ok(self.session(state, store.clone(), &key))
            }
            _ => Err(ReadyError::NoPendingHandshake),
        }
    }

    async fn authorize(
        &self,
        params: &AuthorizeParams,
        store: &dyn SessionStore,
    ) -> Result<Url, AuthError> {
        if params.iss.is_empty() {
            return Err(AuthError::MissingIssuer);
        }
        let server_url = params.iss.trim_end_matches('/');
        let smart = self.discover(server_url).await?;
        let pkce = PkceData::new();

        // Only one launch is in flight at a time
        if let Some(previous) = store.get(SMART_KEY)? {
            store.remove(&previous)?;
        }

        let state = ClientState {
            server_url: server_url.to_string(),
            client_id: params.client_id.clone(),
            redirect_uri: params.redirect_uri.clone(),
            scope: params.scope.clone(),
            token_uri: smart.token_endpoint.clone(),
            code_verifier: Some(pkce.code_verifier.clone()),
            token_response: None,
            expires_at: None,
        };
        save_state(store, &pkce.state, &state)?;
        store.set(SMART_KEY, &pkce.state)?;

        let mut url = Url::parse(&smart.authorization_endpoint)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &params.client_id)
                .append_pair("scope", &params.scope)
                .append_pair("redirect_uri", &params.redirect_uri)
                .append_pair("aud", server_url)
                .append_pair("state", &pkce.state)
                .append_pair("code_challenge", &pkce.code_challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(launch) = &params.launch {
                query.append_pair("launch", launch);
            }
        }

        info!("Generated authorization URL: {}", url);
        Ok(url)
    }
}

/// Bearer-token FHIR session for one launched patient
pub struct SmartSession {
    http_client: reqwest::Client,
    server_url: String,
    patient_id: Option<String>,
    state: Arc<RwLock<ClientState>>,
    /// Where refreshed tokens are written back, and under which key
    persist: Option<(Arc<dyn SessionStore>, String)>,
}

impl SmartSession {
    pub fn new(http_client: reqwest::Client, state: ClientState) -> Self {
        let patient_id = state
            .token_response
            .as_ref()
            .and_then(|t| t.patient.clone());

        Self {
            http_client,
            server_url: state.server_url.trim_end_matches('/').to_string(),
            patient_id,
            state: Arc::new(RwLock::new(state)),
            persist: None,
        }
    }

    /// Keep `store[key]` in step with token refreshes
    pub fn with_store(mut self, store: Arc<dyn SessionStore>, key: &str) -> Self {
        self.persist = Some((store, key.to_string()));
        self
    }

    /// Get access token, refreshing if needed
    async fn get_valid_token(&self) -> Result<String, SessionError> {
        {
            let state = self.state.read().await;
            let token = state
                .token_response
                .as_ref()
                .ok_or(SessionError::TokenExpired)?;

            if !state.is_token_expired() {
                return Ok(token.access_token.clone());
            }
            if token.refresh_token.is_none() {
                return Err(SessionError::TokenExpired);
            }
        }

        self.refresh_token().await
    }

    /// Refresh the access token using the refresh token
    async fn refresh_token(&self) -> Result<String, SessionError> {
        let mut state = self.state.write().await;
        let refresh_token = state
            .token_response
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or_else(|| SessionError::RefreshFailed("No refresh token available".to_string()))?;

        info!("Access token expired, refreshing");
        let response = self
            .http_client
            .post(&state.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", state.client_id.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Failed to refresh token: {}", body);
            return Err(SessionError::RefreshFailed(body));
        }

        let mut refreshed: TokenResponse = response.json().await?;
        if let Some(previous) = state.token_response.as_ref() {
            // Servers may omit these on refresh
            refreshed.refresh_token = refreshed.refresh_token.or_else(|| previous.refresh_token.clone());
            refreshed.patient = refreshed.patient.or_else(|| previous.patient.clone());
        }
        let access_token = refreshed.access_token.clone();
        state.apply_token_response(refreshed);

        // Later runs restore from storage
        if let Some((store, key)) = &self.persist {
            store.set(key, &serde_json::to_string(&*state)?)?;
            debug!("Saved refreshed client state under {}", key);
        }
        Ok(access_token)
    }

    async fn get_json(&self, url: &str) -> Result<Value, SessionError> {
        let token = self.get_valid_token().await?;
        let response = self
            .http_client
            .get(url)
            .bearer_auth(&token)
            .header(reqwest::header::ACCEPT, "application/fhir+json")
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Handle HTTP response and convert to appropriate error
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, SessionError> {
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            reqwest::StatusCode::UNAUTHORIZED => Err(SessionError::TokenExpired),
            reqwest::StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                Err(SessionError::AccessDenied(body))
            }
            reqwest::StatusCode::NOT_FOUND => {
                Err(SessionError::NotFound(response.url().path().to_string()))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SessionError::UnexpectedResponse(format!("{}: {}", status, body)))
            }
        }
    }
}

/// URL of the bundle's `next` page, if any
fn next_link(bundle: &Value) -> Option<String> {
    bundle["link"]
        .as_array()?
        .iter()
        .find(|l| l["relation"].as_str() == Some("next"))
        .and_then(|l| l["url"].as_str())
        .map(str::to_string)
}

fn entry_resources(bundle: &Value) -> impl Iterator<Item = Value> + '_ {
    bundle["entry"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|e| e.get("resource").cloned())
}

#[async_trait]
impl LaunchSession for SmartSession {
    fn patient_id(&self) -> Option<&str> {
        self.patient_id.as_deref()
    }

    async fn read_patient(&self) -> Result<Value, SessionError> {
        let id = self.patient_id().ok_or(SessionError::NoPatientContext)?;
        self.get_json(&format!("{}/Patient/{}", self.server_url, id)).await
    }

    async fn request(&self, query: &ResourceQuerySpec) -> Result<Value, SessionError> {
        let id = self.patient_id().ok_or(SessionError::NoPatientContext)?;
        let mut url = Url::parse(&format!("{}/{}", self.server_url, query.resource_type))?;
        url.query_pairs_mut().append_pair("patient", id);

        let mut pages = Vec::new();
        let mut next = Some(url.to_string());
        while let Some(page_url) = next.take() {
            let bundle = self.get_json(&page_url).await?;
            next = next_link(&bundle);
            pages.push(bundle);

            if query.page_limit > 0 && pages.len() >= query.page_limit as usize {
                break;
            }
        }
        debug!("Fetched {} page(s) of {}", pages.len(), query.resource_type);

        if query.flat {
            return Ok(Value::Array(pages.iter().flat_map(|page| entry_resources(page)).collect()));
        }
        if pages.len() == 1 {
            return Ok(pages.remove(0));
        }
        Ok(Value::Array(pages))
    }

    async fn state(&self) -> Value {
        serde_json::to_value(&*self.state.read().await).unwrap_or(Value::Null)
    }
}
