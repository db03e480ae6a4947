//! SMART-on-FHIR client-credentials authentication.
//!
//! Grounded on the reference engine's well-known discovery cache and
//! `authenticate_async`: discovery results are cached per host for 600
//! seconds behind a process-wide mutex so repeated client instances talking
//! to the same server don't re-discover on every request.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::error::Error;

const WELL_KNOWN_TTL_SECS: i64 = 600;

#[derive(Debug, Clone)]
struct WellKnownCacheEntry {
	auth_url: Option<String>,
	last_updated: DateTime<Utc>,
}

/// Process-wide cache of `host -> token_endpoint`, shared by every
/// [`AuthEngine`] in the process.
#[derive(Debug, Default)]
pub struct WellKnownCache {
	entries: Mutex<HashMap<String, WellKnownCacheEntry>>,
}

impl WellKnownCache {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// The shared, process-global instance used by default.
	pub fn global() -> Arc<Self> {
		static CACHE: OnceLock<Arc<WellKnownCache>> = OnceLock::new();
		CACHE.get_or_init(|| Arc::new(WellKnownCache::new())).clone()
	}

	async fn get_fresh(&self, host: &str) -> Option<Option<String>> {
		let entries = self.entries.lock().await;
		let entry = entries.get(host)?;
		if Utc::now() - entry.last_updated < chrono::Duration::seconds(WELL_KNOWN_TTL_SECS) {
			Some(entry.auth_url.clone())
		} else {
			None
		}
	}

	async fn store(&self, host: &str, auth_url: Option<String>) {
		let mut entries = self.entries.lock().await;
		entries.insert(host.to_string(), WellKnownCacheEntry { auth_url, last_updated: Utc::now() });
	}
}

#[derive(Debug, Clone)]
pub struct AuthState {
	pub access_token: Option<String>,
	pub expiry: Option<DateTime<Utc>>,
	pub login_token_b64: Option<String>,
	pub scopes: Vec<String>,
	/// The FHIR server's own base URL, used to derive the default
	/// `{base}/.well-known/smart-configuration` discovery URL when
	/// `auth_wellknown_url` isn't set explicitly.
	pub base_url: String,
	pub auth_server_url: Option<String>,
	pub auth_wellknown_url: Option<String>,
}

impl AuthState {
	fn is_valid(&self) -> bool {
		match (&self.access_token, self.expiry) {
			(Some(_), Some(expiry)) => Utc::now() < expiry,
			(Some(_), None) => true,
			(None, _) => false,
		}
	}
}

#[derive(Deserialize)]
struct SmartConfiguration {
	token_endpoint: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
	access_token: Option<String>,
	expires_in: Option<i64>,
}

/// Performs SMART discovery and the client-credentials grant, caching the
/// resulting access token until it expires. One `AuthEngine` is shared
/// (behind a mutex) across clones of the same client so a concurrent 401
/// storm only triggers one refresh.
pub struct AuthEngine {
	http: reqwest::Client,
	well_known: Arc<WellKnownCache>,
	state: Mutex<AuthState>,
}

impl AuthEngine {
	#[must_use]
	pub fn new(http: reqwest::Client, state: AuthState) -> Self {
		Self { http, well_known: WellKnownCache::global(), state: Mutex::new(state) }
	}

	#[must_use]
	pub fn with_well_known_cache(
		http: reqwest::Client,
		state: AuthState,
		well_known: Arc<WellKnownCache>,
	) -> Self {
		Self { http, well_known, state: Mutex::new(state) }
	}

	/// Returns a cached, non-expired access token, or performs a full
	/// discovery + client-credentials round trip and caches the result.
	pub async fn get_access_token(&self) -> Result<String, Error> {
		let mut state = self.state.lock().await;
		if state.is_valid() {
			if let Some(token) = &state.access_token {
				return Ok(token.clone());
			}
		}

		let token_endpoint = self.discover_token_endpoint(&state).await?;
		let login_token = state
			.login_token_b64
			.clone()
			.ok_or_else(|| Error::Auth("no client credentials configured".to_string()))?;

		let scope = state.scopes.join(" ");
		let response = self
			.http
			.post(&token_endpoint)
			.header("Authorization", format!("Basic {login_token}"))
			.header("Content-Type", "application/x-www-form-urlencoded")
			.body(format!("grant_type=client_credentials&scope={scope}"))
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(Error::Auth(format!(
				"token endpoint returned {}",
				response.status()
			)));
		}

		let body: TokenResponse = response.json().await?;
		let access_token =
			body.access_token.ok_or_else(|| Error::Auth("token response had no access_token".to_string()))?;
		let expiry = body.expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs));

		state.access_token = Some(access_token.clone());
		state.expiry = expiry;
		Ok(access_token)
	}

	/// Forces the next [`Self::get_access_token`] call to re-authenticate,
	/// used by the transport's 401 handling path.
	pub async fn invalidate(&self) {
		let mut state = self.state.lock().await;
		state.access_token = None;
		state.expiry = None;
	}

	/// The currently cached token's expiry, if any, for callers building a
	/// `refresh_token_fn` context.
	pub async fn current_expiry(&self) -> Option<DateTime<Utc>> {
		self.state.lock().await.expiry
	}

	async fn discover_token_endpoint(&self, state: &AuthState) -> Result<String, Error> {
		if let Some(explicit) = &state.auth_server_url {
			return Ok(explicit.clone());
		}

		let well_known_url = match &state.auth_wellknown_url {
			Some(explicit) => explicit.clone(),
			None => format!("{}/.well-known/smart-configuration", state.base_url.trim_end_matches('/')),
		};
		let host = reqwest::Url::parse(&well_known_url)
			.map_err(|err| Error::UrlParse(err.to_string()))?
			.host_str()
			.unwrap_or_default()
			.to_string();

		if let Some(cached) = self.well_known.get_fresh(&host).await {
			return cached.ok_or_else(|| Error::Auth("well-known discovery previously failed".to_string()));
		}

		let response = self.http.get(&well_known_url).send().await?;
		if response.status() == reqwest::StatusCode::NOT_FOUND {
			self.well_known.store(&host, None).await;
			return Err(Error::Auth("well-known configuration not found".to_string()));
		}
		if !response.status().is_success() {
			return Err(Error::Auth(format!("well-known discovery returned {}", response.status())));
		}

		let config: SmartConfiguration = response.json().await?;
		self.well_known.store(&host, config.token_endpoint.clone()).await;
		config.token_endpoint.ok_or_else(|| Error::Auth("well-known configuration had no token_endpoint".to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn auth_state_without_token_is_invalid() {
		let state = AuthState {
			access_token: None,
			expiry: None,
			login_token_b64: None,
			scopes: vec![],
			base_url: "http://example.com".to_string(),
			auth_server_url: None,
			auth_wellknown_url: None,
		};
		assert!(!state.is_valid());
	}

	#[test]
	fn auth_state_with_future_expiry_is_valid() {
		let state = AuthState {
			access_token: Some("tok".to_string()),
			expiry: Some(Utc::now() + chrono::Duration::seconds(60)),
			login_token_b64: None,
			scopes: vec![],
			base_url: "http://example.com".to_string(),
			auth_server_url: None,
			auth_wellknown_url: None,
		};
		assert!(state.is_valid());
	}

	#[test]
	fn auth_state_with_past_expiry_is_invalid() {
		let state = AuthState {
			access_token: Some("tok".to_string()),
			expiry: Some(Utc::now() - chrono::Duration::seconds(60)),
			login_token_b64: None,
			scopes: vec![],
			base_url: "http://example.com".to_string(),
			auth_server_url: None,
			auth_wellknown_url: None,
		};
		assert!(!state.is_valid());
	}
}
