//! Client errors.

use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

/// FHIR REST Client Error.
///
/// Variants map onto the error taxonomy of the engine: terminal response
/// classes (`NotFound`, `Forbidden`, `Unauthorized`, `RateLimited`) are
/// returned as values by most operations rather than propagated as `Err`,
/// but are kept here so callers opting into `throw_on_error` get a single
/// error type to match on.
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// Failed parsing a URL while composing a request.
	#[error("Failed parsing the URL: {0}")]
	UrlParse(String),

	/// Resource is missing an ID where one is required (`$update`, `$delete`,
	/// single-resource `$graph`).
	#[error("Resource is missing ID")]
	MissingId,

	/// Authentication failed: the token response had no `access_token`, or
	/// well-known discovery failed outright (not merely absent).
	#[error("Authentication failed: {0}")]
	Auth(String),

	/// Final 401 after refresh was attempted (or unavailable) and retries
	/// were exhausted.
	#[error("Unauthorized ({0}): {1}")]
	Unauthorized(StatusCode, String),

	/// 403 response from the server.
	#[error("Forbidden ({0}): {1}")]
	Forbidden(StatusCode, String),

	/// 404 response from the server.
	#[error("Not found: {0}")]
	NotFound(String),

	/// 429 after retries exhausted.
	#[error("Rate limited after retries exhausted: {0}")]
	RateLimited(String),

	/// Retryable condition (5xx in the retry set, or a network/timeout
	/// error) after the retry budget was exhausted.
	#[error("Transient failure after {retries} attempts against {url}: {message}")]
	Transient { url: String, retries: u32, message: String },

	/// Validation failure from the validator server, or a merge-response
	/// issue with `severity == error`. Attached to one resource; never
	/// fails the whole batch.
	#[error("Validation error for {resource_type}: {message}")]
	Validation { resource_type: String, message: String },

	/// Unexpected failure from the transport itself, carrying enough
	/// context for diagnostics.
	#[error("Sender error for request {request_id} to {url}: {message}")]
	Sender { request_id: String, url: String, message: String },

	/// Serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(Arc<serde_json::Error>),

	/// HTTP request error (connection, timeout, build failure).
	#[error("Request error: {0}")]
	Request(Arc<reqwest::Error>),

	/// Generic HTTP error response not covered by a more specific variant.
	#[error("Got error response ({0}): {1}")]
	Response(StatusCode, String),
}

impl From<serde_json::Error> for Error {
	fn from(error: serde_json::Error) -> Self {
		Self::Json(Arc::new(error))
	}
}

impl From<reqwest::Error> for Error {
	fn from(error: reqwest::Error) -> Self {
		Self::Request(Arc::new(error))
	}
}

impl Error {
	/// Whether the error should likely be retried by the transport.
	#[must_use]
	pub fn should_retry(&self) -> bool {
		tracing::debug!("Checking if error `{self}` should be retried");
		match self {
			Self::Request(err) => err.is_connect() || err.is_request() || err.is_timeout(),
			Self::Transient { .. } => true,
			_ => false,
		}
	}
}
