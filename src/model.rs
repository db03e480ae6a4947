//! Response and paging data types returned by the engine.
//!
//! Resources are kept as opaque [`serde_json::Value`] bags throughout; this
//! module only adds the small accessors the engine itself needs
//! (`resourceType`, `id`, `contained`) plus the response envelopes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Returns the lowercased `resourceType` of a resource, if present.
#[must_use]
pub fn resource_type(resource: &Value) -> Option<&str> {
	resource.get("resourceType").and_then(Value::as_str)
}

/// Returns the `id` of a resource, if present.
#[must_use]
pub fn resource_id(resource: &Value) -> Option<&str> {
	resource.get("id").and_then(Value::as_str)
}

/// Removes and returns the `contained` array of a resource, leaving the
/// resource without a `contained` key. Operates on an owned clone so callers
/// never observe mutation of data they still hold a reference to.
#[must_use]
pub fn take_contained(resource: &mut Value) -> Vec<Value> {
	resource
		.as_object_mut()
		.and_then(|obj| obj.remove("contained"))
		.and_then(|v| v.as_array().cloned())
		.unwrap_or_default()
}

/// The engine's uniform return value for a single request or aggregated
/// paged/streamed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
	/// Correlates this response with the request that produced it (echoes
	/// `X-Request-ID` when the server sent one, otherwise a locally
	/// generated UUID).
	pub request_id: String,
	/// The URL that was actually requested.
	pub url: String,
	/// The HTTP status of the (terminal) attempt.
	pub status: u16,
	/// Error label/body for non-2xx terminal responses (`"Retry"`,
	/// `"NotFound"`, `"Error"`, `"UnAuthorized"`).
	pub error: Option<String>,
	/// The access token used for this request, if any.
	pub access_token: Option<String>,
	/// `next` link extracted from a Bundle response, with INC-285 applied.
	pub next_url: Option<String>,
	/// `Bundle.total` when present, else 0.
	pub total_count: u64,
	/// `resourceType` of a single-resource (non-Bundle) response.
	pub resource_type: Option<String>,
	/// `id` of a single-resource response.
	pub id: Option<String>,
	/// Response headers, lowercased keys.
	pub response_headers: HashMap<String, String>,
	/// Chunk sequence number when the response was streamed.
	pub chunk_number: Option<u64>,
	/// Always 0: this engine implements no request-level cache, so there is
	/// nothing to count a hit against. Kept for shape parity with the
	/// reference engine's `GetResponse.cache_hits`.
	pub cache_hits: u64,
	/// The transport's per-attempt log for the request that produced this
	/// response (one entry per retry, including the terminal attempt).
	pub results_by_url: Vec<crate::client::transport::AttemptLog>,
	/// The response body: a single resource, a flat array, or the
	/// per-type map produced by bundle expansion.
	pub body: Value,
}

impl GetResponse {
	/// `true` iff this response is a plain 200.
	#[must_use]
	pub fn successful(&self) -> bool {
		self.status == 200
	}
}

/// One page emitted by the Paged Query Engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagingResult {
	pub request_id: String,
	pub page_number: u64,
	pub resources: Vec<Value>,
	pub response_headers: HashMap<String, String>,
}

/// A single field in a `_sort` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
	pub field: String,
	pub ascending: bool,
}

impl SortField {
	#[must_use]
	pub fn ascending(field: impl Into<String>) -> Self {
		Self { field: field.into(), ascending: true }
	}

	#[must_use]
	pub fn descending(field: impl Into<String>) -> Self {
		Self { field: field.into(), ascending: false }
	}

	/// Renders as `field` or `-field`.
	#[must_use]
	pub fn render(&self) -> String {
		if self.ascending {
			self.field.clone()
		} else {
			format!("-{}", self.field)
		}
	}
}

/// `_lastUpdated` bounds, rendered as `ge`/`lt` query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastUpdatedFilter {
	pub greater_than: Option<chrono::DateTime<chrono::Utc>>,
	pub less_than: Option<chrono::DateTime<chrono::Utc>>,
}

impl LastUpdatedFilter {
	/// Formats an instant as `YYYY-MM-DDTHH:MM:SSZ`.
	#[must_use]
	pub fn format(instant: chrono::DateTime<chrono::Utc>) -> String {
		instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
	}
}
