//! The client configuration surface and the top-level operations that tie
//! the URL builder, auth engine, transport, response processor, paging, and
//! merge pipeline together.
//!
//! `ClientState` is a plain configuration record built with chained
//! `with_*` setters (Design Note: "Builder that returns itself" recast as a
//! configuration record, since there is no separate builder type here).

pub mod auth;
pub mod by_last_updated;
pub mod error;
pub mod graph;
pub mod merge;
pub mod paging;
pub mod response;
pub mod scope;
pub mod transport;
pub mod url;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

use self::auth::{AuthEngine, AuthState};
use self::error::Error;
use self::merge::{MergeOutcomeKind, MergePipeline, MergeResponseEntry};
use self::response::{build_get_response, ExpansionOptions};
use self::transport::{Transport, TransportOptions};
use self::url::{build_url, UrlParts};
use crate::model::{GetResponse, LastUpdatedFilter, SortField};

/// Fluent client configuration. Every setter consumes and returns `Self` so
/// callers chain calls; invariants (page size, required action payloads,
/// required ids) are checked at the operation that needs them rather than
/// at construction, matching the reference engine's assert-at-use-site
/// style.
#[derive(Debug, Clone)]
pub struct ClientState {
	pub url: String,
	pub resource: Option<String>,
	pub ids: Vec<String>,
	pub action: Option<String>,
	pub action_payload: Option<Value>,
	pub additional_parameters: Vec<String>,
	pub custom_filters: BTreeSet<String>,
	pub filter_by_resource: Option<String>,
	pub filter_parameter: Option<String>,
	pub include_only_properties: Vec<String>,
	pub page_number: Option<u64>,
	pub page_size: Option<u64>,
	pub last_updated: LastUpdatedFilter,
	pub sort_fields: Vec<SortField>,
	pub include_total: bool,
	pub separate_bundle_resources: bool,
	pub expand_fhir_bundle: bool,
	pub additional_request_headers: HashMap<String, String>,
	pub chunk_size: Option<usize>,

	pub retry_count: u32,
	pub exclude_status_codes_from_retry: Vec<u16>,
	pub use_data_streaming: bool,
	pub send_data_as_chunked: bool,
	pub compress: bool,
	pub throw_exception_on_error: bool,
	pub maximum_time_to_retry_on_429: Option<Duration>,
	pub timeout: Option<Duration>,

	pub auth_server_url: Option<String>,
	pub auth_wellknown_url: Option<String>,
	pub auth_scopes: Vec<String>,
	pub client_id: Option<String>,
	pub client_secret: Option<String>,
	pub access_token: Option<String>,

	pub validation_server_url: Option<String>,
	pub max_concurrent_requests: Option<u64>,
}

impl Default for ClientState {
	fn default() -> Self {
		Self {
			url: String::new(),
			resource: None,
			ids: Vec::new(),
			action: None,
			action_payload: None,
			additional_parameters: Vec::new(),
			custom_filters: BTreeSet::new(),
			filter_by_resource: None,
			filter_parameter: None,
			include_only_properties: Vec::new(),
			page_number: None,
			page_size: None,
			last_updated: LastUpdatedFilter::default(),
			sort_fields: Vec::new(),
			include_total: false,
			separate_bundle_resources: false,
			expand_fhir_bundle: true,
			additional_request_headers: HashMap::new(),
			chunk_size: None,
			retry_count: 2,
			exclude_status_codes_from_retry: Vec::new(),
			use_data_streaming: false,
			send_data_as_chunked: false,
			compress: false,
			throw_exception_on_error: false,
			maximum_time_to_retry_on_429: None,
			timeout: None,
			auth_server_url: None,
			auth_wellknown_url: None,
			auth_scopes: Vec::new(),
			client_id: None,
			client_secret: None,
			access_token: None,
			validation_server_url: None,
			max_concurrent_requests: None,
		}
	}
}

impl ClientState {
	#[must_use]
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into(), ..Self::default() }
	}

	#[must_use]
	pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
		self.resource = Some(resource.into());
		self
	}

	#[must_use]
	pub fn with_id(mut self, id: impl Into<String>) -> Self {
		self.ids = vec![id.into()];
		self
	}

	#[must_use]
	pub fn with_ids(mut self, ids: Vec<String>) -> Self {
		self.ids = ids;
		self
	}

	#[must_use]
	pub fn with_action(mut self, action: impl Into<String>, payload: Value) -> Self {
		self.action = Some(action.into());
		self.action_payload = Some(payload);
		self
	}

	#[must_use]
	pub fn with_page_size(mut self, page_size: u64) -> Self {
		self.page_size = Some(page_size);
		self
	}

	#[must_use]
	pub fn with_page_number(mut self, page_number: u64) -> Self {
		self.page_number = Some(page_number);
		self
	}

	#[must_use]
	pub fn with_sort(mut self, sort_fields: Vec<SortField>) -> Self {
		self.sort_fields = sort_fields;
		self
	}

	#[must_use]
	pub fn with_last_updated(mut self, last_updated: LastUpdatedFilter) -> Self {
		self.last_updated = last_updated;
		self
	}

	#[must_use]
	pub fn with_include_total(mut self, include_total: bool) -> Self {
		self.include_total = include_total;
		self
	}

	#[must_use]
	pub fn with_separate_bundle_resources(mut self, separate: bool) -> Self {
		self.separate_bundle_resources = separate;
		self
	}

	#[must_use]
	pub fn with_client_credentials(
		mut self,
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
	) -> Self {
		self.client_id = Some(client_id.into());
		self.client_secret = Some(client_secret.into());
		self
	}

	#[must_use]
	pub fn with_auth_scopes(mut self, scopes: Vec<String>) -> Self {
		self.auth_scopes = scopes;
		self
	}

	#[must_use]
	pub fn with_auth_server_url(mut self, auth_server_url: impl Into<String>) -> Self {
		self.auth_server_url = Some(auth_server_url.into());
		self
	}

	#[must_use]
	pub fn with_auth_wellknown_url(mut self, auth_wellknown_url: impl Into<String>) -> Self {
		self.auth_wellknown_url = Some(auth_wellknown_url.into());
		self
	}

	#[must_use]
	pub fn with_retry_count(mut self, retries: u32) -> Self {
		self.retry_count = retries;
		self
	}

	#[must_use]
	pub fn with_validation_server_url(mut self, url: impl Into<String>) -> Self {
		self.validation_server_url = Some(url.into());
		self
	}

	/// Finalizes the configuration into a runnable [`FhirClient`], building
	/// the shared HTTP client, optional auth engine, and transport.
	///
	/// # Errors
	/// Returns [`Error::UrlParse`] if `page_size` is required by a later
	/// operation and is zero; that check happens per-operation, not here.
	pub fn build(self) -> Result<FhirClient, Error> {
		let http = reqwest::Client::builder()
			.build()
			.map_err(|err| Error::Sender { request_id: "build".to_string(), url: self.url.clone(), message: err.to_string() })?;

		let auth = if self.client_id.is_some() && self.client_secret.is_some() {
			use base64::Engine as _;
			let login_token = base64::engine::general_purpose::STANDARD.encode(format!(
				"{}:{}",
				self.client_id.clone().unwrap_or_default(),
				self.client_secret.clone().unwrap_or_default()
			));
			Some(Arc::new(AuthEngine::new(
				http.clone(),
				AuthState {
					access_token: self.access_token.clone(),
					expiry: None,
					login_token_b64: Some(login_token),
					scopes: self.auth_scopes.clone(),
					base_url: self.url.clone(),
					auth_server_url: self.auth_server_url.clone(),
					auth_wellknown_url: self.auth_wellknown_url.clone(),
				},
			)))
		} else {
			None
		};

		let options = TransportOptions {
			retries: self.retry_count,
			timeout: self.timeout,
			exclude_status_codes_from_retry: self.exclude_status_codes_from_retry.iter().copied().collect(),
			throw_on_error: self.throw_exception_on_error,
			maximum_time_to_retry_on_429: self.maximum_time_to_retry_on_429,
			compress: self.compress,
			send_data_as_chunked: self.send_data_as_chunked,
			..TransportOptions::default()
		};
		let transport = Arc::new(Transport::new(http, auth, options));

		Ok(FhirClient { state: self, transport })
	}
}

/// A built client ready to perform requests.
pub struct FhirClient {
	state: ClientState,
	transport: Arc<Transport>,
}

impl FhirClient {
	fn url_parts(&self) -> UrlParts<'_> {
		UrlParts {
			base: &self.state.url,
			resource: self.state.resource.as_deref(),
			ids: &self.state.ids,
			action: self.state.action.as_deref(),
			filter_by_resource: self.state.filter_by_resource.as_deref(),
			filter_parameter: self.state.filter_parameter.as_deref(),
			include_only_properties: &self.state.include_only_properties,
			page_number: self.state.page_number,
			page_size: self.state.page_size,
			sort_fields: &self.state.sort_fields,
			include_total: self.state.include_total,
			id_above: None,
			additional_parameters: &self.state.additional_parameters,
			custom_filters: Some(&self.state.custom_filters),
			last_updated: Some(&self.state.last_updated),
		}
	}

	fn expansion_options(&self) -> ExpansionOptions {
		ExpansionOptions {
			separate_bundle_resources: self.state.separate_bundle_resources,
			expand_fhir_bundle: self.state.expand_fhir_bundle,
			access_token: self.state.access_token.clone(),
			extra_context: HashMap::new(),
		}
	}

	/// A single read or search request (not paged).
	pub async fn get(&self) -> Result<GetResponse, Error> {
		let url = build_url(&self.url_parts());
		let raw = self
			.transport
			.fetch(Method::GET, &url, self.state.additional_request_headers.clone(), None)
			.await?;
		Ok(build_get_response(&raw, &url, &self.expansion_options()))
	}

	/// Runs the parallel paged query engine, honoring `page_size` and
	/// `max_concurrent_requests`. The aggregated resources and total are
	/// wrapped into a single [`GetResponse`], matching `get()`'s envelope.
	pub async fn search_paged(&self) -> Result<GetResponse, Error> {
		let page_size = self.state.page_size.filter(|&size| size > 0).unwrap_or(10);
		let concurrent_requests = self.state.max_concurrent_requests.unwrap_or(1).max(1);

		let spec = paging::PagedQuerySpec {
			base: self.state.url.clone(),
			resource: self.state.resource.clone(),
			page_size,
			include_only_properties: self.state.include_only_properties.clone(),
			sort_fields: self.state.sort_fields.clone(),
			include_total: self.state.include_total,
			additional_parameters: self.state.additional_parameters.clone(),
			custom_filters: self.state.custom_filters.clone(),
			last_updated: self.state.last_updated.clone(),
		};

		let (resources, total) =
			paging::run_paged_query(self.transport.clone(), spec, concurrent_requests, None).await?;
		let url = build_url(&self.url_parts());
		Ok(GetResponse {
			request_id: uuid::Uuid::new_v4().to_string(),
			url,
			status: 200,
			error: None,
			access_token: self.state.access_token.clone(),
			next_url: None,
			total_count: total,
			resource_type: self.state.resource.clone(),
			id: None,
			response_headers: HashMap::new(),
			chunk_number: None,
			cache_hits: 0,
			results_by_url: Vec::new(),
			body: Value::Array(resources),
		})
	}

	/// Runs the two-phase by-`_lastUpdated` engine.
	pub async fn by_last_updated(
		&self,
		start: chrono::DateTime<chrono::Utc>,
		end: chrono::DateTime<chrono::Utc>,
		page_size_ids: u64,
		page_size_resources: usize,
	) -> Result<Vec<Value>, Error> {
		let resource = self.state.resource.clone().ok_or(Error::MissingId)?;
		let spec = by_last_updated::ByLastUpdatedSpec {
			base: self.state.url.clone(),
			resource,
			start,
			end,
			page_size_ids,
			page_size_resources,
			concurrent_requests: self.state.max_concurrent_requests.unwrap_or(1).max(1),
		};
		by_last_updated::run(self.transport.clone(), spec).await
	}

	/// `$merge`, optionally validating each resource first.
	pub async fn merge(
		&self,
		resources: Vec<Value>,
		batch_size: Option<usize>,
	) -> Result<Vec<MergeResponseEntry>, Error> {
		let pipeline = MergePipeline::new(
			self.transport.clone(),
			self.state.url.clone(),
			self.state.validation_server_url.clone(),
		);
		pipeline.merge(resources, batch_size).await
	}

	/// `PUT {url}/{resource}/{id}`.
	pub async fn update(&self, resource_json: &Value) -> Result<GetResponse, Error> {
		let id = self.state.ids.first().ok_or(Error::MissingId)?;
		let url = format!(
			"{}/{}/{}",
			self.state.url.trim_end_matches('/'),
			self.state.resource.as_deref().unwrap_or_default(),
			id
		);
		let body = serde_json::to_vec(resource_json)?;
		let mut headers = self.state.additional_request_headers.clone();
		headers.insert("Content-Type".to_string(), "application/fhir+json".to_string());
		let raw = self.transport.fetch(Method::PUT, &url, headers, Some(body)).await?;
		Ok(build_get_response(&raw, &url, &self.expansion_options()))
	}

	/// `PATCH {url}/{resource}/{id}` with `application/json-patch+json`.
	pub async fn patch(&self, json_patch: &Value) -> Result<GetResponse, Error> {
		let id = self.state.ids.first().ok_or(Error::MissingId)?;
		let url = format!(
			"{}/{}/{}",
			self.state.url.trim_end_matches('/'),
			self.state.resource.as_deref().unwrap_or_default(),
			id
		);
		let body = serde_json::to_vec(json_patch)?;
		let mut headers = self.state.additional_request_headers.clone();
		headers.insert("Content-Type".to_string(), "application/json-patch+json".to_string());
		let raw = self.transport.fetch(Method::PATCH, &url, headers, Some(body)).await?;
		Ok(build_get_response(&raw, &url, &self.expansion_options()))
	}

	/// `DELETE {url}/{resource}/{id|ids-joined}`. Requires at least one id,
	/// joined as a single path segment rather than a query parameter.
	pub async fn delete(&self) -> Result<GetResponse, Error> {
		self.state.ids.first().ok_or(Error::MissingId)?;
		let url = format!(
			"{}/{}/{}",
			self.state.url.trim_end_matches('/'),
			self.state.resource.as_deref().unwrap_or_default(),
			self.state.ids.join(",")
		);
		let raw = self
			.transport
			.fetch(Method::DELETE, &url, self.state.additional_request_headers.clone(), None)
			.await?;
		Ok(build_get_response(&raw, &url, &self.expansion_options()))
	}

	/// `DELETE {url}/{resource}?{query}`; unlike [`Self::delete`] this never
	/// touches `self.state.ids` and builds a pure query-filter URL. The
	/// optional `{"deleted": N}` response body is exposed via `count`.
	pub async fn delete_by_query(&self) -> Result<(GetResponse, Option<u64>), Error> {
		let url = build_url(&UrlParts { ids: &[], ..self.url_parts() });
		let raw = self
			.transport
			.fetch(Method::DELETE, &url, self.state.additional_request_headers.clone(), None)
			.await?;
		let response = build_get_response(&raw, &url, &self.expansion_options());
		let count = response.body.get("deleted").and_then(Value::as_u64);
		Ok((response, count))
	}

	/// `$graph` traversal, delegating to a single POST or the paged engine.
	pub async fn graph(&self, spec: graph::GraphSpec) -> Result<Vec<Value>, Error> {
		graph::run(self.transport.clone(), spec).await
	}
}

/// Classifies a merge result list into the four outcome buckets named by
/// the merge pipeline's contract, for callers that want the summary rather
/// than the raw entries.
#[must_use]
pub fn summarize_merge(entries: &[MergeResponseEntry]) -> HashMap<&'static str, usize> {
	let mut summary = HashMap::new();
	for entry in entries {
		let key = match entry.kind() {
			MergeOutcomeKind::Merged => "merged",
			MergeOutcomeKind::Created => "created",
			MergeOutcomeKind::Updated => "updated",
			MergeOutcomeKind::Issue => "issue",
		};
		*summary.entry(key).or_insert(0) += 1;
	}
	summary
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_state_expands_bundles_but_not_separate() {
		let state = ClientState::new("http://srv");
		assert!(state.expand_fhir_bundle);
		assert!(!state.separate_bundle_resources);
	}

	#[test]
	fn fluent_setters_chain() {
		let state = ClientState::new("http://srv")
			.with_resource("Patient")
			.with_id("123")
			.with_page_size(10)
			.with_include_total(true);
		assert_eq!(state.resource.as_deref(), Some("Patient"));
		assert_eq!(state.ids, vec!["123".to_string()]);
		assert_eq!(state.page_size, Some(10));
		assert!(state.include_total);
	}
}
