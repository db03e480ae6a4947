//! Parallel paged retrieval: `N` workers striped across page numbers, a
//! shared last-page watermark, and an `id:above` cursor optimization per
//! worker stripe.
//!
//! Grounded on the reference engine's `get_page_by_query` / `get_tasks` /
//! `get_by_query_in_pages`.

use std::collections::BTreeSet;
use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::error::Error;
use super::response::{build_get_response, ExpansionOptions};
use super::transport::Transport;
use super::url::{build_url, UrlParts};
use crate::model::{resource_id, GetResponse, LastUpdatedFilter, PagingResult, SortField};

/// The query shape a paged run holds fixed across all of its workers; only
/// `page_number` and `id_above` vary per worker/attempt.
#[derive(Debug, Clone, Default)]
pub struct PagedQuerySpec {
	pub base: String,
	pub resource: Option<String>,
	pub page_size: u64,
	pub include_only_properties: Vec<String>,
	pub sort_fields: Vec<SortField>,
	pub include_total: bool,
	pub additional_parameters: Vec<String>,
	pub custom_filters: BTreeSet<String>,
	pub last_updated: LastUpdatedFilter,
}

/// Runs the paged query engine to completion, collecting every page's
/// resources and emitting one [`PagingResult`] per non-empty page as it
/// arrives. Returns the aggregated resource list and the max observed
/// `Bundle.total`.
pub async fn run_paged_query(
	transport: Arc<Transport>,
	spec: PagedQuerySpec,
	concurrent_requests: u64,
	on_page: Option<Arc<dyn Fn(&PagingResult) -> bool + Send + Sync>>,
) -> Result<(Vec<Value>, u64), Error> {
	let last_page: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
	let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
	let mut join_set = JoinSet::new();

	for worker in 0..concurrent_requests.max(1) {
		let transport = transport.clone();
		let spec = spec.clone();
		let last_page = last_page.clone();
		let stop = stop.clone();
		let on_page = on_page.clone();

		join_set.spawn(async move {
			run_worker(transport, spec, worker, concurrent_requests.max(1), last_page, stop, on_page).await
		});
	}

	let mut resources = Vec::new();
	let mut max_total = 0u64;
	while let Some(result) = join_set.join_next().await {
		let (worker_resources, worker_total) = result.map_err(|err| Error::Sender {
			request_id: "paged-query".to_string(),
			url: spec.base.clone(),
			message: err.to_string(),
		})??;
		resources.extend(worker_resources);
		max_total = max_total.max(worker_total);
	}

	Ok((resources, max_total))
}

async fn run_worker(
	transport: Arc<Transport>,
	spec: PagedQuerySpec,
	worker: u64,
	stride: u64,
	last_page: Arc<Mutex<Option<u64>>>,
	stop: Arc<std::sync::atomic::AtomicBool>,
	on_page: Option<Arc<dyn Fn(&PagingResult) -> bool + Send + Sync>>,
) -> Result<(Vec<Value>, u64), Error> {
	let mut page_number = worker;
	let mut id_above: Option<String> = None;
	let mut collected = Vec::new();
	let mut max_total = 0u64;

	loop {
		if stop.load(std::sync::atomic::Ordering::SeqCst) {
			break;
		}
		{
			let watermark = last_page.lock().await;
			if let Some(stop_at) = *watermark {
				if page_number >= stop_at {
					break;
				}
			}
		}

		let ids: Vec<String> = Vec::new();
		let parts = UrlParts {
			base: &spec.base,
			resource: spec.resource.as_deref(),
			ids: &ids,
			page_number: Some(page_number),
			page_size: Some(spec.page_size),
			include_only_properties: &spec.include_only_properties,
			sort_fields: &spec.sort_fields,
			include_total: spec.include_total,
			id_above: id_above.as_deref(),
			additional_parameters: &spec.additional_parameters,
			custom_filters: Some(&spec.custom_filters),
			last_updated: Some(&spec.last_updated),
			..Default::default()
		};
		let url = build_url(&parts);

		let raw = transport.fetch(Method::GET, &url, Default::default(), None).await?;
		let response = build_get_response(&raw, &url, &ExpansionOptions { expand_fhir_bundle: false, ..Default::default() });
		max_total = max_total.max(response.total_count);

		let bundle_entries = parse_bundle_entries(&response.body);
		if bundle_entries.is_empty() {
			let mut watermark = last_page.lock().await;
			if watermark.map_or(true, |stop_at| page_number < stop_at) {
				*watermark = Some(page_number);
			}
			break;
		}

		if let Some(last) = bundle_entries.last() {
			if let Some(id) = resource_id(last) {
				id_above = Some(id.to_string());
			}
		}

		let paging_result = PagingResult {
			request_id: response.request_id.clone(),
			page_number,
			resources: bundle_entries.clone(),
			response_headers: response.response_headers.clone(),
		};
		if let Some(on_page) = &on_page {
			if !on_page(&paging_result) {
				stop.store(true, std::sync::atomic::Ordering::SeqCst);
				collected.extend(bundle_entries);
				break;
			}
		}

		collected.extend(bundle_entries);
		page_number += stride;
	}

	Ok((collected, max_total))
}

/// Extracts the resource list from a response body that is either a flat
/// array (already expanded) or a raw Bundle still carrying `entry`.
fn parse_bundle_entries(body: &Value) -> Vec<Value> {
	if let Some(array) = body.as_array() {
		return array.clone();
	}
	if body.get("resourceType").and_then(Value::as_str) == Some("Bundle") {
		return body
			.get("entry")
			.and_then(Value::as_array)
			.map(|entries| entries.iter().filter_map(|entry| entry.get("resource").cloned()).collect())
			.unwrap_or_default();
	}
	Vec::new()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_flat_array_body() {
		let body = serde_json::json!([{"resourceType": "Patient", "id": "1"}]);
		assert_eq!(parse_bundle_entries(&body).len(), 1);
	}

	#[test]
	fn parses_raw_bundle_body() {
		let body = serde_json::json!({
			"resourceType": "Bundle",
			"entry": [{"resource": {"resourceType": "Patient", "id": "1"}}]
		});
		assert_eq!(parse_bundle_entries(&body).len(), 1);
	}

	#[test]
	fn empty_bundle_yields_no_entries() {
		let body = serde_json::json!({"resourceType": "Bundle", "entry": []});
		assert!(parse_bundle_entries(&body).is_empty());
	}
}
