//! `$graph` driver: delegates either to a single POST or the paged query
//! engine, depending on `process_in_pages`.
//!
//! Grounded on the reference engine's `$graph` handling inside
//! `_send_fhir_request_internal_async` / `fhir_composite_query_mixin.py`.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;

use super::error::Error;
use super::paging::{run_paged_query, PagedQuerySpec};
use super::response::{build_get_response, ExpansionOptions};
use super::transport::Transport;
use super::url::{build_url, UrlParts};

/// Inputs to a `$graph` traversal.
#[derive(Debug, Clone)]
pub struct GraphSpec {
	pub base: String,
	pub start_resource: String,
	pub graph_definition: Value,
	pub ids: Vec<String>,
	pub contained: bool,
	pub process_in_pages: bool,
	pub page_size: u64,
	pub concurrent_requests: u64,
}

/// Runs a `$graph` traversal, returning the flattened resource list.
pub async fn run(transport: Arc<Transport>, spec: GraphSpec) -> Result<Vec<Value>, Error> {
	// the server requires an id path segment even for a graph traversal
	// rooted at an id-less selection
	let ids = if spec.ids.is_empty() { vec!["1".to_string()] } else { spec.ids.clone() };
	let additional_parameters =
		if spec.contained { vec!["contained=true".to_string()] } else { Vec::new() };

	if spec.process_in_pages {
		let query_spec = PagedQuerySpec {
			base: spec.base.clone(),
			resource: Some(spec.start_resource.clone()),
			page_size: spec.page_size,
			additional_parameters,
			..Default::default()
		};
		let (resources, _total) =
			run_paged_query(transport, query_spec, spec.concurrent_requests, None).await?;
		return Ok(resources);
	}

	let mut all = Vec::new();
	for chunk in ids.chunks(spec.page_size.max(1) as usize) {
		let parts = UrlParts {
			base: &spec.base,
			resource: Some(&spec.start_resource),
			ids: chunk,
			action: Some("$graph"),
			additional_parameters: &additional_parameters,
			..Default::default()
		};
		let url = build_url(&parts);
		let body = serde_json::to_vec(&spec.graph_definition)?;

		let raw = transport
			.fetch(
				Method::POST,
				&url,
				[("Content-Type".to_string(), "application/fhir+json".to_string())].into(),
				Some(body),
			)
			.await?;
		let response = build_get_response(&raw, &url, &ExpansionOptions::default());

		match response.body {
			Value::Array(resources) => all.extend(resources),
			other if response.resource_type.is_some() => all.push(other),
			_ => {}
		}
	}

	Ok(all)
}
