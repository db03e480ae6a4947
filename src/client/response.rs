//! Status-class dispatch, Bundle expansion, `next` link extraction, and the
//! NDJSON incremental parser.
//!
//! Grounded on the reference engine's `fhir_response_processor.py` (bundle
//! expansion, contained promotion, next-link / INC-285 handling) and
//! `ndjson_chunk_streaming_parser.py` (the incremental line parser).

use std::collections::HashMap;

use reqwest::Url;
use serde_json::{Map, Value};

use super::transport::RawResponse;
use crate::model::{resource_id, resource_type, take_contained, GetResponse};

/// Controls how a 200 response body is turned into the final [`GetResponse`].
#[derive(Debug, Clone, Default)]
pub struct ExpansionOptions {
	pub separate_bundle_resources: bool,
	pub expand_fhir_bundle: bool,
	pub access_token: Option<String>,
	pub url: String,
	pub extra_context: HashMap<String, Value>,
}

/// Builds the terminal [`GetResponse`] for one request given its raw
/// transport result and the current expansion options. The `request_id`
/// echoes `X-Request-ID` when present, else falls back to a fresh UUID.
#[must_use]
pub fn build_get_response(raw: &RawResponse, base_url: &str, opts: &ExpansionOptions) -> GetResponse {
	let request_id = raw
		.headers
		.get("x-request-id")
		.cloned()
		.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

	if raw.status != 200 {
		let error_label = match raw.status {
			404 => "NotFound",
			401 => "UnAuthorized",
			429 => "Retry",
			_ => "Error",
		};
		return GetResponse {
			request_id,
			url: base_url.to_string(),
			status: raw.status,
			error: Some(error_label.to_string()),
			access_token: raw.access_token.clone(),
			next_url: None,
			total_count: 0,
			resource_type: None,
			id: None,
			response_headers: raw.headers.clone(),
			chunk_number: None,
			cache_hits: 0,
			results_by_url: raw.attempts.clone(),
			body: Value::String(raw.body.clone()),
		};
	}

	let parsed: Value = match serde_json::from_str(&raw.body) {
		Ok(value) => value,
		Err(_) => Value::String(raw.body.clone()),
	};

	let is_bundle = resource_type(&parsed) == Some("Bundle");
	let opts_with_url = ExpansionOptions { url: base_url.to_string(), ..opts.clone() };

	let (total_count, body) = if is_bundle && opts.expand_fhir_bundle {
		let (count, entries) = expand_bundle(&parsed, &opts_with_url);
		(count, Value::Array(entries))
	} else if !is_bundle && opts.separate_bundle_resources {
		(1, wrap_single_resource(&parsed, &opts_with_url))
	} else if is_bundle {
		(parsed.get("total").and_then(Value::as_u64).unwrap_or(0), parsed.clone())
	} else {
		(0, parsed.clone())
	};

	let next_url =
		if is_bundle { extract_next_link(&parsed).map(|next| apply_port_preservation(base_url, &next)) } else { None };

	GetResponse {
		request_id,
		url: base_url.to_string(),
		status: 200,
		error: None,
		access_token: raw.access_token.clone(),
		next_url,
		total_count,
		resource_type: resource_type(&parsed).map(ToString::to_string),
		id: resource_id(&parsed).map(ToString::to_string),
		response_headers: raw.headers.clone(),
		chunk_number: None,
		cache_hits: 0,
		results_by_url: raw.attempts.clone(),
		body,
	}
}

/// Expands a Bundle into either a flat resource list or, with
/// `separate_bundle_resources`, one per-type map per entry (contained
/// resources promoted into their own type keys within that same map). Each
/// separated map carries its own `token`/`url`/extra context, matching the
/// reference engine's per-entry `_separate_contained_resources_async`.
/// Never mutates `bundle`; all writes happen on cloned entries.
#[must_use]
pub fn expand_bundle(bundle: &Value, opts: &ExpansionOptions) -> (u64, Vec<Value>) {
	let total_count = bundle.get("total").and_then(Value::as_u64).unwrap_or(0);
	let entries = bundle.get("entry").and_then(Value::as_array).cloned().unwrap_or_default();

	if !opts.separate_bundle_resources {
		let resources: Vec<Value> =
			entries.iter().filter_map(|entry| entry.get("resource").cloned()).collect();
		return (total_count, resources);
	}

	let mut separated = Vec::new();
	let mut promoted_count = 0u64;

	for entry in &entries {
		let Some(resource) = entry.get("resource") else { continue };
		let mut resource = resource.clone();
		let contained = take_contained(&mut resource);

		let mut map: Map<String, Value> = Map::new();
		if let Some(type_key) = resource_type(&resource).map(|t| t.to_lowercase()) {
			push_into_type_list(&mut map, &type_key, resource);
		}

		for contained_resource in contained {
			if let Some(type_key) = resource_type(&contained_resource).map(|t| t.to_lowercase()) {
				push_into_type_list(&mut map, &type_key, contained_resource);
				promoted_count += 1;
			}
		}

		insert_context(&mut map, opts);
		separated.push(Value::Object(map));
	}

	let total_count = entries.len() as u64 + promoted_count;
	(total_count, separated)
}

/// Inserts `token`, `url`, and any extra context keys into a separated
/// resource map. Shared by `expand_bundle` and `wrap_single_resource` so both
/// paths stay in lockstep with the reference engine's `resources_dict`.
fn insert_context(map: &mut Map<String, Value>, opts: &ExpansionOptions) {
	if let Some(token) = &opts.access_token {
		map.insert("token".to_string(), Value::String(token.clone()));
	}
	map.insert("url".to_string(), Value::String(opts.url.clone()));
	for (key, value) in &opts.extra_context {
		map.insert(key.clone(), value.clone());
	}
}

fn push_into_type_list(map: &mut Map<String, Value>, type_key: &str, resource: Value) {
	match map.get_mut(type_key) {
		Some(Value::Array(list)) => list.push(resource),
		_ => {
			map.insert(type_key.to_string(), Value::Array(vec![resource]));
		}
	}
}

fn wrap_single_resource(resource: &Value, opts: &ExpansionOptions) -> Value {
	let mut map = Map::new();
	if let Some(type_key) = resource_type(resource).map(|t| t.to_lowercase()) {
		map.insert(type_key, Value::Array(vec![resource.clone()]));
	}
	insert_context(&mut map, opts);
	Value::Array(vec![Value::Object(map)])
}

/// Returns the `link[relation=next].url` of a Bundle, if any.
#[must_use]
pub fn extract_next_link(bundle: &Value) -> Option<String> {
	bundle.get("link")?.as_array()?.iter().find_map(|link| {
		if link.get("relation").and_then(Value::as_str) == Some("next") {
			link.get("url").and_then(Value::as_str).map(ToString::to_string)
		} else {
			None
		}
	})
}

/// INC-285: if `base` has an explicit port and `next` shares its scheme and
/// host but has no explicit port, copy the base's port onto `next`.
#[must_use]
pub fn apply_port_preservation(base: &str, next: &str) -> String {
	let (Ok(base_url), Ok(mut next_url)) = (Url::parse(base), Url::parse(next)) else {
		return next.to_string();
	};

	let Some(port) = base_url.port() else { return next.to_string() };
	if next_url.port().is_some() {
		return next.to_string();
	}
	if base_url.scheme() != next_url.scheme() || base_url.host_str() != next_url.host_str() {
		return next.to_string();
	}

	let _ = next_url.set_port(Some(port));
	next_url.to_string()
}

/// Incrementally parses newline-delimited JSON fed in arbitrary chunks.
///
/// Mirrors the reference parser: append the chunk to an internal buffer,
/// split on `\n`, attempt to decode each complete line, and keep any
/// trailing incomplete (or malformed) line in the buffer for the next call.
/// Malformed lines are only dropped when the parser is reset.
#[derive(Debug, Default)]
pub struct NdjsonParser {
	buffer: String,
}

impl NdjsonParser {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Feeds one chunk of bytes (assumed valid UTF-8) and returns any
	/// resources that could be fully decoded so far.
	pub fn add_chunk(&mut self, chunk: &str) -> Vec<Value> {
		self.buffer.push_str(chunk);
		let mut resources = Vec::new();

		let mut lines: Vec<String> = self.buffer.split('\n').map(ToString::to_string).collect();
		let trailing = lines.pop().unwrap_or_default();

		let mut leftover = Vec::new();
		for line in lines {
			if line.trim().is_empty() {
				continue;
			}
			match serde_json::from_str::<Value>(&line) {
				Ok(value) => resources.push(value),
				Err(_) => leftover.push(line),
			}
		}

		leftover.push(trailing);
		self.buffer = leftover.join("\n");
		resources
	}

	/// Clears the buffer, dropping any pending incomplete or malformed
	/// lines.
	pub fn reset(&mut self) {
		self.buffer.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn expand_bundle_flat_list() {
		let bundle = json!({
			"resourceType": "Bundle",
			"total": 2,
			"entry": [
				{"resource": {"resourceType": "Patient", "id": "1"}},
				{"resource": {"resourceType": "Patient", "id": "2"}},
			]
		});
		let (total, resources) = expand_bundle(&bundle, &ExpansionOptions::default());
		assert_eq!(total, 2);
		assert_eq!(resources.len(), 2);
	}

	#[test]
	fn expand_bundle_promotes_contained_without_mutating_parent() {
		let bundle = json!({
			"resourceType": "Bundle",
			"entry": [
				{"resource": {
					"resourceType": "Practitioner",
					"id": "1",
					"contained": [{"resourceType": "PractitionerRole", "id": "2"}]
				}}
			]
		});
		let opts = ExpansionOptions {
			separate_bundle_resources: true,
			url: "http://example.com".to_string(),
			..Default::default()
		};
		let (total, separated) = expand_bundle(&bundle, &opts);
		assert_eq!(total, 2);
		assert_eq!(separated.len(), 1);
		let map = separated[0].as_object().unwrap();
		assert!(map["practitioner"][0].get("contained").is_none());
		assert_eq!(map["practitionerrole"][0]["id"], "2");
		assert_eq!(map["url"], "http://example.com");
		// original bundle untouched
		assert!(bundle["entry"][0]["resource"].get("contained").is_some());
	}

	#[test]
	fn expand_bundle_separates_each_entry_into_its_own_map() {
		let bundle = json!({
			"resourceType": "Bundle",
			"total": 2,
			"entry": [
				{"resource": {
					"resourceType": "Practitioner",
					"id": "1",
					"contained": [{"resourceType": "PractitionerRole", "id": "2"}]
				}},
				{"resource": {"resourceType": "Practitioner", "id": "3"}},
			]
		});
		let opts = ExpansionOptions {
			separate_bundle_resources: true,
			access_token: Some("mock_access_token".to_string()),
			url: "http://example.com".to_string(),
			extra_context: [("extra_key".to_string(), json!("extra_value"))].into_iter().collect(),
		};
		let (total, separated) = expand_bundle(&bundle, &opts);
		// 2 entries + 1 promoted contained resource, regardless of bundle.total
		assert_eq!(total, 3);
		assert_eq!(separated.len(), 2);
		for entry in &separated {
			assert_eq!(entry["token"], "mock_access_token");
			assert_eq!(entry["url"], "http://example.com");
			assert_eq!(entry["extra_key"], "extra_value");
		}
		assert!(separated[0].get("practitionerrole").is_some());
		assert!(separated[1].get("practitionerrole").is_none());
	}

	#[test]
	fn next_link_port_preservation_applies_when_host_and_scheme_match() {
		let next = apply_port_preservation(
			"http://fhir-server-mcp:3000/4_0_0/Observation",
			"http://fhir-server-mcp/4_0_0/Observation?_count=10&_getpagesoffset=10",
		);
		assert_eq!(next, "http://fhir-server-mcp:3000/4_0_0/Observation?_count=10&_getpagesoffset=10");
	}

	#[test]
	fn next_link_unchanged_when_next_has_explicit_port() {
		let next = apply_port_preservation(
			"http://host:3000/a",
			"http://host:4000/b",
		);
		assert_eq!(next, "http://host:4000/b");
	}

	#[test]
	fn ndjson_parser_handles_lines_split_across_chunks() {
		let mut parser = NdjsonParser::new();
		let mut all = Vec::new();
		// the line for `{"a":2}` is split across these two chunks
		all.extend(parser.add_chunk("{\"a\":1}\n{\"a\":"));
		all.extend(parser.add_chunk("2}\n{\"a\":3"));
		assert_eq!(all, vec![json!({"a": 1}), json!({"a": 2})]);
		// `{"a":3}` has no trailing newline yet, so it stays buffered
		assert_eq!(parser.buffer, "{\"a\":3");
		all.extend(parser.add_chunk("}\n"));
		assert_eq!(all, vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})]);
	}

	#[test]
	fn ndjson_parser_retains_malformed_line_for_next_chunk() {
		let mut parser = NdjsonParser::new();
		let first = parser.add_chunk("not json\n{\"a\":1}\n");
		assert_eq!(first.len(), 1);
		assert_eq!(parser.buffer, "not json");
	}
}
