//! Merge/validate pipeline: optional per-resource `$validate`, batched
//! `$merge` submission, and per-resource outcome classification.
//!
//! Grounded on the reference engine's `fhir_merge_mixin.py` and the exact
//! field set of `FhirMergeResourceResponseEntry`.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;

use super::error::Error;
use super::transport::Transport;
use crate::model::{resource_id, resource_type};

/// One outcome of a merge, matching the wire shape of the reference
/// engine's `FhirMergeResourceResponseEntry`. A server entry is classified
/// as `Issue` iff it carries an `issue` array or an `error` string; any
/// other shape is an `Outcome`, since every `Outcome` field is individually
/// optional and the two variants are otherwise structurally ambiguous.
#[derive(Debug, Clone)]
pub enum MergeResponseEntry {
	Outcome {
		resource_type: Option<String>,
		id: Option<String>,
		created: Option<bool>,
		updated: Option<bool>,
		deleted: Option<bool>,
		message: Option<String>,
		source_assigning_authority: Option<String>,
		resource_version: Option<String>,
		status: u16,
	},
	Issue {
		resource_type: Option<String>,
		id: Option<String>,
		issue: Option<Vec<Value>>,
		error: Option<String>,
		status: u16,
	},
}

/// Parses one `$merge` response entry off its raw JSON shape, using
/// presence of `issue`/`error` to disambiguate from a plain outcome.
fn parse_merge_entry(value: &Value) -> MergeResponseEntry {
	let status = value.get("status").and_then(Value::as_u64).map_or(200, |s| s as u16);
	let resource_type = value.get("resourceType").or_else(|| value.get("resource_type")).and_then(Value::as_str).map(ToString::to_string);
	let id = value.get("id").and_then(Value::as_str).map(ToString::to_string);

	let issue = value.get("issue").and_then(Value::as_array).cloned();
	let error = value.get("error").and_then(Value::as_str).map(ToString::to_string);

	if issue.is_some() || error.is_some() {
		return MergeResponseEntry::Issue { resource_type, id, issue, error, status };
	}

	MergeResponseEntry::Outcome {
		resource_type,
		id,
		created: value.get("created").and_then(Value::as_bool),
		updated: value.get("updated").and_then(Value::as_bool),
		deleted: value.get("deleted").and_then(Value::as_bool),
		message: value.get("message").and_then(Value::as_str).map(ToString::to_string),
		source_assigning_authority: value
			.get("source_assigning_authority")
			.and_then(Value::as_str)
			.map(ToString::to_string),
		resource_version: value.get("resource_version").and_then(Value::as_str).map(ToString::to_string),
		status,
	}
}

/// The high-level classification a caller usually wants: whether a
/// resource was merged without change, created, updated, or failed with an
/// issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcomeKind {
	Merged,
	Created,
	Updated,
	Issue,
}

impl MergeResponseEntry {
	#[must_use]
	pub fn kind(&self) -> MergeOutcomeKind {
		match self {
			Self::Issue { .. } => MergeOutcomeKind::Issue,
			Self::Outcome { created: Some(true), .. } => MergeOutcomeKind::Created,
			Self::Outcome { updated: Some(true), .. } => MergeOutcomeKind::Updated,
			Self::Outcome { .. } => MergeOutcomeKind::Merged,
		}
	}

	fn synthetic_issue(resource: &Value, status: u16, error: String) -> Self {
		Self::Issue {
			resource_type: resource_type(resource).map(ToString::to_string),
			id: resource_id(resource).map(ToString::to_string),
			issue: None,
			error: Some(error),
			status,
		}
	}

	fn validation_issue(resource: &Value, issue: Vec<Value>) -> Self {
		Self::Issue {
			resource_type: resource_type(resource).map(ToString::to_string),
			id: resource_id(resource).map(ToString::to_string),
			issue: Some(issue),
			error: None,
			status: 422,
		}
	}
}

/// Runs the merge/validate pipeline for a batch of resources against one
/// FHIR server.
pub struct MergePipeline {
	transport: Arc<Transport>,
	server_url: String,
	validation_url: Option<String>,
}

impl MergePipeline {
	#[must_use]
	pub fn new(transport: Arc<Transport>, server_url: String, validation_url: Option<String>) -> Self {
		Self { transport, server_url, validation_url }
	}

	/// Validates (if configured), batches, and submits `resources`,
	/// returning one [`MergeResponseEntry`] per input resource in
	/// submission order. Prior validation errors are always included
	/// alongside the batches that actually reached `$merge`.
	pub async fn merge(
		&self,
		resources: Vec<Value>,
		batch_size: Option<usize>,
	) -> Result<Vec<MergeResponseEntry>, Error> {
		let mut validation_errors = Vec::new();
		let mut surviving = Vec::new();

		if self.validation_url.is_some() {
			for resource in resources {
				match self.validate(&resource).await? {
					Some(issue) => validation_errors.push(MergeResponseEntry::validation_issue(&resource, issue)),
					None => surviving.push(resource),
				}
			}
		} else {
			surviving = resources;
		}

		let mut results = Vec::new();
		let batch_size = batch_size.unwrap_or(surviving.len().max(1));
		for batch in surviving.chunks(batch_size.max(1)) {
			results.extend(self.submit_batch(batch).await?);
		}

		results.extend(validation_errors);
		Ok(results)
	}

	async fn validate(&self, resource: &Value) -> Result<Option<Vec<Value>>, Error> {
		let validation_url = self.validation_url.as_ref().expect("validate called without validation_url");
		let resource_type = resource_type(resource).unwrap_or("Resource");
		let url = format!("{}/{}/$validate", validation_url.trim_end_matches('/'), resource_type);
		let body = serde_json::to_vec(resource)?;

		let raw = self
			.transport
			.fetch(
				Method::POST,
				&url,
				[("Content-Type".to_string(), "application/fhir+json".to_string())].into(),
				Some(body),
			)
			.await?;

		let outcome: Value = serde_json::from_str(&raw.body).unwrap_or(Value::Null);
		let issues = outcome.get("issue").and_then(Value::as_array).cloned().unwrap_or_default();
		let has_error = issues
			.iter()
			.any(|issue| issue.get("severity").and_then(Value::as_str) == Some("error"));

		Ok(if has_error { Some(issues) } else { None })
	}

	async fn submit_batch(&self, batch: &[Value]) -> Result<Vec<MergeResponseEntry>, Error> {
		if batch.is_empty() {
			return Ok(Vec::new());
		}

		let resource_type_name = resource_type(&batch[0]).unwrap_or("Resource");
		// The literal `1` id segment is a documented server-contract quirk:
		// some FHIR servers reject `$merge` without a path id.
		let url = format!("{}/{}/1/$merge", self.server_url.trim_end_matches('/'), resource_type_name);

		let body_value = if batch.len() == 1 { batch[0].clone() } else { Value::Array(batch.to_vec()) };
		let body = serde_json::to_vec(&body_value)?;

		let raw = self
			.transport
			.fetch(
				Method::POST,
				&url,
				[("Content-Type".to_string(), "application/fhir+json".to_string())].into(),
				Some(body),
			)
			.await?;

		if raw.status != 200 {
			return Ok(batch
				.iter()
				.map(|resource| MergeResponseEntry::synthetic_issue(resource, raw.status, raw.body.clone()))
				.collect());
		}

		let parsed: Value = serde_json::from_str(&raw.body).unwrap_or(Value::Null);
		let entries: Vec<Value> = match parsed {
			Value::Array(items) => items,
			Value::Null => Vec::new(),
			single => vec![single],
		};

		Ok(entries.iter().map(parse_merge_entry).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_created_outcome() {
		let entry = MergeResponseEntry::Outcome {
			resource_type: Some("Patient".to_string()),
			id: Some("1".to_string()),
			created: Some(true),
			updated: None,
			deleted: None,
			message: None,
			source_assigning_authority: None,
			resource_version: None,
			status: 200,
		};
		assert_eq!(entry.kind(), MergeOutcomeKind::Created);
	}

	#[test]
	fn classifies_issue() {
		let entry = MergeResponseEntry::Issue {
			resource_type: Some("Patient".to_string()),
			id: None,
			issue: None,
			error: Some("boom".to_string()),
			status: 500,
		};
		assert_eq!(entry.kind(), MergeOutcomeKind::Issue);
	}

	#[test]
	fn parses_outcome_entry_from_server_json_shape() {
		let json = serde_json::json!({
			"resourceType": "Patient",
			"id": "42",
			"created": true,
			"token": "abc"
		});
		let entry = parse_merge_entry(&json);
		assert_eq!(entry.kind(), MergeOutcomeKind::Created);
	}

	#[test]
	fn parses_issue_entry_distinguished_by_error_field() {
		let json = serde_json::json!({
			"resourceType": "Patient",
			"error": "conflict"
		});
		let entry = parse_merge_entry(&json);
		assert_eq!(entry.kind(), MergeOutcomeKind::Issue);
	}
}
