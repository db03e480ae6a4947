//! Composes FHIR request URLs from the current query state.

use std::collections::BTreeSet;

use crate::model::{LastUpdatedFilter, SortField};

/// The subset of [`crate::client::ClientState`] that influences URL
/// composition, passed by reference so the builder has no dependency on the
/// rest of the client configuration.
#[derive(Debug, Clone, Default)]
pub struct UrlParts<'a> {
	pub base: &'a str,
	pub resource: Option<&'a str>,
	pub ids: &'a [String],
	pub action: Option<&'a str>,
	pub filter_by_resource: Option<&'a str>,
	pub filter_parameter: Option<&'a str>,
	pub include_only_properties: &'a [String],
	pub page_number: Option<u64>,
	pub page_size: Option<u64>,
	pub sort_fields: &'a [SortField],
	pub include_total: bool,
	pub id_above: Option<&'a str>,
	pub additional_parameters: &'a [String],
	pub custom_filters: Option<&'a BTreeSet<String>>,
	pub last_updated: Option<&'a LastUpdatedFilter>,
}

static EMPTY_LAST_UPDATED: LastUpdatedFilter = LastUpdatedFilter { greater_than: None, less_than: None };

/// Builds the fully composed URL string for the given query state.
///
/// Mirrors the reference engine's `build_url`: no validation is performed
/// here, callers are responsible for logical consistency of the parts (e.g.
/// not setting both a single id and `filter_by_resource` with multiple ids).
#[must_use]
pub fn build_url(parts: &UrlParts<'_>) -> String {
	let mut path = parts.base.trim_end_matches('/').to_string();
	if let Some(resource) = parts.resource {
		path.push('/');
		path.push_str(resource);
	}

	match parts.ids {
		[] => {}
		[single] if parts.filter_by_resource.is_none() => {
			path.push('/');
			path.push_str(single);
		}
		ids => {
			if let Some(filter_by_resource) = parts.filter_by_resource {
				let key = match parts.filter_parameter {
					Some(filter_parameter) => format!("{filter_parameter}:{filter_by_resource}"),
					None => filter_by_resource.to_lowercase(),
				};
				push_param(&mut path, &key, &ids[0]);
			} else {
				push_param(&mut path, "id", &ids.join(","));
			}
		}
	}

	if let Some(action) = parts.action {
		path.push('/');
		path.push_str(action);
	}

	if !parts.include_only_properties.is_empty() {
		push_param(&mut path, "_elements", &parts.include_only_properties.join(","));
	}

	if let Some(page_size) = parts.page_size {
		push_param(&mut path, "_count", &page_size.to_string());
		push_param(&mut path, "_getpagesoffset", &parts.page_number.unwrap_or(0).to_string());
	}

	if !parts.sort_fields.is_empty() {
		let rendered: Vec<String> = parts.sort_fields.iter().map(SortField::render).collect();
		push_param(&mut path, "_sort", &rendered.join(","));
	}

	if parts.include_total {
		push_param(&mut path, "_total", "accurate");
	}

	if let Some(cursor) = parts.id_above {
		push_param(&mut path, "id:above", cursor);
	}

	for filter in parts.custom_filters.into_iter().flatten() {
		push_raw(&mut path, filter);
	}

	for extra in parts.additional_parameters {
		push_raw(&mut path, extra);
	}

	let last_updated = parts.last_updated.unwrap_or(&EMPTY_LAST_UPDATED);
	if let Some(before) = last_updated.less_than {
		push_param(&mut path, "_lastUpdated", &format!("lt{}", LastUpdatedFilter::format(before)));
	}
	if let Some(after) = last_updated.greater_than {
		push_param(&mut path, "_lastUpdated", &format!("ge{}", LastUpdatedFilter::format(after)));
	}

	path
}

fn push_param(path: &mut String, key: &str, value: &str) {
	path.push(if path.contains('?') { '&' } else { '?' });
	path.push_str(key);
	path.push('=');
	path.push_str(&urlencoding_light(value));
}

/// Appends a pre-formatted `key=value` (or bare) filter string verbatim,
/// matching the reference engine's treatment of custom filters and extra
/// parameters as opaque strings.
fn push_raw(path: &mut String, raw: &str) {
	path.push(if path.contains('?') { '&' } else { '?' });
	path.push_str(raw);
}

/// Minimal percent-encoding for the handful of characters that appear in
/// FHIR search values (commas and colons are left alone; they are
/// meaningful in `id=a,b,c` and `_lastUpdated=ge...`).
fn urlencoding_light(value: &str) -> String {
	value.replace(' ', "%20")
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn builds_simple_read() {
		let ids = vec!["12355".to_string()];
		let parts = UrlParts {
			base: "http://srv",
			resource: Some("Patient"),
			ids: &ids,
			..Default::default()
		};
		assert_eq!(build_url(&parts), "http://srv/Patient/12355");
	}

	#[test]
	fn builds_paged_search_with_sort_and_total() {
		let sort = vec![SortField::ascending("name"), SortField::descending("birthdate")];
		let parts = UrlParts {
			base: "http://srv",
			resource: Some("Patient"),
			page_size: Some(10),
			page_number: Some(2),
			sort_fields: &sort,
			include_total: true,
			..Default::default()
		};
		let url = build_url(&parts);
		assert_eq!(
			url,
			"http://srv/Patient?_count=10&_getpagesoffset=2&_sort=name,-birthdate&_total=accurate"
		);
	}

	#[test]
	fn builds_reference_search_with_filter_parameter() {
		let ids = vec!["123".to_string()];
		let parts = UrlParts {
			base: "http://srv",
			resource: Some("Observation"),
			ids: &ids,
			filter_by_resource: Some("Patient"),
			filter_parameter: Some("subject"),
			..Default::default()
		};
		assert_eq!(build_url(&parts), "http://srv/Observation?subject:Patient=123");
	}

	#[test]
	fn multiple_ids_without_filter_by_resource_joins_as_id_list() {
		let ids = vec!["1".to_string(), "2".to_string(), "3".to_string()];
		let parts =
			UrlParts { base: "http://srv", resource: Some("Patient"), ids: &ids, ..Default::default() };
		assert_eq!(build_url(&parts), "http://srv/Patient?id=1,2,3");
	}

	#[test]
	fn last_updated_bounds_both_present_in_order() {
		let last_updated = LastUpdatedFilter {
			greater_than: Some(chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
			less_than: Some(chrono::Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
		};
		let parts = UrlParts {
			base: "http://srv",
			resource: Some("Patient"),
			last_updated: Some(&last_updated),
			..Default::default()
		};
		let url = build_url(&parts);
		assert_eq!(
			url,
			"http://srv/Patient?_lastUpdated=lt2024-02-01T00:00:00Z&_lastUpdated=ge2024-01-01T00:00:00Z"
		);
	}

	#[test]
	fn graph_action_appends_as_path_segment() {
		let ids = vec!["1".to_string()];
		let parts = UrlParts {
			base: "http://srv",
			resource: Some("Patient"),
			ids: &ids,
			action: Some("$graph"),
			..Default::default()
		};
		assert_eq!(build_url(&parts), "http://srv/Patient/1/$graph");
	}
}
