//! SMART-on-FHIR scope parsing and interaction checks.
//!
//! Grounded on the reference engine's `fhir_scope_parser.py`: scopes of the
//! shape `<context>/<resourceType>.<interaction>` (context one of
//! `patient|user|system|launch`, `resourceType`/`interaction` may be `*`)
//! plus bare tokens (`openid`, `offline_access`) kept as opaque strings.

/// One parsed SMART scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FhirScope {
	/// `<context>/<resourceType>.<interaction>`, e.g. `patient/Observation.read`.
	Scoped { context: String, resource_type: String, interaction: String },
	/// A bare token such as `openid` or `offline_access`.
	Bare(String),
}

impl FhirScope {
	/// Parses one space-joined scope string into its component scopes.
	/// Drops an orphan `launch/patient` scope when no corresponding
	/// `patient/*` scope is also present, matching the reference parser.
	#[must_use]
	pub fn parse(scopes: &str) -> Vec<Self> {
		let mut parsed: Vec<Self> =
			scopes.split_whitespace().map(Self::parse_one).collect();

		let has_patient_context =
			parsed.iter().any(|scope| matches!(scope, Self::Scoped { context, .. } if context == "patient"));
		if !has_patient_context {
			parsed.retain(|scope| {
				!matches!(
					scope,
					Self::Scoped { context, resource_type, .. }
						if context == "launch" && resource_type == "patient"
				)
			});
		}

		parsed
	}

	fn parse_one(token: &str) -> Self {
		let Some((context, rest)) = token.split_once('/') else {
			return Self::Bare(token.to_string());
		};
		if !matches!(context, "patient" | "user" | "system" | "launch") {
			return Self::Bare(token.to_string());
		}
		let Some((resource_type, interaction)) = rest.split_once('.') else {
			return Self::Scoped {
				context: context.to_string(),
				resource_type: rest.to_string(),
				interaction: "*".to_string(),
			};
		};
		Self::Scoped {
			context: context.to_string(),
			resource_type: resource_type.to_string(),
			interaction: interaction.to_lowercase(),
		}
	}

	/// Renders this scope back to its string form, the inverse of
	/// [`Self::parse_one`].
	#[must_use]
	pub fn render(&self) -> String {
		match self {
			Self::Bare(token) => token.clone(),
			Self::Scoped { context, resource_type, interaction } => {
				format!("{context}/{resource_type}.{interaction}")
			}
		}
	}
}

/// Decides whether a parsed scope list allows `interaction` on
/// `resource_type`.
///
/// `OperationOutcome` and `Bundle` are always allowed. An absent scope list,
/// or one with no SMART-style-scoped entries at all (a vendor not using
/// SMART scoping), also allows everything. Otherwise some scope must match
/// both the resource type and the interaction (`*` or case-insensitive
/// exact).
#[must_use]
pub fn allows(scopes: &[FhirScope], resource_type: &str, interaction: &str) -> bool {
	if resource_type.eq_ignore_ascii_case("OperationOutcome") || resource_type.eq_ignore_ascii_case("Bundle") {
		return true;
	}

	let scoped: Vec<&FhirScope> = scopes.iter().filter(|s| matches!(s, FhirScope::Scoped { .. })).collect();
	if scoped.is_empty() {
		return true;
	}

	scoped.iter().any(|scope| {
		let FhirScope::Scoped { resource_type: scoped_type, interaction: scoped_interaction, .. } = scope else {
			unreachable!()
		};
		(scoped_type == "*" || scoped_type.eq_ignore_ascii_case(resource_type))
			&& (scoped_interaction == "*" || scoped_interaction.eq_ignore_ascii_case(interaction))
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_scoped_and_bare_tokens() {
		let scopes = FhirScope::parse("patient/Observation.read openid system/*.*");
		assert_eq!(
			scopes,
			vec![
				FhirScope::Scoped {
					context: "patient".to_string(),
					resource_type: "Observation".to_string(),
					interaction: "read".to_string()
				},
				FhirScope::Bare("openid".to_string()),
				FhirScope::Scoped {
					context: "system".to_string(),
					resource_type: "*".to_string(),
					interaction: "*".to_string()
				},
			]
		);
	}

	#[test]
	fn drops_orphan_launch_patient() {
		let scopes = FhirScope::parse("launch/patient user/Patient.read");
		assert!(scopes.iter().all(|s| s.render() != "launch/patient"));
	}

	#[test]
	fn keeps_launch_patient_when_patient_scope_present() {
		let scopes = FhirScope::parse("launch/patient patient/Patient.read");
		assert!(scopes.iter().any(|s| s.render() == "launch/patient"));
	}

	#[test]
	fn no_scopes_allows_everything() {
		assert!(allows(&[], "Observation", "read"));
	}

	#[test]
	fn operation_outcome_and_bundle_always_allowed() {
		let scopes = FhirScope::parse("patient/Observation.read");
		assert!(allows(&scopes, "OperationOutcome", "write"));
		assert!(allows(&scopes, "Bundle", "write"));
	}

	#[test]
	fn scoped_list_denies_unmatched_resource_type() {
		let scopes = FhirScope::parse("patient/Observation.read");
		assert!(!allows(&scopes, "Patient", "read"));
	}

	#[test]
	fn wildcard_scope_allows_any_resource_and_interaction() {
		let scopes = FhirScope::parse("system/*.*");
		assert!(allows(&scopes, "Patient", "write"));
	}

	#[test]
	fn parse_idempotent_on_render() {
		let source = "patient/Observation.read system/*.* openid";
		let first = FhirScope::parse(source);
		let rendered: Vec<String> = first.iter().map(FhirScope::render).collect();
		let second = FhirScope::parse(&rendered.join(" "));
		assert_eq!(first, second);
	}
}
