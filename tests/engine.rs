//! End-to-end tests against a mocked FHIR server, covering the scenarios
//! that only show up once transport, response processing, auth, and paging
//! are wired together.

use eyre::Result;
use fhir_client_engine::ClientState;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn single_read_returns_the_resource_body() -> Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/Patient/123"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"resourceType": "Patient",
			"id": "123",
			"name": [{"family": "Doe"}]
		})))
		.mount(&server)
		.await;

	let client = ClientState::new(server.uri()).with_resource("Patient").with_id("123").build()?;
	let response = client.get().await?;

	assert!(response.successful());
	assert_eq!(response.resource_type.as_deref(), Some("Patient"));
	assert_eq!(response.id.as_deref(), Some("123"));
	assert_eq!(response.body["name"][0]["family"], "Doe");
	Ok(())
}

#[tokio::test]
async fn paged_query_follows_two_pages_until_empty() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/Patient"))
		.and(query_param("_getpagesoffset", "0"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"resourceType": "Bundle",
			"entry": [
				{"resource": {"resourceType": "Patient", "id": "1"}},
				{"resource": {"resourceType": "Patient", "id": "2"}},
			]
		})))
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/Patient"))
		.and(query_param("_getpagesoffset", "1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"resourceType": "Bundle",
			"entry": []
		})))
		.mount(&server)
		.await;

	let client = ClientState::new(server.uri()).with_resource("Patient").with_page_size(2).build()?;
	let response = client.search_paged().await?;

	assert_eq!(response.body.as_array().unwrap().len(), 2);
	Ok(())
}

#[tokio::test]
async fn rate_limited_request_retries_after_retry_after_header() -> Result<()> {
	let server = MockServer::start().await;

	// mounted last, so checked first; exhausted after one hit, falling
	// through to the always-on 200 mock below.
	Mock::given(method("GET"))
		.and(path("/Patient/1"))
		.respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
		.up_to_n_times(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/Patient/1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"resourceType": "Patient", "id": "1"})))
		.mount(&server)
		.await;

	let client = ClientState::new(server.uri()).with_resource("Patient").with_id("1").build()?;
	let response = client.get().await?;

	assert!(response.successful());
	assert_eq!(response.id.as_deref(), Some("1"));
	Ok(())
}

#[tokio::test]
async fn unauthorized_response_triggers_token_refresh_and_retry() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/oauth/token"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"access_token": "tok-1",
			"expires_in": 3600
		})))
		.mount(&server)
		.await;

	Mock::given(method("GET"))
		.and(path("/Patient/1"))
		.and(header("Authorization", "Bearer tok-1"))
		.respond_with(ResponseTemplate::new(401))
		.up_to_n_times(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/Patient/1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"resourceType": "Patient", "id": "1"})))
		.mount(&server)
		.await;

	let client = ClientState::new(server.uri())
		.with_resource("Patient")
		.with_id("1")
		.with_client_credentials("client-a", "secret-a")
		.with_auth_server_url(format!("{}/oauth/token", server.uri()))
		.build()?;
	let response = client.get().await?;

	assert!(response.successful());
	Ok(())
}

#[tokio::test]
async fn bundle_contained_resources_are_promoted_without_mutating_the_parent() -> Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/Practitioner"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"resourceType": "Bundle",
			"entry": [{
				"resource": {
					"resourceType": "Practitioner",
					"id": "1",
					"contained": [{"resourceType": "PractitionerRole", "id": "2"}]
				}
			}]
		})))
		.mount(&server)
		.await;

	let client = ClientState::new(server.uri())
		.with_resource("Practitioner")
		.with_separate_bundle_resources(true)
		.build()?;
	let response = client.get().await?;

	let map = response.body.as_array().expect("expanded body is an array")[0]
		.as_object()
		.expect("expanded entry is an object");
	assert!(map["practitioner"][0].get("contained").is_none());
	assert_eq!(map["practitionerrole"][0]["id"], "2");
	Ok(())
}

#[tokio::test]
async fn next_link_inherits_the_base_url_port_when_missing() -> Result<()> {
	let server = MockServer::start().await;
	let host = server.address().ip();
	let port = server.address().port();
	let portless_next = format!("http://{host}/Observation?_count=10&_getpagesoffset=1");

	Mock::given(method("GET"))
		.and(path("/Observation"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"resourceType": "Bundle",
			"entry": [],
			"link": [{"relation": "next", "url": portless_next}]
		})))
		.mount(&server)
		.await;

	let client = ClientState::new(server.uri()).with_resource("Observation").build()?;
	let response = client.get().await?;

	let next_url = response.next_url.expect("next link present");
	assert_eq!(next_url, format!("http://{host}:{port}/Observation?_count=10&_getpagesoffset=1"));
	Ok(())
}
