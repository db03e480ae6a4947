//! Retryable HTTP transport: backoff, 429 `Retry-After` handling, 401
//! refresh-and-retry, optional compression/chunking, and per-attempt
//! tracing.
//!
//! Grounded on the reference engine's `RetryableAioHttpClient.fetch` state
//! machine: `SEND -> (2xx done) | (4xx-non-401 done) | (401 -> refresh ->
//! retry) | (429 -> sleep-per-retry-after -> retry) | (5xx-retryable ->
//! backoff -> retry) | (other -> done-or-raise)`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use super::auth::AuthEngine;
use super::error::Error;

/// One recorded attempt against a URL, kept for diagnostics and for the
/// `log_all_url_results` behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptLog {
	pub ok: bool,
	pub url: String,
	pub status: u16,
	pub retry_count: u32,
	pub start_time: DateTime<Utc>,
	pub end_time: DateTime<Utc>,
}

/// Context passed to a `trace_fn` after every attempt.
#[derive(Debug, Clone)]
pub struct TraceEvent {
	pub url: String,
	pub status: u16,
	pub retry_count: u32,
	pub start_time: DateTime<Utc>,
	pub end_time: DateTime<Utc>,
	pub request_headers: HashMap<String, String>,
	pub response_headers: HashMap<String, String>,
}

pub type TraceFn = Arc<dyn Fn(&TraceEvent) + Send + Sync>;

/// Context passed to a `refresh_token_fn` on a 401.
#[derive(Debug, Clone)]
pub struct RefreshContext {
	pub current_token: Option<String>,
	pub expiry: Option<DateTime<Utc>>,
	pub url: String,
	pub status: u16,
	pub retry_count: u32,
}

/// Result of a `refresh_token_fn` invocation.
#[derive(Debug, Clone)]
pub struct RefreshResult {
	pub access_token: Option<String>,
	pub abort_request: bool,
}

/// Injectable 401 refresh hook: called with `(current_token, expiry, url,
/// status, retry_count)`. If the result says `abort_request` or yields no
/// token, the caller returns the 401 response as-is; otherwise the header is
/// replaced and the request retried. Takes precedence over a configured
/// [`AuthEngine`] when set, mirroring the reference engine's caller-supplied
/// `refresh_token_function`.
pub type RefreshTokenFn = Arc<dyn Fn(RefreshContext) -> BoxFuture<'static, RefreshResult> + Send + Sync>;

/// Transport-level behavior, independent of any one request.
#[derive(Clone)]
pub struct TransportOptions {
	pub retries: u32,
	pub timeout: Option<Duration>,
	pub backoff_factor: f64,
	pub retry_status_codes: HashSet<u16>,
	pub exclude_status_codes_from_retry: HashSet<u16>,
	pub throw_on_error: bool,
	pub log_all_url_results: bool,
	pub maximum_time_to_retry_on_429: Option<Duration>,
	pub compress: bool,
	pub send_data_as_chunked: bool,
}

impl Default for TransportOptions {
	fn default() -> Self {
		Self {
			retries: 2,
			timeout: None,
			backoff_factor: 1.0,
			retry_status_codes: [500, 502, 503, 504].into_iter().collect(),
			exclude_status_codes_from_retry: HashSet::new(),
			throw_on_error: false,
			log_all_url_results: false,
			maximum_time_to_retry_on_429: None,
			compress: false,
			send_data_as_chunked: false,
		}
	}
}

/// The uniform result of a [`Transport::fetch`] call.
#[derive(Debug, Clone)]
pub struct RawResponse {
	pub status: u16,
	pub headers: HashMap<String, String>,
	pub body: String,
	pub access_token: Option<String>,
	pub retry_count: u32,
	pub attempts: Vec<AttemptLog>,
}

pub struct Transport {
	http: reqwest::Client,
	auth: Option<Arc<AuthEngine>>,
	options: TransportOptions,
	trace_fn: Option<TraceFn>,
	refresh_token_fn: Option<RefreshTokenFn>,
}

impl Transport {
	#[must_use]
	pub fn new(http: reqwest::Client, auth: Option<Arc<AuthEngine>>, options: TransportOptions) -> Self {
		Self { http, auth, options, trace_fn: None, refresh_token_fn: None }
	}

	#[must_use]
	pub fn with_trace_fn(mut self, trace_fn: TraceFn) -> Self {
		self.trace_fn = Some(trace_fn);
		self
	}

	#[must_use]
	pub fn with_refresh_token_fn(mut self, refresh_token_fn: RefreshTokenFn) -> Self {
		self.refresh_token_fn = Some(refresh_token_fn);
		self
	}

	/// Executes `method url` with the given headers and optional body,
	/// retrying per the transport's configured policy. `access_token`, when
	/// present, seeds the `Authorization` header for the first attempt; the
	/// auth engine (if configured) is consulted only on the initial send and
	/// after a 401.
	pub async fn fetch(
		&self,
		method: Method,
		url: &str,
		mut headers: HashMap<String, String>,
		body: Option<Vec<u8>>,
	) -> Result<RawResponse, Error> {
		let mut attempts = Vec::new();
		let mut retry_count = 0u32;
		let mut access_token = None;
		let mut cumulative_429_wait = Duration::ZERO;

		if let Some(auth) = &self.auth {
			let token = auth.get_access_token().await?;
			headers.insert("Authorization".to_string(), format!("Bearer {token}"));
			access_token = Some(token);
		}

		loop {
			let start_time = Utc::now();
			let body_for_attempt = self.prepare_body(body.as_deref());

			let mut request = self.http.request(method.clone(), url);
			for (key, value) in &headers {
				request = request.header(key.as_str(), value.as_str());
			}
			if self.options.compress && body.is_some() {
				request = request.header("Content-Encoding", "gzip");
			}
			if self.options.send_data_as_chunked && body.is_some() {
				request = request.header("Transfer-Encoding", "chunked");
			}
			if let Some(timeout) = self.options.timeout {
				request = request.timeout(timeout);
			}
			if let Some(bytes) = body_for_attempt {
				request = request.body(bytes);
			}

			let result = request.send().await;
			let end_time = Utc::now();

			let response = match result {
				Ok(response) => response,
				Err(err) => {
					attempts.push(AttemptLog {
						ok: false,
						url: url.to_string(),
						status: 0,
						retry_count,
						start_time,
						end_time,
					});
					let classified = Error::from(err);
					if classified.should_retry() && retry_count < self.options.retries {
						retry_count += 1;
						self.sleep_backoff(retry_count).await;
						continue;
					}
					if self.options.throw_on_error {
						return Err(classified);
					}
					return Ok(RawResponse {
						status: 500,
						headers: HashMap::new(),
						body: classified.to_string(),
						access_token,
						retry_count,
						attempts,
					});
				}
			};

			let status = response.status();
			let response_headers = header_map_to_strings(response.headers());
			attempts.push(AttemptLog {
				ok: status.is_success(),
				url: url.to_string(),
				status: status.as_u16(),
				retry_count,
				start_time,
				end_time,
			});

			if let Some(trace_fn) = &self.trace_fn {
				trace_fn(&TraceEvent {
					url: url.to_string(),
					status: status.as_u16(),
					retry_count,
					start_time,
					end_time,
					request_headers: headers.clone(),
					response_headers: response_headers.clone(),
				});
			}

			if status.is_success() {
				let body = response.text().await?;
				return Ok(RawResponse {
					status: status.as_u16(),
					headers: response_headers,
					body,
					access_token,
					retry_count,
					attempts,
				});
			}

			if matches!(status, StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND) {
				let body = response.text().await.unwrap_or_default();
				return Ok(RawResponse {
					status: status.as_u16(),
					headers: response_headers,
					body,
					access_token,
					retry_count,
					attempts,
				});
			}

			if status == StatusCode::TOO_MANY_REQUESTS {
				if retry_count >= self.options.retries {
					let body = response.text().await.unwrap_or_default();
					return Ok(RawResponse {
						status: status.as_u16(),
						headers: response_headers,
						body,
						access_token,
						retry_count,
						attempts,
					});
				}
				let wait = parse_retry_after(response.headers().get("retry-after"));
				if let Some(cap) = self.options.maximum_time_to_retry_on_429 {
					if cumulative_429_wait + wait > cap {
						let body = response.text().await.unwrap_or_default();
						return Ok(RawResponse {
							status: status.as_u16(),
							headers: response_headers,
							body,
							access_token,
							retry_count,
							attempts,
						});
					}
				}
				cumulative_429_wait += wait;
				tokio::time::sleep(wait).await;
				retry_count += 1;
				continue;
			}

			if status == StatusCode::UNAUTHORIZED {
				if retry_count >= self.options.retries {
					let body = response.text().await.unwrap_or_default();
					return Ok(RawResponse {
						status: status.as_u16(),
						headers: response_headers,
						body,
						access_token,
						retry_count,
						attempts,
					});
				}

				if let Some(refresh_token_fn) = &self.refresh_token_fn {
					let expiry = match &self.auth {
						Some(auth) => auth.current_expiry().await,
						None => None,
					};
					let result = refresh_token_fn(RefreshContext {
						current_token: access_token.clone(),
						expiry,
						url: url.to_string(),
						status: status.as_u16(),
						retry_count,
					})
					.await;
					match result.access_token {
						Some(new_token) if !result.abort_request => {
							headers.insert("Authorization".to_string(), format!("Bearer {new_token}"));
							access_token = Some(new_token);
							retry_count += 1;
							continue;
						}
						_ => {
							let body = response.text().await.unwrap_or_default();
							return Ok(RawResponse {
								status: status.as_u16(),
								headers: response_headers,
								body,
								access_token,
								retry_count,
								attempts,
							});
						}
					}
				}

				match &self.auth {
					Some(auth) => {
						auth.invalidate().await;
						let new_token = auth.get_access_token().await?;
						headers.insert("Authorization".to_string(), format!("Bearer {new_token}"));
						access_token = Some(new_token);
						retry_count += 1;
						continue;
					}
					None => {
						let body = response.text().await.unwrap_or_default();
						return Ok(RawResponse {
							status: status.as_u16(),
							headers: response_headers,
							body,
							access_token,
							retry_count,
							attempts,
						});
					}
				}
			}

			let retryable = self.options.retry_status_codes.contains(&status.as_u16())
				&& !self.options.exclude_status_codes_from_retry.contains(&status.as_u16());
			if retryable && retry_count < self.options.retries {
				retry_count += 1;
				self.sleep_backoff(retry_count).await;
				continue;
			}

			let body = response.text().await.unwrap_or_default();
			if self.options.throw_on_error {
				return Err(Error::Response(status, body));
			}
			return Ok(RawResponse {
				status: status.as_u16(),
				headers: response_headers,
				body,
				access_token,
				retry_count,
				attempts,
			});
		}
	}

	async fn sleep_backoff(&self, attempt: u32) {
		let seconds = self.options.backoff_factor * 2f64.powi(attempt as i32 - 1);
		tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
	}

	fn prepare_body(&self, body: Option<&[u8]>) -> Option<Vec<u8>> {
		let body = body?;
		if self.options.compress {
			use std::io::Write;
			let mut encoder =
				flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
			encoder.write_all(body).ok()?;
			encoder.finish().ok()
		} else {
			Some(body.to_vec())
		}
	}
}

fn header_map_to_strings(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
	headers
		.iter()
		.filter_map(|(name, value)| {
			value.to_str().ok().map(|v| (name.as_str().to_lowercase(), v.to_string()))
		})
		.collect()
}

/// Parses a `Retry-After` header: numeric seconds, an HTTP-date (clamped to
/// non-negative), or a 60s fallback on anything unparseable.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Duration {
	let Some(value) = value.and_then(|v| v.to_str().ok()) else {
		return Duration::from_secs(60);
	};

	if let Ok(seconds) = value.trim().parse::<u64>() {
		return Duration::from_secs(seconds);
	}

	if let Ok(date) = DateTime::parse_from_rfc2822(value) {
		let now = Utc::now();
		let target = date.with_timezone(&Utc);
		return (target - now).to_std().unwrap_or(Duration::ZERO);
	}

	Duration::from_secs(60)
}

#[cfg(test)]
mod tests {
	use super::*;
	use reqwest::header::HeaderValue;

	#[test]
	fn parses_numeric_retry_after() {
		let value = HeaderValue::from_static("5");
		assert_eq!(parse_retry_after(Some(&value)), Duration::from_secs(5));
	}

	#[test]
	fn falls_back_to_sixty_seconds_on_garbage() {
		let value = HeaderValue::from_static("not-a-date-or-number");
		assert_eq!(parse_retry_after(Some(&value)), Duration::from_secs(60));
	}

	#[test]
	fn missing_header_falls_back_to_sixty_seconds() {
		assert_eq!(parse_retry_after(None), Duration::from_secs(60));
	}

	#[test]
	fn past_http_date_clamps_to_zero() {
		let value = HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT");
		assert_eq!(parse_retry_after(Some(&value)), Duration::ZERO);
	}
}
