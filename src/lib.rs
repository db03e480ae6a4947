//! Async client engine for FHIR R4 servers: URL composition, SMART-on-FHIR
//! client-credentials auth, retryable HTTP transport, response processing
//! (including NDJSON streaming), parallel paged retrieval, the two-phase
//! by-`_lastUpdated` engine, and the merge/validate pipeline.
//!
//! Resources are kept as opaque `serde_json::Value` bags; this crate has no
//! generated FHIR resource domain model. See [`client::ClientState`] for
//! the entry point.

pub mod client;
pub mod model;

pub use client::error::Error;
pub use client::{ClientState, FhirClient};
pub use model::GetResponse;
