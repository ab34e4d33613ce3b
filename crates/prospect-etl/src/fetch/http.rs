//! Shared HTTP plumbing for the collaborators.

use std::time::Duration;

use backon::ExponentialBuilder;
use reqwest::{Client, Response, StatusCode};

use crate::error::{EnrichError, EnrichResult};

pub const USER_AGENT: &str = concat!("prospect/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client shared by every collaborator.
pub fn build_client(timeout: Duration) -> EnrichResult<Client> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

/// Backoff for transient upstream faults: 0.5s doubling to at most 8s,
/// three retries.
pub fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(8))
        .with_max_times(3)
        .with_jitter()
}

/// Classify a response status. 429 is a rate-limit rejection, 404 a
/// missing entity and any other non-success an HTTP fault.
pub fn check_status(source_name: &str, response: Response) -> EnrichResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(status_error(source_name, status, response.url().path()))
}

pub fn status_error(source_name: &str, status: StatusCode, entity: &str) -> EnrichError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => EnrichError::RateLimited {
            source_name: source_name.to_string(),
        },
        StatusCode::NOT_FOUND => EnrichError::NotFound {
            entity: entity.to_string(),
            source_name: source_name.to_string(),
        },
        other => EnrichError::http(source_name, other),
    }
}
