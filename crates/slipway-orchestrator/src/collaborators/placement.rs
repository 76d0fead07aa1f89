// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for the placement ("find a dock") service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slipway_core::graph::{ContextVersion, Owner};
use tracing::debug;

use super::{CollaboratorError, DockFinder, Result, status_error, transport_error};

const SERVICE: &str = "placement";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindDockRequest<'a> {
    owner_github_id: i64,
    context_version_id: &'a str,
    purpose: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindDockResponse {
    docker_host: String,
}

#[derive(Debug, Deserialize)]
struct AvailabilityResponse {
    available: bool,
}

/// [`DockFinder`] backed by the placement service's HTTP API.
///
/// - `POST {base}/docks/build` and `POST {base}/docks/container` return `{"dockerHost": "..."}`
/// - `GET {base}/docks/available?host=...` returns `{"available": true|false}`
#[derive(Debug, Clone)]
pub struct HttpDockFinder {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDockFinder {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn find(&self, purpose: &str, owner: &Owner, cv: &ContextVersion) -> Result<String> {
        let url = format!("{}/docks/{}", self.base_url, purpose);
        let response = self
            .client
            .post(&url)
            .json(&FindDockRequest {
                owner_github_id: owner.github_id,
                context_version_id: &cv.id,
                purpose,
            })
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let found: FindDockResponse = response
            .json()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        if found.docker_host.is_empty() {
            return Err(CollaboratorError::Unavailable(format!(
                "no dock available for {} of {}",
                purpose, cv.id
            )));
        }

        debug!(
            context_version_id = %cv.id,
            docker_host = %found.docker_host,
            purpose,
            "Placement picked a dock"
        );
        Ok(found.docker_host)
    }
}

#[async_trait]
impl DockFinder for HttpDockFinder {
    async fn find_dock_for_build(&self, owner: &Owner, cv: &ContextVersion) -> Result<String> {
        self.find("build", owner, cv).await
    }

    async fn find_dock_for_container(
        &self,
        owner: &Owner,
        cv: &ContextVersion,
    ) -> Result<String> {
        self.find("container", owner, cv).await
    }

    async fn is_dock_available(&self, docker_host: &str) -> Result<bool> {
        let url = format!("{}/docks/available", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("host", docker_host)])
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let availability: AvailabilityResponse = response
            .json()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        Ok(availability.available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalised() {
        let finder = HttpDockFinder::new("http://placement.local:4242/").unwrap();
        assert_eq!(finder.base_url, "http://placement.local:4242");
    }

    #[test]
    fn test_request_shape() {
        let body = serde_json::to_value(FindDockRequest {
            owner_github_id: 7,
            context_version_id: "cv-1",
            purpose: "build",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "ownerGithubId": 7, "contextVersionId": "cv-1", "purpose": "build" })
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let finder = HttpDockFinder::new("http://127.0.0.1:9").unwrap();
        let err = finder.is_dock_available("http://10.0.0.1:4242").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }
}
