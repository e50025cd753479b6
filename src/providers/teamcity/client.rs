use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use crate::auth::Token;
use crate::error::{BuildPilotError, Result};

/// REST client for a TeamCity server.
///
/// Implements [`SubmissionProvider`](crate::providers::SubmissionProvider),
/// [`QueueProvider`](crate::providers::QueueProvider) and
/// [`StatusProvider`](crate::providers::StatusProvider). It makes exactly one
/// HTTP request per call; retries and circuit breaking are layered on top by
/// the orchestrator.
pub struct TeamCityClient {
    client: Client,
    api_url: Url,
    token: Option<Token>,
}

/// Upper bound on a single request, connection included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl TeamCityClient {
    pub fn new(base_url: &str, token: Option<Token>) -> Result<Self> {
        Self::with_timeout(base_url, token, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, token: Option<Token>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(concat!("buildpilot/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| BuildPilotError::Config(format!("Failed to create HTTP client: {e}")))?;

        let mut base = Url::parse(base_url)
            .map_err(|e| BuildPilotError::Config(format!("Invalid base URL: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let api_url = base
            .join("app/rest/")
            .map_err(|e| BuildPilotError::Config(format!("Invalid API base URL: {e}")))?;

        Ok(Self {
            client,
            api_url,
            token,
        })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    pub(super) fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .map_err(|e| BuildPilotError::Config(format!("Invalid endpoint '{path}': {e}")))
    }

    /// Endpoint with a `locator` and optional `fields` query.
    pub(super) fn locator_endpoint(&self, path: &str, locator: &str, fields: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint(path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("locator", locator);
            if let Some(fields) = fields {
                query.append_pair("fields", fields);
            }
        }
        Ok(url)
    }

    pub(super) fn get(&self, url: Url) -> RequestBuilder {
        self.auth_request(self.client.get(url))
    }

    pub(super) fn post(&self, url: Url) -> RequestBuilder {
        self.auth_request(self.client.post(url))
    }

    pub(super) fn put(&self, url: Url) -> RequestBuilder {
        self.auth_request(self.client.put(url))
    }

    fn auth_request(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    /// Sends the request and decodes a JSON body.
    pub(super) async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Like [`fetch`](Self::fetch), but a 404 yields `None`.
    pub(super) async fn fetch_optional<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    /// Sends the request and discards the body.
    pub(super) async fn execute(&self, request: RequestBuilder) -> Result<()> {
        Self::check(request.send().await?).await?;
        Ok(())
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());
        let message = message.trim().to_string();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(BuildPilotError::UpstreamTransient {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(BuildPilotError::UpstreamClient {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Locator fragment selecting builds of one configuration.
pub(super) fn build_type_locator(build_type_id: &str) -> String {
    format!("buildType:(id:{build_type_id})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_is_rooted_at_app_rest() {
        let client = TeamCityClient::new("https://ci.example.com", None).unwrap();
        assert_eq!(client.api_url().as_str(), "https://ci.example.com/app/rest/");

        let nested = TeamCityClient::new("https://example.com/teamcity", None).unwrap();
        assert_eq!(nested.api_url().as_str(), "https://example.com/teamcity/app/rest/");
    }

    #[test]
    fn rejects_invalid_base_url() {
        let result = TeamCityClient::new("not a url", None);
        assert!(matches!(result, Err(BuildPilotError::Config(_))));
    }

    #[test]
    fn locator_is_query_encoded() {
        let client = TeamCityClient::new("https://ci.example.com", None).unwrap();
        let url = client
            .locator_endpoint("builds", "buildType:(id:App_Build),running:true", Some("count"))
            .unwrap();

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("locator".to_string(), "buildType:(id:App_Build),running:true".to_string()),
                ("fields".to_string(), "count".to_string()),
            ]
        );
    }
}
