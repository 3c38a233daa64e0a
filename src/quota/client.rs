//! HTTP client for the external quota authority.

use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AuthorityFetchError, Result, TurnstileError};

/// One quota entry as served by the authority.
///
/// Missing or `null` fields decode as empty/zero so that one bad entry is
/// skipped on its own instead of failing the whole list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaItem {
    #[serde(default, deserialize_with = "null_as_default")]
    pub project: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub route: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub quota: i64,
    /// Window in seconds; zero or less means one second
    #[serde(default, deserialize_with = "null_as_default")]
    pub interval: i64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Body of `GET /quotas?project=...`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaResponse {
    #[serde(default)]
    pub items: Vec<QuotaItem>,
}

/// Pulls the current route quotas of one project.
#[derive(Debug, Clone)]
pub struct QuotaAuthorityClient {
    http: reqwest::Client,
    endpoint: Url,
    project: String,
    retries: u32,
}

impl QuotaAuthorityClient {
    /// Build a client for `{base_url}/quotas?project={project}`.
    pub fn new(base_url: &str, project: &str, timeout: Duration, retries: u32) -> Result<Self> {
        if project.trim().is_empty() {
            return Err(TurnstileError::Config("quota project id is required".into()));
        }
        let endpoint = Url::parse_with_params(
            &format!("{}/quotas", base_url.trim().trim_end_matches('/')),
            &[("project", project)],
        )
        .map_err(|e| TurnstileError::Config(format!("invalid quota authority URL: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TurnstileError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            project: project.to_string(),
            retries,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Fetch the quota list, retrying transport failures up to `retries` times.
    pub async fn fetch(&self) -> std::result::Result<Vec<QuotaItem>, AuthorityFetchError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once().await {
                Err(AuthorityFetchError::Transport(e)) if attempt < self.retries => {
                    attempt += 1;
                    warn!(error = %e, attempt = attempt, "Quota authority request failed, retrying");
                }
                result => return result,
            }
        }
    }

    async fn fetch_once(&self) -> std::result::Result<Vec<QuotaItem>, AuthorityFetchError> {
        debug!(url = %self.endpoint, "Requesting route quotas");
        let response = self.http.get(self.endpoint.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthorityFetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let parsed: QuotaResponse = serde_json::from_slice(&body)
            .map_err(|e| AuthorityFetchError::Decode(e.to_string()))?;

        Ok(parsed
            .items
            .into_iter()
            .filter(|item| item.project.is_empty() || item.project == self.project)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(uri: &str) -> QuotaAuthorityClient {
        QuotaAuthorityClient::new(uri, "billing", Duration::from_millis(500), 1).unwrap()
    }

    #[test]
    fn test_endpoint_built_from_base() {
        let c = client("http://quota.internal:10000/");
        assert_eq!(
            c.endpoint().as_str(),
            "http://quota.internal:10000/quotas?project=billing"
        );
    }

    #[test]
    fn test_project_required() {
        let err = QuotaAuthorityClient::new("http://localhost", " ", Duration::from_secs(1), 0).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_invalid_url() {
        let err = QuotaAuthorityClient::new("not a url", "p", Duration::from_secs(1), 0).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[tokio::test]
    async fn test_fetch_parses_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quotas"))
            .and(query_param("project", "billing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"project": "billing", "route": "/v1/foo", "quota": 10, "interval": 10},
                    {"project": "other", "route": "/v1/bar", "quota": 5, "interval": 1},
                    {"route": "/v1/baz", "quota": 3}
                ]
            })))
            .mount(&server)
            .await;

        let items = client(&server.uri()).fetch().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].route, "/v1/foo");
        assert_eq!(items[1].interval, 0);
    }

    #[tokio::test]
    async fn test_null_and_missing_fields_decode_as_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"route": "/v1/foo", "quota": 1, "interval": 60},
                    {"project": null, "route": null, "quota": 5},
                    {"route": "/v1/bar", "interval": null}
                ]
            })))
            .mount(&server)
            .await;

        let items = client(&server.uri()).fetch().await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].route, "");
        assert_eq!(items[1].quota, 5);
        assert_eq!(items[2].quota, 0);
        assert_eq!(items[2].interval, 0);
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server.uri()).fetch().await.unwrap_err();
        assert!(matches!(err, AuthorityFetchError::Status(503)));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = client(&server.uri()).fetch().await.unwrap_err();
        assert!(matches!(err, AuthorityFetchError::Decode(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"items": []}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let err = client(&server.uri()).fetch().await.unwrap_err();
        assert!(matches!(err, AuthorityFetchError::Transport(_)));
        // one attempt plus one retry, each cut at 500ms
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}
