use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::auth::{CredentialStore, PAT_KEY};
use crate::config::Config;
use crate::error::{PipeLensError, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

pub struct AzureClient {
    client: Client,
    service_root: Url,
    credentials: Arc<dyn CredentialStore>,
    max_retries: u32,
    concurrency: usize,
}

/// Outcome of a single attempt, used to decide whether to retry.
enum Attempt<T> {
    Done(Option<T>),
    Retry(String),
}

impl AzureClient {
    pub fn new(config: &Config, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let client = Client::builder()
            .user_agent("PipeLens/0.1.0")
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            service_root: config.service_root.clone(),
            credentials,
            max_retries: config.max_retries,
            concurrency: config.concurrency.max(1),
        })
    }

    fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.get(PAT_KEY) {
            Some(token) => request.basic_auth("", Some(token.as_str())),
            None => request,
        }
    }

    /// Base every relative endpoint is resolved against: `{root}/{project}/_apis/`.
    pub fn project_api_url(&self, project: &str) -> Result<Url> {
        let mut url = self.service_root.clone();
        url.path_segments_mut()
            .map_err(|()| PipeLensError::Config("Service root cannot be a base".to_string()))?
            .pop_if_empty()
            .push(project)
            .push("_apis")
            .push("");
        Ok(url)
    }

    /// Organisation-level endpoint such as `_apis/projects`.
    pub fn organization_url(&self, endpoint: &str) -> Result<String> {
        let mut base = self.service_root.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(endpoint)
            .map(String::from)
            .map_err(|e| PipeLensError::Config(format!("Invalid organization URL: {e}")))
    }

    /// Resolves an endpoint that is either absolute or relative to the project API base.
    pub fn resolve(&self, project: &str, endpoint: &str) -> Result<Url> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Url::parse(endpoint)
                .map_err(|e| PipeLensError::Config(format!("Invalid endpoint URL: {e}")));
        }

        self.project_api_url(project)?
            .join(endpoint)
            .map_err(|e| PipeLensError::Config(format!("Invalid endpoint '{endpoint}': {e}")))
    }

    /// Fetches one endpoint. Any failure is logged and reported as `None`.
    pub async fn fetch_one<T: DeserializeOwned>(
        &self,
        project: &str,
        endpoint: &str,
    ) -> Option<T> {
        let url = match self.resolve(project, endpoint) {
            Ok(url) => url,
            Err(e) => {
                warn!("Skipping endpoint {endpoint}: {e}");
                return None;
            }
        };

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = backoff_for(attempt);
                debug!("Retrying {url} in {backoff:?} (attempt {attempt}): {last_error}");
                tokio::time::sleep(backoff).await;
            }

            match self.try_fetch(&url).await {
                Attempt::Done(value) => return value,
                Attempt::Retry(reason) => last_error = reason,
            }
        }

        warn!(
            "Giving up on {url} after {} attempts: {last_error}",
            self.max_retries + 1
        );
        None
    }

    async fn try_fetch<T: DeserializeOwned>(&self, url: &Url) -> Attempt<T> {
        let request = self.auth_request(self.client.get(url.clone()));

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => return Attempt::Retry(e.to_string()),
            Err(e) => {
                warn!("Request to {url} failed: {e}");
                return Attempt::Done(None);
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Attempt::Retry(format!("HTTP {status}"));
        }
        if !status.is_success() {
            warn!("Request to {url} returned HTTP {status}");
            return Attempt::Done(None);
        }

        match response.json::<T>().await {
            Ok(value) => Attempt::Done(Some(value)),
            Err(e) => {
                warn!("Unexpected response body from {url}: {e}");
                Attempt::Done(None)
            }
        }
    }

    /// Fetches every endpoint with bounded concurrency. The output has the same length
    /// and order as the input; failed slots are `None`.
    pub async fn fetch_batch<T: DeserializeOwned>(
        &self,
        project: &str,
        endpoints: &[String],
    ) -> Vec<Option<T>> {
        if endpoints.is_empty() {
            return Vec::new();
        }

        debug!("Dispatching batch of {} requests", endpoints.len());

        stream::iter(endpoints)
            .map(|endpoint| self.fetch_one::<T>(project, endpoint))
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let millis = 200u64.saturating_mul(1u64 << attempt.min(10));
    Duration::from_millis(millis).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryCredentialStore, Token};
    use mockito::Matcher;
    use serde_json::Value;

    fn client_for(root: &str, retries: u32) -> AzureClient {
        let mut config = Config::new(root, "proj").unwrap();
        config.max_retries = retries;
        config.request_timeout = Duration::from_secs(2);
        AzureClient::new(&config, Arc::new(MemoryCredentialStore::new())).unwrap()
    }

    #[test]
    fn test_resolve_relative_endpoint() {
        let client = client_for("https://dev.azure.com/contoso", 0);
        let url = client
            .resolve("Web", "pipelines?$top=5&api-version=7.1-preview.1")
            .unwrap();

        assert_eq!(
            url.as_str(),
            "https://dev.azure.com/contoso/Web/_apis/pipelines?$top=5&api-version=7.1-preview.1"
        );
    }

    #[test]
    fn test_resolve_encodes_project_name() {
        let client = client_for("https://dev.azure.com/contoso/", 0);
        let url = client.resolve("My Project", "pipelines").unwrap();

        assert_eq!(
            url.as_str(),
            "https://dev.azure.com/contoso/My%20Project/_apis/pipelines"
        );
    }

    #[test]
    fn test_resolve_absolute_endpoint() {
        let client = client_for("https://dev.azure.com/contoso", 0);
        let url = client
            .resolve("Web", "https://other.example.com/_apis/projects")
            .unwrap();

        assert_eq!(url.as_str(), "https://other.example.com/_apis/projects");
    }

    #[test]
    fn test_organization_url() {
        let client = client_for("https://dev.azure.com/contoso", 0);

        assert_eq!(
            client.organization_url("_apis/projects?api-version=7.1").unwrap(),
            "https://dev.azure.com/contoso/_apis/projects?api-version=7.1"
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_for(1), Duration::from_millis(400));
        assert_eq!(backoff_for(30), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_requests() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = client_for(&format!("{}/org", server.url()), 0);
        let results: Vec<Option<Value>> = client.fetch_batch("proj", &[]).await;

        assert!(results.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_batch_isolates_failed_slot() {
        let mut server = mockito::Server::new_async().await;
        let _m1 = server
            .mock("GET", "/org/proj/_apis/a")
            .with_status(200)
            .with_body(r#"{"n":1}"#)
            .create_async()
            .await;
        let _m2 = server
            .mock("GET", "/org/proj/_apis/b")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;
        let _m3 = server
            .mock("GET", "/org/proj/_apis/c")
            .with_status(200)
            .with_body(r#"{"n":3}"#)
            .create_async()
            .await;

        let client = client_for(&format!("{}/org", server.url()), 0);
        let endpoints = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let results: Vec<Option<Value>> = client.fetch_batch("proj", &endpoints).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap()["n"], 1);
        assert!(results[1].is_none());
        assert_eq!(results[2].as_ref().unwrap()["n"], 3);
    }

    #[tokio::test]
    async fn test_non_json_body_is_none() {
        let mut server = mockito::Server::new_async().await;
        let _m4 = server
            .mock("GET", "/org/proj/_apis/html")
            .with_status(200)
            .with_body("<html>sign in</html>")
            .create_async()
            .await;

        let client = client_for(&format!("{}/org", server.url()), 0);
        let result: Option<Value> = client.fetch_one("proj", "html").await;

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/proj/_apis/missing")
            .with_status(404)
            .with_body(r#"{"message":"not found"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&format!("{}/org", server.url()), 2);
        let result: Option<Value> = client.fetch_one("proj", "missing").await;

        assert!(result.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_retries_are_bounded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/proj/_apis/flaky")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&format!("{}/org", server.url()), 1);
        let result: Option<Value> = client.fetch_one("proj", "flaky").await;

        assert!(result.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_timed_out_request_is_retried_then_isolated() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::net::TcpListener;

        // Accepts connections and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let silent = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                open.push(socket);
            }
        });

        let mut server = mockito::Server::new_async().await;
        let _m5 = server
            .mock("GET", "/org/proj/_apis/ok")
            .with_status(200)
            .with_body(r#"{"n":1}"#)
            .create_async()
            .await;

        let mut config = Config::new(&format!("{}/org", server.url()), "proj").unwrap();
        config.max_retries = 1;
        config.request_timeout = Duration::from_millis(300);
        let client = AzureClient::new(&config, Arc::new(MemoryCredentialStore::new())).unwrap();

        let endpoints = vec![format!("http://{silent_addr}/hang"), "ok".to_string()];
        let results: Vec<Option<Value>> = client.fetch_batch("proj", &endpoints).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_none());
        assert_eq!(results[1].as_ref().unwrap()["n"], 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        silent.abort();
    }

    #[tokio::test]
    async fn test_attaches_basic_auth_from_store() {
        let mut server = mockito::Server::new_async().await;
        // base64(":secret")
        let mock = server
            .mock("GET", "/org/proj/_apis/secure")
            .match_header("authorization", "Basic OnNlY3JldA==")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let config = Config::new(&format!("{}/org", server.url()), "proj").unwrap();
        let store = Arc::new(MemoryCredentialStore::new());
        store.set(PAT_KEY, Token::from("secret"));
        let client = AzureClient::new(&config, store).unwrap();

        let result: Option<Value> = client.fetch_one("proj", "secure").await;

        assert!(result.is_some());
        mock.assert_async().await;
    }
}
