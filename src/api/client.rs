use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use crate::api::auth::{CredentialProvider, StaticToken};
use crate::api::types::{ApiJobTriggerResponse, Payload};
use crate::cache::CacheKey;
use crate::config::{ApiConfig, Config, JobsSettings};
use crate::error::SyncError;
use crate::job::{JobApi, JobResult, JOB_STATUS_RESOURCE};
use crate::query::Fetcher;
use color_eyre::{eyre::eyre, Result};

/// Route used for resources without a configured template.
const DEFAULT_ROUTE: &str = "/{resource}";

/// HTTP client for the resource API and the job protocol.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  routes: Arc<BTreeMap<String, String>>,
  jobs: Arc<JobsSettings>,
  credentials: Arc<dyn CredentialProvider>,
}

impl ApiClient {
  pub fn new(
    api: &ApiConfig,
    jobs: &JobsSettings,
    credentials: Arc<dyn CredentialProvider>,
  ) -> Result<Self> {
    let base_url = Url::parse(&api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url {}: {}", api.base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("api.base_url {} cannot carry a path", api.base_url));
    }

    let http = reqwest::Client::builder()
      .user_agent(concat!("resync/", env!("CARGO_PKG_VERSION")))
      .timeout(Duration::from_secs(api.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let mut routes = api.routes.clone();
    routes
      .entry(JOB_STATUS_RESOURCE.to_string())
      .or_insert_with(|| jobs.status_path.clone());

    Ok(Self {
      http,
      base_url,
      routes: Arc::new(routes),
      jobs: Arc::new(jobs.clone()),
      credentials,
    })
  }

  /// Build a client from configuration with the token from the environment.
  pub fn from_config(config: &Config) -> Result<Self> {
    Self::new(&config.api, &config.jobs, Arc::new(StaticToken::from_env()))
  }

  /// Resolve `key` to a URL through its resource's route template.
  pub fn url_for(&self, key: &CacheKey) -> Result<Url, SyncError> {
    let template = self
      .routes
      .get(key.resource())
      .map(String::as_str)
      .unwrap_or(DEFAULT_ROUTE);
    self.expand(template, key)
  }

  /// Substitute `{param}` placeholders from `key`. Parameters not consumed by
  /// the path become the query string.
  fn expand(&self, template: &str, key: &CacheKey) -> Result<Url, SyncError> {
    let mut url = self.base_url.clone();
    let mut used = Vec::new();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| SyncError::InvalidState("base url cannot carry a path".into()))?;
      segments.pop_if_empty();
      for segment in template.split('/').filter(|s| !s.is_empty()) {
        segments.push(&expand_segment(segment, key, &mut used)?);
      }
    }

    let query: Vec<_> = key
      .params()
      .iter()
      .filter(|(name, _)| !used.contains(&name))
      .collect();
    if !query.is_empty() {
      url
        .query_pairs_mut()
        .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Ok(url)
  }

  /// Send a request with credentials and map non-2xx statuses to errors.
  async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, SyncError> {
    let request = match self.credentials.token() {
      Some(token) => request.bearer_auth(token),
      None => request,
    };

    let response = request.send().await?;
    let status = response.status();
    trace!(url = %response.url(), status = status.as_u16(), "response");
    if status.is_success() {
      return Ok(response);
    }

    let bytes = response.bytes().await.unwrap_or_default();
    let body = if bytes.is_empty() {
      Value::Null
    } else {
      serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    let error = SyncError::from_status(status.as_u16(), body);
    if error.is_auth() {
      self.credentials.on_auth_failure(&error);
    }
    Err(error)
  }

  /// GET the resource behind `key` and validate the body.
  pub async fn get(&self, key: &CacheKey) -> Result<Payload, SyncError> {
    let url = self.url_for(key)?;
    debug!(key = %key, url = %url, "GET");
    let response = self.send(self.http.get(url)).await?;
    let body: Value = response.json().await?;
    Payload::from_json(body)
  }

  /// POST a JSON body to a path (templated against `key`) and return the JSON
  /// response, or `Null` for an empty one.
  pub async fn post(&self, template: &str, key: &CacheKey, body: &Value) -> Result<Value, SyncError> {
    let url = self.expand(template, key)?;
    debug!(url = %url, "POST");
    let response = self.send(self.http.post(url).json(body)).await?;
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
  }

  async fn trigger_job(&self, force: bool) -> Result<String, SyncError> {
    let body = self
      .post(&self.jobs.trigger_path, &job_key(None), &json!({ "force": force }))
      .await?;
    let response: ApiJobTriggerResponse = serde_json::from_value(body)?;
    Ok(response.job_id)
  }

  async fn job_result(&self, job_id: &str) -> Result<JobResult, SyncError> {
    let url = self.expand(&self.jobs.result_path, &job_key(Some(job_id)))?;
    let response = self.send(self.http.get(url)).await?;
    if response.status() == StatusCode::ACCEPTED {
      return Ok(JobResult::Pending);
    }
    let body: Value = response.json().await?;
    Ok(JobResult::Ready(Payload::from_json(body)?))
  }

  async fn confirm_job(&self, job_id: &str) -> Result<(), SyncError> {
    self
      .post(&self.jobs.confirm_path, &job_key(None), &json!({ "jobId": job_id }))
      .await?;
    Ok(())
  }
}

fn job_key(job_id: Option<&str>) -> CacheKey {
  let key = CacheKey::new("jobs");
  match job_id {
    Some(id) => key.param("jobId", id),
    None => key,
  }
}

/// Expand placeholders inside one path segment.
fn expand_segment<'k>(
  segment: &str,
  key: &'k CacheKey,
  used: &mut Vec<&'k String>,
) -> Result<String, SyncError> {
  let mut out = String::new();
  let mut rest = segment;
  while let Some(start) = rest.find('{') {
    let end = rest[start..]
      .find('}')
      .map(|offset| start + offset)
      .ok_or_else(|| SyncError::InvalidState(format!("unclosed placeholder in {}", segment)))?;
    out.push_str(&rest[..start]);

    let name = &rest[start + 1..end];
    if name == "resource" {
      out.push_str(key.resource());
    } else {
      let (param, value) = key
        .params()
        .iter()
        .find(|(k, _)| k == name)
        .ok_or_else(|| SyncError::InvalidState(format!("{} needs parameter {}", key, name)))?;
      used.push(param);
      out.push_str(value);
    }
    rest = &rest[end + 1..];
  }
  out.push_str(rest);
  Ok(out)
}

impl Fetcher for ApiClient {
  fn fetch(&self, key: &CacheKey) -> BoxFuture<'static, Result<Payload, SyncError>> {
    let client = self.clone();
    let key = key.clone();
    async move { client.get(&key).await }.boxed()
  }
}

impl JobApi for ApiClient {
  fn trigger(&self, force: bool) -> BoxFuture<'static, Result<String, SyncError>> {
    let client = self.clone();
    async move { client.trigger_job(force).await }.boxed()
  }

  fn result(&self, job_id: &str) -> BoxFuture<'static, Result<JobResult, SyncError>> {
    let client = self.clone();
    let job_id = job_id.to_string();
    async move { client.job_result(&job_id).await }.boxed()
  }

  fn confirm(&self, job_id: &str) -> BoxFuture<'static, Result<(), SyncError>> {
    let client = self.clone();
    let job_id = job_id.to_string();
    async move { client.confirm_job(&job_id).await }.boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;
  use crate::job::status_key;
  use crate::query::{QueryConfig, QueryCoordinator, QueryOptions};
  use wiremock::matchers::{body_json, header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn client_for(server: &MockServer, token: Arc<StaticToken>) -> ApiClient {
    let api = ApiConfig {
      base_url: format!("{}/v1/", server.uri()),
      routes: BTreeMap::from([(
        "campaigns".to_string(),
        "/clients/{clientId}/campaigns".to_string(),
      )]),
      request_timeout_secs: 5,
    };
    ApiClient::new(&api, &JobsSettings::default(), token).unwrap()
  }

  fn offline_client() -> ApiClient {
    let api = ApiConfig {
      base_url: "https://api.example.com/v1".to_string(),
      routes: BTreeMap::from([("leads".to_string(), "/leads/{leadId}".to_string())]),
      request_timeout_secs: 5,
    };
    ApiClient::new(&api, &JobsSettings::default(), Arc::new(StaticToken::anonymous())).unwrap()
  }

  #[test]
  fn test_route_expansion() {
    let client = offline_client();

    let url = client
      .url_for(&CacheKey::new("leads").param("leadId", "a b").param("fields", "all"))
      .unwrap();
    assert_eq!(url.as_str(), "https://api.example.com/v1/leads/a%20b?fields=all");

    let url = client.url_for(&CacheKey::new("activity").param("page", 2)).unwrap();
    assert_eq!(url.as_str(), "https://api.example.com/v1/activity?page=2");

    let url = client.url_for(&status_key("abc123")).unwrap();
    assert_eq!(url.as_str(), "https://api.example.com/v1/jobs/status/abc123");
  }

  #[test]
  fn test_missing_route_parameter() {
    let client = offline_client();
    let err = client.url_for(&CacheKey::new("leads")).unwrap_err();
    assert!(matches!(err, SyncError::InvalidState(_)));
    assert!(!err.is_retryable());
  }

  #[tokio::test]
  async fn test_get_sends_bearer_and_validates_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/v1/clients/7/campaigns"))
      .and(query_param("page", "1"))
      .and(header("authorization", "Bearer secret"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "data": [{"id": 1, "name": "Spring"}, {"id": 2, "name": "Summer"}]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let client = client_for(&server, Arc::new(StaticToken::new("secret")));
    let key = CacheKey::new("campaigns").param("clientId", 7).param("page", 1);
    let payload = client.get(&key).await.unwrap();

    let list = payload.as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id, "1");
  }

  #[tokio::test]
  async fn test_status_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/v1/expired"))
      .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "token expired"})))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/v1/invalid"))
      .respond_with(ResponseTemplate::new(422).set_body_json(json!({"field": "share"})))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/v1/down"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/v1/scalar"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!(42)))
      .mount(&server)
      .await;

    let token = Arc::new(StaticToken::new("stale"));
    let client = client_for(&server, token.clone());

    let err = client.get(&CacheKey::new("expired")).await.unwrap_err();
    assert_eq!(
      err,
      SyncError::Auth {
        status: 401,
        message: "token expired".into()
      }
    );
    assert_eq!(token.failures(), 1);

    let err = client.get(&CacheKey::new("invalid")).await.unwrap_err();
    assert_eq!(
      err,
      SyncError::Validation {
        status: 422,
        body: json!({"field": "share"})
      }
    );

    let err = client.get(&CacheKey::new("down")).await.unwrap_err();
    assert!(matches!(err, SyncError::Server { status: 503, .. }));
    assert!(err.is_retryable());

    let err = client.get(&CacheKey::new("scalar")).await.unwrap_err();
    assert!(matches!(err, SyncError::Decode(_)));
    assert_eq!(token.failures(), 1);
  }

  #[tokio::test]
  async fn test_job_protocol() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/jobs/trigger"))
      .and(body_json(json!({"force": false})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jobId": "abc123"})))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/v1/jobs/result/pending"))
      .respond_with(ResponseTemplate::new(202))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/v1/jobs/result/abc123"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"imported": 12})))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/v1/jobs/confirm"))
      .and(body_json(json!({"jobId": "abc123"})))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;

    let client = client_for(&server, Arc::new(StaticToken::anonymous()));

    assert_eq!(client.trigger(false).await.unwrap(), "abc123");
    assert_eq!(client.result("pending").await.unwrap(), JobResult::Pending);
    match client.result("abc123").await.unwrap() {
      JobResult::Ready(payload) => {
        assert_eq!(payload.as_document().and_then(|d| d.get("imported")), Some(&json!(12)))
      }
      other => panic!("expected a ready result, got {:?}", other),
    }
    client.confirm("abc123").await.unwrap();
  }

  #[tokio::test]
  async fn test_fetcher_behind_query_coordinator() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/v1/jobs/status/abc123"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "running"})))
      .expect(1)
      .mount(&server)
      .await;

    let client = client_for(&server, Arc::new(StaticToken::anonymous()));
    let queries = QueryCoordinator::new(CacheStore::new(), Arc::new(client), QueryConfig::default());
    let key = status_key("abc123");

    let options = QueryOptions::default();
    let (first, second) = tokio::join!(queries.fetch(&key, &options), queries.fetch(&key, &options));
    assert_eq!(first.unwrap(), second.unwrap());
  }
}
