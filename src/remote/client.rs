//! HTTP implementation of the remote source.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Client, Method, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{ApiPushRequest, ApiRecord, ApiRecordsResponse};
use super::{RemoteError, RemoteRecord, RemoteSource};
use crate::config::RemoteConfig;
use crate::store::Record;

/// Remote content API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base_url: Url,
  token: Option<String>,
  device_id: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, token: Option<String>, timeout: Duration) -> Result<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid remote base URL {}: {}", config.base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Remote base URL cannot carry a path: {}", config.base_url));
    }

    let client = Client::builder()
      .timeout(timeout)
      .user_agent(config.user_agent.as_str())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
      device_id: config.device_id.clone(),
    })
  }

  fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::Network(format!("Unusable base URL {}", self.base_url)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let mut builder = self
      .client
      .request(method, url)
      .header(header::ACCEPT, "application/json");
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(device_id) = &self.device_id {
      builder = builder.header("X-Device-ID", device_id);
    }
    builder
  }
}

#[async_trait]
impl RemoteSource for HttpRemote {
  async fn fetch_region(
    &self,
    region: &str,
    since_version: u64,
  ) -> Result<Vec<RemoteRecord>, RemoteError> {
    let mut url = self.endpoint(&["regions", region, "records"])?;
    url
      .query_pairs_mut()
      .append_pair("since", &since_version.to_string());

    debug!(region, since_version, "Fetching region");
    let response = self.request(Method::GET, url).send().await?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(RemoteError::from_status(status, &body));
    }

    let body: ApiRecordsResponse = response.json().await?;
    Ok(body.records.into_iter().map(RemoteRecord::from).collect())
  }

  async fn push_record(&self, record: &Record) -> Result<RemoteRecord, RemoteError> {
    let url = self.endpoint(&["records", record.id.as_str()])?;
    let mut request = self
      .request(Method::PUT, url)
      .json(&ApiPushRequest::from(record));
    if let Some(token) = &record.push_token {
      request = request.header("Idempotency-Key", token);
    }

    debug!(id = %record.id, revision = record.local_revision, "Pushing record");
    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::CONFLICT {
      let body = response.text().await.unwrap_or_default();
      return match serde_json::from_str::<ApiRecord>(&body) {
        Ok(remote) => Err(RemoteError::Conflict(Box::new(remote.into()))),
        Err(_) => Err(RemoteError::from_status(status, &body)),
      };
    }
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(RemoteError::from_status(status, &body));
    }

    let ack: ApiRecord = response.json().await?;
    Ok(ack.into())
  }
}
