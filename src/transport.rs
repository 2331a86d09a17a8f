use std::future::Future;
use std::time::Duration;

use crate::error::TransportError;

/// HTTP operations the pipeline needs from the network.
///
/// Bodies are pre-serialized JSON so implementations stay independent of the
/// payload types. A non-2xx status must be reported as `TransportError::Status`.
pub trait HttpTransport: Send + Sync + 'static {
    /// GET `url` with query parameters, returning the raw body
    fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    fn put_json(
        &self,
        url: &str,
        json_body: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn post_json(
        &self,
        url: &str,
        json_body: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// `reqwest`-backed transport with a shared connection pool
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(request_timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn send_json(&self, request: reqwest::RequestBuilder, body: String) -> Result<(), TransportError> {
        let response = request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }
}

impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>, TransportError> {
        let response = self.client.get(url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| TransportError::Body(e.to_string()))
    }

    async fn put_json(&self, url: &str, json_body: String) -> Result<(), TransportError> {
        self.send_json(self.client.put(url), json_body).await
    }

    async fn post_json(&self, url: &str, json_body: String) -> Result<(), TransportError> {
        self.send_json(self.client.post(url), json_body).await
    }
}
