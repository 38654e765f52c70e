//! HTTP client for a remote `spiderq broker`

use super::{DeliveryMode, MessagingError, Result, TaskQueue};
use crate::proto::{
    DeclareRequest, ErrorResponse, HEADER_DELIVERY_MODE, HEADER_DELIVERY_TAG, HEADER_QUEUE,
    HEADER_REDELIVERED, PurgeResponse, QueueStatsResponse, SubscribeRequest, SubscribeResponse,
};
use crate::queue::{Delivery, QueueStats};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Timeout for every call except the long poll
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Slack on top of the long-poll window before the client gives up
const POLL_GRACE: Duration = Duration::from_secs(10);

/// Broker connection over HTTP
#[derive(Debug, Clone)]
pub struct BrokerClient {
    client: Client,
    base: Url,
}

impl BrokerClient {
    /// Connect to the broker at `base_url` and verify it answers
    ///
    /// Fails with [`MessagingError::ConnectionError`] if the broker is not
    /// reachable; callers treat that as fatal.
    pub async fn connect(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| MessagingError::ConnectionError(format!("invalid broker URL: {}", e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))?;

        let broker = Self { client, base };
        let response = broker
            .send(broker.client.get(broker.url("health")?).timeout(connect_timeout))
            .await?;
        if !response.status().is_success() {
            return Err(MessagingError::ConnectionError(format!(
                "health check returned HTTP {}",
                response.status()
            )));
        }

        info!(broker = %broker.base, "Connected to broker");
        Ok(broker)
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| MessagingError::Broker(format!("invalid broker path '{}': {}", path, e)))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|e| {
            debug!(error = ?e, "Broker request failed");
            if e.is_connect() || e.is_timeout() {
                MessagingError::ConnectionError(e.to_string())
            } else {
                MessagingError::Broker(e.to_string())
            }
        })
    }

    /// Send and turn non-2xx answers into typed errors
    async fn call(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.send(request.timeout(REQUEST_TIMEOUT)).await?;
        check(response).await
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => (body.code, body.message),
        Err(_) => (String::new(), format!("HTTP {}: {}", status.as_u16(), text)),
    };

    Err(match code.as_str() {
        "QUEUE_NOT_FOUND" => MessagingError::QueueNotFound(message),
        "CONSUMER_NOT_FOUND" => MessagingError::ConsumerNotFound(message),
        "UNKNOWN_DELIVERY_TAG" => MessagingError::UnknownDeliveryTag(
            message
                .rsplit(' ')
                .next()
                .and_then(|t| t.parse().ok())
                .unwrap_or_default(),
        ),
        _ if status.is_client_error() => MessagingError::Rejected(message),
        _ => MessagingError::Broker(message),
    })
}

async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| MessagingError::Broker(format!("invalid broker response: {}", e)))
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn into_stats(body: QueueStatsResponse) -> QueueStats {
    QueueStats {
        durable: body.durable,
        ready: body.ready,
        unacked: body.unacked,
        consumers: body.consumers,
    }
}

#[async_trait]
impl TaskQueue for BrokerClient {
    async fn declare(&self, queue: &str, durable: bool) -> Result<QueueStats> {
        let url = self.url(&format!("queues/{}", queue))?;
        let response = self
            .call(self.client.put(url).json(&DeclareRequest { durable }))
            .await?;
        Ok(into_stats(json(response).await?))
    }

    async fn purge(&self, queue: &str) -> Result<u64> {
        let url = self.url(&format!("queues/{}/messages", queue))?;
        let response = self.call(self.client.delete(url)).await?;
        Ok(json::<PurgeResponse>(response).await?.purged)
    }

    async fn publish(&self, queue: &str, body: Vec<u8>, mode: DeliveryMode) -> Result<()> {
        let url = self.url(&format!("queues/{}/messages", queue))?;
        self.call(
            self.client
                .post(url)
                .header(HEADER_DELIVERY_MODE, mode.code().to_string())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body),
        )
        .await?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u32) -> Result<String> {
        let url = self.url(&format!("queues/{}/consumers", queue))?;
        let response = self
            .call(self.client.post(url).json(&SubscribeRequest { prefetch }))
            .await?;
        Ok(json::<SubscribeResponse>(response).await?.consumer_id)
    }

    async fn next_delivery(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>> {
        let mut url = self.url(&format!("consumers/{}/deliveries", consumer))?;
        url.query_pairs_mut()
            .append_pair("wait_ms", &wait.as_millis().to_string());

        let response = self
            .send(self.client.post(url).timeout(wait + POLL_GRACE))
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = check(response).await?;

        let tag = header(&response, HEADER_DELIVERY_TAG)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| MessagingError::Broker("delivery without tag".to_string()))?;
        let redelivered = header(&response, HEADER_REDELIVERED) == Some("true");
        let queue = header(&response, HEADER_QUEUE).unwrap_or_default().to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))?;

        Ok(Some(Delivery {
            tag,
            queue,
            redelivered,
            body: body.to_vec(),
        }))
    }

    async fn ack(&self, consumer: &str, tag: u64) -> Result<()> {
        let url = self.url(&format!("consumers/{}/deliveries/{}/ack", consumer, tag))?;
        self.call(self.client.post(url)).await?;
        Ok(())
    }

    async fn cancel(&self, consumer: &str) -> Result<()> {
        let url = self.url(&format!("consumers/{}", consumer))?;
        self.call(self.client.delete(url)).await?;
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let url = self.url(&format!("queues/{}", queue))?;
        let response = self.call(self.client.get(url)).await?;
        Ok(into_stats(json(response).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Port 9 (discard) is closed on test machines
        let result = BrokerClient::connect("http://127.0.0.1:9", Duration::from_millis(500)).await;
        assert!(matches!(result, Err(MessagingError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_publish_sends_persistent_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queues/tasks/messages"))
            .and(header_is(HEADER_DELIVERY_MODE, "2"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = BrokerClient::connect(&server.uri(), Duration::from_secs(1))
            .await
            .unwrap();
        client
            .publish("tasks", b"{}".to_vec(), DeliveryMode::Persistent)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_body_maps_to_variant() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/consumers/c1/deliveries/42/ack"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "code": "UNKNOWN_DELIVERY_TAG",
                "message": "unknown delivery tag: 42"
            })))
            .mount(&server)
            .await;

        let client = BrokerClient::connect(&server.uri(), Duration::from_secs(1))
            .await
            .unwrap();
        let err = client.ack("c1", 42).await.unwrap_err();
        assert!(matches!(err, MessagingError::UnknownDeliveryTag(42)));
    }

    #[tokio::test]
    async fn test_empty_poll_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/consumers/c1/deliveries"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = BrokerClient::connect(&server.uri(), Duration::from_secs(1))
            .await
            .unwrap();
        let delivery = client
            .next_delivery("c1", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(delivery.is_none());
    }
}
